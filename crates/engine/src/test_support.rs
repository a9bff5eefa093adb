//! Schema and key helpers shared by the unit tests

use chronicle_core::{
    BranchId, DeletionPolicy, HistoryType, ObjectKey, ObjectName, ReferenceDef, TypeDef,
    TypeRegistry,
};

/// Companies, their departments and people, plus projects and notes
///
/// - `Person.employer` → `Company`, cleared on delete
/// - `Employee` extends `Person`; `department` → `Department`, indexed by
///   `badge` and ordered by `rank`
/// - `Department.company` → `Company`, deleted with the company
/// - `Project.owner` → any `Person`, vetoes deletion
/// - `Note.about` → any `Person`, stabilised on delete
pub(crate) fn company_schema() -> TypeRegistry {
    TypeRegistry::new()
        .with_type(TypeDef::new("Company").primitive("name"))
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Department")
                    .primitive("name")
                    .reference(
                        "company",
                        ReferenceDef::new("Company").on_delete(DeletionPolicy::DeleteReferer),
                    ),
            )
        })
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Person")
                    .primitive("name")
                    .primitive("age")
                    .reference("employer", ReferenceDef::new("Company")),
            )
        })
        .and_then(|r| {
            r.with_type(
                TypeDef::new("Employee")
                    .extends("Person")
                    .primitive("badge")
                    .primitive("rank")
                    .reference("department", ReferenceDef::new("Department")),
            )
        })
        .and_then(|r| {
            r.with_type(TypeDef::new("Project").primitive("title").reference(
                "owner",
                ReferenceDef::new("Person")
                    .polymorphic()
                    .on_delete(DeletionPolicy::Veto),
            ))
        })
        .and_then(|r| {
            r.with_type(TypeDef::new("Note").primitive("text").reference(
                "about",
                ReferenceDef::new("Person")
                    .polymorphic()
                    .with_history(HistoryType::Mixed)
                    .on_delete(DeletionPolicy::StabiliseReference),
            ))
        })
        .unwrap()
}

/// Trunk key of the person named `n`
pub(crate) fn person(n: i64) -> ObjectKey {
    ObjectKey::current(BranchId::TRUNK, "Person", ObjectName::new(n))
}
