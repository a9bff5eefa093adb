//! Reverse side of a reference attribute
//!
//! Both link caches answer "which objects of a referrer type point at this
//! anchor through this attribute". [`LinkSource`] holds the shared part:
//! schema checks, the store scan used for builds, and the per-object test
//! used when replaying events and local changes.

use chronicle_core::{
    attribute, Attributes, BackingStore, BranchRegistry, Error, ObjectId, ObjectKey, Result,
    RevisionNumber, SchemaRegistry, TypeName, UpdateEvent,
};
use std::sync::Arc;

pub(crate) struct LinkSource {
    pub(crate) anchor: ObjectKey,
    anchor_id: ObjectId,
    pub(crate) referrer_type: TypeName,
    pub(crate) attribute: String,
    branch_local: bool,
    store: Arc<dyn BackingStore>,
    schema: Arc<dyn SchemaRegistry>,
    branches: Arc<BranchRegistry>,
}

impl LinkSource {
    pub(crate) fn new(
        anchor: &ObjectKey,
        referrer_type: TypeName,
        attribute: &str,
        store: Arc<dyn BackingStore>,
        schema: Arc<dyn SchemaRegistry>,
        branches: Arc<BranchRegistry>,
    ) -> Result<Self> {
        let anchor = branches.data_key(&anchor.as_current())?;
        if !schema.contains(&referrer_type) {
            return Err(Error::not_found(format!("type {}", referrer_type)));
        }
        let def = schema.reference(&referrer_type, attribute).ok_or_else(|| {
            Error::invalid_operation(format!(
                "{}.{} is not a reference attribute",
                referrer_type, attribute
            ))
        })?;
        let compatible = if def.monomorphic {
            anchor.type_name == def.target_type
        } else {
            schema.is_subtype(&anchor.type_name, &def.target_type)
        };
        if !compatible {
            return Err(Error::invalid_operation(format!(
                "{}.{} cannot refer to {}",
                referrer_type, attribute, anchor.type_name
            )));
        }
        let branch_local = def.branch_local;
        Ok(Self {
            anchor_id: anchor.object_id(),
            anchor,
            referrer_type,
            attribute: attribute.to_string(),
            branch_local,
            store,
            schema,
            branches,
        })
    }

    pub(crate) fn anchor_id(&self) -> &ObjectId {
        &self.anchor_id
    }

    /// Whether a reference stored on `branch` reaches the anchor
    pub(crate) fn resolves_from(&self, branch: chronicle_core::BranchId) -> bool {
        self.branches
            .resolve_reference(branch, self.branch_local, &self.anchor_id)
            .map(|target| target == self.anchor)
            .unwrap_or(false)
    }

    /// Whether `key` with attribute values `values` links to the anchor
    pub(crate) fn links(&self, key: &ObjectKey, values: &Attributes) -> bool {
        key.is_current()
            && self.schema.is_subtype(&key.type_name, &self.referrer_type)
            && attribute(values, &self.attribute).refers_to(&self.anchor_id)
            && self.resolves_from(key.branch)
    }

    /// Whether `event` makes incremental maintenance impossible
    pub(crate) fn invalidated_by(&self, event: &UpdateEvent) -> bool {
        event.deleted.contains_key(&self.anchor)
    }

    /// Every linking object as of `revision`
    pub(crate) fn scan(&self, revision: RevisionNumber) -> Result<Vec<(ObjectKey, Attributes)>> {
        let mut result = Vec::new();
        for type_name in self.schema.subtypes(&self.referrer_type) {
            let sources =
                self.branches
                    .reference_sources(&type_name, self.branch_local, &self.anchor)?;
            for branch in sources {
                let found = self.store.scan(branch, &type_name, revision, &|values| {
                    attribute(values, &self.attribute).refers_to(&self.anchor_id)
                })?;
                result.extend(found);
            }
        }
        Ok(result)
    }

    pub(crate) fn describe(&self, kind: &str, by: &str) -> String {
        format!(
            "{} {}.{} -> {} by {}",
            kind, self.referrer_type, self.attribute, self.anchor, by
        )
    }
}
