//! Type and attribute metadata
//!
//! The schema itself is an external collaborator consumed through
//! [`SchemaRegistry`]. [`TypeRegistry`] is the in-memory implementation
//! used by tests and embedded setups.
//!
//! ## Reference attributes
//!
//! A reference is described by a [`ReferenceDef`]:
//! - **monomorphic**: the target must be exactly the declared type
//! - **branch_local**: the target is resolved on the referrer's branch
//! - **history**: whether it may hold current refs, historic refs, or both
//! - **deletion**: what happens to the referrer when the target is deleted
//!
//! Deletion policies are evaluated by the single function
//! [`evaluate_deletion`].

use crate::error::{Error, Result};
use crate::types::{ObjectId, RevisionNumber, TypeName};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Definitions
// ============================================================================

/// Which history contexts a reference may point into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryType {
    /// Only current references
    Current,
    /// Only stabilised references
    Historic,
    /// Either kind
    Mixed,
}

/// Reaction of a referrer when its target is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Set the reference to null
    ClearReference,
    /// Delete the referrer as well
    DeleteReferer,
    /// Reject the deletion
    Veto,
    /// Replace the reference by a reference to the last revision of the target
    StabiliseReference,
}

/// What a deletion does to one referrer, produced by [`evaluate_deletion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionAction {
    /// Write this value into the reference attribute
    Rewrite(Value),
    /// Delete the referrer
    DeleteReferer,
    /// Abort the deletion
    Veto,
}

/// Decide what happens to a reference when its target is deleted
///
/// # Arguments
///
/// * `policy` - Deletion policy of the reference attribute
/// * `target` - Identity of the object being deleted
/// * `revision` - Revision the deleting transaction reads from
pub fn evaluate_deletion(
    policy: DeletionPolicy,
    target: &ObjectId,
    revision: RevisionNumber,
) -> DeletionAction {
    match policy {
        DeletionPolicy::ClearReference => DeletionAction::Rewrite(Value::Null),
        DeletionPolicy::DeleteReferer => DeletionAction::DeleteReferer,
        DeletionPolicy::Veto => DeletionAction::Veto,
        DeletionPolicy::StabiliseReference => {
            DeletionAction::Rewrite(Value::HistoricRef(target.clone(), revision))
        }
    }
}

/// Definition of a reference attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDef {
    /// Declared target type
    pub target_type: TypeName,
    /// Target must be exactly `target_type`
    pub monomorphic: bool,
    /// Target is resolved on the referrer's branch
    pub branch_local: bool,
    /// Allowed history contexts
    pub history: HistoryType,
    /// Behaviour when the target is deleted
    pub deletion: DeletionPolicy,
}

impl ReferenceDef {
    /// Monomorphic, branch-local, current reference that is cleared on deletion
    pub fn new(target_type: impl Into<TypeName>) -> Self {
        Self {
            target_type: target_type.into(),
            monomorphic: true,
            branch_local: true,
            history: HistoryType::Current,
            deletion: DeletionPolicy::ClearReference,
        }
    }

    /// Allow subtypes of the target type
    pub fn polymorphic(mut self) -> Self {
        self.monomorphic = false;
        self
    }

    /// Resolve the target on the trunk instead of the referrer's branch
    pub fn global(mut self) -> Self {
        self.branch_local = false;
        self
    }

    /// Set the history type
    pub fn with_history(mut self, history: HistoryType) -> Self {
        self.history = history;
        self
    }

    /// Set the deletion policy
    pub fn on_delete(mut self, deletion: DeletionPolicy) -> Self {
        self.deletion = deletion;
        self
    }

    /// Whether branch creation must branch the target type together with
    /// the referrer type
    pub fn requires_branched_target(&self) -> bool {
        self.branch_local && self.monomorphic && self.history == HistoryType::Current
    }
}

/// Kind of an attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    /// Plain value
    Primitive,
    /// Reference to another object
    Reference(ReferenceDef),
}

/// Definition of one declared attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    /// Attribute name
    pub name: String,
    /// Attribute kind
    pub kind: AttributeKind,
}

impl AttributeDef {
    /// Reference definition, if this is a reference
    pub fn reference(&self) -> Option<&ReferenceDef> {
        match &self.kind {
            AttributeKind::Reference(def) => Some(def),
            AttributeKind::Primitive => None,
        }
    }
}

/// Definition of a persistent type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Type name
    pub name: TypeName,
    /// Direct supertype
    pub superclass: Option<TypeName>,
    /// Attributes declared on this type (inherited ones not repeated)
    pub attributes: BTreeMap<String, AttributeDef>,
}

impl TypeDef {
    /// Start a type definition
    pub fn new(name: impl Into<TypeName>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Declare the supertype
    pub fn extends(mut self, superclass: impl Into<TypeName>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    /// Declare a primitive attribute
    pub fn primitive(mut self, name: &str) -> Self {
        self.attributes.insert(
            name.to_string(),
            AttributeDef {
                name: name.to_string(),
                kind: AttributeKind::Primitive,
            },
        );
        self
    }

    /// Declare a reference attribute
    pub fn reference(mut self, name: &str, def: ReferenceDef) -> Self {
        self.attributes.insert(
            name.to_string(),
            AttributeDef {
                name: name.to_string(),
                kind: AttributeKind::Reference(def),
            },
        );
        self
    }
}

// ============================================================================
// Registry contract
// ============================================================================

/// Schema metadata lookup
///
/// Implementors provide [`SchemaRegistry::type_def`] and
/// [`SchemaRegistry::type_names`]; inheritance-aware queries are derived.
pub trait SchemaRegistry: Send + Sync {
    /// Definition of a type
    fn type_def(&self, name: &TypeName) -> Option<&TypeDef>;

    /// All registered type names
    fn type_names(&self) -> Vec<TypeName>;

    /// Whether a type is registered
    fn contains(&self, name: &TypeName) -> bool {
        self.type_def(name).is_some()
    }

    /// Attribute definition, searching supertypes
    fn attribute(&self, type_name: &TypeName, attribute: &str) -> Option<&AttributeDef> {
        let mut current = self.type_def(type_name);
        while let Some(def) = current {
            if let Some(attr) = def.attributes.get(attribute) {
                return Some(attr);
            }
            current = def.superclass.as_ref().and_then(|s| self.type_def(s));
        }
        None
    }

    /// Reference definition, searching supertypes
    fn reference(&self, type_name: &TypeName, attribute: &str) -> Option<&ReferenceDef> {
        self.attribute(type_name, attribute)
            .and_then(AttributeDef::reference)
    }

    /// All reference attributes of a type, including inherited ones
    fn references(&self, type_name: &TypeName) -> Vec<(String, ReferenceDef)> {
        let mut result = BTreeMap::new();
        let mut current = self.type_def(type_name);
        while let Some(def) = current {
            for (name, attr) in &def.attributes {
                if let Some(reference) = attr.reference() {
                    result
                        .entry(name.clone())
                        .or_insert_with(|| reference.clone());
                }
            }
            current = def.superclass.as_ref().and_then(|s| self.type_def(s));
        }
        result.into_iter().collect()
    }

    /// Whether `sub` equals `sup` or inherits from it
    fn is_subtype(&self, sub: &TypeName, sup: &TypeName) -> bool {
        let mut current = Some(sub.clone());
        while let Some(name) = current {
            if &name == sup {
                return true;
            }
            current = self.type_def(&name).and_then(|d| d.superclass.clone());
        }
        false
    }

    /// `type_name` and all of its transitive subtypes
    fn subtypes(&self, type_name: &TypeName) -> BTreeSet<TypeName> {
        self.type_names()
            .into_iter()
            .filter(|t| self.is_subtype(t, type_name))
            .collect()
    }

    /// Every `(referrer type, attribute, definition)` whose reference may
    /// point at an object of `target_type`
    ///
    /// Attributes are reported once per concrete referrer type.
    fn referrers_of(&self, target_type: &TypeName) -> Vec<(TypeName, String, ReferenceDef)> {
        let mut result = Vec::new();
        for referrer in self.type_names() {
            for (attribute, def) in self.references(&referrer) {
                let compatible = if def.monomorphic {
                    &def.target_type == target_type
                } else {
                    self.is_subtype(target_type, &def.target_type)
                };
                if compatible {
                    result.push((referrer.clone(), attribute, def));
                }
            }
        }
        result
    }

    /// Check that `target` may be stored in `attribute` of `type_name`
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for a primitive attribute, a disallowed
    /// history kind or an incompatible target type.
    fn check_reference_value(
        &self,
        type_name: &TypeName,
        attribute: &str,
        value: &Value,
    ) -> Result<()> {
        let Some(target) = value.referenced_id() else {
            return Ok(());
        };
        let def = self.reference(type_name, attribute).ok_or_else(|| {
            Error::invalid_operation(format!(
                "{}.{} is not a reference attribute",
                type_name, attribute
            ))
        })?;
        let historic = matches!(value, Value::HistoricRef(..));
        let allowed = match def.history {
            HistoryType::Current => !historic,
            HistoryType::Historic => historic,
            HistoryType::Mixed => true,
        };
        if !allowed {
            return Err(Error::invalid_operation(format!(
                "{}.{} does not accept {}",
                type_name, attribute, value
            )));
        }
        let compatible = if def.monomorphic {
            target.type_name == def.target_type
        } else {
            self.is_subtype(&target.type_name, &def.target_type)
        };
        if !compatible {
            return Err(Error::invalid_operation(format!(
                "{}.{} expects {} but got {}",
                type_name, attribute, def.target_type, target.type_name
            )));
        }
        Ok(())
    }
}

/// In-memory schema registry
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<TypeName, TypeDef>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for duplicates and `NotFound` when the
    /// superclass has not been registered yet.
    pub fn define(&mut self, def: TypeDef) -> Result<()> {
        if self.types.contains_key(&def.name) {
            return Err(Error::invalid_operation(format!(
                "type {} is already defined",
                def.name
            )));
        }
        if let Some(superclass) = &def.superclass {
            if !self.types.contains_key(superclass) {
                return Err(Error::not_found(format!(
                    "superclass {} of {}",
                    superclass, def.name
                )));
            }
        }
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    /// Builder-style [`TypeRegistry::define`]
    pub fn with_type(mut self, def: TypeDef) -> Result<Self> {
        self.define(def)?;
        Ok(self)
    }
}

impl SchemaRegistry for TypeRegistry {
    fn type_def(&self, name: &TypeName) -> Option<&TypeDef> {
        self.types.get(name)
    }

    fn type_names(&self) -> Vec<TypeName> {
        self.types.keys().cloned().collect()
    }
}
