//! Branch creation
//!
//! A branch forks a base branch at a base revision for a set of types.
//! Objects of branched types are copied onto the new branch in the same
//! revision that creates it; every other type keeps resolving to the base.
//!
//! Creation is checked before anything is allocated:
//! - **Model check**: a branched type must not hold a branch-local,
//!   monomorphic, current reference to an unbranched type.
//! - **Data check**: at the base revision, no object of a branched type may
//!   hold a branch-local current reference to an object of an unbranched
//!   type through a reference the model check let pass (polymorphic or
//!   mixed history).
//!
//! A rejected branch leaves no trace: no id, no revision, no rows. A branch
//! whose commit fails afterwards is unregistered again and its rows are
//! reverted; only the drawn id and revision numbers stay skipped.

use crate::database::Database;
use chronicle_core::{
    attribute, AttributeDelta, Branch, BranchId, Error, ObjectKey, Result, RevisionNumber,
    TypeName, UpdateEvent, Value, BRANCH_SEQUENCE,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

impl Database {
    /// Fork `base` at `base_revision`, branching `types`
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown base branch or type
    /// - `InvalidOperation` for a base revision this node has not applied
    /// - `BranchConsistency` if the model or data check fails
    pub fn create_branch(
        &self,
        base: BranchId,
        base_revision: RevisionNumber,
        types: BTreeSet<TypeName>,
    ) -> Result<Arc<Branch>> {
        self.branches().get(base)?;
        let schema = self.backend().schema();
        for type_name in &types {
            if !schema.contains(type_name) {
                return Err(Error::not_found(format!("type {}", type_name)));
            }
        }
        if base_revision > self.latest_revision() {
            return Err(Error::invalid_operation(format!(
                "base revision {} is ahead of applied revision {}",
                base_revision,
                self.latest_revision()
            )));
        }

        if let Err(e) = self
            .check_branch_model(base, base_revision, &types)
            .and_then(|()| self.check_branch_data(base, base_revision, &types))
        {
            warn!(target: "chronicle::branch", %base, base_revision, error = %e, "branch rejected");
            return Err(e);
        }

        let _cluster = self.backend().lock_commits();
        let mut state = self.replication().lock();
        self.drain(&mut state)?;

        let latest = self.latest_revision();
        let id = self.backend().sequence().next_value(BRANCH_SEQUENCE)?;
        let id = u64::try_from(id)
            .map(BranchId::new)
            .map_err(|_| Error::corruption(format!("branch sequence returned {}", id)))?;
        let revision = self.coordinator().allocate_revision(latest)?;

        let mut writes: Vec<(ObjectKey, AttributeDelta)> = Vec::new();
        let mut event = UpdateEvent::new(revision, latest);
        for type_name in &types {
            let source = self.branches().data_branch(base, type_name)?;
            for (key, values) in
                self.backend()
                    .store()
                    .scan(source, type_name, base_revision, &|_| true)?
            {
                let copy = key.on_branch(id);
                writes.push((copy.clone(), AttributeDelta::Create(values.clone())));
                event.created.insert(copy, values);
            }
        }

        let branch = Branch {
            id,
            base_branch: Some(base),
            base_revision,
            branched_types: types,
        };
        event.created_branches.push(branch.clone());
        let registered = self.branches().register(branch)?;
        let copied = writes.len();
        if let Err(e) = self.publish_system_commit(&mut state, revision, &writes, event) {
            self.branches().unregister(id);
            warn!(target: "chronicle::branch", branch = %id, error = %e, "branch creation failed");
            return Err(e);
        }

        info!(
            target: "chronicle::branch",
            branch = %id,
            %base,
            base_revision,
            revision,
            copied,
            "branch created"
        );
        Ok(registered)
    }

    fn check_branch_model(
        &self,
        base: BranchId,
        base_revision: RevisionNumber,
        types: &BTreeSet<TypeName>,
    ) -> Result<()> {
        let schema = self.backend().schema();
        for type_name in types {
            for (attr, def) in schema.references(type_name) {
                if def.requires_branched_target() && !types.contains(&def.target_type) {
                    return Err(Error::branch_consistency(
                        base,
                        base_revision,
                        format!(
                            "{}.{} requires {} to be branched",
                            type_name, attr, def.target_type
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_branch_data(
        &self,
        base: BranchId,
        base_revision: RevisionNumber,
        types: &BTreeSet<TypeName>,
    ) -> Result<()> {
        let schema = self.backend().schema();
        for type_name in types {
            let local: Vec<String> = schema
                .references(type_name)
                .into_iter()
                .filter(|(_, def)| def.branch_local && !def.requires_branched_target())
                .map(|(attr, _)| attr)
                .collect();
            if local.is_empty() {
                continue;
            }
            let source = self.branches().data_branch(base, type_name)?;
            let rows = self
                .backend()
                .store()
                .scan(source, type_name, base_revision, &|_| true)?;
            for (key, values) in rows {
                for attr in &local {
                    if let Value::Ref(target) = attribute(&values, attr) {
                        if !types.contains(&target.type_name) {
                            return Err(Error::branch_consistency(
                                base,
                                base_revision,
                                format!("{}.{} refers to unbranched {}", key, attr, target),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
