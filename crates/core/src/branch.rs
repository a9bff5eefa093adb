//! Branches and branch resolution
//!
//! A [`Branch`] forks the store at a base revision of a base branch. Only
//! the types in its branched-type set get their own copies; every other type
//! is served by the base branch (recursively, down to the trunk).
//!
//! The [`BranchRegistry`] answers "which branch physically holds the data of
//! type T as seen from branch B" via [`BranchRegistry::data_branch`].

use crate::error::{Error, Result};
use crate::types::{BranchId, ObjectId, ObjectKey, RevisionNumber, TypeName, INITIAL_REVISION};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A named fork point
///
/// The branched-type set never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch id
    pub id: BranchId,
    /// Branch this one was forked from; `None` only for the trunk
    pub base_branch: Option<BranchId>,
    /// Revision of the base branch the fork was taken at
    pub base_revision: RevisionNumber,
    /// Types with branch-local copies
    pub branched_types: BTreeSet<TypeName>,
}

impl Branch {
    /// The trunk: no base, owns every type
    pub fn trunk() -> Self {
        Self {
            id: BranchId::TRUNK,
            base_branch: None,
            base_revision: INITIAL_REVISION,
            branched_types: BTreeSet::new(),
        }
    }

    /// Whether this is the trunk
    pub fn is_trunk(&self) -> bool {
        self.base_branch.is_none()
    }

    /// Whether objects of `type_name` live on this branch itself
    pub fn holds_type(&self, type_name: &TypeName) -> bool {
        self.is_trunk() || self.branched_types.contains(type_name)
    }
}

/// Registry of known branches
#[derive(Debug)]
pub struct BranchRegistry {
    branches: RwLock<BTreeMap<BranchId, Arc<Branch>>>,
}

impl BranchRegistry {
    /// Create a registry holding the trunk
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(BranchId::TRUNK, Arc::new(Branch::trunk()));
        Self {
            branches: RwLock::new(branches),
        }
    }

    /// Register a newly created branch
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the id is taken or the base is unknown.
    pub fn register(&self, branch: Branch) -> Result<Arc<Branch>> {
        let mut branches = self.branches.write();
        if branches.contains_key(&branch.id) {
            return Err(Error::invalid_operation(format!(
                "{} is already registered",
                branch.id
            )));
        }
        match branch.base_branch {
            Some(base) if !branches.contains_key(&base) => {
                return Err(Error::not_found(format!("base {} of {}", base, branch.id)));
            }
            None => {
                return Err(Error::invalid_operation("only the trunk has no base branch"));
            }
            _ => {}
        }
        let branch = Arc::new(branch);
        branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    /// Remove a branch whose creating commit failed
    ///
    /// The trunk and branches other branches are based on stay. Returns
    /// whether the branch was removed.
    pub fn unregister(&self, id: BranchId) -> bool {
        let mut branches = self.branches.write();
        if id == BranchId::TRUNK || branches.values().any(|b| b.base_branch == Some(id)) {
            return false;
        }
        branches.remove(&id).is_some()
    }

    /// Look up a branch
    pub fn get(&self, id: BranchId) -> Result<Arc<Branch>> {
        self.branches
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    /// Whether a branch is known
    pub fn contains(&self, id: BranchId) -> bool {
        self.branches.read().contains_key(&id)
    }

    /// All known branches, ordered by id
    pub fn branches(&self) -> Vec<Arc<Branch>> {
        self.branches.read().values().cloned().collect()
    }

    /// Branch that physically holds objects of `type_name` seen from `branch`
    ///
    /// Walks towards the trunk until a branch that branched the type is found.
    pub fn data_branch(&self, branch: BranchId, type_name: &TypeName) -> Result<BranchId> {
        let branches = self.branches.read();
        let mut current = branch;
        loop {
            let entry = branches
                .get(&current)
                .ok_or_else(|| Error::not_found(current.to_string()))?;
            if entry.holds_type(type_name) {
                return Ok(current);
            }
            match entry.base_branch {
                Some(base) => current = base,
                None => return Ok(current),
            }
        }
    }

    /// Normalize a key to the branch that holds its data
    pub fn data_key(&self, key: &ObjectKey) -> Result<ObjectKey> {
        let branch = self.data_branch(key.branch, &key.type_name)?;
        Ok(key.on_branch(branch))
    }

    /// Branches whose objects of `referrer_type` resolve references to
    /// `target` onto `target.branch`
    ///
    /// These are the only branches where referrers of `target` can live.
    pub fn referrer_branches(
        &self,
        referrer_type: &TypeName,
        target: &ObjectKey,
    ) -> Result<Vec<BranchId>> {
        let ids: Vec<BranchId> = self.branches.read().keys().copied().collect();
        let mut result = Vec::new();
        for id in ids {
            if self.data_branch(id, referrer_type)? == id
                && self.data_branch(id, &target.type_name)? == target.branch
            {
                result.push(id);
            }
        }
        Ok(result)
    }

    /// Data key a reference stored on `from` resolves to
    ///
    /// Branch-local references resolve through `from`, global ones through
    /// the trunk.
    pub fn resolve_reference(
        &self,
        from: BranchId,
        branch_local: bool,
        target: &ObjectId,
    ) -> Result<ObjectKey> {
        let origin = if branch_local { from } else { BranchId::TRUNK };
        let branch = self.data_branch(origin, &target.type_name)?;
        Ok(ObjectKey::current(branch, target.type_name.clone(), target.name))
    }

    /// Branches holding `referrer_type` objects whose reference (local or
    /// global per `branch_local`) resolves onto `target`
    pub fn reference_sources(
        &self,
        referrer_type: &TypeName,
        branch_local: bool,
        target: &ObjectKey,
    ) -> Result<Vec<BranchId>> {
        if branch_local {
            return self.referrer_branches(referrer_type, target);
        }
        if self.data_branch(BranchId::TRUNK, &target.type_name)? != target.branch {
            return Ok(Vec::new());
        }
        let ids: Vec<BranchId> = self.branches.read().keys().copied().collect();
        let mut result = Vec::new();
        for id in ids {
            if self.data_branch(id, referrer_type)? == id {
                result.push(id);
            }
        }
        Ok(result)
    }
}

impl Default for BranchRegistry {
    fn default() -> Self {
        Self::new()
    }
}
