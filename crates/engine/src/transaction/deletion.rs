//! Deletion planning
//!
//! Deleting an object visits every reference that resolves onto it, on
//! every branch that can hold such a reference, and asks the reference's
//! deletion policy what to do. `DeleteReferer` deletes the referrer too and
//! its referrers are visited in turn. The plan is computed completely before
//! anything is recorded, so a veto anywhere leaves the transaction as it
//! was.

use super::Transaction;
use chronicle_core::{
    attribute, evaluate_deletion, Attributes, DeletionAction, Error, ObjectKey, Result, Value,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Everything a deletion records
#[derive(Debug, Default)]
pub(super) struct DeletionPlan {
    /// Objects to delete, the requested one first
    pub(super) deletions: Vec<ObjectKey>,
    /// Reference rewrites on surviving referrers
    pub(super) rewrites: Vec<(ObjectKey, String, Value)>,
}

pub(super) fn plan(txn: &Transaction<'_>, target: &ObjectKey) -> Result<DeletionPlan> {
    if !txn.exists(target)? {
        return Err(Error::deleted_object(target.clone(), txn.read_base()));
    }
    let schema = txn.db().backend().schema();
    let branches = txn.db().branches();

    let mut queue = VecDeque::from([target.clone()]);
    let mut deleted = BTreeSet::new();
    let mut plan = DeletionPlan::default();
    let mut rewrites: BTreeMap<(ObjectKey, String), Value> = BTreeMap::new();

    while let Some(victim) = queue.pop_front() {
        if !deleted.insert(victim.clone()) {
            continue;
        }
        plan.deletions.push(victim.clone());
        let victim_id = victim.object_id();

        for (referrer_type, attr, def) in schema.referrers_of(&victim.type_name) {
            for branch in branches.reference_sources(&referrer_type, def.branch_local, &victim)? {
                let matches = |values: &Attributes| {
                    attribute(values, &attr).refers_to(&victim_id)
                };
                for (referrer, _) in txn.merged_scan(branch, &referrer_type, &matches)? {
                    if deleted.contains(&referrer) {
                        continue;
                    }
                    match evaluate_deletion(def.deletion, &victim_id, txn.read_base()) {
                        DeletionAction::Rewrite(value) => {
                            rewrites.insert((referrer, attr.clone()), value);
                        }
                        DeletionAction::DeleteReferer => queue.push_back(referrer),
                        DeletionAction::Veto => {
                            return Err(Error::DeletionVetoed {
                                target: victim,
                                referrer,
                                attribute: attr,
                            });
                        }
                    }
                }
            }
        }
    }

    plan.rewrites = rewrites
        .into_iter()
        .filter(|((referrer, _), _)| !deleted.contains(referrer))
        .map(|((referrer, attr), value)| (referrer, attr, value))
        .collect();
    Ok(plan)
}
