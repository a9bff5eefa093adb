//! Revisions and the append-only revision history
//!
//! A [`Revision`] is created exactly once, at commit, from the next value of
//! the revision sequence. It is never mutated afterwards.
//!
//! [`RevisionHistory`] records every revision a node knows about, local and
//! replicated, in strictly increasing commit-number order.

use crate::error::{Error, Result};
use crate::types::{RevisionNumber, INITIAL_REVISION};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Author recorded on the initial revision.
pub const SYSTEM_AUTHOR: &str = "system";

/// One committed revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Commit number drawn from the revision sequence
    pub commit_number: RevisionNumber,
    /// Who committed
    pub author: String,
    /// When the commit happened
    pub timestamp: DateTime<Utc>,
}

impl Revision {
    /// Create a revision stamped with the current time
    pub fn new(commit_number: RevisionNumber, author: impl Into<String>) -> Self {
        Self {
            commit_number,
            author: author.into(),
            timestamp: Utc::now(),
        }
    }

    /// The empty initial state
    pub fn initial() -> Self {
        Self::new(INITIAL_REVISION, SYSTEM_AUTHOR)
    }
}

/// Append-only history of revisions
///
/// Commit numbers are strictly increasing but need not be dense: a node
/// only records revisions that carried data.
#[derive(Debug)]
pub struct RevisionHistory {
    entries: RwLock<Vec<Revision>>,
}

impl RevisionHistory {
    /// Create a history holding only the initial revision
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(vec![Revision::initial()]),
        }
    }

    /// Append a revision
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the commit number does not exceed the
    /// latest recorded one.
    pub fn append(&self, revision: Revision) -> Result<()> {
        let mut entries = self.entries.write();
        let latest = entries.last().map_or(INITIAL_REVISION, |r| r.commit_number);
        if revision.commit_number <= latest {
            return Err(Error::invalid_operation(format!(
                "revision {} does not follow latest revision {}",
                revision.commit_number, latest
            )));
        }
        entries.push(revision);
        Ok(())
    }

    /// Remove `commit_number` if it is the latest recorded revision
    ///
    /// Used when a commit fails after its revision was appended. Returns
    /// whether the entry was removed.
    pub fn retract(&self, commit_number: RevisionNumber) -> bool {
        let mut entries = self.entries.write();
        if entries.len() > 1 && entries.last().map(|r| r.commit_number) == Some(commit_number) {
            entries.pop();
            true
        } else {
            false
        }
    }

    /// Latest recorded revision
    pub fn latest(&self) -> Revision {
        self.entries
            .read()
            .last()
            .cloned()
            .unwrap_or_else(Revision::initial)
    }

    /// Commit number of the latest recorded revision
    pub fn latest_number(&self) -> RevisionNumber {
        self.entries
            .read()
            .last()
            .map_or(INITIAL_REVISION, |r| r.commit_number)
    }

    /// Look up a revision by commit number
    pub fn get(&self, commit_number: RevisionNumber) -> Option<Revision> {
        let entries = self.entries.read();
        entries
            .binary_search_by_key(&commit_number, |r| r.commit_number)
            .ok()
            .map(|i| entries[i].clone())
    }

    /// Revisions with `from < commit_number <= to`, oldest first
    pub fn range(&self, from: RevisionNumber, to: RevisionNumber) -> Vec<Revision> {
        self.entries
            .read()
            .iter()
            .filter(|r| r.commit_number > from && r.commit_number <= to)
            .cloned()
            .collect()
    }

    /// Number of recorded revisions, including the initial one
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether only the initial revision is recorded
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for RevisionHistory {
    fn default() -> Self {
        Self::new()
    }
}
