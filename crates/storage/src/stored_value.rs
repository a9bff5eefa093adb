//! Storage-layer object state with its validity range
//!
//! A [`StoredState`] is one immutable state of an object together with the
//! half-open revision range `[valid_from, valid_to)` over which it holds and
//! the revision its incarnation started at. Closing a state only ever sets
//! `valid_to`; the values are never edited after the creating revision.

use chronicle_core::{Attributes, RevisionNumber};

/// One state of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    valid_from: RevisionNumber,
    valid_to: Option<RevisionNumber>,
    created_at: RevisionNumber,
    values: Attributes,
}

impl StoredState {
    /// State of a freshly created incarnation
    pub fn created(values: Attributes, revision: RevisionNumber) -> Self {
        Self {
            valid_from: revision,
            valid_to: None,
            created_at: revision,
            values,
        }
    }

    /// Successor state of the same incarnation
    pub fn successor(&self, values: Attributes, revision: RevisionNumber) -> Self {
        Self {
            valid_from: revision,
            valid_to: None,
            created_at: self.created_at,
            values,
        }
    }

    /// First revision of this state
    pub fn valid_from(&self) -> RevisionNumber {
        self.valid_from
    }

    /// First revision after this state, `None` while newest
    pub fn valid_to(&self) -> Option<RevisionNumber> {
        self.valid_to
    }

    /// Creation revision of the incarnation this state belongs to
    pub fn created_at(&self) -> RevisionNumber {
        self.created_at
    }

    /// Attribute values
    pub fn values(&self) -> &Attributes {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut Attributes {
        &mut self.values
    }

    /// Whether the state is still open
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Whether the state holds at `revision`
    pub fn covers(&self, revision: RevisionNumber) -> bool {
        self.valid_from <= revision && self.valid_to.map_or(true, |to| revision < to)
    }

    /// End the state at `revision`
    pub(crate) fn close(&mut self, revision: RevisionNumber) {
        self.valid_to = Some(revision);
    }

    /// Make the state newest again
    pub(crate) fn reopen(&mut self) {
        self.valid_to = None;
    }
}
