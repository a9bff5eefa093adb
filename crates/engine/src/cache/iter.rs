//! Fail-fast iteration over cache views
//!
//! A [`FailFastIter`] walks a snapshot of a view and, before yielding each
//! element, re-reads the view's modification stamp. If the view changed
//! underneath (a local write in the same transaction, or the session
//! advancing past a foreign commit) the iterator yields one
//! `ConcurrentModification` error and then ends.

use chronicle_concurrency::Pin;
use chronicle_core::{Error, Result};

type StampSource<'a> = Box<dyn Fn() -> Result<u64> + Send + 'a>;

/// Iterator that fails on concurrent modification of its view
pub struct FailFastIter<'a, T> {
    items: std::vec::IntoIter<T>,
    expected: u64,
    current_stamp: StampSource<'a>,
    description: String,
    failed: bool,
    _pin: Pin,
}

impl<'a, T> FailFastIter<'a, T> {
    /// Iterate `items`, taken from a view value with stamp `expected`
    ///
    /// `current_stamp` reads the view's stamp now; `pin` keeps the
    /// snapshot's revision readable for the iterator's lifetime.
    pub fn new(
        items: Vec<T>,
        expected: u64,
        current_stamp: impl Fn() -> Result<u64> + Send + 'a,
        description: impl Into<String>,
        pin: Pin,
    ) -> Self {
        Self {
            items: items.into_iter(),
            expected,
            current_stamp: Box::new(current_stamp),
            description: description.into(),
            failed: false,
            _pin: pin,
        }
    }

    /// Elements not yet yielded
    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl<'a, T> Iterator for FailFastIter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.items.len() == 0 {
            return None;
        }
        match (self.current_stamp)() {
            Ok(stamp) if stamp == self.expected => self.items.next().map(Ok),
            Ok(_) => {
                self.failed = true;
                Some(Err(Error::concurrent_modification(self.description.clone())))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a, T> std::fmt::Debug for FailFastIter<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailFastIter")
            .field("description", &self.description)
            .field("remaining", &self.remaining())
            .field("failed", &self.failed)
            .finish()
    }
}
