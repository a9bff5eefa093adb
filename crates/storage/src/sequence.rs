//! In-memory sequence service
//!
//! Each named sequence is a row guarded by the service mutex, the
//! in-memory counterpart of a row-locked sequence table.

use chronicle_core::{Result, SequenceService};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Named monotonic counters
#[derive(Debug, Default)]
pub struct MemorySequence {
    rows: Mutex<FxHashMap<String, i64>>,
}

impl MemorySequence {
    /// Create a service where every sequence starts at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current value of a sequence
    ///
    /// The next call to `next_value(name)` returns `value + 1`.
    pub fn with_value(self, name: &str, value: i64) -> Self {
        self.rows.lock().insert(name.to_string(), value);
        self
    }
}

impl SequenceService for MemorySequence {
    fn next_value(&self, name: &str) -> Result<i64> {
        let mut rows = self.rows.lock();
        let row = rows.entry(name.to_string()).or_insert(0);
        *row += 1;
        Ok(*row)
    }

    fn current_value(&self, name: &str) -> Result<i64> {
        Ok(self.rows.lock().get(name).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequences_are_independent() {
        let seq = MemorySequence::new().with_value("branch", 1);
        assert_eq!(seq.next_value("revision").unwrap(), 1);
        assert_eq!(seq.next_value("revision").unwrap(), 2);
        assert_eq!(seq.next_value("branch").unwrap(), 2);
        assert_eq!(seq.current_value("revision").unwrap(), 2);
        assert_eq!(seq.current_value("unused").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_next_value_is_unique() {
        let seq = Arc::new(MemorySequence::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || {
                    (0..250)
                        .map(|_| seq.next_value("object").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(seq.current_value("object").unwrap(), 1000);
    }
}
