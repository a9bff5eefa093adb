//! Replay log shared by the nodes of a cluster
//!
//! The log is an append-only sequence of framed [`ReplayRecord`]s. A
//! node's position in the log is the number of records it has consumed.
//! Appends happen under the cluster commit lock, so frames are in commit
//! order.

use crate::record::ReplayRecord;
use chronicle_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Append-only log of committed revisions
pub trait ReplayLog: Send + Sync {
    /// Append a record; returns the log length after the append
    fn append(&self, record: &ReplayRecord) -> Result<u64>;

    /// Decode every record at or after `position`
    ///
    /// # Errors
    ///
    /// Returns `Corruption` for a damaged frame. Records before the damaged
    /// one are not returned either.
    fn read_from(&self, position: u64) -> Result<Vec<ReplayRecord>>;

    /// Number of records in the log
    fn len(&self) -> u64;

    /// Whether the log is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the log holds more than `position` records or `timeout`
    /// elapses; returns whether new records are available
    fn wait_beyond(&self, position: u64, timeout: Duration) -> bool;
}

/// In-memory replay log
///
/// Frames are kept encoded, exactly as a durable log would hold them.
#[derive(Debug, Default)]
pub struct MemoryReplayLog {
    frames: Mutex<Vec<Vec<u8>>>,
    appended: Condvar,
}

impl MemoryReplayLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenated frames of the whole log
    pub fn encode(&self) -> Vec<u8> {
        self.frames.lock().concat()
    }

    /// Rebuild a log from concatenated frames
    ///
    /// # Errors
    ///
    /// Returns `Corruption` if any frame is damaged or truncated.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut frames = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let (_, consumed) = ReplayRecord::from_bytes(rest)?;
            frames.push(rest[..consumed].to_vec());
            rest = &rest[consumed..];
        }
        Ok(Self {
            frames: Mutex::new(frames),
            appended: Condvar::new(),
        })
    }

    /// Overwrite one byte of a stored frame
    #[cfg(test)]
    pub(crate) fn damage(&self, index: usize, offset: usize) {
        if let Some(frame) = self.frames.lock().get_mut(index) {
            if let Some(byte) = frame.get_mut(offset) {
                *byte ^= 0xFF;
            }
        }
    }
}

impl ReplayLog for MemoryReplayLog {
    fn append(&self, record: &ReplayRecord) -> Result<u64> {
        let frame = record.to_bytes()?;
        let mut frames = self.frames.lock();
        frames.push(frame);
        let len = frames.len() as u64;
        drop(frames);
        self.appended.notify_all();
        trace!(
            target: "chronicle::replication",
            revision = record.commit_number(),
            len,
            "record appended"
        );
        Ok(len)
    }

    fn read_from(&self, position: u64) -> Result<Vec<ReplayRecord>> {
        let frames = self.frames.lock();
        let start = usize::try_from(position).unwrap_or(usize::MAX).min(frames.len());
        frames[start..]
            .iter()
            .enumerate()
            .map(|(offset, frame)| {
                ReplayRecord::from_bytes(frame)
                    .map(|(record, _)| record)
                    .map_err(|e| {
                        error!(
                            target: "chronicle::replication",
                            position = start + offset,
                            error = %e,
                            "damaged replay record"
                        );
                        Error::corruption(format!("replay record {}: {}", start + offset, e))
                    })
            })
            .collect()
    }

    fn len(&self) -> u64 {
        self.frames.lock().len() as u64
    }

    fn wait_beyond(&self, position: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        while frames.len() as u64 <= position {
            if self.appended.wait_until(&mut frames, deadline).timed_out() {
                return frames.len() as u64 > position;
            }
        }
        true
    }
}
