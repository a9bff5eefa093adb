//! Applying other nodes' commits
//!
//! Every node appends its commits to the shared replay log. A node consumes
//! the log in order: its own records only move its position forward, foreign
//! records are appended to its history and published on its chain. The
//! store is shared, so replay never writes rows.
//!
//! Records must form an unbroken sequence: each one names its predecessor
//! revision, and a record whose predecessor is not the last applied
//! revision fails with `ReplicationGap`.

use crate::database::{Database, ReplicationState};
use chronicle_core::{Error, Result, RevisionNumber};
use chronicle_durability::ReplayRecord;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

impl Database {
    /// Apply every record past the node's position
    ///
    /// Returns the number of foreign revisions applied.
    pub(crate) fn drain(&self, state: &mut ReplicationState) -> Result<usize> {
        let log = self.backend().replay_log();
        if log.len() <= state.position {
            return Ok(0);
        }
        let records = log.read_from(state.position).map_err(|e| {
            error!(
                target: "chronicle::replication",
                position = state.position,
                error = %e,
                "replay log unreadable"
            );
            e
        })?;
        let mut applied = 0;
        for record in records {
            if self.apply_record(state, record)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Apply one record; returns whether it was foreign
    fn apply_record(&self, state: &mut ReplicationState, record: ReplayRecord) -> Result<bool> {
        if record.node == self.node() {
            state.position += 1;
            return Ok(false);
        }
        let revision = record.commit_number();
        if record.event.previous_revision != state.last_revision {
            let err = Error::ReplicationGap {
                expected: state.last_revision,
                previous: record.event.previous_revision,
                found: revision,
            };
            error!(target: "chronicle::replication", error = %err, "replay stopped");
            return Err(err);
        }

        self.history().append(record.revision)?;
        for branch in &record.event.created_branches {
            if !self.branches().contains(branch.id) {
                self.branches().register(branch.clone())?;
            }
        }
        self.chain().publish(record.event)?;
        state.position += 1;
        state.last_revision = revision;
        trace!(
            target: "chronicle::replication",
            origin = %record.node,
            revision,
            position = state.position,
            "record applied"
        );
        Ok(true)
    }

    /// Wait until at least one foreign revision was applied
    ///
    /// Returns the newest applied revision.
    ///
    /// # Errors
    ///
    /// Returns `RefetchTimeout` if nothing arrived within `timeout`, and
    /// replay failures (`ReplicationGap`, `Corruption`).
    pub fn refetch(&self, timeout: Duration) -> Result<RevisionNumber> {
        let started = Instant::now();
        loop {
            let position = {
                let mut state = self.replication().lock();
                if self.drain(&mut state)? > 0 {
                    debug!(
                        target: "chronicle::replication",
                        revision = state.last_revision,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "refetch applied foreign revisions"
                    );
                    return Ok(state.last_revision);
                }
                state.position
            };
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(Error::RefetchTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                    revision: self.latest_revision(),
                });
            }
            self.backend().replay_log().wait_beyond(position, remaining);
        }
    }
}
