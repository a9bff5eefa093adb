//! Replication log for chronicle
//!
//! This crate ships committed revisions between cluster nodes:
//!
//! - ReplayRecord: one committed revision with its event, framed with a
//!   length prefix, format version and CRC32
//! - ReplayLog: the append-only log contract
//! - MemoryReplayLog: in-memory log keeping encoded frames

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod log;
pub mod record;

pub use log::{MemoryReplayLog, ReplayLog};
pub use record::{verify_frame, RecordError, ReplayRecord, FRAME_OVERHEAD, RECORD_FORMAT_VERSION};
