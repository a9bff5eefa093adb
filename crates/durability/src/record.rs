//! Replay record format
//!
//! Every revision a node commits is appended to the replay log as one
//! self-delimiting frame. Other nodes decode the frames in order and apply
//! the contained event to their own chain.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1)   │ Payload (variable)      │ CRC32 (4)│
//! └─────────────────┴──────────────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The length covers format version, payload and CRC. The CRC covers format
//! version and payload. The payload is the MessagePack encoding of
//! [`ReplayRecord`].

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use chronicle_core::{Error, NodeId, Revision, RevisionNumber, UpdateEvent};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Current replay record format version
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Bytes of framing around the payload: length + version + CRC
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

/// One committed revision as shipped to other nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Node that committed the revision
    pub node: NodeId,
    /// The revision itself
    pub revision: Revision,
    /// Event leading from the previous revision to this one
    pub event: UpdateEvent,
}

impl ReplayRecord {
    /// Create a record
    pub fn new(node: NodeId, revision: Revision, event: UpdateEvent) -> Self {
        Self {
            node,
            revision,
            event,
        }
    }

    /// Commit number of the carried revision
    pub fn commit_number(&self) -> RevisionNumber {
        self.revision.commit_number
    }

    /// Serialize record to one frame
    ///
    /// Format: length (4) + format_version (1) + payload + crc32 (4)
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut body = Vec::with_capacity(256);
        body.push(RECORD_FORMAT_VERSION);
        rmp_serde::encode::write(&mut body, self)?;

        let crc = compute_crc(&body);
        let total_len = body.len() + 4;
        let length = u32::try_from(total_len).map_err(|_| RecordError::TooLarge(total_len))?;

        let mut frame = Vec::with_capacity(4 + total_len);
        frame.write_u32::<LittleEndian>(length)?;
        frame.extend_from_slice(&body);
        frame.write_u32::<LittleEndian>(crc)?;
        Ok(frame)
    }

    /// Deserialize one frame from the start of `bytes`
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        let body = verify_frame(bytes)?;
        let format_version = body[0];
        if format_version != RECORD_FORMAT_VERSION {
            return Err(RecordError::UnsupportedVersion(format_version));
        }
        let record = rmp_serde::from_slice(&body[1..])?;
        Ok((record, 4 + body.len() + 4))
    }

    /// Decode every frame of a concatenated buffer
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Self>, RecordError> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let (record, consumed) = Self::from_bytes(bytes)?;
            records.push(record);
            bytes = &bytes[consumed..];
        }
        Ok(records)
    }
}

/// Check length and CRC of the frame at the start of `bytes`
///
/// Returns the checked body (format version + payload).
pub fn verify_frame(bytes: &[u8]) -> Result<&[u8], RecordError> {
    if bytes.len() < 4 {
        return Err(RecordError::InsufficientData);
    }
    let length = LittleEndian::read_u32(&bytes[0..4]) as usize;
    if length < 5 {
        // Minimum: 1 byte format version + 4 bytes CRC
        return Err(RecordError::InvalidFormat);
    }
    if bytes.len() < 4 + length {
        return Err(RecordError::InsufficientData);
    }

    let body = &bytes[4..length];
    let stored = LittleEndian::read_u32(&bytes[length..4 + length]);
    let computed = compute_crc(body);
    if computed != stored {
        return Err(RecordError::ChecksumMismatch {
            expected: stored,
            computed,
        });
    }
    Ok(body)
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Replay record parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Not enough data to parse record
    #[error("insufficient data to parse record")]
    InsufficientData,

    /// Record format is invalid
    #[error("invalid record format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unsupported format version
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    /// Frame does not fit the length prefix
    #[error("record of {0} bytes exceeds the frame limit")]
    TooLarge(usize),

    /// Payload could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// Payload could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),
}

impl From<rmp_serde::encode::Error> for RecordError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RecordError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RecordError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RecordError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for RecordError {
    fn from(e: std::io::Error) -> Self {
        RecordError::Encode(e.to_string())
    }
}

impl From<RecordError> for Error {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Encode(msg) => Error::Serialization(msg),
            other => Error::corruption(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_core::{attrs, BranchId, ObjectKey, ObjectName, Value};

    fn record(revision: RevisionNumber) -> ReplayRecord {
        let mut event = UpdateEvent::new(revision, revision - 1);
        event.created.insert(
            ObjectKey::current(BranchId::TRUNK, "Person", ObjectName::new(revision)),
            attrs([("name", Value::from("ada"))]),
        );
        ReplayRecord::new(NodeId::new(), Revision::new(revision, "tester"), event)
    }

    #[test]
    fn test_record_roundtrip() {
        let original = record(3);
        let bytes = original.to_bytes().unwrap();
        let (decoded, consumed) = ReplayRecord::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.commit_number(), 3);
    }

    #[test]
    fn test_checksum_failure() {
        let mut bytes = record(1).to_bytes().unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        assert!(matches!(
            ReplayRecord::from_bytes(&bytes),
            Err(RecordError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_insufficient_data() {
        let bytes = record(1).to_bytes().unwrap();
        assert_eq!(
            ReplayRecord::from_bytes(&bytes[..3]).unwrap_err(),
            RecordError::InsufficientData
        );
        assert_eq!(
            ReplayRecord::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err(),
            RecordError::InsufficientData
        );
    }

    #[test]
    fn test_unsupported_version() {
        let mut body = vec![RECORD_FORMAT_VERSION + 1];
        body.extend_from_slice(&[0x90]);
        let crc = compute_crc(&body);
        let mut frame = Vec::new();
        frame.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(
            ReplayRecord::from_bytes(&frame).unwrap_err(),
            RecordError::UnsupportedVersion(RECORD_FORMAT_VERSION + 1)
        );
    }

    #[test]
    fn test_multiple_records_in_sequence() {
        let mut buffer = Vec::new();
        for r in 1..=3 {
            buffer.extend(record(r).to_bytes().unwrap());
        }
        let records = ReplayRecord::decode_all(&buffer).unwrap();
        let revisions: Vec<_> = records.iter().map(|r| r.commit_number()).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[test]
    fn test_record_error_maps_to_corruption() {
        let err: Error = RecordError::InvalidFormat.into();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
