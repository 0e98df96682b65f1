//! Checksummed records of sequenced operations.
//!
//! Every operation the sequencer accepts is written as an [`OpRecord`]
//! before the in-memory notebook changes:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────────────┬──────────┐
//! │ doc_id   │ version  │ payload (bincode op)  │ checksum │
//! │ 16 bytes │ u64      │ variable              │ u32 FNV  │
//! └──────────┴──────────┴───────────────────────┴──────────┘
//! ```
//!
//! Recovery decodes records in version order and skips any that fail
//! verification.

use folio_core::Operation;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One durably logged operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    pub doc_id: Uuid,
    pub version: u64,
    /// bincode-encoded [`Operation`]
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl OpRecord {
    /// Build a record for `op` sequenced as `version`.
    pub fn new(doc_id: Uuid, version: u64, op: &Operation) -> Result<Self, RecordError> {
        let payload = bincode::serde::encode_to_vec(op, bincode::config::standard())
            .map_err(|e| RecordError::SerializationError(e.to_string()))?;
        let checksum = Self::compute_checksum(&doc_id, version, &payload);
        Ok(Self { doc_id, version, payload, checksum })
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(&self.doc_id, self.version, &self.payload)
    }

    /// FNV-1a over the header fields and the payload.
    fn compute_checksum(doc_id: &Uuid, version: u64, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        };
        doc_id.as_bytes().iter().copied().for_each(&mut mix);
        version.to_be_bytes().iter().copied().for_each(&mut mix);
        payload.iter().copied().for_each(&mut mix);
        hash
    }

    /// Decode the logged operation.
    pub fn operation(&self) -> Result<Operation, RecordError> {
        if !self.verify() {
            return Err(RecordError::ChecksumMismatch { version: self.version });
        }
        let (op, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| RecordError::DeserializationError(e.to_string()))?;
        Ok(op)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RecordError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| RecordError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Op record errors.
#[derive(Debug, Clone)]
pub enum RecordError {
    SerializationError(String),
    DeserializationError(String),
    ChecksumMismatch { version: u64 },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::SerializationError(e) => write!(f, "Record serialization error: {e}"),
            RecordError::DeserializationError(e) => write!(f, "Record deserialization error: {e}"),
            RecordError::ChecksumMismatch { version } => {
                write!(f, "Record checksum mismatch at version {version}")
            }
        }
    }
}

impl std::error::Error for RecordError {}

/// Decode and verify serialized records.
///
/// Returns `(version, operation)` pairs in version order and the number of
/// records that were corrupted and skipped.
pub fn recover_records(serialized: &[Vec<u8>]) -> (Vec<(u64, Operation)>, usize) {
    let mut valid = Vec::with_capacity(serialized.len());
    let mut corrupted = 0;

    for bytes in serialized {
        match OpRecord::decode(bytes).and_then(|r| r.operation().map(|op| (r.version, op))) {
            Ok(entry) => valid.push(entry),
            Err(e) => {
                log::warn!("Skipping op record: {e}");
                corrupted += 1;
            }
        }
    }

    valid.sort_by_key(|(version, _)| *version);
    (valid, corrupted)
}
