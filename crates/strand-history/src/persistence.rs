//! Encoding of history records into store blobs.
//!
//! The execution store is payload-agnostic; this module owns the format.
//! Snapshots, events and tasks are JSON.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::events::HistoryEvent;
use crate::replication::ReplicationTask;
use crate::state::MutableState;
use crate::tasks::HistoryTask;

fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::serialization(format!("corrupt {what}: {e}")))
}

/// Encodes a mutable-state snapshot.
pub fn encode_snapshot(state: &MutableState) -> Result<Bytes> {
    encode(state)
}

/// Decodes a mutable-state snapshot.
pub fn decode_snapshot(bytes: &[u8]) -> Result<MutableState> {
    decode("snapshot", bytes)
}

/// Encodes history events.
pub fn encode_events(events: &[HistoryEvent]) -> Result<Vec<Bytes>> {
    events.iter().map(encode).collect()
}

/// Decodes history events.
pub fn decode_events(blobs: &[Bytes]) -> Result<Vec<HistoryEvent>> {
    blobs.iter().map(|b| decode("history event", b)).collect()
}

/// Encodes a transfer task.
pub fn encode_task(task: &HistoryTask) -> Result<Bytes> {
    encode(task)
}

/// Decodes a transfer task.
pub fn decode_task(bytes: &[u8]) -> Result<HistoryTask> {
    decode("transfer task", bytes)
}

/// Encodes a replication task.
pub fn encode_replication_task(task: &ReplicationTask) -> Result<Bytes> {
    encode(task)
}

/// Decodes a replication task.
pub fn decode_replication_task(bytes: &[u8]) -> Result<ReplicationTask> {
    decode("replication task", bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_blob_is_serialization_error() {
        let err = decode_snapshot(b"{not json").unwrap_err();
        assert!(err.to_string().contains("corrupt snapshot"));
        assert!(!err.is_retryable());
    }
}
