//! Durable storage for room documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append / compact / write  ┌───────────────┐
//! │ PersistenceBridge│ ─────────────────────────► │ DocumentStore │
//! │ (per-room queue) │ ◄───────────────────────── │ (RocksDB)     │
//! └──────────────────┘        load full state     └───────┬───────┘
//!                                                         │
//!                              ┌──────────────────────────┴──────┐
//!                              │ CF "documents": full states     │
//!                              │ CF "deltas":    appended deltas │
//!                              │ CF "metadata":  per-room counts │
//!                              │ CF "rooms":     room directory  │
//!                              └─────────────────────────────────┘
//! ```
//!
//! Logical layout per room: an ordered sequence of delta records plus at most
//! one full-state record. `compact` replaces the delta sequence with a single
//! full-state record equivalent to applying all of them in order.
//!
//! Store calls are blocking; callers on the async runtime go through
//! `tokio::task::spawn_blocking`. Implementations must be safe for
//! concurrent use across distinct rooms. Ordering within a room is the
//! caller's job.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryStore, StoreCall, StoreCallCounts};
pub use rocks::{RocksStore, RoomMetadata, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Store unavailable or corrupt while reading.
    #[error("read failed for room '{room}': {reason}")]
    Read { room: String, reason: String },
    /// Append, compact, or full-state write failed.
    #[error("write failed for room '{room}': {reason}")]
    Write { room: String, reason: String },
    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn read(room: &str, reason: impl std::fmt::Display) -> Self {
        StoreError::Read {
            room: room.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn write(room: &str, reason: impl std::fmt::Display) -> Self {
        StoreError::Write {
            room: room.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Key-addressed storage for per-room document state.
pub trait DocumentStore: Send + Sync + 'static {
    /// Full persisted state of `room`, with pending deltas folded in.
    /// Empty bytes when nothing is stored.
    fn load_full_state(&self, room: &str) -> Result<Vec<u8>, StoreError>;

    /// Append one delta to the room's delta sequence.
    fn append_delta(&self, room: &str, delta: &[u8]) -> Result<(), StoreError>;

    /// Collapse appended deltas into the full-state record.
    fn compact(&self, room: &str) -> Result<(), StoreError>;

    /// Overwrite the authoritative full-state record.
    fn write_full_state(&self, room: &str, state: &[u8]) -> Result<(), StoreError>;

    /// Flush and stop accepting writes.
    fn close(&self) -> Result<(), StoreError>;
}

/// Room metadata record kept by the room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub room_id: String,
    pub owner_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

impl RoomRecord {
    /// New record with a freshly generated identifier.
    pub fn generate(owner_id: Option<String>) -> Self {
        Self {
            room_id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            created_at: unix_now(),
        }
    }
}

/// Room metadata creation used by the control endpoint.
pub trait RoomDirectory: Send + Sync + 'static {
    fn create_room(&self, owner_id: Option<String>) -> Result<RoomRecord, StoreError>;

    fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
