//! Binary frame protocol for room synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────────────────┐
//! │ kind     │ payload              │
//! │ 1 byte   │ varint len + bytes   │
//! └──────────┴──────────────────────┘
//! ```
//!
//! The room is selected by the WebSocket request path, so frames carry no
//! room or peer identifiers. Handshake follows the y-sync exchange:
//!
//! 1. On attach the server sends `SyncStep1` with the room's state vector.
//! 2. Either side answers a `SyncStep1` with a `SyncStep2` holding the diff.
//! 3. Afterwards every mutation travels as an `Update`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Encoded state vector; the receiver replies with the missing diff
    SyncStep1 = 1,
    /// Diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental CRDT delta
    Update = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a sync step 1 (state vector).
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncStep1,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff).
    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncStep2,
            payload: diff,
        }
    }

    /// Create an incremental update frame.
    pub fn update(delta: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Update,
            payload: delta,
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: FrameKind::Ping,
            payload: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: FrameKind::Pong,
            payload: Vec::new(),
        }
    }

    /// Whether this frame carries document changes to merge.
    pub fn carries_delta(&self) -> bool {
        matches!(self.kind, FrameKind::SyncStep2 | FrameKind::Update)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid payload for {kind:?} frame: {reason}")]
    InvalidPayload { kind: FrameKind, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let frame = Frame::update(vec![1, 2, 3, 4, 5]);
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, FrameKind::Update);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sync_steps_carry_payload() {
        let step1 = Frame::decode(&Frame::sync_step1(vec![10, 20]).encode().unwrap()).unwrap();
        let step2 = Frame::decode(&Frame::sync_step2(vec![30]).encode().unwrap()).unwrap();

        assert_eq!(step1.kind, FrameKind::SyncStep1);
        assert_eq!(step1.payload, vec![10, 20]);
        assert_eq!(step2.kind, FrameKind::SyncStep2);
        assert_eq!(step2.payload, vec![30]);
    }

    #[test]
    fn test_carries_delta() {
        assert!(Frame::update(vec![1]).carries_delta());
        assert!(Frame::sync_step2(vec![1]).carries_delta());
        assert!(!Frame::sync_step1(vec![1]).carries_delta());
        assert!(!Frame::ping().carries_delta());
    }

    #[test]
    fn test_frame_overhead_small() {
        let encoded = Frame::update(vec![0u8; 50]).encode().unwrap();
        // kind + length prefix + payload
        assert!(encoded.len() <= 53, "frame of {} bytes", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_frame_kind_values() {
        assert_eq!(FrameKind::SyncStep1 as u8, 1);
        assert_eq!(FrameKind::SyncStep2 as u8, 2);
        assert_eq!(FrameKind::Update as u8, 3);
        assert_eq!(FrameKind::Ping as u8, 4);
        assert_eq!(FrameKind::Pong as u8, 5);
    }
}
