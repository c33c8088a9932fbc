//! # quill-sync: replicated-document sessions with durable persistence
//!
//! Multiplexes WebSocket connections onto per-room Yrs documents, loads each
//! room from RocksDB on first use, appends every accepted delta, and
//! compacts and flushes the room when its last connection leaves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ws://host/<room>   ┌─────────────────┐
//! │  Clients    │ ◄──────────────────► │ SyncServer      │
//! └─────────────┘    Binary Frames     └────────┬────────┘
//!                                               │ acquire / release
//!                                      ┌────────▼────────┐
//!                                      │ SessionRegistry │  one Session per room
//!                                      └────────┬────────┘
//!                                               │ bind / unbind
//!                                      ┌────────▼────────┐
//!                                      │PersistenceBridge│  per-room ordered writer
//!                                      └────────┬────────┘
//!                                               │
//!                                      ┌────────▼────────┐
//!                                      │ DocumentStore   │  RocksDB (LZ4)
//!                                      └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Environment-driven server configuration
//! - [`protocol`]: Binary wire protocol (bincode-encoded `Frame`)
//! - [`document`]: Yrs document wrapper and update helpers
//! - [`session`]: Per-room replica, subscribers and lifecycle
//! - [`registry`]: Room id to session map with single-flight creation
//! - [`bridge`]: Binds sessions to the store
//! - [`storage`]: Store traits, RocksDB and in-memory implementations
//! - [`server`]: WebSocket sync server, sharing its port with the control routes
//! - [`control`]: HTTP room-creation routes

pub mod bridge;
pub mod config;
pub mod control;
pub mod document;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use bridge::{BridgeStats, PersistenceBridge};
pub use config::{ConfigError, ServerConfig};
pub use document::{
    is_empty_update, merge_updates, peer_origin, DeltaSubscription, DocUpdate, DocumentError,
    RoomDocument,
};
pub use protocol::{Frame, FrameKind, ProtocolError};
pub use registry::SessionRegistry;
pub use server::{
    is_websocket_request, room_id_from_path, ServerStats, ShutdownHandle, SyncServer,
};
pub use session::{Session, SessionState};
pub use storage::{
    DocumentStore, MemoryStore, RocksStore, RoomDirectory, RoomMetadata, RoomRecord,
    StoreCallCounts, StoreConfig, StoreError,
};
