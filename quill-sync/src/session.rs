//! Per-room live session: one CRDT replica, its subscribers, and its
//! lifecycle state.
//!
//! Lifecycle:
//! ```text
//! Unbound ──► Binding ──► Bound ──► Unbinding ──► Closed
//!    │                      ▲
//!    └── (ephemeral room) ──┘
//! ```
//! A `Closed` session is never reused. The registry owns sessions; the
//! persistence bridge only borrows them while bound.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tokio::sync::broadcast;
use yrs::Origin;

use crate::document::{DeltaSubscription, DocUpdate, DocumentError, RoomDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Unbound = 0,
    Binding = 1,
    Bound = 2,
    Unbinding = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Unbound,
            1 => SessionState::Binding,
            2 => SessionState::Bound,
            3 => SessionState::Unbinding,
            _ => SessionState::Closed,
        }
    }
}

/// One in-memory replica for a room.
pub struct Session {
    room_id: String,
    document: RoomDocument,
    subscribers: AtomicUsize,
    state: AtomicU8,
    /// Every committed document change, fanned out to connections.
    fanout: broadcast::Sender<DocUpdate>,
    _fanout_subscription: DeltaSubscription,
}

impl Session {
    /// Create an `Unbound` session with an empty document.
    ///
    /// `capacity` bounds how many updates a slow subscriber may fall behind
    /// before it has to be resynchronised.
    pub fn new(room_id: impl Into<String>, capacity: usize) -> Result<Self, DocumentError> {
        let room_id = room_id.into();
        let document = RoomDocument::new();
        let (fanout, _) = broadcast::channel(capacity.max(1));

        let sender = fanout.clone();
        let subscription = document.observe(move |update| {
            // No receivers is fine: nobody is attached yet
            let _ = sender.send(update);
        })?;

        log::debug!("Created session for room '{room_id}'");
        Ok(Self {
            room_id,
            document,
            subscribers: AtomicUsize::new(0),
            state: AtomicU8::new(SessionState::Unbound as u8),
            fanout,
            _fanout_subscription: subscription,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn document(&self) -> &RoomDocument {
        &self.document
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Returns false if the session was not in `from`.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            log::trace!("Room '{}': {from:?} -> {to:?}", self.room_id);
        } else {
            log::warn!(
                "Room '{}': refused {from:?} -> {to:?} (currently {:?})",
                self.room_id,
                self.state()
            );
        }
        ok
    }

    pub(crate) fn set_state(&self, to: SessionState) {
        self.state.store(to as u8, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Returns the new count.
    pub(crate) fn add_subscriber(&self) -> usize {
        self.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the new count. Never goes below zero.
    pub(crate) fn remove_subscriber(&self) -> usize {
        let previous = self
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn clear_subscribers(&self) {
        self.subscribers.store(0, Ordering::SeqCst);
    }

    /// Receiver for every change committed to this session's document.
    pub fn subscribe(&self) -> broadcast::Receiver<DocUpdate> {
        self.fanout.subscribe()
    }

    /// Merge a delta received from a connection.
    pub fn apply_delta(&self, delta: &[u8], origin: Option<Origin>) -> Result<(), DocumentError> {
        self.document.apply_delta(delta, origin)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
