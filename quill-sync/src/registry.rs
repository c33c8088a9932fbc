//! Room id → session map with single-flight creation.
//!
//! Every room id gets a slot guarded by its own async mutex. The global map
//! is only locked long enough to find or insert a slot, so rooms never wait
//! on each other. Creation, binding and teardown of a room's session all
//! happen while holding that room's slot, which gives:
//!
//! - exactly one session (and one store load) per room, however many
//!   connections race to acquire it;
//! - an `acquire` that arrives while the last `release` is still flushing
//!   waits for the flush, finds the slot retired, and starts over on a fresh
//!   slot with a fresh session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;

use crate::bridge::PersistenceBridge;
use crate::document::DocumentError;
use crate::session::{Session, SessionState};

#[derive(Default)]
struct SlotState {
    session: Option<Arc<Session>>,
    /// Set once the slot's session has closed. A retired slot is already out
    /// of the map; anyone still holding it must look the room up again.
    retired: bool,
}

#[derive(Default)]
struct RoomSlot {
    state: AsyncMutex<SlotState>,
}

pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Arc<RoomSlot>>>,
    bridge: Arc<PersistenceBridge>,
    broadcast_capacity: usize,
}

impl SessionRegistry {
    pub fn new(bridge: Arc<PersistenceBridge>, broadcast_capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            bridge,
            broadcast_capacity,
        }
    }

    /// Return the room's live session, creating and binding it on first use,
    /// and count the caller as a subscriber.
    pub async fn acquire(&self, room_id: &str) -> Result<Arc<Session>, DocumentError> {
        loop {
            let slot = self
                .lock_slots()
                .entry(room_id.to_string())
                .or_default()
                .clone();

            let mut state = slot.state.lock().await;
            if state.retired {
                log::debug!("Room '{room_id}' closed while waiting; retrying acquire");
                continue;
            }

            let session = match &state.session {
                Some(session) => session.clone(),
                None => {
                    let session = Arc::new(Session::new(room_id, self.broadcast_capacity)?);
                    self.bridge.bind(&session).await?;
                    log::info!("Session for room '{room_id}' opened");
                    state.session = Some(session.clone());
                    session
                }
            };

            let count = session.add_subscriber();
            log::debug!("Room '{room_id}' now has {count} subscriber(s)");
            return Ok(session);
        }
    }

    /// Drop one subscriber. The last one out flushes and closes the session.
    pub async fn release(&self, room_id: &str, session: &Arc<Session>) {
        let slot = self.lock_slots().get(room_id).cloned();
        let Some(slot) = slot else {
            log::warn!("Release for unknown room '{room_id}'");
            return;
        };

        let mut state = slot.state.lock().await;
        match &state.session {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => {
                log::warn!("Release of a stale session for room '{room_id}'");
                return;
            }
        }

        let remaining = session.remove_subscriber();
        if remaining > 0 {
            log::debug!("Room '{room_id}' now has {remaining} subscriber(s)");
            return;
        }

        self.close(room_id, &slot, &mut state).await;
    }

    /// Flush and close every live session. Used at shutdown.
    ///
    /// Returns how many sessions were closed.
    pub async fn drain(&self) -> usize {
        let slots: Vec<(String, Arc<RoomSlot>)> = self
            .lock_slots()
            .iter()
            .map(|(room, slot)| (room.clone(), slot.clone()))
            .collect();

        let mut drained = 0;
        for (room_id, slot) in slots {
            let mut state = slot.state.lock().await;
            let Some(session) = state.session.clone() else {
                continue;
            };
            if session.subscriber_count() > 0 {
                log::warn!(
                    "Draining room '{room_id}' with {} subscriber(s) still attached",
                    session.subscriber_count()
                );
                session.clear_subscribers();
            }
            self.close(&room_id, &slot, &mut state).await;
            drained += 1;
        }

        if drained > 0 {
            log::info!("Drained {drained} session(s)");
        }
        drained
    }

    async fn close(&self, room_id: &str, slot: &Arc<RoomSlot>, state: &mut SlotState) {
        let Some(session) = state.session.take() else {
            return;
        };

        session.transition(SessionState::Bound, SessionState::Unbinding);
        self.bridge.unbind(&session).await;
        session.set_state(SessionState::Closed);
        state.retired = true;

        let mut slots = self.lock_slots();
        if slots.get(room_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(room_id);
        }
        drop(slots);

        log::info!("Session for room '{room_id}' closed");
    }

    /// The live session for `room_id`, if any. Does not count as a subscriber.
    pub async fn get(&self, room_id: &str) -> Option<Arc<Session>> {
        let slot = self.lock_slots().get(room_id).cloned()?;
        let state = slot.state.lock().await;
        state.session.clone()
    }

    /// Number of rooms with a slot (live, binding, or closing).
    pub fn room_count(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.lock_slots().keys().cloned().collect()
    }

    pub fn bridge(&self) -> &Arc<PersistenceBridge> {
        &self.bridge
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Arc<RoomSlot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
