//! Persistence bridge: attaches live sessions to the durable store.
//!
//! ```text
//!  Session document ──observe──► DeltaSink ──mpsc──► RoomWriter task
//!                                                        │ (spawn_blocking)
//!                                                        ▼
//!                                                  DocumentStore
//! ```
//!
//! Each bound room gets its own writer task draining an ordered queue, so
//! appends reach the store in the order the document accepted the deltas
//! while a slow store never blocks other rooms or the connection hot path.
//! The ephemeral room never touches the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::document::{is_empty_update, DeltaSubscription, DocumentError};
use crate::session::{Session, SessionState};
use crate::storage::DocumentStore;

/// Bridge statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub loads: u64,
    pub appends: u64,
    pub skipped_empty: u64,
    pub compactions: u64,
    pub full_writes: u64,
    pub store_failures: u64,
}

#[derive(Default)]
struct AtomicBridgeStats {
    loads: AtomicU64,
    appends: AtomicU64,
    skipped_empty: AtomicU64,
    compactions: AtomicU64,
    full_writes: AtomicU64,
    store_failures: AtomicU64,
}

impl AtomicBridgeStats {
    fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            loads: self.loads.load(Ordering::Relaxed),
            appends: self.appends.load(Ordering::Relaxed),
            skipped_empty: self.skipped_empty.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            full_writes: self.full_writes.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

/// Store operation queued for a room's writer.
#[derive(Debug)]
enum StoreOp {
    Append(Vec<u8>),
    Compact,
    WriteFullState(Vec<u8>),
}

impl StoreOp {
    fn name(&self) -> &'static str {
        match self {
            StoreOp::Append(_) => "append",
            StoreOp::Compact => "compact",
            StoreOp::WriteFullState(_) => "write full state",
        }
    }
}

/// Producer side of a room's write queue.
#[derive(Clone)]
struct DeltaSink {
    room_id: Arc<str>,
    queue: mpsc::UnboundedSender<StoreOp>,
    stats: Arc<AtomicBridgeStats>,
}

impl DeltaSink {
    fn on_delta(&self, delta: &[u8]) {
        if is_empty_update(delta) {
            self.stats.skipped_empty.fetch_add(1, Ordering::Relaxed);
            log::debug!("Skipping empty delta for room '{}'", self.room_id);
            return;
        }
        self.enqueue(StoreOp::Append(delta.to_vec()));
    }

    fn enqueue(&self, op: StoreOp) {
        if let Err(e) = self.queue.send(op) {
            log::warn!(
                "Dropped {} for room '{}': writer already stopped",
                e.0.name(),
                self.room_id
            );
        }
    }
}

/// Consumer side: runs store operations for one room, one at a time.
struct RoomWriter {
    sink: DeltaSink,
    task: JoinHandle<()>,
}

impl RoomWriter {
    fn spawn(
        room_id: &str,
        store: Arc<dyn DocumentStore>,
        stats: Arc<AtomicBridgeStats>,
    ) -> Self {
        let room_id: Arc<str> = Arc::from(room_id);
        let (queue, mut rx) = mpsc::unbounded_channel::<StoreOp>();

        let task_room = room_id.clone();
        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                Self::execute(&task_room, &store, &task_stats, op).await;
            }
            log::trace!("Writer for room '{task_room}' stopped");
        });

        Self {
            sink: DeltaSink {
                room_id,
                queue,
                stats,
            },
            task,
        }
    }

    async fn execute(
        room_id: &Arc<str>,
        store: &Arc<dyn DocumentStore>,
        stats: &AtomicBridgeStats,
        op: StoreOp,
    ) {
        let name = op.name();
        let counter = match op {
            StoreOp::Append(_) => &stats.appends,
            StoreOp::Compact => &stats.compactions,
            StoreOp::WriteFullState(_) => &stats.full_writes,
        };

        let store = store.clone();
        let room = room_id.clone();
        let result = tokio::task::spawn_blocking(move || match op {
            StoreOp::Append(delta) => store.append_delta(&room, &delta),
            StoreOp::Compact => store.compact(&room),
            StoreOp::WriteFullState(state) => store.write_full_state(&room, &state),
        })
        .await;

        match result {
            Ok(Ok(())) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.store_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Store {name} failed for room '{room_id}': {e}");
            }
            Err(e) => {
                stats.store_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Store {name} task for room '{room_id}' panicked: {e}");
            }
        }
    }

    /// Close the queue and wait for everything already queued to finish.
    async fn finish(self) {
        let RoomWriter { sink, task } = self;
        let room_id = sink.room_id.clone();
        drop(sink);
        if let Err(e) = task.await {
            log::error!("Writer for room '{room_id}' failed: {e}");
        }
    }
}

struct Binding {
    /// `None` while binding and once unbinding has begun.
    subscription: Option<DeltaSubscription>,
    writer: RoomWriter,
}

/// Binds sessions to a [`DocumentStore`] for as long as they have subscribers.
pub struct PersistenceBridge {
    store: Arc<dyn DocumentStore>,
    ephemeral_room: String,
    bindings: Mutex<HashMap<String, Binding>>,
    stats: Arc<AtomicBridgeStats>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn DocumentStore>, ephemeral_room: impl Into<String>) -> Self {
        Self {
            store,
            ephemeral_room: ephemeral_room.into(),
            bindings: Mutex::new(HashMap::new()),
            stats: Arc::new(AtomicBridgeStats::default()),
        }
    }

    pub fn is_ephemeral(&self, room_id: &str) -> bool {
        room_id == self.ephemeral_room
    }

    pub fn ephemeral_room(&self) -> &str {
        &self.ephemeral_room
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Load persisted state into the session and start capturing its deltas.
    ///
    /// Every delta the document commits afterwards goes through
    /// [`PersistenceBridge::on_delta`]. A load failure is logged and treated
    /// as "nothing persisted".
    pub async fn bind(self: &Arc<Self>, session: &Session) -> Result<(), DocumentError> {
        let room_id = session.room_id();

        if self.is_ephemeral(room_id) {
            session.transition(SessionState::Unbound, SessionState::Bound);
            log::debug!("Room '{room_id}' is ephemeral; bound without storage");
            return Ok(());
        }

        session.transition(SessionState::Unbound, SessionState::Binding);

        let state = self.load(room_id).await;
        if is_empty_update(&state) {
            log::info!("Room '{room_id}' bound with no persisted state");
        } else {
            match session.document().apply_delta(&state, None) {
                Ok(()) => log::info!(
                    "Room '{room_id}' bound with {} bytes of persisted state",
                    state.len()
                ),
                Err(e) => log::error!("Persisted state for room '{room_id}' is unreadable: {e}"),
            }
        }

        // The writer is registered before the observer exists, so no
        // committed delta can miss it
        let writer = RoomWriter::spawn(room_id, self.store.clone(), self.stats.clone());
        self.lock_bindings().insert(
            room_id.to_string(),
            Binding {
                subscription: None,
                writer,
            },
        );

        let bridge = Arc::downgrade(self);
        let observed_room = room_id.to_string();
        let observed = session.document().observe(move |update| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.on_delta(&observed_room, &update.delta);
            }
        });
        let subscription = match observed {
            Ok(subscription) => subscription,
            Err(e) => {
                let binding = self.lock_bindings().remove(room_id);
                if let Some(binding) = binding {
                    binding.writer.finish().await;
                }
                return Err(e);
            }
        };

        if let Some(binding) = self.lock_bindings().get_mut(room_id) {
            binding.subscription = Some(subscription);
        }
        session.transition(SessionState::Binding, SessionState::Bound);
        Ok(())
    }

    /// Queue one delta for the room's store append.
    ///
    /// This is the path every committed document change takes while the
    /// room is bound. No-op for the ephemeral room, for empty deltas, and
    /// for rooms that are not bound.
    pub fn on_delta(&self, room_id: &str, delta: &[u8]) {
        if self.is_ephemeral(room_id) {
            return;
        }
        let sink = self.lock_bindings().get(room_id).map(|b| b.writer.sink.clone());
        match sink {
            Some(sink) => sink.on_delta(delta),
            None => log::warn!("Delta for unbound room '{room_id}' ignored"),
        }
    }

    /// Compact, flush the full state, and detach the session from the store.
    ///
    /// Waits until every queued store operation for the room has finished.
    pub async fn unbind(&self, session: &Session) {
        let room_id = session.room_id();
        if self.is_ephemeral(room_id) {
            return;
        }

        // Detach the observer first; the binding stays registered until
        // then so late deltas still reach the queue in order
        let detached = self
            .lock_bindings()
            .get_mut(room_id)
            .map(|binding| (binding.subscription.take(), binding.writer.sink.clone()));
        let Some((subscription, sink)) = detached else {
            log::warn!("Unbind for room '{room_id}' which is not bound");
            return;
        };

        sink.enqueue(StoreOp::Compact);

        let state = session.document().encode_state();
        if is_empty_update(&state) {
            self.stats.skipped_empty.fetch_add(1, Ordering::Relaxed);
            log::debug!("Room '{room_id}' is empty; full state not written");
        } else {
            sink.enqueue(StoreOp::WriteFullState(state));
        }

        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        drop(sink);

        let binding = self.lock_bindings().remove(room_id);
        if let Some(binding) = binding {
            binding.writer.finish().await;
        }
        log::info!("Room '{room_id}' flushed and unbound");
    }

    /// Whether `room_id` currently has a store binding.
    pub fn is_bound(&self, room_id: &str) -> bool {
        self.lock_bindings().contains_key(room_id)
    }

    pub fn bound_rooms(&self) -> Vec<String> {
        self.lock_bindings().keys().cloned().collect()
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats.snapshot()
    }

    async fn load(&self, room_id: &str) -> Vec<u8> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let store = self.store.clone();
        let room = room_id.to_string();
        match tokio::task::spawn_blocking(move || store.load_full_state(&room)).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Load failed for room '{room_id}', starting empty: {e}");
                Vec::new()
            }
            Err(e) => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Load task for room '{room_id}' panicked, starting empty: {e}");
                Vec::new()
            }
        }
    }

    fn lock_bindings(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.bindings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
