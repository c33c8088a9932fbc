//! In-memory room store.
//!
//! Keeps the same logical layout as the RocksDB store (delta sequence plus
//! one full-state record per room) and counts every call, so tests can assert
//! exactly which store operations a code path issued. Reads and writes can be
//! made to fail on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{DocumentStore, RoomDirectory, RoomRecord, StoreError};
use crate::document::merge_updates;

/// Snapshot of per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub loads: u64,
    pub appends: u64,
    pub compactions: u64,
    pub full_writes: u64,
    pub closes: u64,
}

impl StoreCallCounts {
    /// Total calls that would have written to storage.
    pub fn writes(&self) -> u64 {
        self.appends + self.compactions + self.full_writes
    }

    /// Total calls of any kind.
    pub fn total(&self) -> u64 {
        self.loads + self.writes() + self.closes
    }
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    appends: AtomicU64,
    compactions: AtomicU64,
    full_writes: AtomicU64,
    closes: AtomicU64,
}

#[derive(Debug, Default, Clone)]
struct RoomEntry {
    full_state: Option<Vec<u8>>,
    deltas: Vec<Vec<u8>>,
}

/// One store operation, in the order it reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Load(String),
    Append(String, Vec<u8>),
    Compact(String),
    WriteFullState(String, Vec<u8>),
    Close,
}

#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, RoomEntry>>,
    directory: Mutex<HashMap<String, RoomRecord>>,
    journal: Mutex<Vec<StoreCall>>,
    counters: Counters,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a full-state record for `room`.
    pub fn with_full_state(room: &str, state: Vec<u8>) -> Self {
        let store = Self::new();
        store.lock_rooms().insert(
            room.to_string(),
            RoomEntry {
                full_state: Some(state),
                deltas: Vec::new(),
            },
        );
        store
    }

    /// Make every subsequent load fail with `StoreError::Read`.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent append, compact and write fail with `StoreError::Write`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn counts(&self) -> StoreCallCounts {
        StoreCallCounts {
            loads: self.counters.loads.load(Ordering::SeqCst),
            appends: self.counters.appends.load(Ordering::SeqCst),
            compactions: self.counters.compactions.load(Ordering::SeqCst),
            full_writes: self.counters.full_writes.load(Ordering::SeqCst),
            closes: self.counters.closes.load(Ordering::SeqCst),
        }
    }

    /// Every call in arrival order.
    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.journal).clone()
    }

    /// Calls that concern `room`, in arrival order.
    pub fn calls_for(&self, room: &str) -> Vec<StoreCall> {
        lock(&self.journal)
            .iter()
            .filter(|call| match call {
                StoreCall::Load(r) | StoreCall::Compact(r) => r == room,
                StoreCall::Append(r, _) | StoreCall::WriteFullState(r, _) => r == room,
                StoreCall::Close => false,
            })
            .cloned()
            .collect()
    }

    /// The stored full-state record, ignoring pending deltas.
    pub fn full_state(&self, room: &str) -> Option<Vec<u8>> {
        self.lock_rooms().get(room).and_then(|e| e.full_state.clone())
    }

    /// Pending deltas for `room` in append order.
    pub fn deltas(&self, room: &str) -> Vec<Vec<u8>> {
        self.lock_rooms()
            .get(room)
            .map(|e| e.deltas.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_rooms(&self) -> MutexGuard<'_, HashMap<String, RoomEntry>> {
        lock(&self.rooms)
    }

    fn record(&self, call: StoreCall) {
        lock(&self.journal).push(call);
    }

    fn check_write(&self, room: &str) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write(room, "injected write failure"));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DocumentStore for MemoryStore {
    fn load_full_state(&self, room: &str) -> Result<Vec<u8>, StoreError> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.record(StoreCall::Load(room.to_string()));
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::read(room, "injected read failure"));
        }

        let rooms = self.lock_rooms();
        let Some(entry) = rooms.get(room) else {
            return Ok(Vec::new());
        };
        if entry.deltas.is_empty() {
            return Ok(entry.full_state.clone().unwrap_or_default());
        }
        let parts = entry
            .full_state
            .iter()
            .chain(entry.deltas.iter())
            .map(|b| b.as_slice());
        Ok(merge_updates(parts))
    }

    fn append_delta(&self, room: &str, delta: &[u8]) -> Result<(), StoreError> {
        self.counters.appends.fetch_add(1, Ordering::SeqCst);
        self.record(StoreCall::Append(room.to_string(), delta.to_vec()));
        self.check_write(room)?;

        self.lock_rooms()
            .entry(room.to_string())
            .or_default()
            .deltas
            .push(delta.to_vec());
        Ok(())
    }

    fn compact(&self, room: &str) -> Result<(), StoreError> {
        self.counters.compactions.fetch_add(1, Ordering::SeqCst);
        self.record(StoreCall::Compact(room.to_string()));
        self.check_write(room)?;

        let mut rooms = self.lock_rooms();
        let Some(entry) = rooms.get_mut(room) else {
            return Ok(());
        };
        if entry.deltas.is_empty() {
            return Ok(());
        }
        let merged = merge_updates(
            entry
                .full_state
                .iter()
                .chain(entry.deltas.iter())
                .map(|b| b.as_slice()),
        );
        entry.deltas.clear();
        if !merged.is_empty() {
            entry.full_state = Some(merged);
        }
        Ok(())
    }

    fn write_full_state(&self, room: &str, state: &[u8]) -> Result<(), StoreError> {
        self.counters.full_writes.fetch_add(1, Ordering::SeqCst);
        self.record(StoreCall::WriteFullState(room.to_string(), state.to_vec()));
        self.check_write(room)?;

        self.lock_rooms()
            .entry(room.to_string())
            .or_default()
            .full_state = Some(state.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.record(StoreCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl RoomDirectory for MemoryStore {
    fn create_room(&self, owner_id: Option<String>) -> Result<RoomRecord, StoreError> {
        let record = RoomRecord::generate(owner_id);
        self.check_write(&record.room_id)?;
        lock(&self.directory).insert(record.room_id.clone(), record.clone());
        Ok(record)
    }

    fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::read(room_id, "injected read failure"));
        }
        Ok(lock(&self.directory).get(room_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RoomDocument;
    use yrs::{GetString, Text, Transact, WriteTxn};

    fn edit(doc: &RoomDocument, s: &str) -> Vec<u8> {
        let before = doc.state_vector();
        {
            let mut txn = doc.inner().transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, s);
        }
        doc.diff(&before).unwrap()
    }

    #[test]
    fn test_counts_every_call() {
        let store = MemoryStore::new();
        store.load_full_state("abc").unwrap();
        store.append_delta("abc", b"x").unwrap();
        store.compact("abc").unwrap();
        store.write_full_state("abc", b"y").unwrap();
        store.close().unwrap();

        let counts = store.counts();
        assert_eq!(
            counts,
            StoreCallCounts {
                loads: 1,
                appends: 1,
                compactions: 1,
                full_writes: 1,
                closes: 1,
            }
        );
        assert_eq!(counts.writes(), 3);
        assert_eq!(counts.total(), 5);
        assert_eq!(store.calls().len(), 5);
    }

    #[test]
    fn test_compact_folds_deltas() {
        let store = MemoryStore::new();
        let doc = RoomDocument::new();
        store.append_delta("abc", &edit(&doc, "hello")).unwrap();
        store.append_delta("abc", &edit(&doc, " there")).unwrap();

        let before = store.load_full_state("abc").unwrap();
        store.compact("abc").unwrap();
        assert!(store.deltas("abc").is_empty());
        assert_eq!(store.full_state("abc").unwrap(), before);
        assert_eq!(store.load_full_state("abc").unwrap(), doc.encode_state());
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_reads(true);
        assert!(matches!(store.load_full_state("abc"), Err(StoreError::Read { .. })));
        store.fail_writes(true);
        assert!(matches!(store.append_delta("abc", b"x"), Err(StoreError::Write { .. })));
        assert!(store.deltas("abc").is_empty());

        store.fail_reads(false);
        store.fail_writes(false);
        store.append_delta("abc", b"x").unwrap();
        assert_eq!(store.deltas("abc").len(), 1);
    }

    #[test]
    fn test_calls_for_filters_by_room() {
        let store = MemoryStore::new();
        store.append_delta("a", b"1").unwrap();
        store.append_delta("b", b"2").unwrap();
        store.compact("a").unwrap();

        assert_eq!(
            store.calls_for("a"),
            vec![
                StoreCall::Append("a".into(), b"1".to_vec()),
                StoreCall::Compact("a".into()),
            ]
        );
    }

    #[test]
    fn test_room_directory() {
        let store = MemoryStore::new();
        let record = store.create_room(None).unwrap();
        assert_eq!(store.get_room(&record.room_id).unwrap(), Some(record));
        assert_eq!(store.get_room("nope").unwrap(), None);
    }
}
