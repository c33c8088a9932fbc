//! CRDT document for a single room.
//!
//! Thin wrapper over a Yrs `Doc`. Merging is delegated entirely to Yrs:
//! applying an update is commutative and idempotent, so replicas converge
//! regardless of delivery order. Every transaction that changes the document
//! is reported to observers as a v1-encoded delta, tagged with the origin of
//! the connection that caused it (if any).

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

/// v1 encoding of an update that carries no structs and no deletions.
///
/// This is what an empty document encodes to, so it counts as zero-size.
pub const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Errors raised by the CRDT primitive.
#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to install observer: {0}")]
    Observe(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// A delta emitted by a document after a committed change.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    /// Transaction origin; `None` for changes made by the server itself.
    pub origin: Option<Origin>,
    /// v1-encoded delta.
    pub delta: Arc<Vec<u8>>,
}

impl DocUpdate {
    /// Whether this update was caused by the given origin.
    pub fn is_from(&self, origin: &Origin) -> bool {
        self.origin.as_ref() == Some(origin)
    }
}

/// Transaction origin identifying a connected peer.
pub fn peer_origin(peer_id: Uuid) -> Origin {
    Origin::from(peer_id.to_string().as_str())
}

/// Handle for a delta observer. Dropping it unsubscribes.
pub struct DeltaSubscription {
    inner: Option<Subscription>,
}

impl DeltaSubscription {
    /// Remove the observer now.
    pub fn unsubscribe(mut self) {
        self.inner.take();
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }
}

impl std::fmt::Debug for DeltaSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// In-memory replicated state of one room.
pub struct RoomDocument {
    doc: Doc,
    /// Serializes transactions on this document.
    txn_lock: Mutex<()>,
}

impl RoomDocument {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            txn_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.txn_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merge a v1-encoded update into the document.
    ///
    /// `origin` tags the transaction so observers can tell who caused the
    /// change. Applying an update that is already integrated is a no-op and
    /// emits nothing.
    pub fn apply_delta(&self, delta: &[u8], origin: Option<Origin>) -> Result<(), DocumentError> {
        let update = Update::decode_v1(delta)?;
        let _guard = self.lock();
        let mut txn = match origin {
            Some(origin) => self.doc.transact_mut_with(origin),
            None => self.doc.transact_mut(),
        };
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(format!("{e:?}")))
    }

    /// Encode the complete document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let _guard = self.lock();
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the document's state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let _guard = self.lock();
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything the holder of `remote_sv` is missing.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let _guard = self.lock();
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Register `handler` for every committed change.
    ///
    /// The handler runs synchronously inside the committing transaction and
    /// must not touch this document.
    pub fn observe<F>(&self, handler: F) -> Result<DeltaSubscription, DocumentError>
    where
        F: Fn(DocUpdate) + Send + Sync + 'static,
    {
        let _guard = self.lock();
        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                handler(DocUpdate {
                    origin: txn.origin().cloned(),
                    delta: Arc::new(event.update.clone()),
                });
            })
            .map_err(|e| DocumentError::Observe(format!("{e:?}")))?;
        Ok(DeltaSubscription {
            inner: Some(subscription),
        })
    }

    /// Direct access to the underlying Yrs document.
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for RoomDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an encoded update carries nothing worth persisting.
pub fn is_empty_update(bytes: &[u8]) -> bool {
    bytes.is_empty() || bytes == EMPTY_UPDATE_V1
}

/// Fold a sequence of updates into one full-state update.
///
/// Undecodable inputs are skipped with a warning. Returns empty bytes when
/// nothing non-empty was merged.
pub fn merge_updates<'a, I>(updates: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let doc = RoomDocument::new();
    let mut merged = 0usize;
    for bytes in updates {
        if is_empty_update(bytes) {
            continue;
        }
        match doc.apply_delta(bytes, None) {
            Ok(()) => merged += 1,
            Err(e) => log::warn!("Skipping unreadable update during merge: {e}"),
        }
    }
    if merged == 0 {
        return Vec::new();
    }
    let state = doc.encode_state();
    if is_empty_update(&state) {
        Vec::new()
    } else {
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use yrs::{GetString, Text, WriteTxn};

    fn insert(doc: &RoomDocument, at: u32, s: &str) -> Vec<u8> {
        let before = doc.state_vector();
        {
            let mut txn = doc.inner().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, at, s);
        }
        doc.diff(&before).unwrap()
    }

    fn text_of(doc: &RoomDocument) -> String {
        let mut txn = doc.inner().transact_mut();
        let text = txn.get_or_insert_text("content");
        text.get_string(&txn)
    }

    #[test]
    fn test_empty_document_encodes_as_empty_update() {
        let doc = RoomDocument::new();
        assert!(is_empty_update(&doc.encode_state()));
        assert!(is_empty_update(&[]));
        assert!(!is_empty_update(&[1, 0, 0]));
    }

    #[test]
    fn test_replicas_converge_in_any_order() {
        let a = RoomDocument::new();
        let b = RoomDocument::new();
        let d1 = insert(&a, 0, "hello");
        let d2 = insert(&b, 0, "world");
        let d3 = insert(&a, 5, "!");

        let left = RoomDocument::new();
        for d in [&d1, &d2, &d3] {
            left.apply_delta(d, None).unwrap();
        }
        let right = RoomDocument::new();
        for d in [&d2, &d3, &d1, &d2] {
            right.apply_delta(d, None).unwrap();
        }

        assert_eq!(text_of(&left), text_of(&right));
        assert_eq!(text_of(&left).len(), "hello!world".len());
    }

    #[test]
    fn test_state_roundtrip_through_fresh_document() {
        let doc = RoomDocument::new();
        insert(&doc, 0, "persist me");
        let state = doc.encode_state();

        let restored = RoomDocument::new();
        restored.apply_delta(&state, None).unwrap();
        assert_eq!(restored.encode_state(), state);
        assert_eq!(text_of(&restored), "persist me");
    }

    #[test]
    fn test_observer_reports_origin() {
        let source = RoomDocument::new();
        let delta = insert(&source, 0, "abc");

        let doc = RoomDocument::new();
        let seen: Arc<StdMutex<Vec<DocUpdate>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = doc
            .observe(move |update| sink.lock().unwrap().push(update))
            .unwrap();

        let peer = Uuid::new_v4();
        doc.apply_delta(&delta, Some(peer_origin(peer))).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_from(&peer_origin(peer)));
        assert!(!seen[0].is_from(&peer_origin(Uuid::new_v4())));
        assert!(!seen[0].delta.is_empty());
    }

    #[test]
    fn test_reapplied_delta_emits_nothing() {
        let source = RoomDocument::new();
        let delta = insert(&source, 0, "once");

        let doc = RoomDocument::new();
        let count = Arc::new(StdMutex::new(0usize));
        let counter = count.clone();
        let _sub = doc.observe(move |_| *counter.lock().unwrap() += 1).unwrap();

        doc.apply_delta(&delta, None).unwrap();
        doc.apply_delta(&delta, None).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_events() {
        let source = RoomDocument::new();
        let d1 = insert(&source, 0, "a");
        let d2 = insert(&source, 1, "b");

        let doc = RoomDocument::new();
        let count = Arc::new(StdMutex::new(0usize));
        let counter = count.clone();
        let sub = doc.observe(move |_| *counter.lock().unwrap() += 1).unwrap();

        doc.apply_delta(&d1, None).unwrap();
        sub.unsubscribe();
        doc.apply_delta(&d2, None).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_merge_updates_matches_sequential_apply() {
        let source = RoomDocument::new();
        let d1 = insert(&source, 0, "foo");
        let d2 = insert(&source, 3, "bar");

        let merged = merge_updates([d1.as_slice(), &[][..], d2.as_slice()]);
        let doc = RoomDocument::new();
        doc.apply_delta(&merged, None).unwrap();
        assert_eq!(text_of(&doc), "foobar");
    }

    #[test]
    fn test_merge_updates_of_nothing_is_empty() {
        assert!(merge_updates(std::iter::empty::<&[u8]>()).is_empty());
        assert!(merge_updates([EMPTY_UPDATE_V1]).is_empty());
        assert!(merge_updates([&[0xFFu8, 0xFF][..]]).is_empty());
    }

    #[test]
    fn test_apply_garbage_fails() {
        let doc = RoomDocument::new();
        assert!(doc.apply_delta(&[0xFF, 0xFF, 0xFF], None).is_err());
    }
}
