//! Bounded, best-effort snapshot ring keyed by identifier.
//!
//! Each store takes its place in the ring when it is issued: the caller
//! gets a ticket under the index lock, the write runs on the background
//! context, and finished writes are registered strictly in ticket order.
//! Writes may complete in any order; the ring never does. Evicted files
//! are deleted after the lock is released. Every I/O failure is logged
//! and dropped.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, warn};

use super::store::FileStore;
use crate::counter::FrameIdentifier;
use crate::error::StampError;
use crate::task::Background;

// ── SnapshotCacheConfig ──────────────────────────────────────────

/// Sizing of the ring: `stored_frames_per_second × retention_secs + margin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotCacheConfig {
    pub stored_frames_per_second: u32,
    pub retention_secs: u32,
    pub margin: u32,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        // 30 fps stream, one stored frame per 3 rendered.
        Self {
            stored_frames_per_second: 10,
            retention_secs: 90,
            margin: 100,
        }
    }
}

impl SnapshotCacheConfig {
    /// Cache sized for a stream that mints one identifier every
    /// `frames_per_code` frames at `fps`.
    pub fn for_stream(fps: u32, frames_per_code: u32, retention_secs: u32, margin: u32) -> Self {
        Self {
            stored_frames_per_second: fps / frames_per_code.max(1),
            retention_secs,
            margin,
        }
    }

    pub fn capacity(&self) -> usize {
        self.stored_frames_per_second as usize * self.retention_secs as usize
            + self.margin as usize
    }

    pub fn validate(&self) -> Result<(), StampError> {
        if self.capacity() == 0 {
            return Err(StampError::InvalidConfig(
                "snapshot cache capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ── Index ────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct DuplicateEntry(FrameIdentifier);

/// A finished write waiting for its turn to be registered. `None`
/// when the write failed.
#[derive(Debug)]
struct Landed {
    id: FrameIdentifier,
    written: Option<(PathBuf, Bytes)>,
}

#[derive(Debug, Default)]
struct Index {
    order: VecDeque<FrameIdentifier>,
    by_id: HashMap<FrameIdentifier, PathBuf>,
    confirmed: HashSet<FrameIdentifier>,
    latest: Option<(FrameIdentifier, Bytes)>,
    /// Identifiers holding a ticket whose write has not been registered.
    in_flight: HashSet<FrameIdentifier>,
    next_ticket: u64,
    next_to_register: u64,
    landed: BTreeMap<u64, Landed>,
}

impl Index {
    /// Claim the next ring position for `id`.
    fn reserve(&mut self, id: FrameIdentifier) -> Result<u64, DuplicateEntry> {
        if self.by_id.contains_key(&id) || !self.in_flight.insert(id) {
            return Err(DuplicateEntry(id));
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        Ok(ticket)
    }

    /// Record the outcome of `ticket` and register every consecutive
    /// finished write. Returns the identifiers whose files must go:
    /// evictions, plus every write that lands after a stop.
    fn land(
        &mut self,
        ticket: u64,
        landed: Landed,
        capacity: usize,
        stopped: bool,
    ) -> Vec<FrameIdentifier> {
        self.landed.insert(ticket, landed);
        let mut doomed = Vec::new();
        while let Some(Landed { id, written }) = self.landed.remove(&self.next_to_register) {
            self.next_to_register += 1;
            self.in_flight.remove(&id);
            let Some((path, bytes)) = written else {
                continue;
            };
            if stopped {
                doomed.push(id);
                continue;
            }
            match self.register(id, path, bytes, capacity) {
                Ok(evicted) => doomed.extend(evicted.into_iter().map(|(id, _)| id)),
                // Same identifier, same file: it belongs to the entry already in the ring.
                Err(DuplicateEntry(id)) => warn!(identifier = %id, "duplicate snapshot identifier ignored"),
            }
        }
        doomed
    }

    /// Append one entry and evict down to `capacity`. Returns the
    /// evicted entries; a duplicate leaves the index untouched.
    fn register(
        &mut self,
        id: FrameIdentifier,
        path: PathBuf,
        bytes: Bytes,
        capacity: usize,
    ) -> Result<Vec<(FrameIdentifier, PathBuf)>, DuplicateEntry> {
        if self.by_id.contains_key(&id) {
            return Err(DuplicateEntry(id));
        }
        self.order.push_back(id);
        self.by_id.insert(id, path);
        self.latest = Some((id, bytes));

        let mut evicted = Vec::new();
        while self.order.len() > capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(path) = self.by_id.remove(&oldest) {
                evicted.push((oldest, path));
            }
            self.confirmed.insert(oldest);
        }
        Ok(evicted)
    }

    fn exists(&mut self, id: FrameIdentifier) -> bool {
        if self.by_id.contains_key(&id) {
            self.confirmed.insert(id);
            return true;
        }
        self.confirmed.contains(&id)
    }

    fn drain(&mut self) -> Vec<(FrameIdentifier, PathBuf)> {
        self.latest = None;
        self.confirmed.clear();
        self.order
            .drain(..)
            .filter_map(|id| self.by_id.remove(&id).map(|path| (id, path)))
            .collect()
    }
}

// ── SnapshotCache ────────────────────────────────────────────────

struct Shared {
    store: FileStore,
    capacity: usize,
    index: Mutex<Index>,
    stopped: AtomicBool,
    background: Background,
    span: Span,
}

/// Cloneable handle to one stream's snapshot ring.
#[derive(Clone)]
pub struct SnapshotCache {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("dir", &self.shared.store.dir())
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl SnapshotCache {
    pub fn new(
        store: FileStore,
        config: &SnapshotCacheConfig,
        background: Background,
    ) -> Result<Self, StampError> {
        config.validate()?;
        Ok(Self::with_capacity(store, config.capacity(), background))
    }

    /// Cache holding at most `capacity` entries (minimum one).
    pub fn with_capacity(store: FileStore, capacity: usize, background: Background) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                capacity: capacity.max(1),
                index: Mutex::new(Index::default()),
                stopped: AtomicBool::new(false),
                background,
                span: tracing::info_span!("snapshot_cache"),
            }),
        }
    }

    /// Replace the span store and delete work is recorded under.
    /// Only effective before the handle is cloned.
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.span = span;
        }
        self
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.shared
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_handle(&self) -> &FileStore {
        &self.shared.store
    }

    pub fn background(&self) -> &Background {
        &self.shared.background
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.index().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist `bytes` under `id` in the background. Never blocks; the
    /// entry's ring position is fixed by call order.
    pub fn store(&self, id: FrameIdentifier, bytes: Bytes) {
        self.store_with(id, async move { Ok::<_, StampError>(bytes) });
    }

    /// Like [`store`](Self::store), for bytes still being produced. The
    /// ring position is taken now; `bytes` is awaited and written on the
    /// background context.
    pub fn store_with<F>(&self, id: FrameIdentifier, bytes: F)
    where
        F: Future<Output = Result<Bytes, StampError>> + Send + 'static,
    {
        let Some(ticket) = self.reserve(id) else {
            return;
        };
        let cache = self.clone();
        self.shared.background.spawn(
            async move {
                let written = match bytes.await {
                    Ok(bytes) => cache.write(id, bytes).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = &written {
                    warn!(identifier = %id, error = %e, "snapshot dropped");
                }
                cache.land(ticket, id, written.ok());
            }
            .instrument(self.shared.span.clone()),
        );
    }

    /// Write `bytes` and register `id` once the file is in place.
    ///
    /// Storing an identifier already in the ring is a caller bug: it
    /// panics in debug builds and is ignored otherwise.
    pub async fn insert(&self, id: FrameIdentifier, bytes: Bytes) -> Result<(), StampError> {
        let Some(ticket) = self.reserve(id) else {
            return Ok(());
        };
        match self.write(id, bytes).await {
            Ok(written) => {
                self.land(ticket, id, Some(written));
                Ok(())
            }
            Err(e) => {
                self.land(ticket, id, None);
                Err(e)
            }
        }
    }

    fn reserve(&self, id: FrameIdentifier) -> Option<u64> {
        if self.shared.stopped.load(Ordering::Acquire) {
            debug!(identifier = %id, "cache stopped, snapshot ignored");
            return None;
        }
        let reserved = self.index().reserve(id);
        match reserved {
            Ok(ticket) => Some(ticket),
            Err(DuplicateEntry(id)) => {
                debug_assert!(false, "duplicate snapshot identifier {id}");
                warn!(identifier = %id, "duplicate snapshot identifier ignored");
                None
            }
        }
    }

    async fn write(&self, id: FrameIdentifier, bytes: Bytes) -> Result<(PathBuf, Bytes), StampError> {
        let path = self.shared.store.write(id, &bytes).await?;
        Ok((path, bytes))
    }

    fn land(&self, ticket: u64, id: FrameIdentifier, written: Option<(PathBuf, Bytes)>) {
        let stored = written.is_some();
        let doomed = {
            let mut index = self.index();
            let stopped = self.shared.stopped.load(Ordering::Acquire);
            index.land(ticket, Landed { id, written }, self.shared.capacity, stopped)
        };
        if stored {
            debug!(identifier = %id, ticket, "snapshot written");
        }
        self.delete_later(doomed);
    }

    fn delete_later(&self, ids: Vec<FrameIdentifier>) {
        if ids.is_empty() {
            return;
        }
        let store = self.shared.store.clone();
        self.shared.background.spawn(
            async move {
                for id in ids {
                    if let Err(e) = store.remove(id).await {
                        warn!(identifier = %id, error = %e, "failed to delete snapshot");
                    }
                }
            }
            .instrument(self.shared.span.clone()),
        );
    }

    /// `true` if `id` is in the ring or was confirmed seen before it
    /// left. A hit in the ring marks it confirmed.
    pub fn exists(&self, id: FrameIdentifier) -> bool {
        self.index().exists(id)
    }

    /// `true` only while `id` is still in the ring.
    pub fn contains(&self, id: FrameIdentifier) -> bool {
        self.index().by_id.contains_key(&id)
    }

    /// The subset of `ids` for which [`exists`](Self::exists) holds,
    /// in input order.
    pub fn filter_stored(&self, ids: &[FrameIdentifier]) -> Vec<FrameIdentifier> {
        let mut index = self.index();
        ids.iter().copied().filter(|id| index.exists(*id)).collect()
    }

    /// Most recently stored entry.
    pub fn latest(&self) -> Option<(FrameIdentifier, Bytes)> {
        self.index().latest.clone()
    }

    /// Location of the file backing `id`, while it is in the ring.
    pub fn path_of(&self, id: FrameIdentifier) -> Option<PathBuf> {
        self.index().by_id.get(&id).cloned()
    }

    /// Ring contents, oldest first.
    pub fn identifiers(&self) -> Vec<FrameIdentifier> {
        self.index().order.iter().copied().collect()
    }

    /// Drop every entry, forget confirmed identifiers and delete the
    /// backing files. Later stores are ignored.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let drained = self.index().drain();
        debug!(entries = drained.len(), "snapshot cache stopped");
        self.delete_later(drained.into_iter().map(|(id, _)| id).collect());
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Wait for every pending write and delete.
    pub async fn flush(&self) {
        self.shared.background.flush().await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> FrameIdentifier {
        FrameIdentifier::new(n)
    }

    async fn cache(capacity: usize) -> (tempfile::TempDir, SnapshotCache) {
        let root = tempfile::tempdir().unwrap();
        let store = FileStore::open(root.path(), "test").await.unwrap();
        let cache = SnapshotCache::with_capacity(store, capacity, Background::current().unwrap());
        (root, cache)
    }

    #[test]
    fn default_capacity_matches_retention_window() {
        assert_eq!(SnapshotCacheConfig::default().capacity(), 1000);
        assert_eq!(SnapshotCacheConfig::for_stream(30, 3, 90, 100).capacity(), 1000);
        let empty = SnapshotCacheConfig {
            stored_frames_per_second: 0,
            retention_secs: 90,
            margin: 0,
        };
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn ring_keeps_newest_and_confirms_evicted() {
        let (_root, cache) = cache(5).await;
        for n in 1..=8 {
            cache.store(id(n), Bytes::from(vec![n as u8]));
        }
        cache.flush().await;

        assert_eq!(cache.identifiers(), (4..=8).map(id).collect::<Vec<_>>());
        for n in 1..=3 {
            assert!(!cache.contains(id(n)), "{n} still present");
            assert!(cache.exists(id(n)), "{n} not confirmed");
        }
        assert!(!cache.exists(id(9)));
        assert_eq!(cache.store_handle().list().await.unwrap(), (4..=8).map(id).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn back_to_back_stores_keep_call_order() {
        for _ in 0..10 {
            let (_root, cache) = cache(20).await;
            for n in 1..=50 {
                // Larger payloads early so their writes tend to finish last.
                cache.store(id(n), Bytes::from(vec![n as u8; (51 - n as usize) * 4096]));
            }
            cache.flush().await;

            let expected: Vec<_> = (31..=50).map(id).collect();
            assert_eq!(cache.identifiers(), expected);
            assert_eq!(cache.latest().map(|(latest, _)| latest), Some(id(50)));
            assert_eq!(cache.store_handle().list().await.unwrap(), expected);
            assert!((1..=30).all(|n| cache.exists(id(n))));
        }
    }

    #[test]
    fn landing_out_of_order_registers_in_ticket_order() {
        let mut index = Index::default();
        let tickets: Vec<u64> = (1..=4).map(|n| index.reserve(id(n)).unwrap()).collect();
        let landed = |n: u64| Landed {
            id: id(n),
            written: Some((PathBuf::from(n.to_string()), Bytes::new())),
        };

        assert!(index.land(tickets[2], landed(3), 2, false).is_empty());
        assert!(index.land(tickets[1], landed(2), 2, false).is_empty());
        assert!(index.order.is_empty());

        // Ticket 0 failed; 2 and 3 register behind it, then 4 evicts 2.
        let failed = Landed { id: id(1), written: None };
        assert!(index.land(tickets[0], failed, 2, false).is_empty());
        assert_eq!(index.order, VecDeque::from(vec![id(2), id(3)]));
        assert_eq!(index.land(tickets[3], landed(4), 2, false), vec![id(2)]);
        assert_eq!(index.order, VecDeque::from(vec![id(3), id(4)]));
        assert_eq!(index.latest.as_ref().map(|(latest, _)| *latest), Some(id(4)));
        assert!(index.in_flight.is_empty());
        assert!(index.reserve(id(1)).is_ok());
    }

    #[test]
    fn reserve_rejects_identifier_in_flight() {
        let mut index = Index::default();
        assert_eq!(index.reserve(id(7)), Ok(0));
        assert_eq!(index.reserve(id(7)), Err(DuplicateEntry(id(7))));
        assert_eq!(index.reserve(id(8)), Ok(1));
    }

    #[tokio::test]
    async fn latest_tracks_last_store() {
        let (_root, cache) = cache(3).await;
        assert!(cache.latest().is_none());
        cache.insert(id(101), Bytes::from_static(b"a")).await.unwrap();
        cache.insert(id(201), Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(cache.latest(), Some((id(201), Bytes::from_static(b"b"))));
    }

    #[tokio::test]
    async fn exists_hit_survives_eviction() {
        let (_root, cache) = cache(1).await;
        cache.insert(id(1), Bytes::from_static(b"a")).await.unwrap();
        assert!(cache.exists(id(1)));
        cache.insert(id(2), Bytes::from_static(b"b")).await.unwrap();
        cache.flush().await;
        assert!(!cache.contains(id(1)));
        assert!(cache.exists(id(1)));
        // Confirmation keeps the identifier, not the file.
        assert_eq!(cache.store_handle().list().await.unwrap(), vec![id(2)]);
        assert_eq!(
            cache.filter_stored(&[id(3), id(2), id(1)]),
            vec![id(2), id(1)]
        );
    }

    #[tokio::test]
    async fn write_failure_is_dropped() {
        let (root, cache) = cache(4).await;
        std::fs::remove_dir_all(root.path().join("test")).unwrap();
        cache.store(id(1), Bytes::from_static(b"a"));
        cache.flush().await;
        assert!(cache.is_empty());
        assert!(!cache.exists(id(1)));
    }

    #[tokio::test]
    async fn stop_clears_ring_and_files() {
        let (_root, cache) = cache(4).await;
        for n in 1..=3 {
            cache.insert(id(n), Bytes::from_static(b"x")).await.unwrap();
        }
        cache.stop();
        cache.flush().await;
        assert!(cache.is_empty());
        assert!(cache.latest().is_none());
        assert!(cache.store_handle().list().await.unwrap().is_empty());

        cache.insert(id(9), Bytes::from_static(b"x")).await.unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn duplicate_register_leaves_index_unchanged() {
        let mut index = Index::default();
        index
            .register(id(1), PathBuf::from("a"), Bytes::new(), 4)
            .unwrap();
        index
            .register(id(2), PathBuf::from("b"), Bytes::new(), 4)
            .unwrap();
        assert_eq!(
            index.register(id(1), PathBuf::from("c"), Bytes::new(), 4),
            Err(DuplicateEntry(id(1)))
        );
        assert_eq!(index.order, VecDeque::from(vec![id(1), id(2)]));
        assert_eq!(index.by_id.get(&id(1)), Some(&PathBuf::from("a")));
        assert_eq!(index.latest.as_ref().map(|(latest, _)| *latest), Some(id(2)));
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "duplicate snapshot identifier")]
    async fn duplicate_store_panics_in_debug() {
        let (_root, cache) = cache(4).await;
        cache.insert(id(5), Bytes::from_static(b"a")).await.unwrap();
        let _ = cache.insert(id(5), Bytes::from_static(b"b")).await;
    }
}
