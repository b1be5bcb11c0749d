//! # Shared Mesh Store
//!
//! The node's authoritative copy of the room mesh.
//!
//! ## Concurrency Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SharedStore                                     │
//! │                                                                         │
//! │   control plane ──replace/append/clear──┐                               │
//! │   transfer tasks ──────replace/append───┤     ┌──────────────────────┐  │
//! │                                         ├────►│ RwLock<Inner>        │  │
//! │   renderer ───────────snapshot──────────┤     │  bytes: Option<Bytes>│  │
//! │   snapshot server ────snapshot──────────┘     │  last_modified       │  │
//! │                                               │  version             │  │
//! │                                               └──────────────────────┘  │
//! │                                                                         │
//! │  Every operation takes the lock once. A snapshot is a cheap clone of    │
//! │  an immutable Bytes handle and never observes a half-applied update.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Merge semantics are plain byte concatenation: `append(b)` on a store
//! holding `a` yields `a ++ b`. Appending to an empty store yields `b`.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};

// =============================================================================
// Snapshot
// =============================================================================

/// Consistent view of the store at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshBlob {
    /// Mesh bytes. Opaque to the sync layer.
    pub bytes: Bytes,

    /// When the content last changed (replace or append).
    pub last_modified: DateTime<Utc>,

    /// Monotonic change counter, bumped by every mutation including clear.
    pub version: u64,
}

impl MeshBlob {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the payload is zero-length.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Default)]
struct Inner {
    bytes: Option<Bytes>,
    last_modified: Option<DateTime<Utc>>,
    version: u64,
}

impl Inner {
    /// Strictly later than the previous stamp, even if the clock did not move.
    fn next_stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_modified {
            Some(prev) if now <= prev => prev + Duration::nanoseconds(1),
            _ => now,
        }
    }

    fn touch(&mut self) {
        self.last_modified = Some(self.next_stamp());
        self.version += 1;
    }}

/// Thread-safe container for the current mesh.
///
/// Cloning shares the same underlying state. Safe to call from any thread,
/// including the host's render loop.
#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    inner: Arc<RwLock<Inner>>,
}

impl SharedStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole mesh. Returns the new version.
    pub fn replace(&self, bytes: impl Into<Bytes>) -> u64 {
        let mut inner = self.write();
        inner.bytes = Some(bytes.into());
        inner.touch();
        inner.version
    }

    /// Merges `bytes` onto the end of the current mesh. Returns the new version.
    pub fn append(&self, bytes: impl Into<Bytes>) -> u64 {
        let addition: Bytes = bytes.into();
        let mut inner = self.write();
        let merged = match inner.bytes.take() {
            Some(existing) if !existing.is_empty() => {
                let mut buf = BytesMut::with_capacity(existing.len() + addition.len());
                buf.extend_from_slice(&existing);
                buf.extend_from_slice(&addition);
                buf.freeze()
            }
            _ => addition,
        };
        inner.bytes = Some(merged);
        inner.touch();
        inner.version
    }

    /// Drops the mesh. Returns true if there was one.
    ///
    /// `last_modified` keeps its previous value; `version` still advances.
    pub fn clear(&self) -> bool {
        let mut inner = self.write();
        let had_mesh = inner.bytes.take().is_some();
        inner.version += 1;
        had_mesh
    }

    /// Current mesh, or None if the store is absent.
    pub fn snapshot(&self) -> Option<MeshBlob> {
        let inner = self.read();
        let bytes = inner.bytes.clone()?;
        Some(MeshBlob {
            bytes,
            last_modified: inner.last_modified.unwrap_or_else(Utc::now),
            version: inner.version,
        })
    }

    /// Returns true if there is no mesh or it is zero-length.
    pub fn is_empty(&self) -> bool {
        self.read().bytes.as_ref().map_or(true, |b| b.is_empty())
    }

    /// Current mesh length (0 when absent).
    pub fn len(&self) -> usize {
        self.read().bytes.as_ref().map_or(0, |b| b.len())
    }

    /// Current version counter.
    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// When the content last changed, if ever.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.read().last_modified
    }

    /// Returns true if the content changed after `since`.
    ///
    /// A renderer polls this with the stamp of the snapshot it last drew.
    pub fn is_dirty_since(&self, since: Option<DateTime<Utc>>) -> bool {
        match (self.read().last_modified, since) {
            (Some(current), Some(seen)) => current > seen,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_store_is_absent() {
        let store = SharedStore::new();
        assert!(store.snapshot().is_none());
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert_eq!(store.version(), 0);
        assert!(store.last_modified().is_none());
    }

    #[test]
    fn test_replace_then_append_concatenates() {
        let store = SharedStore::new();
        store.replace(vec![1u8, 2, 3]);
        store.append(vec![4u8, 5]);
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.bytes.as_ref(), &[1, 2, 3, 4, 5]);
        assert_eq!(snap.version, 2);
    }

    #[test]
    fn test_append_to_empty_store() {
        let store = SharedStore::new();
        store.append(vec![9u8, 9]);
        assert_eq!(store.snapshot().unwrap().bytes.as_ref(), &[9, 9]);
    }

    #[test]
    fn test_last_modified_strictly_increases() {
        let store = SharedStore::new();
        let mut prev = None;
        for i in 0..50u8 {
            store.append(vec![i]);
            let stamp = store.last_modified();
            assert!(stamp > prev);
            prev = stamp;
        }
    }

    #[test]
    fn test_clear_keeps_timestamp_and_bumps_version() {
        let store = SharedStore::new();
        store.replace(vec![1u8]);
        let stamp = store.last_modified();
        let version = store.version();

        assert!(store.clear());
        assert!(store.snapshot().is_none());
        assert_eq!(store.last_modified(), stamp);
        assert_eq!(store.version(), version + 1);

        // Clearing an absent store is a no-op apart from the version
        assert!(!store.clear());
    }

    #[test]
    fn test_zero_length_replace_is_present_but_empty() {
        let store = SharedStore::new();
        store.replace(Vec::<u8>::new());
        assert!(store.snapshot().is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_dirty_tracking() {
        let store = SharedStore::new();
        assert!(!store.is_dirty_since(None));

        store.replace(vec![1u8]);
        assert!(store.is_dirty_since(None));

        let seen = store.snapshot().map(|s| s.last_modified);
        assert!(!store.is_dirty_since(seen));

        store.append(vec![2u8]);
        assert!(store.is_dirty_since(seen));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = SharedStore::new();
        store.replace(vec![1u8, 2]);
        let snap = store.snapshot().unwrap();
        store.replace(vec![7u8]);
        assert_eq!(snap.bytes.as_ref(), &[1, 2]);
    }

    #[test]
    fn test_concurrent_appends_are_not_interleaved() {
        const WRITERS: usize = 8;
        const CHUNK: usize = 64;

        let store = SharedStore::new();
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || store.append(vec![w as u8; CHUNK]))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.len(), WRITERS * CHUNK);
        assert_eq!(snap.version, WRITERS as u64);

        // Every chunk must be contiguous: one writer's bytes, start to end
        let mut seen = std::collections::HashSet::new();
        for chunk in snap.bytes.chunks(CHUNK) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
            assert!(seen.insert(chunk[0]));
        }
    }

    #[test]
    fn test_concurrent_snapshots_never_see_partial_appends() {
        const WRITERS: usize = 4;
        const ROUNDS: usize = 50;
        const CHUNK: usize = 256;

        let store = SharedStore::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let store = store.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut observed = 0usize;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    if let Some(snap) = store.snapshot() {
                        assert_eq!(snap.len() % CHUNK, 0, "partial append visible at v{}", snap.version);
                        for chunk in snap.bytes.chunks(CHUNK) {
                            assert!(chunk.iter().all(|b| *b == chunk[0]));
                        }
                        observed += 1;
                    }
                }
                observed
            })
        };

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        store.append(vec![(w * ROUNDS + round) as u8; CHUNK]);
                    }
                })
            })
            .collect();
        for handle in writers {
            handle.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        let observed = reader.join().unwrap();

        assert!(observed > 0);
        assert_eq!(store.len(), WRITERS * ROUNDS * CHUNK);
    }
}
