//! Tile cache and swapper.
//!
//! A process typically creates one [`TileCache`] and passes it to every
//! [`TileManager`](crate::manager::TileManager) it builds; tiles from
//! unrelated managers then compete for one resident-byte budget. The cache
//! tracks every resident tile buffer in an LRU list and, when the budget is
//! exceeded, swaps cold unreferenced tiles out to a [`BackingStore`].
//!
//! # Eviction
//!
//! Eviction walks from the least-recently-used end, skipping tiles with an
//! outstanding read or write reference. A dirty tile is persisted before its
//! buffer is dropped; a clean tile that was never persisted just reverts to
//! invalid, since its bytes are reconstructible (by the manager's validate
//! source, or as zeroes when there is none). If every resident tile is
//! referenced the cache exceeds its budget rather than corrupt data or
//! deadlock — the excess drains on the next eviction pass.
//!
//! # Example
//!
//! ```
//! use tilestore::{TileCache, TileManager, TileAccess};
//!
//! let cache = TileCache::in_memory(8 * 1024 * 1024);
//! let manager = TileManager::new(&cache, 257, 130, 3);
//!
//! let tile = manager.get_tile(0, 0, TileAccess::Read).unwrap();
//! assert_eq!(tile.size(), 64 * 64 * 3);
//! drop(tile);
//!
//! assert!(cache.stats().resident_bytes <= cache.budget());
//! ```

mod store;

pub use store::{BackingStore, FileStore, MemStore, DEFAULT_SLOT_SIZE};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::SwapError;
use crate::tile::{SharedBuffer, Tile, TileState, Validity};

/// Default resident-byte budget: 64MB.
pub const DEFAULT_CACHE_BUDGET: usize = 64 * 1024 * 1024;

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of cache counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total bytes of resident tile buffers.
    pub resident_bytes: usize,
    /// Number of resident tile buffers.
    pub resident_tiles: usize,
    /// Tiles restored from the backing store.
    pub swap_ins: u64,
    /// Tiles persisted to the backing store.
    pub swap_outs: u64,
    /// Tile buffers dropped by eviction (persisted or not).
    pub evictions: u64,
    /// Evictions skipped because persisting the tile failed.
    pub swap_write_failures: u64,
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheInner {
    /// Resident tiles, most-recently-used first. Values are weak: the
    /// manager owns the tile, the cache only watches it.
    resident: LruCache<u64, Weak<Tile>>,
    resident_bytes: usize,
    swap_ins: u64,
    swap_outs: u64,
    evictions: u64,
    swap_write_failures: u64,
}

struct CacheShared {
    budget: usize,
    store: Box<dyn BackingStore>,
    next_ident: AtomicU64,
    inner: Mutex<CacheInner>,
}

/// Process-wide pool bounding total resident tile memory.
///
/// Cloning is cheap and shares the same pool; managers hold a clone.
#[derive(Clone)]
pub struct TileCache {
    shared: Arc<CacheShared>,
}

impl TileCache {
    /// Create a cache with the given budget, swapping to an anonymous temp
    /// file in the system temp directory.
    pub fn new(budget: usize) -> Result<Self, SwapError> {
        Ok(Self::with_store(budget, Box::new(FileStore::temp()?)))
    }

    /// Create a cache with the given budget and an in-memory backing store.
    pub fn in_memory(budget: usize) -> Self {
        Self::with_store(budget, Box::new(MemStore::new()))
    }

    /// Create a cache over a caller-supplied backing store.
    pub fn with_store(budget: usize, store: Box<dyn BackingStore>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                budget,
                store,
                next_ident: AtomicU64::new(1),
                inner: Mutex::new(CacheInner {
                    resident: LruCache::unbounded(),
                    resident_bytes: 0,
                    swap_ins: 0,
                    swap_outs: 0,
                    evictions: 0,
                    swap_write_failures: 0,
                }),
            }),
        }
    }

    /// Maximum resident bytes before eviction starts.
    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.inner.lock();
        CacheStats {
            resident_bytes: inner.resident_bytes,
            resident_tiles: inner.resident.len(),
            swap_ins: inner.swap_ins,
            swap_outs: inner.swap_outs,
            evictions: inner.evictions,
            swap_write_failures: inner.swap_write_failures,
        }
    }

    /// Hand out a fresh tile identity, stable for the tile's lifetime and
    /// used as the backing-store key.
    pub(crate) fn assign_ident(&self) -> u64 {
        self.shared.next_ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Move a tile to the most-recently-used end. Called on every acquire.
    pub(crate) fn touch(&self, tile: &Tile) {
        let mut inner = self.shared.inner.lock();
        inner.resident.get(&tile.ident());
    }

    /// Bookkeeping hook for a freshly allocated tile buffer. May evict other
    /// tiles to get back under budget.
    pub(crate) fn note_allocated(&self, tile: &Arc<Tile>, bytes: usize) {
        let mut inner = self.shared.inner.lock();
        inner.resident.put(tile.ident(), Arc::downgrade(tile));
        inner.resident_bytes += bytes;
        self.evict_to_budget(&mut inner);
    }

    /// Bookkeeping hook for a tile whose buffer is going away outside the
    /// eviction path (manager teardown, map-over replacement).
    pub(crate) fn note_freed(&self, ident: u64, resident_bytes: Option<usize>) {
        let mut inner = self.shared.inner.lock();
        if inner.resident.pop(&ident).is_some() {
            if let Some(bytes) = resident_bytes {
                inner.resident_bytes = inner.resident_bytes.saturating_sub(bytes);
            }
        }
    }

    /// Forget a tile's persisted bytes (invalidation makes them stale).
    pub(crate) fn discard_persisted(&self, ident: u64) {
        self.shared.store.free(ident);
    }

    /// Re-check the budget after a reference release made tiles evictable.
    /// Keeps the resident total under budget once nothing is referenced,
    /// instead of waiting for the next allocation.
    pub(crate) fn sweep(&self) {
        let mut inner = self.shared.inner.lock();
        self.evict_to_budget(&mut inner);
    }

    /// Restore a swapped-out tile's bytes. The caller holds the tile's state
    /// lock and has already taken a reference, so the buffer cannot be
    /// evicted again before the caller sees it.
    pub(crate) fn fault_in(
        &self,
        tile: &Arc<Tile>,
        state: &mut TileState,
    ) -> Result<SharedBuffer, SwapError> {
        debug_assert!(state.swapped && state.persisted && state.buffer.is_none());

        let len = tile.size();
        let bytes = self.shared.store.read(tile.ident(), len)?;
        let buffer = SharedBuffer::from_vec(bytes.to_vec());
        state.buffer = Some(buffer.clone());
        state.swapped = false;

        let mut inner = self.shared.inner.lock();
        inner.swap_ins += 1;
        inner.resident.put(tile.ident(), Arc::downgrade(tile));
        inner.resident_bytes += len;
        self.evict_to_budget(&mut inner);

        debug!(ident = tile.ident(), len, "faulted in tile");
        Ok(buffer)
    }

    /// Swap out cold tiles until resident bytes are back under budget.
    ///
    /// Runs with the cache lock held. Victim tile states are taken with
    /// `try_lock` and referenced tiles are skipped, so a thread holding a
    /// tile lock while waiting on the cache can never be deadlocked by the
    /// eviction path.
    fn evict_to_budget(&self, inner: &mut CacheInner) {
        if inner.resident_bytes <= self.shared.budget {
            return;
        }

        let candidates: Vec<(u64, Weak<Tile>)> = inner
            .resident
            .iter()
            .rev()
            .map(|(ident, weak)| (*ident, weak.clone()))
            .collect();

        for (ident, weak) in candidates {
            if inner.resident_bytes <= self.shared.budget {
                break;
            }

            let Some(tile) = weak.upgrade() else {
                // Owner went away without the usual teardown bookkeeping.
                inner.resident.pop(&ident);
                continue;
            };
            if tile.is_referenced() {
                continue;
            }
            let Some(mut state) = tile.state.try_lock() else {
                continue;
            };
            if tile.is_referenced() {
                continue;
            }
            let Some(buffer) = state.buffer.take() else {
                inner.resident.pop(&ident);
                continue;
            };
            let len = buffer.len();

            if state.dirty {
                // A releasing guard may still hold the buffer lock for a
                // moment after the refcount hits zero; never block on it.
                let Some(data) = buffer.try_read_owned() else {
                    state.buffer = Some(buffer);
                    continue;
                };
                match self.shared.store.write(ident, &data) {
                    Ok(()) => {
                        drop(data);
                        state.persisted = true;
                        state.dirty = false;
                        inner.swap_outs += 1;
                    }
                    Err(e) => {
                        // Non-fatal: keep this tile resident, try the next.
                        drop(data);
                        state.buffer = Some(buffer);
                        inner.swap_write_failures += 1;
                        warn!(ident, error = %e, "failed to persist tile, skipping eviction");
                        continue;
                    }
                }
            }

            if state.persisted {
                state.swapped = true;
            } else {
                // Clean and never persisted: contents are reconstructible,
                // so the tile just reverts to invalid.
                state.validity = Validity::Invalid;
            }
            drop(buffer);
            drop(state);

            inner.resident.pop(&ident);
            inner.resident_bytes = inner.resident_bytes.saturating_sub(len);
            inner.evictions += 1;
            trace!(ident, len, "evicted tile buffer");
        }

        if inner.resident_bytes > self.shared.budget {
            debug!(
                resident = inner.resident_bytes,
                budget = self.shared.budget,
                "cache over budget, all remaining tiles referenced"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
