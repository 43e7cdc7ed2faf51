//! Cache budget, eviction, and swap persistence tests.

use std::sync::Arc;

use tilestore::{TileAccess, TileCache, TileManager, TileSource};

use super::test_utils::{CountingSource, CountingStore};

const TILE_BYTES: usize = 64 * 64;

/// 192x64 at 1 bpp: exactly three full 64x64 tiles in a row.
fn three_tile_manager(cache: &TileCache) -> TileManager {
    TileManager::new(cache, 192, 64, 1)
}

#[test]
fn test_lru_eviction_persists_dirty_bytes() {
    let store = Arc::new(CountingStore::new());
    let cache = TileCache::with_store(
        2 * TILE_BYTES,
        Box::new(ArcStore(store.clone())),
    );
    let manager = three_tile_manager(&cache);

    // Dirty three tiles in sequence with no overlapping references.
    for (i, x) in [0u32, 64, 128].iter().enumerate() {
        let mut tile = manager.get_tile(*x, 0, TileAccess::Write).unwrap();
        tile.data_mut().fill(i as u8 + 1);
    }

    // Budget holds two tiles: the least-recently-used was evicted, and its
    // dirty bytes hit the store's write before the buffer was dropped.
    let stats = cache.stats();
    assert!(stats.resident_bytes <= cache.budget());
    assert_eq!(stats.resident_tiles, 2);
    assert_eq!(stats.evictions, 1);
    assert_eq!(store.writes(), 1);

    // The evicted tile faults back in with its bytes intact.
    let tile = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    assert!(tile.data().iter().all(|&b| b == 1));
    drop(tile);
    assert_eq!(store.reads(), 1);
    assert_eq!(cache.stats().swap_ins, 1);
}

#[test]
fn test_budget_invariant_after_unreferenced_workload() {
    let cache = TileCache::in_memory(2 * TILE_BYTES);
    let manager = TileManager::new(&cache, 320, 128, 1);

    let tile_count = manager.level_info(0).unwrap().tile_count;
    for index in 0..tile_count {
        let mut tile = manager.get_tile_by_index(index, TileAccess::Write).unwrap();
        tile.data_mut().fill(index as u8);
    }
    for index in 0..tile_count {
        drop(manager.get_tile_by_index(index, TileAccess::Read).unwrap());
    }

    // Nothing referenced: resident bytes are within budget.
    assert!(cache.stats().resident_bytes <= cache.budget());
}

#[test]
fn test_referenced_tiles_survive_pressure() {
    let cache = TileCache::in_memory(2 * TILE_BYTES);
    let manager = three_tile_manager(&cache);

    let mut pinned = manager.get_tile(0, 0, TileAccess::Write).unwrap();
    pinned.data_mut().fill(0x77);

    // Churn the other two tiles while the first is referenced.
    for _ in 0..3 {
        for x in [64u32, 128] {
            let mut tile = manager.get_tile(x, 0, TileAccess::Write).unwrap();
            tile.data_mut().fill(0x10);
        }
    }

    // The pinned tile's buffer never moved.
    assert_eq!(pinned.data()[0], 0x77);
    drop(pinned);

    let tile = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    assert!(tile.data().iter().all(|&b| b == 0x77));
}

#[test]
fn test_clean_reconstructible_tiles_revalidate_after_eviction() {
    let store = Arc::new(CountingStore::new());
    let cache = TileCache::with_store(2 * TILE_BYTES, Box::new(ArcStore(store.clone())));
    let manager = three_tile_manager(&cache);

    let source = Arc::new(CountingSource::new(0x44));
    manager.set_validate_source(Some(source.clone() as Arc<dyn TileSource>));

    // Read all three tiles; the first gets evicted clean.
    for x in [0u32, 64, 128] {
        drop(manager.get_tile(x, 0, TileAccess::Read).unwrap());
    }
    assert_eq!(store.writes(), 0);
    assert_eq!(cache.stats().evictions, 1);

    // Re-reading the evicted tile re-runs validation instead of the store.
    let tile = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    assert!(tile.data().iter().all(|&b| b == 0x44));
    drop(tile);
    assert_eq!(store.reads(), 0);
    assert_eq!(source.calls_for(0), 2);
}

#[test]
fn test_managers_share_one_budget() {
    let cache = TileCache::in_memory(2 * TILE_BYTES);
    let a = TileManager::new(&cache, 64, 64, 1);
    let b = TileManager::new(&cache, 64, 64, 1);
    let c = TileManager::new(&cache, 64, 64, 1);

    for manager in [&a, &b, &c] {
        let mut tile = manager.get_tile(0, 0, TileAccess::Write).unwrap();
        tile.data_mut().fill(0x01);
    }

    // Three managers, one pool: only two buffers stay resident.
    let stats = cache.stats();
    assert_eq!(stats.resident_tiles, 2);
    assert!(stats.resident_bytes <= cache.budget());
}

#[test]
fn test_manager_teardown_releases_accounting() {
    let store = Arc::new(CountingStore::new());
    let cache = TileCache::with_store(64 * 1024 * 1024, Box::new(ArcStore(store.clone())));

    {
        let manager = three_tile_manager(&cache);
        for x in [0u32, 64, 128] {
            let mut tile = manager.get_tile(x, 0, TileAccess::Write).unwrap();
            tile.data_mut().fill(0xAA);
        }
        assert_eq!(cache.stats().resident_tiles, 3);
    }

    let stats = cache.stats();
    assert_eq!(stats.resident_tiles, 0);
    assert_eq!(stats.resident_bytes, 0);
}

#[test]
fn test_swap_file_store_roundtrip_through_cache() {
    // Same scenario as the counting test, but against the real temp file.
    let cache = TileCache::new(2 * TILE_BYTES).unwrap();
    let manager = three_tile_manager(&cache);

    for (i, x) in [0u32, 64, 128].iter().enumerate() {
        let mut tile = manager.get_tile(*x, 0, TileAccess::Write).unwrap();
        tile.data_mut().fill((i as u8 + 1) * 3);
    }

    for (i, x) in [0u32, 64, 128].iter().enumerate() {
        let tile = manager.get_tile(*x, 0, TileAccess::Read).unwrap();
        assert!(
            tile.data().iter().all(|&b| b == (i as u8 + 1) * 3),
            "tile at x={x} lost its bytes through swap"
        );
    }
}

/// Adapter so a test can keep a handle on a store it hands to the cache.
struct ArcStore(Arc<CountingStore>);

impl tilestore::BackingStore for ArcStore {
    fn write(&self, ident: u64, bytes: &[u8]) -> Result<(), tilestore::SwapError> {
        self.0.write(ident, bytes)
    }

    fn read(&self, ident: u64, len: usize) -> Result<bytes::Bytes, tilestore::SwapError> {
        self.0.read(ident, len)
    }

    fn free(&self, ident: u64) {
        self.0.free(ident)
    }
}
