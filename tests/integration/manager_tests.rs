//! Validation, invalidation, mapping, and bulk pixel I/O tests.

use std::sync::Arc;

use tilestore::{
    TileAccess, TileCache, TileError, TileFill, TileManager, TileSource, ValidateError,
};

use super::test_utils::{fill_pattern, CountingSource, FlakySource};

fn make_manager(width: u32, height: u32, bpp: u32) -> (TileCache, TileManager) {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let manager = TileManager::new(&cache, width, height, bpp);
    (cache, manager)
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_validate_callback_fills_tile_and_recounts_after_invalidate() {
    let (_cache, manager) = make_manager(257, 130, 3);
    let source = Arc::new(CountingSource::new(0x7F));
    manager.set_validate_source(Some(source.clone() as Arc<dyn TileSource>));

    // First access validates and fills with 0x7F.
    let tile = manager.get_tile(100, 100, TileAccess::Read).unwrap();
    let index = tile.index();
    assert_eq!(tile.data()[0], 0x7F);
    drop(tile);
    assert_eq!(source.calls_for(index), 1);

    // A second access does not revalidate.
    drop(manager.get_tile(100, 100, TileAccess::Read).unwrap());
    assert_eq!(source.calls_for(index), 1);

    // Invalidation forces the callback to run again on next access.
    manager.invalidate_tile(100, 100).unwrap();
    drop(manager.get_tile(100, 100, TileAccess::Read).unwrap());
    assert_eq!(source.calls_for(index), 2);
}

#[test]
fn test_no_source_yields_zeroed_valid_tiles() {
    let (_cache, manager) = make_manager(100, 100, 2);

    let tile = manager.get_tile(10, 10, TileAccess::Read).unwrap();
    assert!(tile.data().iter().all(|&b| b == 0));
}

#[test]
fn test_validation_failure_leaves_tile_invalid_and_retries() {
    let (_cache, manager) = make_manager(64, 64, 1);
    let source = Arc::new(FlakySource::new(0x33, 2));
    manager.set_validate_source(Some(source.clone() as Arc<dyn TileSource>));

    // Two failures surface as Validation errors, no partial validity.
    for _ in 0..2 {
        let err = manager.get_tile(0, 0, TileAccess::Read).unwrap_err();
        assert!(matches!(err, TileError::Validation { .. }));
    }

    // Third attempt succeeds; failure was not cached.
    let tile = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    assert_eq!(tile.data()[0], 0x33);
    assert_eq!(source.attempts(), 3);
}

#[test]
fn test_validate_callback_may_read_other_tiles() {
    struct NeighborSource;

    impl TileSource for NeighborSource {
        fn validate(
            &self,
            manager: &TileManager,
            index: u32,
            fill: &mut TileFill<'_>,
        ) -> Result<(), ValidateError> {
            if index == 0 {
                fill.fill(5);
                return Ok(());
            }
            // Reading a neighbor recursively validates it.
            let neighbor = manager
                .get_tile(0, 0, TileAccess::Read)
                .map_err(|e| ValidateError::new(e.to_string()))?;
            let base = neighbor.data()[0];
            fill.fill(base + 1);
            Ok(())
        }
    }

    let (_cache, manager) = make_manager(128, 64, 1);
    manager.set_validate_source(Some(Arc::new(NeighborSource) as Arc<dyn TileSource>));

    let tile = manager.get_tile(64, 0, TileAccess::Read).unwrap();
    assert_eq!(tile.data()[0], 6);
}

#[test]
fn test_validate_callback_cannot_reenter_same_tile() {
    struct SelfSource;

    impl TileSource for SelfSource {
        fn validate(
            &self,
            manager: &TileManager,
            _index: u32,
            fill: &mut TileFill<'_>,
        ) -> Result<(), ValidateError> {
            // Requesting the tile currently being validated is rejected.
            match manager.get_tile(0, 0, TileAccess::Read) {
                Err(TileError::InvalidAccess { .. }) => {
                    fill.fill(1);
                    Ok(())
                }
                Err(e) => Err(ValidateError::new(format!("unexpected error: {e}"))),
                Ok(_) => Err(ValidateError::new("reentrant lock unexpectedly granted")),
            }
        }
    }

    let (_cache, manager) = make_manager(64, 64, 1);
    manager.set_validate_source(Some(Arc::new(SelfSource) as Arc<dyn TileSource>));

    let tile = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    assert_eq!(tile.data()[0], 1);
}

// =============================================================================
// Lock discipline
// =============================================================================

#[test]
fn test_single_writer_discipline() {
    let (_cache, manager) = make_manager(100, 100, 1);

    let writer = manager.get_tile(0, 0, TileAccess::Write).unwrap();

    let err = manager.get_tile(0, 0, TileAccess::Write).unwrap_err();
    assert!(matches!(err, TileError::InvalidAccess { .. }));

    drop(writer);
    assert!(manager.get_tile(0, 0, TileAccess::Write).is_ok());
}

#[test]
fn test_concurrent_readers_allowed() {
    let (_cache, manager) = make_manager(100, 100, 1);

    let a = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    let b = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    let c = manager.get_tile(0, 0, TileAccess::Read).unwrap();
    assert_eq!(a.data()[0], b.data()[0]);
    drop((a, b, c));
}

// =============================================================================
// Mapping
// =============================================================================

#[test]
fn test_map_tile_shares_contents() {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let src = TileManager::new(&cache, 64, 64, 3);
    let dst = TileManager::new(&cache, 128, 128, 3);

    // Give the source tile recognizable contents.
    {
        let mut tile = src.get_tile(0, 0, TileAccess::Write).unwrap();
        tile.data_mut().fill(0xCD);
    }

    let guard = src.get_tile(0, 0, TileAccess::Read).unwrap();
    dst.map_tile(64, 0, &guard).unwrap();
    drop(guard);

    // The mapped slot is valid with the source's bytes; no validate source
    // was ever installed on dst.
    let mapped = dst.get_tile(64, 0, TileAccess::Read).unwrap();
    assert!(mapped.data().iter().all(|&b| b == 0xCD));
}

#[test]
fn test_map_tile_copy_on_write_isolation() {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let src = TileManager::new(&cache, 64, 64, 1);
    let dst = TileManager::new(&cache, 64, 64, 1);

    {
        let mut tile = src.get_tile(0, 0, TileAccess::Write).unwrap();
        tile.data_mut().fill(0x11);
    }
    let guard = src.get_tile(0, 0, TileAccess::Read).unwrap();
    dst.map_over_tile(0, &guard).unwrap();
    drop(guard);

    // Writing the mapped copy leaves the original untouched.
    {
        let mut tile = dst.get_tile(0, 0, TileAccess::Write).unwrap();
        tile.data_mut().fill(0x22);
    }
    let original = src.get_tile(0, 0, TileAccess::Read).unwrap();
    assert!(original.data().iter().all(|&b| b == 0x11));
    let copied = dst.get_tile(0, 0, TileAccess::Read).unwrap();
    assert!(copied.data().iter().all(|&b| b == 0x22));
}

#[test]
fn test_map_tile_dimension_mismatch() {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let src = TileManager::new(&cache, 64, 64, 3);
    let dst = TileManager::new(&cache, 100, 100, 3);

    let guard = src.get_tile(0, 0, TileAccess::Read).unwrap();

    // Destination slot at (70, 70) is a 36x36 edge tile.
    let err = dst.map_tile(70, 70, &guard).unwrap_err();
    assert!(matches!(err, TileError::DimensionMismatch { .. }));

    // Same shape but different bpp also mismatches.
    let dst_bpp = TileManager::new(&cache, 64, 64, 1);
    let err = dst_bpp.map_tile(0, 0, &guard).unwrap_err();
    assert!(matches!(err, TileError::DimensionMismatch { .. }));

    // A matching slot succeeds.
    dst.map_tile(0, 0, &guard).unwrap();
}

// =============================================================================
// Invalidation
// =============================================================================

#[test]
fn test_invalidate_already_invalid_is_noop() {
    let (_cache, manager) = make_manager(100, 100, 1);

    // Never accessed: invalid by construction; invalidating is not an error.
    manager.invalidate_tile(0, 0).unwrap();
    manager.invalidate_tile(0, 0).unwrap();
    manager.invalidate_all();

    assert!(manager.invalidate_tile(200, 0).is_err());
}

#[test]
fn test_write_invalidates_derived_pyramid_tiles() {
    let (_cache, manager) = make_manager(128, 128, 1);
    assert_eq!(manager.level_count(), 2);

    // Fill level 0 with a constant through writes.
    manager
        .write_pixel_data(0, 0, 128, 128, &vec![100u8; 128 * 128], 128)
        .unwrap();

    // Level 1 materializes as the average of uniform 100s.
    let tile = manager.get_tile_at_level(1, 0, 0, TileAccess::Read).unwrap();
    assert!(tile.data().iter().all(|&b| b == 100));
    drop(tile);

    // Punch a 2x2 zero block at the origin; the derived pixel re-averages.
    manager.write_pixel_data(0, 0, 2, 2, &[0u8; 4], 2).unwrap();
    let tile = manager.get_tile_at_level(1, 0, 0, TileAccess::Read).unwrap();
    assert_eq!(tile.data()[0], 0);
    assert_eq!(tile.data()[1], 100);
}

#[test]
fn test_invalidate_area_forces_revalidation() {
    let (_cache, manager) = make_manager(257, 130, 1);
    let source = Arc::new(CountingSource::new(9));
    manager.set_validate_source(Some(source.clone() as Arc<dyn TileSource>));

    // Touch every tile once.
    let info = manager.level_info(0).unwrap();
    for index in 0..info.tile_count {
        drop(manager.get_tile_by_index(index, TileAccess::Read).unwrap());
    }
    assert_eq!(source.total_calls(), info.tile_count as usize);

    // Invalidate a 2x2-tile area; only those four revalidate.
    manager.invalidate_area(60, 60, 10, 10).unwrap();
    for index in 0..info.tile_count {
        drop(manager.get_tile_by_index(index, TileAccess::Read).unwrap());
    }
    assert_eq!(source.total_calls(), info.tile_count as usize + 4);
}

// =============================================================================
// Bulk pixel I/O
// =============================================================================

#[test]
fn test_bulk_write_read_roundtrip() {
    let (_cache, manager) = make_manager(200, 150, 3);

    let (x, y, w, h) = (33, 21, 130, 100);
    let mut pattern = vec![0u8; (w * h * 3) as usize];
    fill_pattern(&mut pattern, x, y, w, h, 3);

    manager
        .write_pixel_data(x, y, w, h, &pattern, (w * 3) as usize)
        .unwrap();

    let mut readback = vec![0u8; (w * h * 3) as usize];
    manager
        .read_pixel_data(x, y, w, h, &mut readback, (w * 3) as usize)
        .unwrap();
    assert_eq!(readback, pattern);
}

#[test]
fn test_single_pixel_accessors() {
    let (_cache, manager) = make_manager(100, 100, 3);

    manager.write_pixel(65, 70, &[1, 2, 3]).unwrap();

    let mut pixel = [0u8; 3];
    manager.read_pixel(65, 70, &mut pixel).unwrap();
    assert_eq!(pixel, [1, 2, 3]);

    // Neighboring pixel untouched.
    manager.read_pixel(66, 70, &mut pixel).unwrap();
    assert_eq!(pixel, [0, 0, 0]);

    assert!(manager.read_pixel(100, 0, &mut pixel).is_err());
    let mut short = [0u8; 2];
    assert!(matches!(
        manager.read_pixel(0, 0, &mut short),
        Err(TileError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_request_pixel_data_single_tile_aliases_buffer() {
    let (_cache, manager) = make_manager(200, 200, 1);

    manager
        .write_pixel_data(64, 64, 8, 8, &vec![0xEE; 64], 8)
        .unwrap();

    // Rectangle within one tile: stride is the tile's, not the rect's.
    let view = manager
        .request_pixel_data(64, 64, 8, 8, TileAccess::Read)
        .unwrap();
    assert_eq!(view.stride(), 64);
    assert_eq!(&view.data()[..8], &[0xEE; 8]);
    view.release().unwrap();
}

#[test]
fn test_request_pixel_data_scratch_writeback() {
    let (_cache, manager) = make_manager(200, 200, 1);

    // Rectangle spanning multiple tiles: scratch copy with its own stride.
    let mut view = manager
        .request_pixel_data(32, 32, 100, 10, TileAccess::Write)
        .unwrap();
    assert_eq!(view.stride(), 100);
    view.data_mut()[..100].fill(0x5A);
    view.release().unwrap();

    let mut row = vec![0u8; 100];
    manager.read_pixel_data(32, 32, 100, 1, &mut row, 100).unwrap();
    assert_eq!(row, vec![0x5A; 100]);

    let mut below = vec![0u8; 100];
    manager.read_pixel_data(32, 33, 100, 1, &mut below, 100).unwrap();
    assert_eq!(below, vec![0u8; 100]);
}

// =============================================================================
// Manager odds and ends
// =============================================================================

#[test]
fn test_offsets_and_bounds() {
    let (_cache, manager) = make_manager(100, 50, 1);
    assert_eq!(manager.offsets(), (0, 0));

    manager.set_offsets(-10, 25);
    assert_eq!(manager.offsets(), (-10, 25));
    assert_eq!(manager.bounds(), (-10, 25, 100, 50));
}

#[test]
fn test_user_data_slot() {
    let (_cache, manager) = make_manager(64, 64, 1);

    manager.set_user_data(Box::new("layer-7".to_string()));
    let name = manager.with_user_data(|s: &String| s.clone()).unwrap();
    assert_eq!(name, "layer-7");

    // Wrong type downcasts to None.
    assert!(manager.with_user_data(|_: &u32| ()).is_none());

    let taken = manager.take_user_data().unwrap();
    assert_eq!(taken.downcast_ref::<String>().unwrap(), "layer-7");
    assert!(manager.take_user_data().is_none());
}

#[test]
fn test_mem_size_tracks_allocated_tiles() {
    let (_cache, manager) = make_manager(128, 64, 2);
    assert_eq!(manager.mem_size(), 0);

    drop(manager.get_tile(0, 0, TileAccess::Read).unwrap());
    assert_eq!(manager.mem_size(), 64 * 64 * 2);

    drop(manager.get_tile(64, 0, TileAccess::Read).unwrap());
    assert_eq!(manager.mem_size(), 2 * 64 * 64 * 2);
}
