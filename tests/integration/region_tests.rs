//! Pixel region round-trip, lockstep, and parallel processing tests.

use tilestore::{
    process, process_parallel, tile_chunks, PixelRegion, TileAccess, TileCache, TileError,
    TileManager,
};

use super::test_utils::{fill_pattern, pattern_byte};

fn make_manager(width: u32, height: u32, bpp: u32) -> (TileCache, TileManager) {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let manager = TileManager::new(&cache, width, height, bpp);
    (cache, manager)
}

#[test]
fn test_region_roundtrip_identical_bytes() {
    let (_cache, manager) = make_manager(257, 130, 3);
    let (x, y, w, h) = (5, 9, 240, 110);

    // Write a known pattern through a write-mode region.
    let mut region = PixelRegion::open(&manager, x, y, w, h, true).unwrap();
    region
        .for_each_span(|span| {
            for row in 0..span.height() {
                let py = span.y() + row;
                let px0 = span.x();
                for (i, chunk) in span.row_mut(row).chunks_exact_mut(3).enumerate() {
                    let px = px0 + i as u32;
                    for (c, byte) in chunk.iter_mut().enumerate() {
                        *byte = pattern_byte(px, py, c as u32);
                    }
                }
            }
            Ok(())
        })
        .unwrap();

    // Read it back through a read-mode region over the same rectangle.
    let mut region = PixelRegion::open(&manager, x, y, w, h, false).unwrap();
    region
        .for_each_span(|span| {
            for row in 0..span.height() {
                let py = span.y() + row;
                for (i, chunk) in span.row(row).chunks_exact(3).enumerate() {
                    let px = span.x() + i as u32;
                    for (c, &byte) in chunk.iter().enumerate() {
                        assert_eq!(byte, pattern_byte(px, py, c as u32));
                    }
                }
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_region_error_propagates_from_closure() {
    let (_cache, manager) = make_manager(100, 100, 1);

    let mut region = PixelRegion::open(&manager, 0, 0, 100, 100, false).unwrap();
    let err = region
        .for_each_span(|_| {
            Err(TileError::InvalidAccess {
                reason: "stop".to_string(),
            })
        })
        .unwrap_err();
    assert!(matches!(err, TileError::InvalidAccess { .. }));

    // The aborted iteration released its tile.
    assert!(manager.get_tile(0, 0, TileAccess::Write).is_ok());
}

#[test]
fn test_lockstep_source_to_destination_copy() {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let src = TileManager::new(&cache, 257, 130, 3);
    let dst = TileManager::new(&cache, 257, 130, 3);

    let (w, h) = (257, 130);
    let mut pattern = vec![0u8; (w * h * 3) as usize];
    fill_pattern(&mut pattern, 0, 0, w, h, 3);
    src.write_pixel_data(0, 0, w, h, &pattern, (w * 3) as usize)
        .unwrap();

    let mut regions = [
        PixelRegion::open(&src, 0, 0, w, h, false).unwrap(),
        PixelRegion::open(&dst, 0, 0, w, h, true).unwrap(),
    ];
    process(&mut regions, |spans| {
        let (src_span, rest) = spans.split_first_mut().unwrap();
        let dst_span = &mut rest[0];
        for row in 0..src_span.height() {
            dst_span.row_mut(row).copy_from_slice(src_span.row(row));
        }
        Ok(())
    })
    .unwrap();

    let mut readback = vec![0u8; (w * h * 3) as usize];
    dst.read_pixel_data(0, 0, w, h, &mut readback, (w * 3) as usize)
        .unwrap();
    assert_eq!(readback, pattern);
}

#[test]
fn test_lockstep_three_regions_blend() {
    let cache = TileCache::in_memory(64 * 1024 * 1024);
    let a = TileManager::new(&cache, 96, 96, 1);
    let b = TileManager::new(&cache, 96, 96, 1);
    let out = TileManager::new(&cache, 96, 96, 1);

    a.write_pixel_data(0, 0, 96, 96, &vec![10u8; 96 * 96], 96)
        .unwrap();
    b.write_pixel_data(0, 0, 96, 96, &vec![30u8; 96 * 96], 96)
        .unwrap();

    let mut regions = [
        PixelRegion::open(&a, 0, 0, 96, 96, false).unwrap(),
        PixelRegion::open(&b, 0, 0, 96, 96, false).unwrap(),
        PixelRegion::open(&out, 0, 0, 96, 96, true).unwrap(),
    ];
    process(&mut regions, |spans| {
        let height = spans[0].height();
        for row in 0..height {
            let width = spans[0].row(row).len();
            for i in 0..width {
                let sum = spans[0].row(row)[i] / 2 + spans[1].row(row)[i] / 2;
                spans[2].row_mut(row)[i] = sum;
            }
        }
        Ok(())
    })
    .unwrap();

    let mut pixel = [0u8];
    out.read_pixel(50, 50, &mut pixel).unwrap();
    assert_eq!(pixel[0], 20);
}

#[test]
fn test_parallel_chunks_write_pattern() {
    let (cache, manager) = make_manager(257, 130, 1);

    process_parallel(&manager, 0, 0, 257, 130, true, |span| {
        for row in 0..span.height() {
            let py = span.y() + row;
            let px0 = span.x();
            for (i, byte) in span.row_mut(row).iter_mut().enumerate() {
                *byte = pattern_byte(px0 + i as u32, py, 0);
            }
        }
        Ok(())
    })
    .unwrap();

    // Sequential readback sees every parallel write.
    let mut readback = vec![0u8; 257 * 130];
    manager
        .read_pixel_data(0, 0, 257, 130, &mut readback, 257)
        .unwrap();
    for y in 0..130u32 {
        for x in 0..257u32 {
            assert_eq!(readback[(y * 257 + x) as usize], pattern_byte(x, y, 0));
        }
    }

    assert!(cache.stats().resident_bytes <= cache.budget());
}

#[test]
fn test_parallel_chunks_under_memory_pressure() {
    // Budget fits only four tiles; the parallel fill must still complete.
    let cache = TileCache::in_memory(4 * 64 * 64);
    let manager = TileManager::new(&cache, 320, 192, 1);

    process_parallel(&manager, 0, 0, 320, 192, true, |span| {
        span.fill(0x66);
        Ok(())
    })
    .unwrap();

    let mut pixel = [0u8];
    for (x, y) in [(0, 0), (319, 191), (160, 96)] {
        manager.read_pixel(x, y, &mut pixel).unwrap();
        assert_eq!(pixel[0], 0x66);
    }
    assert!(cache.stats().swap_outs > 0);
}

#[test]
fn test_chunks_align_to_tile_edges() {
    let (_cache, manager) = make_manager(257, 130, 1);

    let chunks = tile_chunks(&manager, 0, 0, 257, 130).unwrap();
    // 5x3 tile grid fully covered.
    assert_eq!(chunks.len(), 15);
    for chunk in &chunks {
        assert!(chunk.x % 64 == 0);
        assert!(chunk.y % 64 == 0);
        assert!(chunk.width <= 64 && chunk.height <= 64);
    }
}

#[test]
fn test_flat_buffer_to_tiles_and_back() {
    let (_cache, manager) = make_manager(150, 70, 2);

    let mut pattern = vec![0u8; 150 * 70 * 2];
    fill_pattern(&mut pattern, 0, 0, 150, 70, 2);

    let mut regions = [
        PixelRegion::from_slice(&pattern, 150, 70, 2, 0, 0, 150, 70).unwrap(),
        PixelRegion::open(&manager, 0, 0, 150, 70, true).unwrap(),
    ];
    process(&mut regions, |spans| {
        let (src_span, rest) = spans.split_first_mut().unwrap();
        let dst_span = &mut rest[0];
        for row in 0..src_span.height() {
            dst_span.row_mut(row).copy_from_slice(src_span.row(row));
        }
        Ok(())
    })
    .unwrap();

    let mut out = vec![0u8; 150 * 70 * 2];
    {
        let mut regions = [
            PixelRegion::open(&manager, 0, 0, 150, 70, false).unwrap(),
            PixelRegion::from_slice_mut(&mut out, 150, 70, 2, 0, 0, 150, 70).unwrap(),
        ];
        process(&mut regions, |spans| {
            let (src_span, rest) = spans.split_first_mut().unwrap();
            let dst_span = &mut rest[0];
            for row in 0..src_span.height() {
                dst_span.row_mut(row).copy_from_slice(src_span.row(row));
            }
            Ok(())
        })
        .unwrap();
    }
    assert_eq!(out, pattern);
}
