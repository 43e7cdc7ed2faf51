//! Lockstep and parallel region processing.
//!
//! [`process`] steps 1–N regions over congruent rectangles together, so a
//! caller can read from a source region and write to a destination region
//! without coordinating tile boundaries by hand. Each step's chunk size is
//! the minimum distance to the next boundary across all registered regions.
//!
//! [`process_parallel`] splits a manager rectangle into tile-aligned chunks
//! and hands each to a rayon worker; chunks never share a tile, so workers
//! only meet at the manager/cache locks.

use rayon::prelude::*;

use crate::error::TileError;
use crate::manager::TileManager;

use super::{PixelRegion, Rect, Span};

/// Step multiple regions over congruent rectangles in lockstep.
///
/// All regions must have the same clipped width and height. On each step the
/// closure receives one span per region, in registration order, all covering
/// the same relative sub-rectangle.
///
/// Regions over the *same* manager must not overlap the same tiles when one
/// of them is a write region: the write span would hold the tile's buffer
/// lock while the read span waits for it.
///
/// # Errors
///
/// [`TileError::DimensionMismatch`] if the regions' rectangles differ in
/// size; otherwise the first error from tile acquisition or the closure.
pub fn process<F>(regions: &mut [PixelRegion<'_>], mut f: F) -> Result<(), TileError>
where
    F: FnMut(&mut [Span<'_>]) -> Result<(), TileError>,
{
    let Some(first) = regions.first() else {
        return Ok(());
    };
    let width = first.width();
    let height = first.height();
    let bpp = first.bpp();

    for region in regions.iter() {
        if region.width() != width || region.height() != height {
            return Err(TileError::DimensionMismatch {
                src_width: width,
                src_height: height,
                src_bpp: bpp,
                dst_width: region.width(),
                dst_height: region.height(),
                dst_bpp: region.bpp(),
            });
        }
    }

    let mut dy = 0;
    while dy < height {
        let mut step_h = height - dy;
        for region in regions.iter() {
            let y = region.y() + dy;
            step_h = step_h.min(region.next_y_boundary(y) - y);
        }

        let mut dx = 0;
        while dx < width {
            let mut step_w = width - dx;
            for region in regions.iter() {
                let x = region.x() + dx;
                step_w = step_w.min(region.next_x_boundary(x) - x);
            }

            let mut spans: Vec<Span<'_>> = regions
                .iter_mut()
                .map(|region| {
                    let rect = Rect::new(region.x() + dx, region.y() + dy, step_w, step_h);
                    region.span_at(rect)
                })
                .collect::<Result<_, _>>()?;
            f(&mut spans)?;
            drop(spans);

            dx += step_w;
        }
        dy += step_h;
    }
    Ok(())
}

/// Tile-aligned chunk rectangles covering a manager rectangle, row-major.
///
/// Each chunk lies within exactly one tile, so independent workers claiming
/// disjoint chunks never contend on a tile lock.
pub fn tile_chunks(
    manager: &TileManager,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<Vec<Rect>, TileError> {
    // Borrow the region's clipping and boundary walk without acquiring tiles.
    let probe = PixelRegion::open(manager, x, y, width, height, false)?;
    let rect = probe.rect();

    let mut chunks = Vec::new();
    let mut cy = rect.y;
    while cy < rect.bottom() {
        let chunk_h = probe.next_y_boundary(cy) - cy;
        let mut cx = rect.x;
        while cx < rect.right() {
            let chunk_w = probe.next_x_boundary(cx) - cx;
            chunks.push(Rect::new(cx, cy, chunk_w, chunk_h));
            cx += chunk_w;
        }
        cy += chunk_h;
    }

    Ok(chunks)
}

/// Process a manager rectangle with one rayon task per tile-aligned chunk.
///
/// The closure runs once per span (one span per chunk) from worker threads;
/// synchronization happens only at the manager and cache layers.
pub fn process_parallel<F>(
    manager: &TileManager,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    write: bool,
    f: F,
) -> Result<(), TileError>
where
    F: Fn(&mut Span<'_>) -> Result<(), TileError> + Send + Sync,
{
    let chunks = tile_chunks(manager, x, y, width, height)?;
    chunks.into_par_iter().try_for_each(|chunk| {
        let mut region =
            PixelRegion::open(manager, chunk.x, chunk.y, chunk.width, chunk.height, write)?;
        region.for_each_span(|span| f(span))
    })
}

// =============================================================================
// Tests
// =============================================================================
