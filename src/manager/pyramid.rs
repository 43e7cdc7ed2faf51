//! Pyramid level geometry.
//!
//! A manager keeps its image at decreasing resolutions: level 0 is the
//! toplevel, and each level below is the ceiling half of the previous one in
//! each dimension, down to the first level whose whole area fits within one
//! tile. Levels above 0 materialize on demand by 2×2 box-averaging the level
//! below.

use crate::error::TileError;
use crate::tile::{TILE_HEIGHT, TILE_WIDTH};

use super::TileManager;

// =============================================================================
// LevelInfo
// =============================================================================

/// Geometry of a single pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelInfo {
    /// Index of this level (0 = toplevel, full resolution).
    pub level: usize,

    /// Level width in pixels.
    pub width: u32,

    /// Level height in pixels.
    pub height: u32,

    /// Number of tiles in X direction.
    pub tiles_x: u32,

    /// Number of tiles in Y direction.
    pub tiles_y: u32,

    /// Total number of tiles in this level's grid.
    pub tile_count: u32,
}

impl LevelInfo {
    pub(crate) fn toplevel(width: u32, height: u32) -> Self {
        Self::at_level(0, width, height)
    }

    fn at_level(level: usize, width: u32, height: u32) -> Self {
        let tiles_x = width.div_ceil(TILE_WIDTH);
        let tiles_y = height.div_ceil(TILE_HEIGHT);
        Self {
            level,
            width,
            height,
            tiles_x,
            tiles_y,
            tile_count: tiles_x * tiles_y,
        }
    }

    /// The next level down the pyramid: ceiling half in each dimension.
    pub(crate) fn below(&self) -> Self {
        Self::at_level(self.level + 1, self.width.div_ceil(2), self.height.div_ceil(2))
    }

    /// Whether this level's whole area fits within one nominal tile.
    pub fn fits_in_one_tile(&self) -> bool {
        self.width as u64 * self.height as u64 <= TILE_WIDTH as u64 * TILE_HEIGHT as u64
    }

    /// Linear tile index for a tile coordinate, or `None` out of bounds.
    pub fn tile_index(&self, tile_x: u32, tile_y: u32) -> Option<u32> {
        if tile_x >= self.tiles_x || tile_y >= self.tiles_y {
            return None;
        }
        Some(tile_y * self.tiles_x + tile_x)
    }

    /// Tile coordinates for a linear tile index.
    pub fn tile_coords(&self, index: u32) -> (u32, u32) {
        (index % self.tiles_x, index / self.tiles_x)
    }

    /// Tile coordinates of the tile containing the given pixel.
    pub fn tile_containing(&self, x: u32, y: u32) -> (u32, u32) {
        (x / TILE_WIDTH, y / TILE_HEIGHT)
    }

    /// Pixel origin of the tile at the given linear index.
    pub fn tile_origin(&self, index: u32) -> (u32, u32) {
        let (tile_x, tile_y) = self.tile_coords(index);
        (tile_x * TILE_WIDTH, tile_y * TILE_HEIGHT)
    }

    /// Pixel dimensions of a specific tile. Edge tiles may be smaller than
    /// the nominal tile size.
    pub fn tile_dimensions(&self, tile_x: u32, tile_y: u32) -> (u32, u32) {
        let width = if tile_x == self.tiles_x - 1 {
            let remainder = self.width % TILE_WIDTH;
            if remainder == 0 {
                TILE_WIDTH
            } else {
                remainder
            }
        } else {
            TILE_WIDTH
        };

        let height = if tile_y == self.tiles_y - 1 {
            let remainder = self.height % TILE_HEIGHT;
            if remainder == 0 {
                TILE_HEIGHT
            } else {
                remainder
            }
        } else {
            TILE_HEIGHT
        };

        (width, height)
    }
}

/// Derive the full pyramid: toplevel first, halving until a level's area
/// fits within one tile.
pub(crate) fn derive_levels(width: u32, height: u32) -> Vec<LevelInfo> {
    let mut levels = vec![LevelInfo::toplevel(width, height)];
    while !levels[levels.len() - 1].fits_in_one_tile() {
        let below = levels[levels.len() - 1].below();
        levels.push(below);
    }
    levels
}

// =============================================================================
// Downsample validation
// =============================================================================

/// Materialize a level ≥ 1 tile by box-averaging the corresponding area of
/// the level above it in resolution (level - 1). Source tiles validate
/// recursively through the manager as they are read.
pub(crate) fn downsample_into(
    manager: &TileManager,
    level: usize,
    index: u32,
    target: &mut [u8],
) -> Result<(), TileError> {
    debug_assert!(level >= 1);

    let info = manager
        .level_info(level)
        .ok_or(TileError::LevelOutOfBounds {
            level,
            level_count: manager.level_count(),
        })?;
    let src_info = manager
        .level_info(level - 1)
        .ok_or(TileError::LevelOutOfBounds {
            level: level - 1,
            level_count: manager.level_count(),
        })?;

    let bpp = manager.bpp() as usize;
    let (origin_x, origin_y) = info.tile_origin(index);
    let (tile_x, tile_y) = info.tile_coords(index);
    let (width, height) = info.tile_dimensions(tile_x, tile_y);

    // Source rectangle at double resolution, clipped to the source level.
    let src_x = origin_x * 2;
    let src_y = origin_y * 2;
    let src_w = (width * 2).min(src_info.width - src_x);
    let src_h = (height * 2).min(src_info.height - src_y);

    let src_stride = src_w as usize * bpp;
    let mut scratch = vec![0u8; src_stride * src_h as usize];
    manager.read_level_rect(level - 1, src_x, src_y, src_w, src_h, &mut scratch, src_stride)?;

    let dst_stride = width as usize * bpp;
    for dy in 0..height as usize {
        for dx in 0..width as usize {
            let sx = dx * 2;
            let sy = dy * 2;
            let block_w = if sx + 1 < src_w as usize { 2 } else { 1 };
            let block_h = if sy + 1 < src_h as usize { 2 } else { 1 };

            for channel in 0..bpp {
                let mut sum = 0u32;
                for by in 0..block_h {
                    for bx in 0..block_w {
                        sum += scratch[(sy + by) * src_stride + (sx + bx) * bpp + channel] as u32;
                    }
                }
                target[dy * dst_stride + dx * bpp + channel] =
                    (sum / (block_w * block_h) as u32) as u8;
            }
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
