//! Pixel regions: rectangular cursors over tiled or flat pixel storage.
//!
//! A [`PixelRegion`] walks a rectangle of a [`TileManager`] (or a plain
//! in-memory buffer) tile by tile in row-major order, yielding contiguous
//! [`Span`]s to algorithms. The region holds a lock only on the tile of the
//! currently yielded span; advancing releases it (marking it dirty for write
//! regions) before acquiring the next, so an aborted iteration never leaves
//! a tile referenced.
//!
//! # Example
//!
//! ```
//! use tilestore::{PixelRegion, TileCache, TileManager};
//!
//! let cache = TileCache::in_memory(8 * 1024 * 1024);
//! let manager = TileManager::new(&cache, 200, 100, 1);
//!
//! // Fill a rectangle through a write region.
//! let mut region = PixelRegion::open(&manager, 10, 10, 80, 40, true).unwrap();
//! region
//!     .for_each_span(|span| {
//!         span.fill(0x7F);
//!         Ok(())
//!     })
//!     .unwrap();
//! ```

mod process;

pub use process::{process, process_parallel, tile_chunks};

use crate::error::TileError;
use crate::manager::TileManager;
use crate::tile::{TileAccess, TileGuard, TILE_HEIGHT, TILE_WIDTH};

// =============================================================================
// Rect
// =============================================================================

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// One past the rightmost column.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// One past the bottom row.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection of two rectangles; empty when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Rect {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
        }
    }
}

// =============================================================================
// Pixel Region
// =============================================================================

enum FlatData<'a> {
    Ref(&'a [u8]),
    Mut(&'a mut [u8]),
}

enum RegionSource<'a> {
    Tiles {
        manager: &'a TileManager,
        level: usize,
    },
    Flat {
        data: FlatData<'a>,
        stride: usize,
    },
}

/// A rectangle-shaped cursor over a tile manager or flat buffer.
///
/// Created for the duration of one algorithmic pass; the rectangle is
/// clipped to the source's bounds at open time. Iteration proceeds
/// left-to-right, top-to-bottom in tile-sized (or smaller, at edges)
/// chunks.
pub struct PixelRegion<'a> {
    source: RegionSource<'a>,
    rect: Rect,
    bpp: u32,
    write: bool,
}

impl<'a> std::fmt::Debug for PixelRegion<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelRegion")
            .field("rect", &self.rect)
            .field("bpp", &self.bpp)
            .field("write", &self.write)
            .finish_non_exhaustive()
    }
}

impl<'a> PixelRegion<'a> {
    /// Open a region over a manager's toplevel. The rectangle is clipped to
    /// the toplevel bounds; an empty clipped rectangle is an error.
    pub fn open(
        manager: &'a TileManager,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        write: bool,
    ) -> Result<Self, TileError> {
        Self::open_level(manager, 0, x, y, width, height, write)
    }

    /// Open a region over a specific pyramid level.
    pub(crate) fn open_level(
        manager: &'a TileManager,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        write: bool,
    ) -> Result<Self, TileError> {
        let info = manager
            .level_info(level)
            .ok_or(TileError::LevelOutOfBounds {
                level,
                level_count: manager.level_count(),
            })?;
        let bounds = Rect::new(0, 0, info.width, info.height);
        let rect = Rect::new(x, y, width, height).intersect(&bounds);
        if rect.is_empty() {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }
        Ok(Self {
            source: RegionSource::Tiles { manager, level },
            rect,
            bpp: manager.bpp(),
            write,
        })
    }

    /// Open a read-only region over a flat row-major buffer of
    /// `buf_width` × `buf_height` pixels.
    pub fn from_slice(
        data: &'a [u8],
        buf_width: u32,
        buf_height: u32,
        bpp: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, TileError> {
        let stride = buf_width as usize * bpp as usize;
        let rect = Self::clip_flat(data.len(), buf_width, buf_height, bpp, x, y, width, height)?;
        Ok(Self {
            source: RegionSource::Flat {
                data: FlatData::Ref(data),
                stride,
            },
            rect,
            bpp,
            write: false,
        })
    }

    /// Open a writable region over a flat row-major buffer.
    pub fn from_slice_mut(
        data: &'a mut [u8],
        buf_width: u32,
        buf_height: u32,
        bpp: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, TileError> {
        let stride = buf_width as usize * bpp as usize;
        let rect = Self::clip_flat(data.len(), buf_width, buf_height, bpp, x, y, width, height)?;
        Ok(Self {
            source: RegionSource::Flat {
                data: FlatData::Mut(data),
                stride,
            },
            rect,
            bpp,
            write: true,
        })
    }

    fn clip_flat(
        data_len: usize,
        buf_width: u32,
        buf_height: u32,
        bpp: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Rect, TileError> {
        let required = buf_width as usize * buf_height as usize * bpp as usize;
        if data_len < required {
            return Err(TileError::BufferTooSmall {
                required,
                actual: data_len,
            });
        }
        let bounds = Rect::new(0, 0, buf_width, buf_height);
        let rect = Rect::new(x, y, width, height).intersect(&bounds);
        if rect.is_empty() {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width: buf_width,
                height: buf_height,
            });
        }
        Ok(rect)
    }

    /// The clipped rectangle this region walks.
    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn x(&self) -> u32 {
        self.rect.x
    }

    pub fn y(&self) -> u32 {
        self.rect.y
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Whether spans from this region may be written.
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Start walking the rectangle. Re-open the region to restart; an
    /// in-progress cursor cannot rewind.
    pub fn spans<'r>(&'r mut self) -> SpanIter<'r, 'a> {
        let cursor = Some((self.rect.x, self.rect.y));
        SpanIter {
            region: self,
            cursor,
        }
    }

    /// Run a closure over every span in row-major order.
    pub fn for_each_span<F>(&mut self, mut f: F) -> Result<(), TileError>
    where
        F: FnMut(&mut Span<'_>) -> Result<(), TileError>,
    {
        let mut iter = self.spans();
        while let Some(mut span) = iter.next_span()? {
            f(&mut span)?;
        }
        Ok(())
    }

    /// Next chunk boundary strictly after `x`, clamped to the rectangle's
    /// right edge. Flat buffers have no internal boundaries.
    pub(crate) fn next_x_boundary(&self, x: u32) -> u32 {
        let limit = self.rect.right();
        match self.source {
            RegionSource::Tiles { .. } => ((x / TILE_WIDTH + 1) * TILE_WIDTH).min(limit),
            RegionSource::Flat { .. } => limit,
        }
    }

    pub(crate) fn next_y_boundary(&self, y: u32) -> u32 {
        let limit = self.rect.bottom();
        match self.source {
            RegionSource::Tiles { .. } => ((y / TILE_HEIGHT + 1) * TILE_HEIGHT).min(limit),
            RegionSource::Flat { .. } => limit,
        }
    }

    /// Produce a span for a sub-rectangle that does not cross a chunk
    /// boundary. Acquires the underlying tile for tile-backed regions.
    pub(crate) fn span_at(&mut self, rect: Rect) -> Result<Span<'_>, TileError> {
        debug_assert!(!rect.is_empty());
        debug_assert!(rect.x >= self.rect.x && rect.right() <= self.rect.right());
        debug_assert!(rect.y >= self.rect.y && rect.bottom() <= self.rect.bottom());

        let bpp = self.bpp;
        match &mut self.source {
            RegionSource::Tiles { manager, level } => {
                let access = if self.write {
                    TileAccess::Write
                } else {
                    TileAccess::Read
                };
                let guard = manager.get_tile_at_level(*level, rect.x, rect.y, access)?;
                let stride = guard.stride();
                let offset = guard.offset_of(rect.x % TILE_WIDTH, rect.y % TILE_HEIGHT);
                Ok(Span {
                    data: SpanData::Tile(guard),
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    bpp,
                    stride,
                    offset,
                })
            }
            RegionSource::Flat { data, stride } => {
                let stride = *stride;
                let offset = rect.y as usize * stride + rect.x as usize * bpp as usize;
                let data = match data {
                    FlatData::Ref(slice) => SpanData::Slice(*slice),
                    FlatData::Mut(slice) => SpanData::SliceMut(&mut **slice),
                };
                Ok(Span {
                    data,
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    bpp,
                    stride,
                    offset,
                })
            }
        }
    }
}

// =============================================================================
// Span
// =============================================================================

enum SpanData<'r> {
    Tile(TileGuard),
    Slice(&'r [u8]),
    SliceMut(&'r mut [u8]),
}

/// One contiguous chunk of a region: the portion of a single tile (or flat
/// buffer) inside the region's rectangle.
///
/// Rows are `stride()` bytes apart in the underlying storage; each row of
/// the span itself is `width() × bpp()` contiguous bytes.
pub struct Span<'r> {
    data: SpanData<'r>,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    bpp: u32,
    stride: usize,
    offset: usize,
}

impl Span<'_> {
    /// Absolute pixel column of the span's left edge.
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Absolute pixel row of the span's top edge.
    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Bytes between the starts of consecutive rows in the underlying
    /// storage.
    pub fn stride(&self) -> usize {
        self.stride
    }

    fn row_bounds(&self, row: u32) -> (usize, usize) {
        debug_assert!(row < self.height);
        let start = self.offset + row as usize * self.stride;
        (start, start + self.width as usize * self.bpp as usize)
    }

    /// One row of the span's pixels.
    pub fn row(&self, row: u32) -> &[u8] {
        let (start, end) = self.row_bounds(row);
        match &self.data {
            SpanData::Tile(guard) => &guard.data()[start..end],
            SpanData::Slice(slice) => &slice[start..end],
            SpanData::SliceMut(slice) => &slice[start..end],
        }
    }

    /// One mutable row of the span's pixels.
    ///
    /// # Panics
    ///
    /// Panics if the region was opened read-only.
    pub fn row_mut(&mut self, row: u32) -> &mut [u8] {
        let (start, end) = self.row_bounds(row);
        match &mut self.data {
            SpanData::Tile(guard) => &mut guard.data_mut()[start..end],
            SpanData::SliceMut(slice) => &mut slice[start..end],
            SpanData::Slice(_) => panic!("row_mut called on a read-only span"),
        }
    }

    /// Fill every pixel byte of the span with the same value.
    pub fn fill(&mut self, value: u8) {
        for row in 0..self.height {
            self.row_mut(row).fill(value);
        }
    }
}

// =============================================================================
// Span iterator
// =============================================================================

/// Cursor over a region's spans. Obtained from [`PixelRegion::spans`].
pub struct SpanIter<'r, 'a> {
    region: &'r mut PixelRegion<'a>,
    /// Absolute coordinates of the next span's origin.
    cursor: Option<(u32, u32)>,
}

impl SpanIter<'_, '_> {
    /// Advance to the next span. The previous span must have been dropped,
    /// which released its tile (marking it dirty for write regions).
    pub fn next_span(&mut self) -> Result<Option<Span<'_>>, TileError> {
        let Some((x, y)) = self.cursor else {
            return Ok(None);
        };

        let width = self.region.next_x_boundary(x) - x;
        let height = self.region.next_y_boundary(y) - y;
        let rect = Rect::new(x, y, width, height);

        let next_x = x + width;
        self.cursor = if next_x < self.region.rect.right() {
            Some((next_x, y))
        } else {
            let next_y = y + height;
            if next_y < self.region.rect.bottom() {
                Some((self.region.rect.x, next_y))
            } else {
                None
            }
        };

        self.region.span_at(rect).map(Some)
    }
}

// =============================================================================
// Tests
// =============================================================================
