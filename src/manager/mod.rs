//! Tile manager: the owner of an image's tiled pixel storage.
//!
//! A [`TileManager`] owns a pyramid of tile grids for one image-like entity.
//! Consumers ask it for a tile at pixel coordinates; the manager locates or
//! lazily creates the [`Tile`](crate::tile::Tile), ensures the cache has its
//! buffer resident, runs on-demand validation when the tile is invalid, and
//! returns it locked for read or write.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Pixel Region / callers         │
//! └────────────────────┬────────────────────┘
//!                      │ get_tile(x, y, access)
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              TileManager                │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ level grids  │  │   TileSource    │  │
//! │  │ (lazy tiles) │  │ (validation)    │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ residency / eviction
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │           TileCache (shared)            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Validation and reentrancy
//!
//! No internal lock is held while a [`TileSource`] callback runs, so a
//! callback may call back into the same manager for *other* tiles — reading
//! already-valid neighbors while producing its own is legal and validates
//! them recursively. Requesting the tile currently being validated fails
//! with [`TileError::InvalidAccess`].

mod pyramid;

pub use pyramid::LevelInfo;

use std::any::Any;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cache::TileCache;
use crate::error::{TileError, ValidateError};
use crate::region::PixelRegion;
use crate::tile::{SharedBuffer, Tile, TileAccess, TileGuard, Validity, TILE_HEIGHT, TILE_WIDTH};

/// Linear tile index within one pyramid level's grid, row-major.
pub type TileIndex = u32;

// =============================================================================
// Validation source
// =============================================================================

/// Mutable view of a tile's buffer handed to a [`TileSource`].
///
/// The callback must fill exactly `width × height × bpp` bytes, row-major
/// with no padding. `x`/`y` are the tile's pixel origin at level 0.
pub struct TileFill<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    bpp: u32,
    x: u32,
    y: u32,
}

impl TileFill<'_> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Pixel origin of this tile within the toplevel image.
    pub fn origin(&self) -> (u32, u32) {
        (self.x, self.y)
    }

    pub fn stride(&self) -> usize {
        (self.width * self.bpp) as usize
    }

    /// The whole buffer to fill, row-major, no padding.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// One row of the buffer.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &mut self.data[start..start + stride]
    }

    /// Fill every byte with the same value.
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }
}

/// On-demand producer of tile contents.
///
/// Installed on a manager with [`TileManager::set_validate_source`]; invoked
/// synchronously the first time an invalid tile is read or written. When no
/// source is installed, invalid tiles become valid with zeroed bytes.
pub trait TileSource: Send + Sync {
    fn validate(
        &self,
        manager: &TileManager,
        index: TileIndex,
        fill: &mut TileFill<'_>,
    ) -> Result<(), ValidateError>;
}

impl<F> TileSource for F
where
    F: Fn(&TileManager, TileIndex, &mut TileFill<'_>) -> Result<(), ValidateError> + Send + Sync,
{
    fn validate(
        &self,
        manager: &TileManager,
        index: TileIndex,
        fill: &mut TileFill<'_>,
    ) -> Result<(), ValidateError> {
        self(manager, index, fill)
    }
}

/// Wrap a closure as a boxed [`TileSource`].
///
/// ```
/// use tilestore::{TileCache, TileManager};
///
/// let cache = TileCache::in_memory(1024 * 1024);
/// let manager = TileManager::new(&cache, 64, 64, 1);
/// manager.set_validate_source(Some(tilestore::source_fn(|_, _, fill| {
///     fill.fill(0x7F);
///     Ok(())
/// })));
/// ```
pub fn source_fn<F>(f: F) -> Arc<dyn TileSource>
where
    F: Fn(&TileManager, TileIndex, &mut TileFill<'_>) -> Result<(), ValidateError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Tile Manager
// =============================================================================

struct Level {
    info: LevelInfo,
    slots: Mutex<Vec<Option<Arc<Tile>>>>,
}

/// Owner of a pyramid of tile grids representing one image-like entity.
///
/// Tiles remain unallocated and invalid until first use. Concurrent calls
/// into the same manager are safe; different managers only contend on the
/// shared cache.
///
/// # Deadlock note
///
/// Requesting read access to a tile while holding a write guard on that
/// same tile from the same thread blocks forever; release the write guard
/// first. Distinct tiles never interact this way.
pub struct TileManager {
    cache: TileCache,
    width: u32,
    height: u32,
    bpp: u32,
    levels: Vec<Level>,
    source: RwLock<Option<Arc<dyn TileSource>>>,
    offsets: Mutex<(i32, i32)>,
    user_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl TileManager {
    /// Create a manager for a `width` × `height` image with `bpp` bytes per
    /// pixel, registered with the given cache.
    ///
    /// The pyramid has as many levels as it takes for the smallest level's
    /// area to fit within one tile.
    ///
    /// # Panics
    ///
    /// Panics if any dimension or `bpp` is zero.
    pub fn new(cache: &TileCache, width: u32, height: u32, bpp: u32) -> Self {
        assert!(width > 0 && height > 0, "image dimensions must be nonzero");
        assert!(bpp > 0, "bytes per pixel must be nonzero");

        let levels = pyramid::derive_levels(width, height)
            .into_iter()
            .map(|info| Level {
                slots: Mutex::new(vec![None; info.tile_count as usize]),
                info,
            })
            .collect();

        Self {
            cache: cache.clone(),
            width,
            height,
            bpp,
            levels,
            source: RwLock::new(None),
            offsets: Mutex::new((0, 0)),
            user_data: Mutex::new(None),
        }
    }

    // =========================================================================
    // Geometry accessors
    // =========================================================================

    /// Toplevel width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Toplevel height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per pixel.
    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Number of pyramid levels (level 0 is the toplevel).
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Geometry of one pyramid level, or `None` if the level does not exist.
    pub fn level_info(&self, level: usize) -> Option<LevelInfo> {
        self.levels.get(level).map(|l| l.info)
    }

    /// Placement of this manager's origin in its enclosing coordinate space.
    pub fn offsets(&self) -> (i32, i32) {
        *self.offsets.lock()
    }

    pub fn set_offsets(&self, x: i32, y: i32) {
        *self.offsets.lock() = (x, y);
    }

    /// The manager's rectangle in the enclosing coordinate space.
    pub fn bounds(&self) -> (i32, i32, u32, u32) {
        let (x, y) = self.offsets();
        (x, y, self.width, self.height)
    }

    // =========================================================================
    // Validation source
    // =========================================================================

    /// Install or replace the on-demand fill source. `None` means invalid
    /// tiles become valid with zeroed bytes.
    pub fn set_validate_source(&self, source: Option<Arc<dyn TileSource>>) {
        *self.source.write() = source;
    }

    /// Whether a validate source is installed.
    pub fn has_validate_source(&self) -> bool {
        self.source.read().is_some()
    }

    // =========================================================================
    // User data
    // =========================================================================

    /// Attach opaque data to the manager, replacing any previous value.
    pub fn set_user_data(&self, data: Box<dyn Any + Send + Sync>) {
        *self.user_data.lock() = Some(data);
    }

    /// Remove and return the attached data.
    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.user_data.lock().take()
    }

    /// Run a closure over the attached data downcast to `T`, if present and
    /// of that type.
    pub fn with_user_data<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.user_data.lock();
        guard.as_ref().and_then(|d| d.downcast_ref::<T>()).map(f)
    }

    // =========================================================================
    // Tile access
    // =========================================================================

    /// Get the toplevel tile containing pixel `(x, y)`, resident, validated,
    /// and locked for the requested access.
    ///
    /// # Errors
    ///
    /// - [`TileError::OutOfBounds`] if the coordinates exceed the toplevel
    /// - [`TileError::InvalidAccess`] on a second concurrent write reference
    ///   or when the tile is in the middle of being validated
    /// - [`TileError::Validation`] if the validate source fails; the tile
    ///   stays invalid and the next access retries
    /// - [`TileError::Swap`] if a swapped-out buffer cannot be restored
    pub fn get_tile(&self, x: u32, y: u32, access: TileAccess) -> Result<TileGuard, TileError> {
        self.get_tile_at_level(0, x, y, access)
    }

    /// Get a toplevel tile by linear index; used for sequential whole-image
    /// scans.
    pub fn get_tile_by_index(
        &self,
        index: TileIndex,
        access: TileAccess,
    ) -> Result<TileGuard, TileError> {
        let info = self.levels[0].info;
        if index >= info.tile_count {
            return Err(TileError::IndexOutOfBounds {
                index,
                tile_count: info.tile_count,
            });
        }
        self.lock_tile(0, index, access)
    }

    /// Get the tile containing `(x, y)` in the coordinate space of the given
    /// pyramid level. Tiles at levels ≥ 1 materialize by downsampling the
    /// level above them in resolution.
    pub fn get_tile_at_level(
        &self,
        level: usize,
        x: u32,
        y: u32,
        access: TileAccess,
    ) -> Result<TileGuard, TileError> {
        let info = self.level_info(level).ok_or(TileError::LevelOutOfBounds {
            level,
            level_count: self.level_count(),
        })?;
        if x >= info.width || y >= info.height {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }
        let (tile_x, tile_y) = info.tile_containing(x, y);
        let index = info
            .tile_index(tile_x, tile_y)
            .expect("tile coordinates derived from bounds-checked pixels");
        self.lock_tile(level, index, access)
    }

    /// Fetch or lazily create the tile at a slot.
    fn slot(&self, level: usize, index: TileIndex) -> Arc<Tile> {
        let level_entry = &self.levels[level];
        let mut slots = level_entry.slots.lock();
        match &slots[index as usize] {
            Some(tile) => tile.clone(),
            None => {
                let (tile_x, tile_y) = level_entry.info.tile_coords(index);
                let (width, height) = level_entry.info.tile_dimensions(tile_x, tile_y);
                let tile = Arc::new(Tile::new(
                    self.cache.assign_ident(),
                    level,
                    index,
                    width,
                    height,
                    self.bpp,
                ));
                slots[index as usize] = Some(tile.clone());
                tile
            }
        }
    }

    /// Acquire, fault in, validate, and resolve copy-on-write for a tile.
    fn lock_tile(
        &self,
        level: usize,
        index: TileIndex,
        access: TileAccess,
    ) -> Result<TileGuard, TileError> {
        let tile = self.slot(level, index);
        tile.acquire(access)?;

        match self.prepare_locked(&tile, level, index, access) {
            Ok(guard) => {
                if access.is_write() && level == 0 && self.levels.len() > 1 {
                    self.invalidate_derived(index);
                }
                Ok(guard)
            }
            Err(e) => {
                tile.abort(access);
                Err(e)
            }
        }
    }

    /// The body of `lock_tile` after the reference is taken: the tile cannot
    /// be evicted underneath us from here on.
    fn prepare_locked(
        &self,
        tile: &Arc<Tile>,
        level: usize,
        index: TileIndex,
        access: TileAccess,
    ) -> Result<TileGuard, TileError> {
        self.cache.touch(tile);

        let mut state = tile.state.lock();

        // Residency axis: fault in or allocate.
        if state.buffer.is_none() {
            if state.swapped {
                self.cache.fault_in(tile, &mut state)?;
            } else {
                state.buffer = Some(SharedBuffer::zeroed(tile.size()));
                self.cache.note_allocated(tile, tile.size());
            }
        }

        // Validity axis.
        match state.validity {
            Validity::Valid => {}
            Validity::Validating => {
                return Err(TileError::InvalidAccess {
                    reason: format!("tile {index} is currently being validated"),
                });
            }
            Validity::Invalid => {
                let source = if level == 0 {
                    self.source.read().clone()
                } else {
                    None
                };

                if level == 0 && source.is_none() {
                    // No validate source: accept the buffer as-is.
                    state.validity = Validity::Valid;
                } else {
                    let buffer = state
                        .buffer
                        .clone()
                        .expect("resident tile has a buffer during validation");
                    state.validity = Validity::Validating;
                    drop(state);

                    let result = self.run_validation(tile, level, index, source, &buffer);

                    state = tile.state.lock();
                    match result {
                        Ok(()) => state.validity = Validity::Valid,
                        Err(e) => {
                            state.validity = Validity::Invalid;
                            return Err(e);
                        }
                    }
                }
            }
        }

        // Copy-on-write: a writer must own its bytes alone.
        if access.is_write() {
            let buffer = state
                .buffer
                .as_mut()
                .expect("resident tile has a buffer after validation");
            if buffer.make_unique() {
                debug!(index, level, "copied shared tile buffer before write");
            }
        }

        let buffer = state
            .buffer
            .clone()
            .expect("resident tile has a buffer after validation");
        drop(state);

        Ok(TileGuard::new(
            tile.clone(),
            buffer,
            access,
            self.cache.clone(),
        ))
    }

    /// Run the fill callback (level 0) or pyramid downsampling (levels ≥ 1)
    /// with no manager locks held, so the callback may reenter for other
    /// tiles.
    fn run_validation(
        &self,
        tile: &Arc<Tile>,
        level: usize,
        index: TileIndex,
        source: Option<Arc<dyn TileSource>>,
        buffer: &SharedBuffer,
    ) -> Result<(), TileError> {
        let mut data = buffer.write_owned();

        if level == 0 {
            let source = source.expect("level 0 validation requires a source");
            let info = self.levels[0].info;
            let (x, y) = info.tile_origin(index);
            let mut fill = TileFill {
                data: &mut data[..],
                width: tile.width(),
                height: tile.height(),
                bpp: self.bpp,
                x,
                y,
            };
            source
                .validate(self, index, &mut fill)
                .map_err(|e| TileError::Validation { index, source: e })
        } else {
            pyramid::downsample_into(self, level, index, &mut data[..])
        }
    }

    // =========================================================================
    // Mapping tiles between managers
    // =========================================================================

    /// Map a foreign tile's buffer into the slot containing pixel `(x, y)`,
    /// marking the slot valid. The buffer is shared copy-on-write: either
    /// side's next write access copies it down.
    ///
    /// # Errors
    ///
    /// - [`TileError::DimensionMismatch`] if the source tile's shape or bpp
    ///   differ from the destination slot's
    /// - [`TileError::InvalidAccess`] if the destination tile is referenced
    pub fn map_tile(&self, x: u32, y: u32, source: &TileGuard) -> Result<(), TileError> {
        let info = self.levels[0].info;
        if x >= info.width || y >= info.height {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }
        let (tile_x, tile_y) = info.tile_containing(x, y);
        let index = info
            .tile_index(tile_x, tile_y)
            .expect("tile coordinates derived from bounds-checked pixels");
        self.map_over_tile(index, source)
    }

    /// Map a foreign tile's buffer over the toplevel tile at the given
    /// linear index. See [`map_tile`](Self::map_tile).
    pub fn map_over_tile(&self, index: TileIndex, source: &TileGuard) -> Result<(), TileError> {
        let info = self.levels[0].info;
        if index >= info.tile_count {
            return Err(TileError::IndexOutOfBounds {
                index,
                tile_count: info.tile_count,
            });
        }

        let (tile_x, tile_y) = info.tile_coords(index);
        let (width, height) = info.tile_dimensions(tile_x, tile_y);
        if source.width() != width || source.height() != height || source.bpp() != self.bpp {
            return Err(TileError::DimensionMismatch {
                src_width: source.width(),
                src_height: source.height(),
                src_bpp: source.bpp(),
                dst_width: width,
                dst_height: height,
                dst_bpp: self.bpp,
            });
        }

        let tile = self.slot(0, index);
        if tile.is_referenced() {
            return Err(TileError::InvalidAccess {
                reason: format!("cannot map over referenced tile {index}"),
            });
        }

        let mut state = tile.state.lock();
        if let Some(old) = state.buffer.take() {
            self.cache.note_freed(tile.ident(), Some(old.len()));
        }
        if state.persisted {
            self.cache.discard_persisted(tile.ident());
            state.persisted = false;
        }

        let shared = source.share_buffer();
        let len = shared.len();
        state.buffer = Some(shared);
        state.validity = Validity::Valid;
        state.dirty = true;
        state.swapped = false;
        drop(state);

        self.cache.note_allocated(&tile, len);
        if self.levels.len() > 1 {
            self.invalidate_derived(index);
        }
        debug!(index, "mapped foreign tile into slot");
        Ok(())
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Mark the toplevel tile containing `(x, y)` invalid, along with every
    /// pyramid tile derived from the same area. Contents' validity is
    /// discarded; buffers are not necessarily freed. Invalidating an
    /// already-invalid tile is a no-op.
    pub fn invalidate_tile(&self, x: u32, y: u32) -> Result<(), TileError> {
        let info = self.levels[0].info;
        if x >= info.width || y >= info.height {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }
        let (tile_x, tile_y) = info.tile_containing(x, y);
        let index = info
            .tile_index(tile_x, tile_y)
            .expect("tile coordinates derived from bounds-checked pixels");
        self.invalidate_slot(0, index);
        self.invalidate_derived(index);
        Ok(())
    }

    /// Mark every tile intersecting the rectangle invalid, across all
    /// pyramid levels.
    pub fn invalidate_area(&self, x: u32, y: u32, width: u32, height: u32) -> Result<(), TileError> {
        let info = self.levels[0].info;
        let x1 = x.checked_add(width).ok_or(TileError::OutOfBounds {
            x,
            y,
            width: info.width,
            height: info.height,
        })?;
        let y1 = y.checked_add(height).ok_or(TileError::OutOfBounds {
            x,
            y,
            width: info.width,
            height: info.height,
        })?;
        if x1 > info.width || y1 > info.height {
            return Err(TileError::OutOfBounds {
                x,
                y,
                width: info.width,
                height: info.height,
            });
        }
        if width == 0 || height == 0 {
            return Ok(());
        }

        let (tx0, ty0) = info.tile_containing(x, y);
        let (tx1, ty1) = info.tile_containing(x1 - 1, y1 - 1);
        for tile_y in ty0..=ty1 {
            for tile_x in tx0..=tx1 {
                let index = info
                    .tile_index(tile_x, tile_y)
                    .expect("tile range derived from bounds-checked rectangle");
                self.invalidate_slot(0, index);
                self.invalidate_derived(index);
            }
        }
        Ok(())
    }

    /// Mark every tile at every level invalid.
    pub fn invalidate_all(&self) {
        for (level, entry) in self.levels.iter().enumerate() {
            let count = entry.info.tile_count;
            for index in 0..count {
                self.invalidate_slot(level, index);
            }
        }
    }

    /// Invalidate one slot's tile if it has been created. Nonexistent tiles
    /// are invalid by construction.
    fn invalidate_slot(&self, level: usize, index: TileIndex) {
        let tile = {
            let slots = self.levels[level].slots.lock();
            slots[index as usize].clone()
        };
        let Some(tile) = tile else { return };

        let mut state = tile.state.lock();
        state.validity = Validity::Invalid;
        state.dirty = false;
        state.swapped = false;
        if state.persisted {
            state.persisted = false;
            self.cache.discard_persisted(tile.ident());
        }
    }

    /// Invalidate the pyramid tiles at levels ≥ 1 covering the same area as
    /// a toplevel tile.
    fn invalidate_derived(&self, index: TileIndex) {
        let info = self.levels[0].info;
        let (x0, y0) = info.tile_origin(index);
        let (tile_x, tile_y) = info.tile_coords(index);
        let (width, height) = info.tile_dimensions(tile_x, tile_y);
        let x1 = x0 + width - 1;
        let y1 = y0 + height - 1;

        for (level, entry) in self.levels.iter().enumerate().skip(1) {
            let shift = level as u32;
            let (tx0, ty0) = entry.info.tile_containing(x0 >> shift, y0 >> shift);
            let (tx1, ty1) = entry.info.tile_containing(x1 >> shift, y1 >> shift);
            for tile_y in ty0..=ty1 {
                for tile_x in tx0..=tx1 {
                    if let Some(derived) = entry.info.tile_index(tile_x, tile_y) {
                        self.invalidate_slot(level, derived);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Sum of all currently allocated tile buffer sizes across all levels.
    pub fn mem_size(&self) -> usize {
        let mut total = 0;
        for entry in &self.levels {
            let slots = entry.slots.lock();
            for tile in slots.iter().flatten() {
                if tile.state.lock().buffer.is_some() {
                    total += tile.size();
                }
            }
        }
        total
    }

    // =========================================================================
    // Bulk pixel I/O
    // =========================================================================

    /// Copy the rectangle's pixels into a caller-supplied flat buffer with
    /// the given row stride. The rectangle must lie fully inside the
    /// toplevel.
    pub fn read_pixel_data(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u8],
        stride: usize,
    ) -> Result<(), TileError> {
        self.check_rect(0, x, y, width, height)?;
        check_flat_buffer(out.len(), width, height, self.bpp, stride)?;
        self.read_level_rect(0, x, y, width, height, out, stride)
    }

    /// Copy a caller-supplied flat buffer into the rectangle's pixels.
    pub fn write_pixel_data(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        input: &[u8],
        stride: usize,
    ) -> Result<(), TileError> {
        self.check_rect(0, x, y, width, height)?;
        check_flat_buffer(input.len(), width, height, self.bpp, stride)?;

        let bpp = self.bpp as usize;
        let mut region = PixelRegion::open(self, x, y, width, height, true)?;
        region.for_each_span(|span| {
            let src_x = ((span.x() - x) as usize) * bpp;
            for row in 0..span.height() {
                let src_y = (span.y() + row - y) as usize;
                let src = &input[src_y * stride + src_x..];
                let len = span.width() as usize * bpp;
                span.row_mut(row).copy_from_slice(&src[..len]);
            }
            Ok(())
        })
    }

    /// Read one pixel's bytes into `out` (at least `bpp` bytes).
    pub fn read_pixel(&self, x: u32, y: u32, out: &mut [u8]) -> Result<(), TileError> {
        let bpp = self.bpp as usize;
        if out.len() < bpp {
            return Err(TileError::BufferTooSmall {
                required: bpp,
                actual: out.len(),
            });
        }
        let guard = self.get_tile(x, y, TileAccess::Read)?;
        let offset = guard.offset_of(x % TILE_WIDTH, y % TILE_HEIGHT);
        out[..bpp].copy_from_slice(&guard.data()[offset..offset + bpp]);
        Ok(())
    }

    /// Write one pixel from `input` (at least `bpp` bytes).
    pub fn write_pixel(&self, x: u32, y: u32, input: &[u8]) -> Result<(), TileError> {
        let bpp = self.bpp as usize;
        if input.len() < bpp {
            return Err(TileError::BufferTooSmall {
                required: bpp,
                actual: input.len(),
            });
        }
        let mut guard = self.get_tile(x, y, TileAccess::Write)?;
        let offset = guard.offset_of(x % TILE_WIDTH, y % TILE_HEIGHT);
        guard.data_mut()[offset..offset + bpp].copy_from_slice(&input[..bpp]);
        Ok(())
    }

    /// Read a rectangle at any pyramid level into a flat buffer. Used by the
    /// downsampling path; level 0 is the public `read_pixel_data`.
    pub(crate) fn read_level_rect(
        &self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u8],
        stride: usize,
    ) -> Result<(), TileError> {
        let bpp = self.bpp as usize;
        let mut region = PixelRegion::open_level(self, level, x, y, width, height, false)?;
        region.for_each_span(|span| {
            let dst_x = ((span.x() - x) as usize) * bpp;
            for row in 0..span.height() {
                let dst_y = (span.y() + row - y) as usize;
                let len = span.width() as usize * bpp;
                let dst = &mut out[dst_y * stride + dst_x..dst_y * stride + dst_x + len];
                dst.copy_from_slice(span.row(row));
            }
            Ok(())
        })
    }

    fn check_rect(
        &self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<(), TileError> {
        let info = self.level_info(level).ok_or(TileError::LevelOutOfBounds {
            level,
            level_count: self.level_count(),
        })?;
        let oob = TileError::OutOfBounds {
            x,
            y,
            width: info.width,
            height: info.height,
        };
        let x1 = x.checked_add(width).ok_or_else(|| oob.clone())?;
        let y1 = y.checked_add(height).ok_or_else(|| oob.clone())?;
        if width == 0 || height == 0 || x1 > info.width || y1 > info.height {
            return Err(oob);
        }
        Ok(())
    }

    // =========================================================================
    // Contiguous rectangle views
    // =========================================================================

    /// Borrow a rectangle as one contiguous buffer view.
    ///
    /// When the rectangle lies within a single tile the view aliases the
    /// tile's buffer directly (with the tile's stride); otherwise a scratch
    /// copy is filled through a pixel region, and a write view copies the
    /// scratch back on [`PixelData::release`] (or drop).
    pub fn request_pixel_data(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        access: TileAccess,
    ) -> Result<PixelData<'_>, TileError> {
        self.check_rect(0, x, y, width, height)?;

        let info = self.levels[0].info;
        let bpp = self.bpp as usize;
        let single_tile =
            info.tile_containing(x, y) == info.tile_containing(x + width - 1, y + height - 1);

        let backing = if single_tile {
            let guard = self.get_tile(x, y, access)?;
            let offset = guard.offset_of(x % TILE_WIDTH, y % TILE_HEIGHT);
            let stride = guard.stride();
            PixelDataBacking::Tile {
                guard,
                offset,
                stride,
            }
        } else {
            let stride = width as usize * bpp;
            let mut data = vec![0; stride * height as usize];
            self.read_pixel_data(x, y, width, height, &mut data, stride)?;
            PixelDataBacking::Scratch { data, stride }
        };

        Ok(PixelData {
            manager: self,
            x,
            y,
            width,
            height,
            access,
            backing,
            released: false,
        })
    }
}

impl Drop for TileManager {
    fn drop(&mut self) {
        for entry in &self.levels {
            let mut slots = entry.slots.lock();
            for tile in slots.iter_mut().filter_map(Option::take) {
                if tile.is_referenced() {
                    warn!(
                        index = tile.index(),
                        level = tile.level(),
                        "destroying manager while tile is referenced"
                    );
                }
                let mut state = tile.state.lock();
                let resident = state.buffer.take().map(|b| b.len());
                self.cache.note_freed(tile.ident(), resident);
                if state.persisted {
                    self.cache.discard_persisted(tile.ident());
                }
            }
        }
    }
}

fn check_flat_buffer(
    actual: usize,
    width: u32,
    height: u32,
    bpp: u32,
    stride: usize,
) -> Result<(), TileError> {
    let required = (height as usize - 1) * stride + width as usize * bpp as usize;
    if actual < required {
        return Err(TileError::BufferTooSmall { required, actual });
    }
    Ok(())
}

// =============================================================================
// PixelData
// =============================================================================

enum PixelDataBacking {
    Tile {
        guard: TileGuard,
        offset: usize,
        stride: usize,
    },
    Scratch {
        data: Vec<u8>,
        stride: usize,
    },
}

/// Contiguous buffer view over a rectangle of a manager.
///
/// Obtained from [`TileManager::request_pixel_data`]. Rows are `stride()`
/// bytes apart starting at `data()[0]`. A write view backed by a scratch
/// copy writes back on [`release`](Self::release) or drop; prefer `release`
/// so write-back failures surface as errors instead of log lines.
pub struct PixelData<'a> {
    manager: &'a TileManager,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    access: TileAccess,
    backing: PixelDataBacking,
    released: bool,
}

impl PixelData<'_> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.manager.bpp()
    }

    /// Bytes between the starts of consecutive rows.
    pub fn stride(&self) -> usize {
        match &self.backing {
            PixelDataBacking::Tile { stride, .. } => *stride,
            PixelDataBacking::Scratch { stride, .. } => *stride,
        }
    }

    /// The view's bytes, starting at the rectangle's top-left pixel.
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            PixelDataBacking::Tile { guard, offset, .. } => &guard.data()[*offset..],
            PixelDataBacking::Scratch { data, .. } => data,
        }
    }

    /// Mutable view bytes. Panics if the view was requested read-only.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            PixelDataBacking::Tile { guard, offset, .. } => {
                let offset = *offset;
                &mut guard.data_mut()[offset..]
            }
            PixelDataBacking::Scratch { data, .. } => {
                assert!(
                    self.access.is_write(),
                    "data_mut called on a read-only pixel data view"
                );
                data
            }
        }
    }

    /// Release the view, copying scratch-backed writes back into the tiles.
    pub fn release(mut self) -> Result<(), TileError> {
        self.released = true;
        self.write_back()
    }

    fn write_back(&mut self) -> Result<(), TileError> {
        if !self.access.is_write() {
            return Ok(());
        }
        if let PixelDataBacking::Scratch { data, stride } = &self.backing {
            self.manager
                .write_pixel_data(self.x, self.y, self.width, self.height, data, *stride)?;
        }
        Ok(())
    }
}

impl Drop for PixelData<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.write_back() {
                tracing::error!(error = %e, "failed to write back pixel data on drop");
            }
        }
    }
}
