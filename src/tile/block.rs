//! The tile itself: a fixed-maximum-size block of pixel memory with
//! dirty/valid state, split read/write reference counting, and swap state.
//!
//! Tiles are created by a [`TileManager`](crate::manager::TileManager) and
//! handed to callers only through [`TileGuard`], which releases the
//! reference on drop. The cache never evicts a tile while any guard is
//! outstanding.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::TileCache;
use crate::error::TileError;

use super::buffer::{OwnedReadGuard, OwnedWriteGuard, SharedBuffer};

/// Nominal tile width in pixels. Edge tiles may be narrower.
pub const TILE_WIDTH: u32 = 64;

/// Nominal tile height in pixels. Edge tiles may be shorter.
pub const TILE_HEIGHT: u32 = 64;

// =============================================================================
// Access Mode
// =============================================================================

/// Access mode requested when locking a tile.
///
/// `Write` implies read visibility; there is no write-only mode. At most one
/// write reference may be outstanding per tile at a time, while read
/// references may be held concurrently in any number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileAccess {
    Read,
    Write,
}

impl TileAccess {
    pub fn is_write(self) -> bool {
        matches!(self, TileAccess::Write)
    }
}

// =============================================================================
// Tile State
// =============================================================================

/// Validity axis of a tile's state machine. The residency axis (resident vs
/// swapped) is managed by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Validity {
    /// Contents are undefined; validation runs before the next read/write.
    Invalid,
    /// A validate callback is currently filling the buffer.
    Validating,
    /// Contents are defined.
    Valid,
}

/// Mutable state of a tile, guarded by the tile's state lock.
pub(crate) struct TileState {
    pub validity: Validity,
    /// Written since last persisted or validated. Dirty implies valid.
    pub dirty: bool,
    /// Resident pixel bytes; `None` while unallocated or swapped out.
    pub buffer: Option<SharedBuffer>,
    /// The backing store holds a copy of this tile's bytes.
    pub persisted: bool,
    /// The buffer was dropped and the persisted copy is authoritative.
    pub swapped: bool,
}

// =============================================================================
// Tile
// =============================================================================

/// A single fixed-size block of pixel memory.
///
/// Geometry is fixed at creation; edge tiles are smaller than the nominal
/// [`TILE_WIDTH`] × [`TILE_HEIGHT`]. The level and linear index identify the
/// owning manager's slot for cache bookkeeping; the manager owns the tile,
/// never the other way around.
pub struct Tile {
    ident: u64,
    level: usize,
    index: u32,
    width: u32,
    height: u32,
    bpp: u32,
    read_refs: AtomicU32,
    write_locked: AtomicBool,
    pub(crate) state: Mutex<TileState>,
}

impl Tile {
    pub(crate) fn new(
        ident: u64,
        level: usize,
        index: u32,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Self {
        Self {
            ident,
            level,
            index,
            width,
            height,
            bpp,
            read_refs: AtomicU32::new(0),
            write_locked: AtomicBool::new(false),
            state: Mutex::new(TileState {
                validity: Validity::Invalid,
                dirty: false,
                buffer: None,
                persisted: false,
                swapped: false,
            }),
        }
    }

    /// Stable identity used as the backing-store key.
    pub fn ident(&self) -> u64 {
        self.ident
    }

    /// Pyramid level of the owning slot (0 = toplevel).
    pub fn level(&self) -> usize {
        self.level
    }

    /// Linear index of the owning slot within its level's grid.
    pub fn index(&self) -> u32 {
        self.index
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

    /// Buffer size in bytes: width × height × bpp.
    pub fn size(&self) -> usize {
        (self.width * self.height * self.bpp) as usize
    }

    /// Bytes between the starts of consecutive rows.
    pub fn stride(&self) -> usize {
        (self.width * self.bpp) as usize
    }

    /// Whether any read or write reference is outstanding.
    pub(crate) fn is_referenced(&self) -> bool {
        self.read_refs.load(Ordering::Acquire) > 0 || self.write_locked.load(Ordering::Acquire)
    }

    /// Take a reference. Fails with `InvalidAccess` if a write reference is
    /// requested while another is outstanding.
    pub(crate) fn acquire(&self, access: TileAccess) -> Result<(), TileError> {
        match access {
            TileAccess::Read => {
                self.read_refs.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            TileAccess::Write => self
                .write_locked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| ())
                .map_err(|_| TileError::InvalidAccess {
                    reason: format!(
                        "tile {} already has an outstanding write reference",
                        self.index
                    ),
                }),
        }
    }

    /// Drop a reference taken with [`acquire`](Self::acquire). Releasing a
    /// write reference marks the tile dirty.
    pub(crate) fn release(&self, access: TileAccess) {
        match access {
            TileAccess::Read => {
                self.read_refs.fetch_sub(1, Ordering::AcqRel);
            }
            TileAccess::Write => {
                let mut state = self.state.lock();
                state.dirty = true;
                drop(state);
                self.write_locked.store(false, Ordering::Release);
            }
        }
    }

    /// Undo an `acquire` whose follow-up work failed, without dirtying.
    pub(crate) fn abort(&self, access: TileAccess) {
        match access {
            TileAccess::Read => {
                self.read_refs.fetch_sub(1, Ordering::AcqRel);
            }
            TileAccess::Write => {
                self.write_locked.store(false, Ordering::Release);
            }
        }
    }
}

// =============================================================================
// Tile Guard
// =============================================================================

enum BufferGuard {
    Read(OwnedReadGuard),
    Write(OwnedWriteGuard),
}

/// Scoped tile reference with direct access to the resident pixel bytes.
///
/// Dropping the guard releases the reference; a guard acquired for write
/// marks the tile dirty on release, and the release re-checks the cache
/// budget now that the tile is evictable. While any guard is live the tile
/// cannot be evicted, so the byte slices stay valid for the guard's
/// lifetime.
pub struct TileGuard {
    tile: Arc<Tile>,
    buffer: SharedBuffer,
    data: BufferGuard,
    access: TileAccess,
    cache: TileCache,
}

impl std::fmt::Debug for TileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileGuard")
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl TileGuard {
    /// Wrap an already-acquired tile. The caller has resolved residency,
    /// validity, and copy-on-write before this point.
    pub(crate) fn new(
        tile: Arc<Tile>,
        buffer: SharedBuffer,
        access: TileAccess,
        cache: TileCache,
    ) -> Self {
        let data = match access {
            TileAccess::Read => BufferGuard::Read(buffer.read_owned()),
            TileAccess::Write => BufferGuard::Write(buffer.write_owned()),
        };
        Self {
            tile,
            buffer,
            data,
            access,
            cache,
        }
    }

    pub fn width(&self) -> u32 {
        self.tile.width()
    }

    pub fn height(&self) -> u32 {
        self.tile.height()
    }

    pub fn bpp(&self) -> u32 {
        self.tile.bpp()
    }

    /// Buffer size in bytes, accounting for edge tiles.
    pub fn size(&self) -> usize {
        self.tile.size()
    }

    pub fn stride(&self) -> usize {
        self.tile.stride()
    }

    pub fn level(&self) -> usize {
        self.tile.level()
    }

    pub fn index(&self) -> u32 {
        self.tile.index()
    }

    pub fn access(&self) -> TileAccess {
        self.access
    }

    /// Byte offset of the pixel at the given intra-tile coordinates.
    pub fn offset_of(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width() && y < self.height());
        (y * self.width() * self.bpp() + x * self.bpp()) as usize
    }

    /// The tile's pixel bytes, row-major with no padding.
    pub fn data(&self) -> &[u8] {
        match &self.data {
            BufferGuard::Read(guard) => guard,
            BufferGuard::Write(guard) => guard,
        }
    }

    /// Mutable pixel bytes.
    ///
    /// # Panics
    ///
    /// Panics if the guard was acquired read-only.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            BufferGuard::Write(guard) => &mut guard[..],
            BufferGuard::Read(_) => panic!("data_mut called on a read-only tile guard"),
        }
    }

    /// One row of pixels within the tile.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = self.offset_of(0, y);
        let len = self.stride();
        &self.data()[start..start + len]
    }

    /// One mutable row of pixels. Panics if the guard is read-only.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = self.offset_of(0, y);
        let len = self.stride();
        &mut self.data_mut()[start..start + len]
    }

    /// Share this tile's buffer for mapping into another manager's slot.
    pub(crate) fn share_buffer(&self) -> SharedBuffer {
        self.buffer.clone()
    }

    /// Release the reference explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for TileGuard {
    fn drop(&mut self) {
        self.tile.release(self.access);
        // The eviction pass skips this tile if it races with our still-held
        // buffer lock; the next sweep picks it up.
        self.cache.sweep();
    }
}

// =============================================================================
// Tests
// =============================================================================
