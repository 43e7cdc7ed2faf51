//! Swap backing stores.
//!
//! When the cache evicts a dirty tile it persists the tile's bytes through a
//! [`BackingStore`] and reloads them on the next access. Tile identity is an
//! opaque token stable for the tile's lifetime; the byte layout inside the
//! store is the store's own business.
//!
//! Two implementations ship with the crate:
//!
//! - [`FileStore`]: an anonymous temp file divided into fixed-size slots,
//!   with a free list so slots are reused as tiles are freed
//! - [`MemStore`]: a HashMap of byte blobs, for tests and for hosts that
//!   want swap without touching the filesystem

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::SwapError;
use crate::tile::{TILE_HEIGHT, TILE_WIDTH};

// =============================================================================
// BackingStore Trait
// =============================================================================

/// Persistence interface the cache uses for evicted tile bytes.
///
/// Implementations must serialize their own internal state; the cache calls
/// these methods from whichever thread triggered the eviction or fault-in.
pub trait BackingStore: Send + Sync {
    /// Persist a tile's bytes under its identity, replacing any previous
    /// bytes for the same identity.
    fn write(&self, ident: u64, bytes: &[u8]) -> Result<(), SwapError>;

    /// Read back exactly `len` previously persisted bytes.
    fn read(&self, ident: u64, len: usize) -> Result<Bytes, SwapError>;

    /// Drop any bytes persisted for this identity. Unknown identities are
    /// ignored.
    fn free(&self, ident: u64);
}

// =============================================================================
// FileStore
// =============================================================================

/// Default slot size: one nominal tile at 4 bytes per pixel.
pub const DEFAULT_SLOT_SIZE: usize = (TILE_WIDTH * TILE_HEIGHT * 4) as usize;

struct FileStoreInner {
    file: File,
    /// Slot index per tile identity.
    slots: HashMap<u64, u64>,
    /// Slot indices freed for reuse.
    free: Vec<u64>,
    next_slot: u64,
}

/// Temp-file backing store with fixed-size slots.
///
/// Each tile identity maps to one slot; a tile rewritten after its first
/// eviction reuses its slot, and freed slots go on a free list so the file
/// does not grow past the high-water mark of swapped tiles.
pub struct FileStore {
    slot_size: usize,
    inner: Mutex<FileStoreInner>,
}

impl FileStore {
    /// Create a store over an anonymous temp file in the system temp
    /// directory. The file is unlinked immediately and disappears when the
    /// store is dropped.
    pub fn temp() -> Result<Self, SwapError> {
        let file = tempfile::tempfile().map_err(|e| SwapError::Create(e.to_string()))?;
        Ok(Self::with_file(file, DEFAULT_SLOT_SIZE))
    }

    /// Create a store over an anonymous temp file in the given directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self, SwapError> {
        let file = tempfile::tempfile_in(dir).map_err(|e| SwapError::Create(e.to_string()))?;
        Ok(Self::with_file(file, DEFAULT_SLOT_SIZE))
    }

    /// Create a store over the given file with a custom slot size.
    pub fn with_file(file: File, slot_size: usize) -> Self {
        Self {
            slot_size,
            inner: Mutex::new(FileStoreInner {
                file,
                slots: HashMap::new(),
                free: Vec::new(),
                next_slot: 0,
            }),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots currently assigned to tiles.
    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl BackingStore for FileStore {
    fn write(&self, ident: u64, bytes: &[u8]) -> Result<(), SwapError> {
        if bytes.len() > self.slot_size {
            return Err(SwapError::SlotTooSmall {
                ident,
                required: bytes.len(),
                slot_size: self.slot_size,
            });
        }

        let mut inner = self.inner.lock();
        let slot = match inner.slots.get(&ident) {
            Some(&slot) => slot,
            None => {
                let slot = match inner.free.pop() {
                    Some(slot) => slot,
                    None => {
                        let next = inner.next_slot;
                        inner.next_slot += 1;
                        next
                    }
                };
                inner.slots.insert(ident, slot);
                slot
            }
        };

        let offset = slot * self.slot_size as u64;
        let result = inner
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| inner.file.write_all(bytes));

        match result {
            Ok(()) => {
                trace!(ident, slot, len = bytes.len(), "persisted tile bytes");
                Ok(())
            }
            Err(e) => Err(SwapError::Write {
                ident,
                message: e.to_string(),
            }),
        }
    }

    fn read(&self, ident: u64, len: usize) -> Result<Bytes, SwapError> {
        let mut inner = self.inner.lock();
        let slot = *inner
            .slots
            .get(&ident)
            .ok_or(SwapError::MissingSlot { ident })?;

        let offset = slot * self.slot_size as u64;
        let mut bytes = vec![0; len];
        let result = inner
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| inner.file.read_exact(&mut bytes));

        match result {
            Ok(()) => {
                trace!(ident, slot, len, "restored tile bytes");
                Ok(Bytes::from(bytes))
            }
            Err(e) => Err(SwapError::Read {
                ident,
                message: e.to_string(),
            }),
        }
    }

    fn free(&self, ident: u64) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.remove(&ident) {
            inner.free.push(slot);
        }
    }
}

// =============================================================================
// MemStore
// =============================================================================

/// In-memory backing store.
pub struct MemStore {
    entries: Mutex<HashMap<u64, Bytes>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tile identities with persisted bytes.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemStore {
    fn write(&self, ident: u64, bytes: &[u8]) -> Result<(), SwapError> {
        self.entries
            .lock()
            .insert(ident, Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn read(&self, ident: u64, len: usize) -> Result<Bytes, SwapError> {
        let entries = self.entries.lock();
        let bytes = entries
            .get(&ident)
            .ok_or(SwapError::MissingSlot { ident })?;
        if bytes.len() != len {
            return Err(SwapError::Read {
                ident,
                message: format!("persisted {} bytes, expected {}", bytes.len(), len),
            });
        }
        Ok(bytes.clone())
    }

    fn free(&self, ident: u64) {
        self.entries.lock().remove(&ident);
    }
}

// =============================================================================
// Tests
// =============================================================================
