//! Copy-on-write pixel buffers.
//!
//! Tiles mapped between managers share one buffer until either side acquires
//! write access, at which point the writer clones the bytes down to a private
//! copy. The share count is the `Arc` strong count; outstanding read guards
//! count as shares, so a writer never mutates bytes a reader is looking at.

use std::sync::Arc;

use parking_lot::RwLock;

/// Owned read guard over a buffer's bytes; keeps the buffer alive.
pub(crate) type OwnedReadGuard = parking_lot::ArcRwLockReadGuard<parking_lot::RawRwLock, Vec<u8>>;

/// Owned write guard over a buffer's bytes; keeps the buffer alive.
pub(crate) type OwnedWriteGuard = parking_lot::ArcRwLockWriteGuard<parking_lot::RawRwLock, Vec<u8>>;

/// Pixel storage shared between tiles until one of them writes.
#[derive(Clone)]
pub(crate) struct SharedBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl SharedBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    /// Number of handles (tile slots plus live guards) sharing these bytes.
    pub fn share_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }

    pub fn read_owned(&self) -> OwnedReadGuard {
        self.bytes.read_arc()
    }

    /// Non-blocking read lock; `None` while a writer holds the bytes.
    pub fn try_read_owned(&self) -> Option<OwnedReadGuard> {
        self.bytes.try_read_arc()
    }

    pub fn write_owned(&self) -> OwnedWriteGuard {
        self.bytes.write_arc()
    }

    /// Resolve copy-on-write: if the bytes are shared, replace this handle
    /// with a private copy. Returns whether a copy was made.
    pub fn make_unique(&mut self) -> bool {
        if Arc::strong_count(&self.bytes) > 1 {
            let copy = self.bytes.read().clone();
            self.bytes = Arc::new(RwLock::new(copy));
            true
        } else {
            false
        }
    }
}
