use thiserror::Error;

/// Errors raised by the swap backing store during eviction or fault-in
#[derive(Debug, Clone, Error)]
pub enum SwapError {
    /// Reading a tile's persisted bytes back from the store failed
    #[error("swap read failed for tile {ident}: {message}")]
    Read { ident: u64, message: String },

    /// Persisting a tile's bytes to the store failed
    #[error("swap write failed for tile {ident}: {message}")]
    Write { ident: u64, message: String },

    /// A fault-in was requested for a tile the store has never seen
    #[error("tile {ident} has no persisted bytes to restore")]
    MissingSlot { ident: u64 },

    /// A tile's bytes exceed the store's fixed slot size
    #[error("tile {ident} needs {required} bytes but swap slots hold {slot_size}")]
    SlotTooSmall {
        ident: u64,
        required: usize,
        slot_size: usize,
    },

    /// The store's backing file could not be created
    #[error("failed to create swap file: {0}")]
    Create(String),
}

/// Failure reported by a [`TileSource`](crate::manager::TileSource) while
/// materializing a tile's contents.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidateError {
    message: String,
}

impl ValidateError {
    /// Create a validation failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur when accessing tiled pixel storage
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Pixel coordinates fall outside the addressed geometry
    #[error("coordinates ({x}, {y}) outside image of {width}x{height} pixels")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// A linear tile index falls outside the tile grid
    #[error("tile index {index} outside grid of {tile_count} tiles")]
    IndexOutOfBounds { index: u32, tile_count: u32 },

    /// A pyramid level does not exist for this manager
    #[error("pyramid level {level} outside {level_count} levels")]
    LevelOutOfBounds { level: usize, level_count: usize },

    /// Illegal lock combination, e.g. a second concurrent write reference
    #[error("invalid tile access: {reason}")]
    InvalidAccess { reason: String },

    /// Source and destination tile shapes are incompatible
    #[error(
        "dimension mismatch: source is {src_width}x{src_height}x{src_bpp}, \
         destination is {dst_width}x{dst_height}x{dst_bpp}"
    )]
    DimensionMismatch {
        src_width: u32,
        src_height: u32,
        src_bpp: u32,
        dst_width: u32,
        dst_height: u32,
        dst_bpp: u32,
    },

    /// A caller-supplied flat buffer is too small for the requested rectangle
    #[error("pixel buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    /// The validate callback failed; the tile remains invalid
    #[error("validation failed for tile {index}: {source}")]
    Validation {
        index: u32,
        #[source]
        source: ValidateError,
    },

    /// Backing-store fault during eviction or fault-in
    #[error("swap error: {0}")]
    Swap(#[from] SwapError),
}
