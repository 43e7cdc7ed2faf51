//! # tilestore
//!
//! A tiled pixel storage engine for raster image editors.
//!
//! An image's pixel data is represented as a paged grid of fixed-size tiles,
//! each independently swappable to disk, reference-counted, lockable for
//! read/write, and lazily validated on first access. Bulk work goes through
//! rectangular pixel regions that pull tiles through the manager one at a
//! time.
//!
//! ## Features
//!
//! - **Fixed-size tiling**: 64×64 tiles with smaller edge tiles; pixel
//!   coordinates map to tiles without touching pixel memory
//! - **On-demand validation**: a [`TileSource`] callback materializes a
//!   tile's contents the first time it is read or written
//! - **Reference counting**: concurrent readers, a single writer, and a
//!   cache that never evicts a referenced tile
//! - **LRU disk swap**: a process-wide resident-byte budget; cold dirty
//!   tiles persist to a [`BackingStore`] and fault back in on demand
//! - **Pyramid levels**: power-of-two reductions materialized by box
//!   averaging, for fast mipmap-style reads
//! - **Pixel regions**: rectangle iterators yielding contiguous spans, with
//!   lockstep multi-region processing and a rayon-parallel chunk variant
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`tile`] - the tile itself: buffer, lock discipline, guards
//! - [`cache`] - the shared swapper: budget, LRU, backing stores
//! - [`manager`] - the tile manager: grids, validation, bulk pixel I/O
//! - [`region`] - pixel regions and lockstep/parallel processing
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```
//! use tilestore::{source_fn, TileAccess, TileCache, TileManager};
//!
//! // One cache per process; managers share its budget.
//! let cache = TileCache::in_memory(32 * 1024 * 1024);
//! let manager = TileManager::new(&cache, 257, 130, 3);
//!
//! // Materialize tiles with a constant on first access.
//! manager.set_validate_source(Some(source_fn(|_, _, fill| {
//!     fill.fill(0x7F);
//!     Ok(())
//! })));
//!
//! let tile = manager.get_tile(100, 100, TileAccess::Read).unwrap();
//! assert_eq!(tile.data()[0], 0x7F);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod region;
pub mod tile;

// Re-export commonly used types
pub use cache::{
    BackingStore, CacheStats, FileStore, MemStore, TileCache, DEFAULT_CACHE_BUDGET,
    DEFAULT_SLOT_SIZE,
};
pub use config::{parse_size, BenchConfig, Cli, Command, InfoConfig};
pub use error::{SwapError, TileError, ValidateError};
pub use manager::{source_fn, LevelInfo, PixelData, TileFill, TileIndex, TileManager, TileSource};
pub use region::{process, process_parallel, tile_chunks, PixelRegion, Rect, Span, SpanIter};
pub use tile::{Tile, TileAccess, TileGuard, TILE_HEIGHT, TILE_WIDTH};
