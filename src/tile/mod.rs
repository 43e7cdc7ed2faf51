//! Tile primitives.
//!
//! A tile is a fixed-maximum-size rectangular block of a tiled image's pixel
//! data. Tiles track a validity flag, a dirty flag, and a reference count
//! split into concurrent read references and a single write reference. Their
//! pixel bytes live in a copy-on-write [`SharedBuffer`](buffer) so that
//! tiles mapped between managers can alias one allocation until either side
//! writes.
//!
//! # Components
//!
//! - [`Tile`]: the block itself, with lock discipline and swap state
//! - [`TileGuard`]: RAII reference returned by the manager's `get_tile`
//!   family; releases on drop, marking write accesses dirty
//! - [`TileAccess`]: requested lock mode (`Read` or `Write`)
//! - [`TILE_WIDTH`] / [`TILE_HEIGHT`]: the nominal tile dimensions

mod buffer;
mod block;

pub(crate) use buffer::SharedBuffer;
pub(crate) use block::{TileState, Validity};

pub use block::{Tile, TileAccess, TileGuard, TILE_HEIGHT, TILE_WIDTH};
