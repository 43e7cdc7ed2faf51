//! Configuration for the tilestore CLI.
//!
//! The binary is a diagnostic harness over the storage engine: `info` prints
//! pyramid and grid geometry for an image size, `bench` runs a synthetic
//! tile churn workload against a configured cache budget.
//!
//! # Environment Variables
//!
//! Options can also be set via environment variables with the `TILESTORE_`
//! prefix:
//!
//! - `TILESTORE_WIDTH` / `TILESTORE_HEIGHT` - image dimensions in pixels
//! - `TILESTORE_BPP` - bytes per pixel (default: 4)
//! - `TILESTORE_CACHE_BUDGET` - resident-byte budget, e.g. "64MB"
//! - `TILESTORE_SWAP_DIR` - directory for the swap file

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// =============================================================================
// Default Values
// =============================================================================

/// Default resident-byte budget for the bench cache.
pub const DEFAULT_CACHE_BUDGET: &str = "64MB";

/// Default bytes per pixel (RGBA).
pub const DEFAULT_BPP: u32 = 4;

/// Default number of bench passes over the image.
pub const DEFAULT_PASSES: u32 = 3;

// =============================================================================
// CLI
// =============================================================================

/// tilestore - a tiled pixel storage engine.
///
/// Manages fixed-size image tiles with on-demand validation, read/write
/// reference counting, and LRU disk swap.
#[derive(Parser, Debug)]
#[command(name = "tilestore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print pyramid and tile grid geometry for an image size.
    Info(InfoConfig),

    /// Run a synthetic tile churn workload and report cache statistics.
    Bench(BenchConfig),
}

// =============================================================================
// Info Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Image width in pixels.
    #[arg(long, env = "TILESTORE_WIDTH")]
    pub width: u32,

    /// Image height in pixels.
    #[arg(long, env = "TILESTORE_HEIGHT")]
    pub height: u32,

    /// Bytes per pixel.
    #[arg(long, default_value_t = DEFAULT_BPP, env = "TILESTORE_BPP")]
    pub bpp: u32,
}

impl InfoConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        validate_geometry(self.width, self.height, self.bpp)
    }
}

// =============================================================================
// Bench Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct BenchConfig {
    /// Image width in pixels.
    #[arg(long, default_value_t = 4096, env = "TILESTORE_WIDTH")]
    pub width: u32,

    /// Image height in pixels.
    #[arg(long, default_value_t = 4096, env = "TILESTORE_HEIGHT")]
    pub height: u32,

    /// Bytes per pixel.
    #[arg(long, default_value_t = DEFAULT_BPP, env = "TILESTORE_BPP")]
    pub bpp: u32,

    /// Resident-byte budget for the tile cache (e.g. "64MB", "1GB").
    #[arg(long, default_value = DEFAULT_CACHE_BUDGET, env = "TILESTORE_CACHE_BUDGET")]
    pub cache_budget: String,

    /// Number of full-image write/read passes.
    #[arg(long, default_value_t = DEFAULT_PASSES)]
    pub passes: u32,

    /// Directory for the swap file (defaults to the system temp dir).
    #[arg(long, env = "TILESTORE_SWAP_DIR")]
    pub swap_dir: Option<PathBuf>,

    /// Swap to memory instead of a temp file.
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl BenchConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        validate_geometry(self.width, self.height, self.bpp)?;

        if self.bpp > 4 {
            return Err("bpp must be between 1 and 4 for the default swap slot size".to_string());
        }
        if self.passes == 0 {
            return Err("passes must be greater than 0".to_string());
        }

        let budget = self.budget_bytes()?;
        if budget == 0 {
            return Err("cache_budget must be greater than 0".to_string());
        }
        Ok(())
    }

    /// The cache budget parsed to bytes.
    pub fn budget_bytes(&self) -> Result<usize, String> {
        parse_size(&self.cache_budget)
    }
}

fn validate_geometry(width: u32, height: u32, bpp: u32) -> Result<(), String> {
    if width == 0 || height == 0 {
        return Err("image dimensions must be greater than 0".to_string());
    }
    if bpp == 0 {
        return Err("bpp must be greater than 0".to_string());
    }
    Ok(())
}

// =============================================================================
// Size Parsing
// =============================================================================

/// Parse a human-readable byte size: "1024", "256KB", "64MB", "2GB".
pub fn parse_size(input: &str) -> Result<usize, String> {
    let trimmed = input.trim().to_ascii_uppercase();
    if trimmed.is_empty() {
        return Err("size must not be empty".to_string());
    }

    let (number, multiplier) = if let Some(stripped) = trimmed.strip_suffix("GB") {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = trimmed.strip_suffix("MB") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = trimmed.strip_suffix("KB") {
        (stripped, 1024)
    } else if let Some(stripped) = trimmed.strip_suffix('B') {
        (stripped, 1)
    } else {
        (trimmed.as_str(), 1)
    };

    let value: usize = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {input}"))?;
    Ok(value * multiplier)
}

// =============================================================================
// Tests
// =============================================================================
