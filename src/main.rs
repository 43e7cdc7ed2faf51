//! tilestore - diagnostic CLI over the tiled pixel storage engine.
//!
//! `info` prints pyramid geometry; `bench` drives a synthetic workload
//! through the cache and reports swap statistics.

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilestore::{
    process_parallel, source_fn, BenchConfig, Cli, Command, FileStore, InfoConfig, TileCache,
    TileManager, TILE_HEIGHT, TILE_WIDTH,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Info(config) => run_info(config),
        Command::Bench(config) => run_bench(config),
    }
}

// =============================================================================
// Info Command
// =============================================================================

fn run_info(config: InfoConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {e}");
        return ExitCode::FAILURE;
    }

    // Tiles allocate lazily, so a throwaway cache costs nothing here.
    let cache = TileCache::in_memory(1);
    let manager = TileManager::new(&cache, config.width, config.height, config.bpp);

    println!("tilestore geometry");
    println!("══════════════════");
    println!();
    println!(
        "Image: {}x{} pixels, {} bytes/pixel, {}x{} tiles",
        config.width, config.height, config.bpp, TILE_WIDTH, TILE_HEIGHT
    );
    println!("Pyramid levels: {}", manager.level_count());
    println!();

    let mut total_tiles = 0u64;
    let mut total_bytes = 0u64;
    for level in 0..manager.level_count() {
        let info = manager
            .level_info(level)
            .expect("level index from level_count");
        let bytes = info.width as u64 * info.height as u64 * config.bpp as u64;
        total_tiles += info.tile_count as u64;
        total_bytes += bytes;
        println!(
            "  level {:2}: {:>7}x{:<7} grid {:>3}x{:<3} ({} tiles, {} bytes)",
            level, info.width, info.height, info.tiles_x, info.tiles_y, info.tile_count, bytes
        );
    }

    println!();
    println!("Total: {total_tiles} tiles, {total_bytes} bytes fully resident");
    ExitCode::SUCCESS
}

// =============================================================================
// Bench Command
// =============================================================================

fn run_bench(config: BenchConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let budget = config
        .budget_bytes()
        .expect("budget validated by config.validate");

    let cache = match build_cache(&config, budget) {
        Ok(cache) => cache,
        Err(e) => {
            error!("Failed to create cache: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  image: {}x{}x{}", config.width, config.height, config.bpp);
    info!("  cache budget: {} bytes", budget);
    info!(
        "  swap: {}",
        if config.in_memory { "memory" } else { "temp file" }
    );
    info!("  passes: {}", config.passes);

    let manager = TileManager::new(&cache, config.width, config.height, config.bpp);

    // Tiles materialize with a recognizable per-tile byte on first access.
    manager.set_validate_source(Some(source_fn(|_, index, fill| {
        fill.fill((index % 251) as u8);
        Ok(())
    })));

    let start = Instant::now();
    for pass in 0..config.passes {
        if let Err(e) = run_pass(&manager, &config, pass) {
            error!("Bench pass {} failed: {}", pass, e);
            return ExitCode::FAILURE;
        }
        info!(
            "  pass {} done: resident {} bytes across {} tiles",
            pass,
            cache.stats().resident_bytes,
            cache.stats().resident_tiles
        );
    }
    let elapsed = start.elapsed();

    let stats = cache.stats();
    info!("");
    info!("Results after {:?}:", elapsed);
    info!("  resident: {} bytes / {} tiles", stats.resident_bytes, stats.resident_tiles);
    info!("  evictions: {}", stats.evictions);
    info!("  swap outs: {}", stats.swap_outs);
    info!("  swap ins: {}", stats.swap_ins);
    info!("  swap write failures: {}", stats.swap_write_failures);
    info!("  manager memory: {} bytes", manager.mem_size());

    if stats.resident_bytes > cache.budget() {
        error!(
            "cache finished over budget: {} > {}",
            stats.resident_bytes,
            cache.budget()
        );
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// One bench pass: parallel pattern write over the whole image, then a
/// scattered single-pixel readback to force faults on swapped tiles.
fn run_pass(
    manager: &TileManager,
    config: &BenchConfig,
    pass: u32,
) -> Result<(), tilestore::TileError> {
    let salt = pass as u8;
    process_parallel(
        manager,
        0,
        0,
        config.width,
        config.height,
        true,
        move |span| {
            for row in 0..span.height() {
                let y = span.y() + row;
                span.row_mut(row)
                    .iter_mut()
                    .enumerate()
                    .for_each(|(i, byte)| {
                        *byte = (i as u32 ^ y) as u8 ^ salt;
                    });
            }
            Ok(())
        },
    )?;

    // Deterministic pseudo-random probe sequence.
    let mut state = 0x2545F491u32.wrapping_add(pass);
    let mut pixel = vec![0u8; config.bpp as usize];
    for _ in 0..1024 {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        let x = state % config.width;
        let y = (state >> 16) % config.height;
        manager.read_pixel(x, y, &mut pixel)?;
    }
    Ok(())
}

fn build_cache(config: &BenchConfig, budget: usize) -> Result<TileCache, tilestore::SwapError> {
    if config.in_memory {
        return Ok(TileCache::in_memory(budget));
    }
    match &config.swap_dir {
        Some(dir) => Ok(TileCache::with_store(budget, Box::new(FileStore::in_dir(dir)?))),
        None => TileCache::new(budget),
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tilestore=debug"
    } else {
        "tilestore=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
