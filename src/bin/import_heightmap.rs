//! Heightmap import tool: builds a landscape and writes it to a world snapshot.
//!
//! Usage: cargo run --release --bin import_heightmap -- [OPTIONS]
//!
//! Options:
//!   --params <FILE>     JSON import parameters (config, heightmap, noise, normalize)
//!   --heightmap <PNG>   16-bit grayscale heightmap, overrides the params file
//!   --layout <N>        Blocks per side when synthesizing from noise (default: 8)
//!   --seed <SEED>       Noise seed
//!   --exaggerate <F>    Multiply every sample after loading
//!   --out <FILE>        Snapshot to write (default: "landscape.db")

use std::path::{Path, PathBuf};
use std::time::Instant;

use rkterra::core::{Error, Result};
use rkterra::landscape::{ImportParams, Landscape};
use rkterra::math::Size;
use rkterra::persistence::MemoryDatabase;
use rkterra::render::CommandRecorder;
use rkterra::terrain::{HeightField, HeightFieldGenerator};

fn main() {
    rkterra::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        log::error!("Import failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let mut params = match parse_str_arg(args, "--params") {
        Some(path) => ImportParams::from_json_file(Path::new(&path))?,
        None => ImportParams::default(),
    };
    if let Some(path) = parse_str_arg(args, "--heightmap") {
        params.heightmap = Some(PathBuf::from(path));
    }
    if let Some(seed) = parse_u32_arg(args, "--seed") {
        params.noise.seed = seed;
    }
    let layout = parse_u32_arg(args, "--layout").unwrap_or(8);
    let out = parse_str_arg(args, "--out").unwrap_or_else(|| "landscape.db".to_string());

    let start = Instant::now();
    let mut field = match &params.heightmap {
        Some(path) => {
            log::info!("Reading heightmap {}", path.display());
            HeightField::from_png16(path)?
        }
        None => {
            let size = params.config.field_size(Size::new(layout, layout));
            log::info!("Synthesizing {}x{} height field (seed {})", size.width, size.height, params.noise.seed);
            HeightFieldGenerator::new(params.noise.clone()).generate(size)?
        }
    };
    if let Some((min, max)) = params.normalize {
        field.normalize(min, max);
    }
    if let Some(factor) = parse_f32_arg(args, "--exaggerate") {
        field.scale(factor);
    }
    let (lo, hi) = field.min_max();
    log::info!("Height field ready: {}x{}, samples {}..{}", field.width(), field.height(), lo, hi);

    // Import against a recording driver; only the database output is kept
    let mut recorder = CommandRecorder::new();
    let mut db = MemoryDatabase::new();
    let mut landscape = Landscape::import(field, params.config, &mut recorder, Some(&mut db))?;
    let layout = landscape.layout();
    let id = landscape.db_id();
    landscape.release(&mut recorder);

    if db.block_count() == 0 {
        return Err(Error::Degenerate("no blocks were stored".into()));
    }
    db.save(Path::new(&out))?;
    log::info!(
        "Wrote landscape {} ({}x{} blocks) to {} in {:.2}s",
        id,
        layout.width,
        layout.height,
        out,
        start.elapsed().as_secs_f32()
    );
    Ok(())
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
