use anyhow::Context;
use clap::Parser;
use image::ImageReader;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

use starseg::backend::RtenBackend;
use starseg::{DetectionOptions, ImageBufferSource, NucleusDetector};

#[derive(Parser)]
#[command(name = "starseg")]
#[command(about = "Detect nuclei and cells with a star-convex polygon network")]
struct Cli {
    /// Path to input image file
    #[arg(value_name = "IMAGE")]
    image_path: PathBuf,

    /// Trained network in .rten format
    #[arg(short, long, value_name = "FILE")]
    model: PathBuf,

    /// JSON file with detection options
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Probability threshold
    #[arg(long)]
    threshold: Option<f64>,

    /// Pixel size to detect at, in the units of --image-pixel-size
    #[arg(long)]
    pixel_size: Option<f64>,

    /// Calibrated size of one image pixel
    #[arg(long, default_value_t = 1.0)]
    image_pixel_size: f64,

    /// Tile width and height at the detection resolution
    #[arg(long)]
    tile_size: Option<usize>,

    /// Expand nuclei by this distance to estimate cells
    #[arg(long)]
    cell_expansion: Option<f64>,

    /// Write detected objects as JSON here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut options = match &args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("Failed to open config {:?}", path))?;
            serde_json::from_reader(file).with_context(|| format!("Failed to parse config {:?}", path))?
        }
        None => DetectionOptions::new(),
    };
    if let Some(threshold) = args.threshold {
        options = options.with_threshold(threshold);
    }
    if let Some(pixel_size) = args.pixel_size {
        options = options.with_pixel_size(pixel_size);
    }
    if let Some(size) = args.tile_size {
        options = options.with_tile_size(size, size);
    }
    if let Some(distance) = args.cell_expansion {
        options = options.with_cell_expansion(distance);
    }
    options = options.with_log_progress(args.verbose);

    info!("Loading image: {:?}", args.image_path);
    let img = ImageReader::open(&args.image_path)?
        .decode()
        .map_err(|e| anyhow::anyhow!("Failed to decode image: {}", e))?;
    info!("Image loaded: {}x{}", img.width(), img.height());
    let source = ImageBufferSource::from_image(&img).with_pixel_size(args.image_pixel_size);

    let backend = RtenBackend::load(&args.model)?;
    let mut detector = NucleusDetector::new(backend, options)?;
    let objects = detector.detect(&source, None, None)?;
    detector.close()?;

    let json = serde_json::to_string_pretty(&objects)?;
    match &args.output {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            writer.write_all(json.as_bytes())?;
            writer.flush()?;
            info!("Wrote {} objects to {:?}", objects.len(), path);
        }
        None => println!("{}", json),
    }

    Ok(())
}
