use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use vessel_proximity_rust_lib::config::AnalysisConfig;
use vessel_proximity_rust_lib::image_io::discover_images;
use vessel_proximity_rust_lib::pipeline::process_image;

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Vessel network and cell proximity analysis for 3D microscopy stacks")]
struct Args {
    /// Directory holding one sub-directory per image
    #[clap(short, long)]
    input: Option<String>,

    /// Directory receiving the result tables and composites
    #[clap(short, long)]
    output: Option<String>,

    /// Path to configuration file
    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Verbose logging (RUST_LOG takes precedence)
    #[clap(short, long)]
    debug: bool,

    /// Write a default configuration to the --config path and exit
    #[clap(long)]
    write_default_config: bool,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    if args.write_default_config {
        AnalysisConfig::default()
            .save_to_file(&args.config)
            .with_context(|| format!("writing default configuration to {}", args.config))?;
        info!("Default configuration written to {}", args.config);
        return Ok(());
    }

    let mut config = AnalysisConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;

    // Command-line paths override the configuration file
    if let Some(input) = args.input {
        config.input_path = input;
    }
    if let Some(output) = args.output {
        config.output_base_dir = output;
    }

    config.validate().context("invalid configuration")?;

    let start_time = Instant::now();

    let output_base = PathBuf::from(&config.output_base_dir);
    fs::create_dir_all(&output_base)
        .with_context(|| format!("creating output directory {}", output_base.display()))?;

    let images = discover_images(&config.input_path)
        .with_context(|| format!("reading input directory {}", config.input_path))?;
    if images.is_empty() {
        warn!("No image directories found in {}", config.input_path);
    }
    info!("Found {} image(s) in {}", images.len(), config.input_path);

    let mut failed = 0usize;
    for entry in &images {
        let image_start = Instant::now();
        match process_image(entry, &config) {
            Ok(results) => info!(
                "{}: {} ROI(s), {} cells in {:.2} s",
                entry.name,
                results.global_records().len(),
                results.cell_records().len(),
                image_start.elapsed().as_secs_f64()
            ),
            Err(e) => {
                failed += 1;
                error!("Failed to process {}: {}", entry.name, e);
            }
        }
    }

    info!(
        "Processed {}/{} image(s) in {:.2} seconds",
        images.len() - failed,
        images.len(),
        start_time.elapsed().as_secs_f64()
    );

    Ok(())
}
