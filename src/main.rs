//! Inventory OCR - recognize text in one label or document photo
//!
//! Runs a single pipeline invocation and prints the result as JSON.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inventory_ocr::config::{self, BackendModeSetting, OcrConfig};
use inventory_ocr::storage;
use inventory_ocr::vision::{BackendMode, OcrPipeline};

/// Inventory OCR - on-device text recognition for labels and documents
#[derive(Parser, Debug)]
#[command(name = "inventory-ocr")]
#[command(about = "Recognize text, groups and table cells in a still image")]
struct Args {
    /// Image file to recognize
    image: PathBuf,

    /// Configuration file (defaults to config.toml in the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend mode: auto, onnx, rten or onnx_accelerated
    #[arg(short, long)]
    mode: Option<BackendMode>,

    /// Directory holding the model and dictionary bundle
    #[arg(short, long)]
    assets: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::get_config_dir()?.join("config.toml"),
    };
    let mut config = load_or_default(&config_path, args.config.is_some())?;
    if let Some(mode) = args.mode {
        config.backend.mode = mode;
    }
    if let Some(assets) = &args.assets {
        config.models.asset_root = assets.clone();
    }
    if args.save_config {
        config::save_config(&config, &config_path)?;
        info!("Saved configuration to {:?}", config_path);
    }

    let mode = BackendModeSetting::new(config.backend.mode);
    let pipeline = Arc::new(OcrPipeline::from_config(&config, mode.subscribe())?);
    if !pipeline.switcher().is_available() {
        warn!(
            "No inference backend available for mode {}; check {:?}",
            mode.get(),
            config.models.asset_root
        );
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let output = match pipeline.run_async(args.image.clone(), cancel).await {
        Ok(output) => output,
        Err(cancelled) => bail!("{}", cancelled),
    };

    let json = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", json);

    Ok(())
}

/// Load configuration, falling back to defaults unless the file was requested explicitly
fn load_or_default(path: &Path, required: bool) -> Result<OcrConfig> {
    if path.exists() {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }
    if required {
        bail!("Configuration file {:?} not found", path);
    }
    info!("Using default configuration");
    Ok(OcrConfig::default())
}
