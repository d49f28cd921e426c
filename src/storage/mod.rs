//! Storage Layer
//!
//! Platform directories and the model asset cache.

pub mod assets;

use anyhow::Result;
use std::path::PathBuf;

pub use assets::{AssetManifest, AssetStore, DirAssetStore, ModelAssetResolver};

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "inventoryocr", "InventoryOcr")
        .ok_or_else(|| anyhow::anyhow!("Could not determine project directories"))
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Get the writable directory model files are staged into
pub fn get_model_cache_dir() -> Result<PathBuf> {
    let cache_dir = project_dirs()?.cache_dir().join("models");
    std::fs::create_dir_all(&cache_dir)?;

    Ok(cache_dir)
}
