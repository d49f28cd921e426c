//! OCR Configuration
//!
//! Settings stored in TOML format, plus the live backend-mode setting the
//! pipeline observes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

use crate::vision::backend::BackendMode;
use crate::vision::detection::DetectionParams;
use crate::vision::ocr_preprocess::EnhanceSettings;

/// OCR settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Backend selection
    pub backend: BackendConfig,
    /// Model locations
    pub models: ModelsConfig,
    /// Detection-map decoding
    pub detection: DetectionConfig,
    /// Pipeline behavior
    pub pipeline: PipelineConfig,
}

/// Backend selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// auto, onnx, rten or onnx_accelerated
    pub mode: BackendMode,
}

/// Model locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Read-only bundle of models and dictionaries
    pub asset_root: PathBuf,
    /// Writable staging directory; platform cache dir when unset
    pub cache_dir: Option<PathBuf>,
    /// Directories an `ORT_DYLIB_PATH` library may be loaded from
    pub trusted_runtime_dirs: Vec<PathBuf>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("assets"),
            cache_dir: None,
            trusted_runtime_dirs: Vec::new(),
        }
    }
}

impl ModelsConfig {
    /// Configured cache dir, or the platform cache dir
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::get_model_cache_dir(),
        }
    }
}

/// Detection-map decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Text probability threshold
    pub threshold: f32,
    /// Minimum component size in map pixels
    pub min_area: usize,
    /// Table cell probability threshold
    pub cell_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            min_area: 16,
            cell_threshold: 0.5,
        }
    }
}

impl DetectionConfig {
    pub fn text_params(&self) -> DetectionParams {
        DetectionParams {
            threshold: self.threshold,
            min_area: self.min_area,
        }
    }

    pub fn cell_params(&self) -> DetectionParams {
        DetectionParams {
            threshold: self.cell_threshold,
            min_area: self.min_area,
        }
    }
}

/// Pipeline behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Longest side of the working image
    pub max_side: u32,
    /// Recognitions below this confidence are dropped
    pub recognition_threshold: f32,
    /// Stage classifications below this score are ignored
    pub orientation_min_confidence: f32,
    /// Contrast factor for document enhancement
    pub enhance_contrast: f32,
    /// Sharpen strength for document enhancement
    pub enhance_sharpen: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_side: 1600,
            recognition_threshold: 0.3,
            orientation_min_confidence: 0.6,
            enhance_contrast: 1.3,
            enhance_sharpen: 0.4,
        }
    }
}

impl PipelineConfig {
    pub fn enhance_settings(&self) -> EnhanceSettings {
        EnhanceSettings {
            contrast: self.enhance_contrast,
            sharpen: self.enhance_sharpen,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<OcrConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: OcrConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &OcrConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Observable backend mode owned by the application
#[derive(Debug)]
pub struct BackendModeSetting {
    sender: watch::Sender<BackendMode>,
}

impl BackendModeSetting {
    pub fn new(mode: BackendMode) -> Self {
        let (sender, _receiver) = watch::channel(mode);
        Self { sender }
    }

    pub fn get(&self) -> BackendMode {
        *self.sender.borrow()
    }

    /// Change the mode; returns whether it differed
    pub fn set(&self, mode: BackendMode) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
        if changed {
            info!("Backend mode set to {}", mode);
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendMode> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_ocr_config() {
        let config = OcrConfig::default();

        assert_eq!(config.backend.mode, BackendMode::Auto);
        assert_eq!(config.models.asset_root, PathBuf::from("assets"));
        assert!(config.models.cache_dir.is_none());
        assert!(config.models.trusted_runtime_dirs.is_empty());

        assert!((config.detection.threshold - 0.3).abs() < 0.001);
        assert_eq!(config.detection.min_area, 16);
        assert!((config.detection.cell_threshold - 0.5).abs() < 0.001);

        assert_eq!(config.pipeline.max_side, 1600);
        assert!((config.pipeline.recognition_threshold - 0.3).abs() < 0.001);
        assert!((config.pipeline.orientation_min_confidence - 0.6).abs() < 0.001);
    }

    #[test]
    fn test_config_with_custom_values() {
        let mut config = OcrConfig::default();
        config.backend.mode = BackendMode::OnnxAccelerated;
        config.models.cache_dir = Some(PathBuf::from("/tmp/models"));
        config.pipeline.max_side = 1024;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("mode = \"onnx_accelerated\""));

        let parsed: OcrConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_sections_take_defaults() {
        let parsed: OcrConfig = toml::from_str("[backend]\nmode = \"rten\"\n").unwrap();
        assert_eq!(parsed.backend.mode, BackendMode::Rten);
        assert_eq!(parsed.pipeline, PipelineConfig::default());

        let parsed: OcrConfig = toml::from_str("[pipeline]\nmax_side = 800\n").unwrap();
        assert_eq!(parsed.pipeline.max_side, 800);
        assert!((parsed.pipeline.enhance_contrast - 1.3).abs() < 0.001);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = OcrConfig::default();
        config.detection.threshold = 0.45;
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result: Result<OcrConfig, _> = toml::from_str("[backend]\nmode = \"tflite\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_backend_mode_setting_notifies() {
        let setting = BackendModeSetting::new(BackendMode::Auto);
        let mut receiver = setting.subscribe();

        assert!(!setting.set(BackendMode::Auto));
        assert!(!receiver.has_changed().unwrap());

        assert!(setting.set(BackendMode::Onnx));
        assert!(receiver.has_changed().unwrap());
        assert_eq!(*receiver.borrow_and_update(), BackendMode::Onnx);
        assert_eq!(setting.get(), BackendMode::Onnx);
    }

    #[test]
    fn test_detection_params() {
        let config = DetectionConfig::default();
        assert!((config.text_params().threshold - 0.3).abs() < 0.001);
        assert!((config.cell_params().threshold - 0.5).abs() < 0.001);
        assert_eq!(config.cell_params().min_area, 16);
    }
}
