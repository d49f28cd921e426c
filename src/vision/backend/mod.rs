//! Inference backends
//!
//! Each backend binds one native runtime behind the same capability
//! interface. Every call answers `None` instead of failing so the
//! [`switcher::BackendSwitcher`] can move on to the next backend.

pub mod onnx;
pub mod rten;
pub mod switcher;

#[cfg(test)]
pub(crate) mod fake;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::detection::DetectionParams;
use super::dictionary::DictionaryCache;
use super::error::{OcrError, OcrResult};
use super::types::{BoundingBox, Recognition, Scene};
use crate::storage::ModelAssetResolver;

pub use onnx::OnnxBackend;
pub use rten::RtenBackend;
pub use switcher::BackendSwitcher;

/// Concrete inference engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// ONNX Runtime on the CPU
    Onnx,
    /// RTen, the pure Rust runtime
    Rten,
    /// ONNX Runtime with a platform accelerator
    OnnxAccelerated,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Onnx => "onnx",
            BackendKind::Rten => "rten",
            BackendKind::OnnxAccelerated => "onnx_accelerated",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-selected backend preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    #[default]
    Auto,
    Onnx,
    Rten,
    OnnxAccelerated,
}

impl BackendMode {
    /// Backend named by this mode, if any
    pub fn preferred(self) -> Option<BackendKind> {
        match self {
            BackendMode::Auto => None,
            BackendMode::Onnx => Some(BackendKind::Onnx),
            BackendMode::Rten => Some(BackendKind::Rten),
            BackendMode::OnnxAccelerated => Some(BackendKind::OnnxAccelerated),
        }
    }

    /// Backends tried after the preferred one
    pub fn fallback_order(self) -> &'static [BackendKind] {
        match self {
            BackendMode::Auto => &[BackendKind::Onnx, BackendKind::Rten],
            BackendMode::Onnx => &[BackendKind::Rten],
            BackendMode::Rten => &[BackendKind::Onnx],
            BackendMode::OnnxAccelerated => &[BackendKind::Onnx],
        }
    }

    /// Full query order: preferred first, then the fallbacks
    pub fn query_order(self) -> Vec<BackendKind> {
        self.preferred()
            .into_iter()
            .chain(self.fallback_order().iter().copied())
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Auto => "auto",
            BackendMode::Onnx => "onnx",
            BackendMode::Rten => "rten",
            BackendMode::OnnxAccelerated => "onnx_accelerated",
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendMode::Auto),
            "onnx" => Ok(BackendMode::Onnx),
            "rten" => Ok(BackendMode::Rten),
            "onnx_accelerated" | "onnx-accelerated" => Ok(BackendMode::OnnxAccelerated),
            other => Err(format!(
                "unknown backend mode '{}' (expected auto, onnx, rten or onnx_accelerated)",
                other
            )),
        }
    }
}

/// Common OCR capability interface
pub trait OcrBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runtime present, not disabled, and required models bundled
    fn is_available(&self) -> bool;

    /// Text boxes in the frame of `image`
    fn detect(&self, scene: Scene, image: &RgbImage) -> Option<Vec<BoundingBox>>;

    /// Recognize a single line (or whole image) of text
    fn infer(&self, scene: Scene, image: &RgbImage) -> Option<Recognition>;

    /// Table cell boxes in the frame of `image`
    fn detect_cells(&self, _image: &RgbImage) -> Option<Vec<BoundingBox>> {
        None
    }

    /// Drop every cached compiled session
    fn invalidate_sessions(&self) {}
}

/// Collaborators shared by all backends of one pipeline
pub struct BackendContext {
    pub resolver: Arc<ModelAssetResolver>,
    pub dictionaries: Arc<DictionaryCache>,
    pub detection: DetectionParams,
    pub cell_detection: DetectionParams,
    /// Allowed locations for a dynamically loaded ONNX Runtime library
    pub trusted_runtime_dirs: Vec<PathBuf>,
}

impl BackendContext {
    pub fn new(resolver: Arc<ModelAssetResolver>) -> Self {
        Self {
            resolver,
            dictionaries: Arc::new(DictionaryCache::new("dictionary")),
            detection: DetectionParams::default(),
            cell_detection: DetectionParams {
                threshold: 0.5,
                ..DetectionParams::default()
            },
            trusted_runtime_dirs: Vec::new(),
        }
    }

    /// Whether every asset in `assets` is bundled
    pub fn assets_present<'a>(&self, assets: impl IntoIterator<Item = &'a str>) -> bool {
        assets.into_iter().all(|asset| self.resolver.is_present(asset))
    }
}

/// Tracks whether a backend has been disabled by a security violation
#[derive(Debug, Default)]
pub struct BackendHealth {
    poisoned: AtomicBool,
}

impl BackendHealth {
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn poison(&self, kind: BackendKind, reason: &OcrError) {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            error!("Disabling {} backend for this process: {}", kind, reason);
        }
    }

    /// Turn a call result into an optional value, logging the failure.
    ///
    /// Security violations poison the backend.
    pub fn settle<T>(&self, kind: BackendKind, operation: &str, result: OcrResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) if e.is_security_violation() => {
                self.poison(kind, &e);
                None
            }
            Err(OcrError::AssetMissing(asset)) => {
                debug!("{} {}: asset {} missing", kind, operation, asset);
                None
            }
            Err(e) => {
                warn!("{} {} failed: {}", kind, operation, e);
                None
            }
        }
    }
}
