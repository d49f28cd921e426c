//! Error taxonomy for the OCR core
//!
//! Every variant except [`Cancelled`] is caught close to where it happens and
//! turned into an absent result so the fallback chain can take over.

use std::path::PathBuf;
use thiserror::Error;

/// Failure inside the OCR core
#[derive(Debug, Error)]
pub enum OcrError {
    /// Model or dictionary file absent from the asset store
    #[error("asset missing: {0}")]
    AssetMissing(String),

    /// Native runtime not present or backend disabled on this device
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Output tensor could not be decoded
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// Path traversal or untrusted model/runtime source
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// Cooperative cancellation
    #[error("cancelled")]
    Cancelled,

    /// Native runtime rejected a call
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl OcrError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this failure must disable the backend for the rest of the process
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation(_))
    }
}

impl From<Cancelled> for OcrError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// The only failure a pipeline invocation surfaces to its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("OCR pipeline cancelled")]
pub struct Cancelled;

pub type OcrResult<T> = std::result::Result<T, OcrError>;
