//! Vision/OCR Layer
//!
//! Turns a still image of an inventory label or document into structured
//! text. Supports multiple inference backends behind one trait:
//! - ONNX Runtime on CPU
//! - ONNX Runtime with the platform accelerator
//! - RTen, a pure Rust runtime

pub mod backend;
pub mod cache;
pub mod ctc;
pub mod detection;
pub mod dictionary;
pub mod error;
pub mod frame;
pub mod models;
pub mod ocr_preprocess;
pub mod pipeline;
pub mod preprocess;
pub mod segment;
pub mod stages;
pub mod table;
pub mod types;

pub use backend::switcher::BackendSwitcher;
pub use backend::{BackendKind, BackendMode, OcrBackend};
pub use error::{Cancelled, OcrError, OcrResult};
pub use pipeline::{OcrPipeline, PipelineSettings};
pub use types::{
    BoundingBox, Group, ImageMeta, Layout, PipelineOutput, Recognition, Scene, TableCell, Token,
};
