//! Inventory OCR - on-device text recognition for labels and documents
//!
//! Detection, recognition and table structure over interchangeable
//! inference backends, with a live backend-mode switch.

pub mod config;
pub mod storage;
pub mod vision;

pub use config::{BackendModeSetting, OcrConfig};
pub use vision::{BackendMode, Cancelled, OcrPipeline, PipelineOutput};
