//! Model catalog and ONNX Runtime sessions
//!
//! Describes which bundled files each backend needs and wraps a compiled
//! ONNX Runtime session behind a lock so it can be shared across calls.

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::error::{OcrError, OcrResult};
use super::preprocess::{InputTensor, Normalization};
use super::types::Scene;

/// Files and input geometry for one detector + recognizer pairing
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    /// Detection model asset path
    pub detector: String,
    /// Recognition model asset path
    pub recognizer: String,
    /// Optional text direction classifier
    pub classifier: Option<String>,
    /// Character dictionary asset path
    pub dictionary: String,
    pub use_space_char: bool,
    /// Recognition input height
    pub rec_height: u32,
    /// Recognition input width (content is right-padded)
    pub rec_width: u32,
    /// Detector input size (width, height)
    pub det_size: (u32, u32),
    /// Optional table cell detection model
    pub cells: Option<String>,
}

impl ModelSpec {
    /// PP-OCR mobile models for ONNX Runtime
    pub fn onnx_standard() -> Self {
        Self {
            name: "onnx-standard".to_string(),
            detector: "onnx/det.onnx".to_string(),
            recognizer: "onnx/rec.onnx".to_string(),
            classifier: Some("onnx/cls.onnx".to_string()),
            dictionary: "dict/ppocr_keys.txt".to_string(),
            use_space_char: true,
            rec_height: 48,
            rec_width: 320,
            det_size: (960, 960),
            cells: Some("onnx/table_cell_det.onnx".to_string()),
        }
    }

    /// Server models, slower but more accurate on dense documents
    pub fn onnx_document() -> Self {
        Self {
            name: "onnx-document".to_string(),
            detector: "onnx/det_server.onnx".to_string(),
            recognizer: "onnx/rec_server.onnx".to_string(),
            rec_width: 480,
            ..Self::onnx_standard()
        }
    }

    /// Same models converted for RTen
    pub fn rten_standard() -> Self {
        Self {
            name: "rten-standard".to_string(),
            detector: "rten/det.rten".to_string(),
            recognizer: "rten/rec.rten".to_string(),
            classifier: None,
            cells: None,
            ..Self::onnx_standard()
        }
    }

    /// Assets without which this model set cannot run
    pub fn required_assets(&self) -> [&str; 3] {
        [&self.detector, &self.recognizer, &self.dictionary]
    }
}

/// Standard model set plus an optional higher-accuracy set used for documents
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    pub standard: ModelSpec,
    pub document: Option<ModelSpec>,
}

impl ModelCatalog {
    pub fn onnx() -> Self {
        Self {
            standard: ModelSpec::onnx_standard(),
            document: Some(ModelSpec::onnx_document()),
        }
    }

    pub fn rten() -> Self {
        Self {
            standard: ModelSpec::rten_standard(),
            document: None,
        }
    }

    /// Model sets to try for a scene, most specific first
    pub fn candidates(&self, scene: Scene) -> Vec<&ModelSpec> {
        match (scene, self.document.as_ref()) {
            (Scene::Document, Some(document)) => vec![document, &self.standard],
            _ => vec![&self.standard],
        }
    }
}

/// Single-input image classifier used by a preprocessing stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageModelSpec {
    pub name: &'static str,
    pub asset: String,
    pub input_width: u32,
    pub input_height: u32,
    pub normalization: Normalization,
    pub classes: usize,
}

impl StageModelSpec {
    /// Whole-page rotation: 0/90/180/270
    pub fn page_orientation() -> Self {
        Self {
            name: "page-orientation",
            asset: "onnx/doc_ori.onnx".to_string(),
            input_width: 224,
            input_height: 224,
            normalization: Normalization::IMAGENET,
            classes: 4,
        }
    }

    /// Text line upside-down check: 0/180
    pub fn textline_orientation() -> Self {
        Self {
            name: "textline-orientation",
            asset: "onnx/cls.onnx".to_string(),
            input_width: 192,
            input_height: 48,
            normalization: Normalization::PADDLE,
            classes: 2,
        }
    }

    /// Document vs item photo
    pub fn scene() -> Self {
        Self {
            name: "scene",
            asset: "onnx/scene.onnx".to_string(),
            input_width: 224,
            input_height: 224,
            normalization: Normalization::IMAGENET,
            classes: 2,
        }
    }

    /// Table vs text label
    pub fn layout() -> Self {
        Self {
            name: "layout",
            asset: "onnx/layout.onnx".to_string(),
            input_width: 224,
            input_height: 224,
            normalization: Normalization::IMAGENET,
            classes: 2,
        }
    }
}

/// Where ONNX Runtime executes a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Cpu,
    /// DirectML on Windows, CoreML on macOS, CUDA elsewhere
    Accelerated,
}

/// Raw first output of a model run
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// Compiled ONNX Runtime session
pub struct OnnxSession {
    session: Mutex<Session>,
    input_name: String,
    path: PathBuf,
}

fn inference_error(context: &str, e: impl std::fmt::Display) -> OcrError {
    OcrError::Inference(format!("{}: {}", context, e))
}

impl OnnxSession {
    /// Compile a session from a model file
    pub fn load(model_path: &Path, target: ExecutionTarget) -> OcrResult<Self> {
        info!("Loading ONNX model from {:?} ({:?})", model_path, target);

        let builder = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(4))
            .map_err(|e| inference_error("session builder", e))?;

        let builder = match target {
            ExecutionTarget::Cpu => builder,
            ExecutionTarget::Accelerated => builder
                .with_execution_providers([accelerator::dispatch()])
                .map_err(|e| {
                    OcrError::BackendUnavailable(format!("accelerator rejected: {}", e))
                })?,
        };

        let session = builder
            .commit_from_file(model_path)
            .map_err(|e| inference_error("failed to load ONNX model", e))?;

        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();
        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        let input_name = input_names
            .into_iter()
            .next()
            .ok_or_else(|| OcrError::Inference(format!("{:?} declares no inputs", model_path)))?;

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            path: model_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    /// Run with a single NCHW input and copy out the first output.
    ///
    /// The input view and the output holder are dropped before returning.
    pub fn run(&self, input: &InputTensor) -> OcrResult<RawOutput> {
        let dims: Vec<i64> = input.shape.iter().map(|&d| d as i64).collect();
        let tensor = TensorRef::from_array_view((dims, input.data.as_slice()))
            .map_err(|e| inference_error("failed to create input tensor", e))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| inference_error("inference failed", e))?;

        let (_, value) = outputs
            .iter()
            .next()
            .ok_or_else(|| OcrError::DecodeFailure("model produced no outputs".to_string()))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| OcrError::DecodeFailure(format!("output is not f32: {}", e)))?;

        Ok(RawOutput {
            shape: shape.iter().copied().collect(),
            data: data.to_vec(),
        })
    }
}

impl std::fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSession")
            .field("path", &self.path)
            .field("input_name", &self.input_name)
            .finish()
    }
}

/// Probe whether ONNX Runtime can execute on `target` in this process
pub fn probe_runtime(target: ExecutionTarget) -> bool {
    if let Err(e) = Session::builder() {
        warn!("ONNX Runtime not usable: {}", e);
        return false;
    }
    match target {
        ExecutionTarget::Cpu => true,
        ExecutionTarget::Accelerated => accelerator::is_available(),
    }
}

mod accelerator {
    use ort::execution_providers::{ExecutionProvider, ExecutionProviderDispatch};
    use tracing::{info, warn};

    #[cfg(target_os = "windows")]
    const NAME: &str = "DirectML";
    #[cfg(target_os = "windows")]
    fn provider() -> ort::execution_providers::DirectMLExecutionProvider {
        ort::execution_providers::DirectMLExecutionProvider::default()
    }

    #[cfg(target_os = "macos")]
    const NAME: &str = "CoreML";
    #[cfg(target_os = "macos")]
    fn provider() -> ort::execution_providers::CoreMLExecutionProvider {
        ort::execution_providers::CoreMLExecutionProvider::default()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    const NAME: &str = "CUDA";
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    fn provider() -> ort::execution_providers::CUDAExecutionProvider {
        ort::execution_providers::CUDAExecutionProvider::default()
    }

    pub fn dispatch() -> ExecutionProviderDispatch {
        provider().build()
    }

    pub fn is_available() -> bool {
        match provider().is_available() {
            Ok(true) => {
                info!("{} execution provider available", NAME);
                true
            }
            Ok(false) => {
                info!("{} execution provider not available", NAME);
                false
            }
            Err(e) => {
                warn!("Failed to query {} execution provider: {}", NAME, e);
                false
            }
        }
    }
}
