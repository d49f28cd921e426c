//! ONNX Runtime backends
//!
//! The same implementation serves the CPU backend and the accelerated one;
//! they differ in execution target and therefore keep separate sessions.

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use super::{BackendContext, BackendHealth, BackendKind, OcrBackend};
use crate::vision::cache::KeyedCache;
use crate::vision::ctc;
use crate::vision::detection::{self, DetectionParams};
use crate::vision::dictionary::Dictionary;
use crate::vision::error::{OcrError, OcrResult};
use crate::vision::models::{self, ExecutionTarget, ModelCatalog, ModelSpec, OnnxSession};
use crate::vision::preprocess::{self, Normalization};
use crate::vision::types::{BoundingBox, Recognition, Scene};

/// Environment variable ONNX Runtime reads its shared library path from
pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

pub type SessionCache = KeyedCache<PathBuf, OnnxSession>;

/// Reject a runtime library outside the trusted directories.
///
/// No library override, or no trusted directories configured, passes.
pub fn check_runtime_library(library: Option<&Path>, trusted_dirs: &[PathBuf]) -> OcrResult<()> {
    let Some(library) = library else {
        return Ok(());
    };
    if trusted_dirs.is_empty() {
        return Ok(());
    }

    let canonical = library
        .canonicalize()
        .map_err(|e| OcrError::SecurityViolation(format!("runtime library {:?}: {}", library, e)))?;
    let trusted = trusted_dirs
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .any(|dir| canonical.starts_with(dir));

    if trusted {
        Ok(())
    } else {
        Err(OcrError::SecurityViolation(format!(
            "runtime library {:?} is not under a trusted directory",
            canonical
        )))
    }
}

/// Resolve, verify and compile (once) the session for a model asset.
///
/// The model must live under the cache root, match its manifest digest and
/// be loaded by a trusted runtime library.
pub fn load_verified_session(
    ctx: &BackendContext,
    sessions: &SessionCache,
    asset: &str,
    target: ExecutionTarget,
) -> OcrResult<Arc<OnnxSession>> {
    let resolved = ctx.resolver.resolve(asset)?;
    let path = ctx.resolver.ensure_under_cache(&resolved)?;

    sessions.get_or_try_insert_with(&path, || {
        let library = std::env::var_os(ORT_DYLIB_ENV).map(PathBuf::from);
        check_runtime_library(library.as_deref(), &ctx.trusted_runtime_dirs)?;
        ctx.resolver.verify_digest(asset, &path)?;
        OnnxSession::load(&path, target)
    })
}

/// PP-OCR pipeline on ONNX Runtime
pub struct OnnxBackend {
    kind: BackendKind,
    target: ExecutionTarget,
    ctx: Arc<BackendContext>,
    catalog: ModelCatalog,
    sessions: SessionCache,
    health: Arc<BackendHealth>,
    runtime: OnceLock<bool>,
}

impl OnnxBackend {
    /// CPU execution
    pub fn cpu(ctx: Arc<BackendContext>, catalog: ModelCatalog) -> Self {
        Self::with_target(BackendKind::Onnx, ExecutionTarget::Cpu, ctx, catalog)
    }

    /// Platform accelerator execution
    pub fn accelerated(ctx: Arc<BackendContext>, catalog: ModelCatalog) -> Self {
        Self::with_target(
            BackendKind::OnnxAccelerated,
            ExecutionTarget::Accelerated,
            ctx,
            catalog,
        )
    }

    fn with_target(
        kind: BackendKind,
        target: ExecutionTarget,
        ctx: Arc<BackendContext>,
        catalog: ModelCatalog,
    ) -> Self {
        Self {
            kind,
            target,
            ctx,
            catalog,
            sessions: SessionCache::new(kind.as_str()),
            health: Arc::new(BackendHealth::default()),
            runtime: OnceLock::new(),
        }
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Poisoning through this handle disables the backend
    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.health
    }

    fn runtime_available(&self) -> bool {
        *self.runtime.get_or_init(|| {
            let available = models::probe_runtime(self.target);
            info!("{} runtime probe: available={}", self.kind, available);
            available
        })
    }

    /// First model set for the scene whose files are all bundled
    fn spec_for(&self, scene: Scene) -> OcrResult<&ModelSpec> {
        self.catalog
            .candidates(scene)
            .into_iter()
            .find(|spec| self.ctx.assets_present(spec.required_assets()))
            .ok_or_else(|| OcrError::AssetMissing(self.catalog.standard.detector.clone()))
    }

    fn ensure_runtime(&self) -> OcrResult<()> {
        if self.health.is_poisoned() {
            return Err(OcrError::BackendUnavailable(format!("{} disabled", self.kind)));
        }
        if !self.runtime_available() {
            return Err(OcrError::BackendUnavailable(format!("{} runtime missing", self.kind)));
        }
        Ok(())
    }

    fn session(&self, asset: &str) -> OcrResult<Arc<OnnxSession>> {
        load_verified_session(&self.ctx, &self.sessions, asset, self.target)
    }

    fn run_detector(
        &self,
        asset: &str,
        size: (u32, u32),
        params: &DetectionParams,
        image: &RgbImage,
    ) -> OcrResult<Vec<BoundingBox>> {
        let session = self.session(asset)?;
        let input = preprocess::prepare_fixed(image, size.0, size.1, &Normalization::IMAGENET);
        let output = session.run(&input)?;
        detection::decode(&output.data, &output.shape, params, size, image.dimensions()).ok_or_else(
            || OcrError::DecodeFailure(format!("unusable detection output shape {:?}", output.shape)),
        )
    }

    fn try_detect(&self, scene: Scene, image: &RgbImage) -> OcrResult<Vec<BoundingBox>> {
        let spec = self.spec_for(scene)?;
        self.ensure_runtime()?;
        self.run_detector(&spec.detector, spec.det_size, &self.ctx.detection, image)
    }

    fn try_infer(&self, scene: Scene, image: &RgbImage) -> OcrResult<Recognition> {
        let spec = self.spec_for(scene)?;
        self.ensure_runtime()?;

        let session = self.session(&spec.recognizer)?;
        let dictionary_path = self.ctx.resolver.resolve(&spec.dictionary)?;
        let dictionary =
            Dictionary::load_cached(&self.ctx.dictionaries, &dictionary_path, spec.use_space_char)?;

        let input = preprocess::prepare_recognition(
            image,
            spec.rec_height,
            spec.rec_width,
            &Normalization::PADDLE,
        );
        let output = session.run(&input)?;
        ctc::decode(&output.data, &output.shape, &dictionary).ok_or_else(|| {
            OcrError::DecodeFailure(format!("unusable recognition output shape {:?}", output.shape))
        })
    }

    fn try_detect_cells(&self, image: &RgbImage) -> OcrResult<Vec<BoundingBox>> {
        let spec = &self.catalog.standard;
        let cells = spec
            .cells
            .as_deref()
            .filter(|asset| self.ctx.resolver.is_present(asset))
            .ok_or_else(|| OcrError::AssetMissing("table cell model".to_string()))?;
        self.ensure_runtime()?;
        self.run_detector(cells, spec.det_size, &self.ctx.cell_detection, image)
    }
}

impl OcrBackend for OnnxBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        !self.health.is_poisoned()
            && self
                .ctx
                .assets_present(self.catalog.standard.required_assets())
            && self.runtime_available()
    }

    fn detect(&self, scene: Scene, image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.health
            .settle(self.kind, "detect", self.try_detect(scene, image))
    }

    fn infer(&self, scene: Scene, image: &RgbImage) -> Option<Recognition> {
        self.health
            .settle(self.kind, "infer", self.try_infer(scene, image))
    }

    fn detect_cells(&self, image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.health
            .settle(self.kind, "detect_cells", self.try_detect_cells(image))
    }

    fn invalidate_sessions(&self) {
        let dropped = self.sessions.clear();
        debug!("{}: invalidated {} sessions", self.kind, dropped);
    }
}
