//! RTen backend
//!
//! Runs the `.rten` conversions of the PP-OCR models on the pure Rust
//! runtime. It is compiled in, so only missing model files make it
//! unavailable.

use image::RgbImage;
use rten::Model;
use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::{BackendContext, BackendHealth, BackendKind, OcrBackend};
use crate::vision::cache::KeyedCache;
use crate::vision::ctc;
use crate::vision::detection;
use crate::vision::dictionary::Dictionary;
use crate::vision::error::{OcrError, OcrResult};
use crate::vision::models::{ModelCatalog, ModelSpec, RawOutput};
use crate::vision::preprocess::{self, InputTensor, Normalization};
use crate::vision::types::{BoundingBox, Recognition, Scene};

pub struct RtenBackend {
    ctx: Arc<BackendContext>,
    catalog: ModelCatalog,
    models: KeyedCache<PathBuf, Model>,
    health: BackendHealth,
}

fn run_model(model: &Model, input: InputTensor) -> OcrResult<RawOutput> {
    let tensor = Tensor::from_data(input.shape.as_slice(), input.data);
    let output = model
        .run_one(tensor.view().into(), None)
        .map_err(|e| OcrError::Inference(format!("rten run failed: {}", e)))?;
    let output: Tensor<f32> = output
        .try_into()
        .map_err(|_| OcrError::DecodeFailure("rten output is not f32".to_string()))?;

    Ok(RawOutput {
        shape: output.shape().iter().map(|&d| d as i64).collect(),
        data: output.to_vec(),
    })
}

impl RtenBackend {
    pub fn new(ctx: Arc<BackendContext>, catalog: ModelCatalog) -> Self {
        Self {
            ctx,
            catalog,
            models: KeyedCache::new("rten"),
            health: BackendHealth::default(),
        }
    }

    pub fn models(&self) -> &KeyedCache<PathBuf, Model> {
        &self.models
    }

    fn spec_for(&self, scene: Scene) -> OcrResult<&ModelSpec> {
        if self.health.is_poisoned() {
            return Err(OcrError::BackendUnavailable("rten disabled".to_string()));
        }
        self.catalog
            .candidates(scene)
            .into_iter()
            .find(|spec| self.ctx.assets_present(spec.required_assets()))
            .ok_or_else(|| OcrError::AssetMissing(self.catalog.standard.detector.clone()))
    }

    fn model(&self, asset: &str) -> OcrResult<Arc<Model>> {
        let resolved = self.ctx.resolver.resolve(asset)?;
        let path = self.ctx.resolver.ensure_under_cache(&resolved)?;
        self.models.get_or_try_insert_with(&path, || {
            info!("Loading RTen model from {:?}", path);
            Model::load_file(&path)
                .map_err(|e| OcrError::Inference(format!("failed to load {:?}: {}", path, e)))
        })
    }

    fn try_detect(&self, scene: Scene, image: &RgbImage) -> OcrResult<Vec<BoundingBox>> {
        let spec = self.spec_for(scene)?;
        let model = self.model(&spec.detector)?;
        let (width, height) = spec.det_size;
        let input = preprocess::prepare_fixed(image, width, height, &Normalization::IMAGENET);
        let output = run_model(&model, input)?;
        detection::decode(
            &output.data,
            &output.shape,
            &self.ctx.detection,
            spec.det_size,
            image.dimensions(),
        )
        .ok_or_else(|| {
            OcrError::DecodeFailure(format!("unusable detection output shape {:?}", output.shape))
        })
    }

    fn try_infer(&self, scene: Scene, image: &RgbImage) -> OcrResult<Recognition> {
        let spec = self.spec_for(scene)?;
        let model = self.model(&spec.recognizer)?;
        let dictionary_path = self.ctx.resolver.resolve(&spec.dictionary)?;
        let dictionary =
            Dictionary::load_cached(&self.ctx.dictionaries, &dictionary_path, spec.use_space_char)?;

        let input = preprocess::prepare_recognition(
            image,
            spec.rec_height,
            spec.rec_width,
            &Normalization::PADDLE,
        );
        let output = run_model(&model, input)?;
        ctc::decode(&output.data, &output.shape, &dictionary).ok_or_else(|| {
            OcrError::DecodeFailure(format!("unusable recognition output shape {:?}", output.shape))
        })
    }
}

impl OcrBackend for RtenBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rten
    }

    fn is_available(&self) -> bool {
        !self.health.is_poisoned()
            && self
                .ctx
                .assets_present(self.catalog.standard.required_assets())
    }

    fn detect(&self, scene: Scene, image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.health
            .settle(BackendKind::Rten, "detect", self.try_detect(scene, image))
    }

    fn infer(&self, scene: Scene, image: &RgbImage) -> Option<Recognition> {
        self.health
            .settle(BackendKind::Rten, "infer", self.try_infer(scene, image))
    }

    fn invalidate_sessions(&self) {
        let dropped = self.models.clear();
        debug!("rten: invalidated {} models", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AssetStore, DirAssetStore, ModelAssetResolver};
    use tempfile::TempDir;

    fn backend(assets: &TempDir, cache: &TempDir) -> RtenBackend {
        let store: Arc<dyn AssetStore> = Arc::new(DirAssetStore::new(assets.path()));
        let resolver = ModelAssetResolver::new(store, cache.path()).unwrap();
        RtenBackend::new(
            Arc::new(BackendContext::new(Arc::new(resolver))),
            ModelCatalog::rten(),
        )
    }

    #[test]
    fn test_unavailable_without_models() {
        let assets = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let backend = backend(&assets, &cache);

        assert!(!backend.is_available());
        assert!(backend.detect(Scene::ItemPhoto, &RgbImage::new(16, 16)).is_none());
        assert!(backend.infer(Scene::ItemPhoto, &RgbImage::new(16, 16)).is_none());
    }

    #[test]
    fn test_corrupt_model_degrades_to_none() {
        let assets = TempDir::new().unwrap();
        std::fs::create_dir_all(assets.path().join("rten")).unwrap();
        std::fs::create_dir_all(assets.path().join("dict")).unwrap();
        std::fs::write(assets.path().join("rten/det.rten"), b"garbage").unwrap();
        std::fs::write(assets.path().join("rten/rec.rten"), b"garbage").unwrap();
        std::fs::write(assets.path().join("dict/ppocr_keys.txt"), "a\nb\n").unwrap();
        let cache = TempDir::new().unwrap();
        let backend = backend(&assets, &cache);

        assert!(backend.is_available());
        assert!(backend.detect(Scene::ItemPhoto, &RgbImage::new(16, 16)).is_none());
        assert!(backend.models().is_empty());
        // Load failures are not security violations
        assert!(backend.is_available());
    }
}
