//! ONNX image classifiers for the orientation, scene and layout stages

use image::RgbImage;
use std::sync::Arc;
use tracing::debug;

use super::{Classification, ImageClassifier};
use crate::vision::backend::onnx::{load_verified_session, SessionCache};
use crate::vision::backend::{BackendContext, BackendHealth, BackendKind};
use crate::vision::ctc;
use crate::vision::error::{OcrError, OcrResult};
use crate::vision::models::{ExecutionTarget, StageModelSpec};
use crate::vision::preprocess;

/// Softmax unless the scores already look like probabilities
pub fn to_probabilities(scores: &[f32]) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let normalized = scores.iter().all(|s| (0.0..=1.0).contains(s)) && (sum - 1.0).abs() < 1e-3;
    if normalized {
        return scores.to_vec();
    }

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

pub struct OnnxClassifier {
    spec: StageModelSpec,
    ctx: Arc<BackendContext>,
    sessions: Arc<SessionCache>,
    health: Arc<BackendHealth>,
}

impl OnnxClassifier {
    /// `sessions` may be shared between classifiers. `health` is the ONNX
    /// backend's, so a tampered stage model disables ONNX Runtime as a whole.
    pub fn new(
        spec: StageModelSpec,
        ctx: Arc<BackendContext>,
        sessions: Arc<SessionCache>,
        health: Arc<BackendHealth>,
    ) -> Self {
        Self {
            spec,
            ctx,
            sessions,
            health,
        }
    }

    pub fn spec(&self) -> &StageModelSpec {
        &self.spec
    }

    /// Model bundled and not disabled
    pub fn is_available(&self) -> bool {
        !self.health.is_poisoned() && self.ctx.resolver.is_present(&self.spec.asset)
    }

    fn try_classify(&self, image: &RgbImage) -> OcrResult<Classification> {
        if !self.is_available() {
            return Err(OcrError::AssetMissing(self.spec.asset.clone()));
        }
        let session = load_verified_session(
            &self.ctx,
            &self.sessions,
            &self.spec.asset,
            ExecutionTarget::Cpu,
        )?;

        let input = preprocess::prepare_fixed(
            image,
            self.spec.input_width,
            self.spec.input_height,
            &self.spec.normalization,
        );
        let output = session.run(&input)?;
        if output.data.len() < self.spec.classes {
            return Err(OcrError::DecodeFailure(format!(
                "{} produced {} scores, expected {}",
                self.spec.name,
                output.data.len(),
                self.spec.classes
            )));
        }

        let probabilities = to_probabilities(&output.data[..self.spec.classes]);
        let (index, score) = ctc::argmax(&probabilities)
            .ok_or_else(|| OcrError::DecodeFailure(format!("{} scores are NaN", self.spec.name)))?;
        debug!("{}: class {} ({:.3})", self.spec.name, index, score);
        Ok(Classification { index, score })
    }
}

impl ImageClassifier for OnnxClassifier {
    fn classify(&self, image: &RgbImage) -> Option<Classification> {
        self.health
            .settle(BackendKind::Onnx, self.spec.name, self.try_classify(image))
    }
}
