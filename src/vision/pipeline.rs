//! Pipeline Orchestrator
//!
//! One invocation walks Loading, Preprocessing, Detecting, Recognizing (per
//! box, or the whole image when nothing was detected) and, for tables,
//! structure assignment. Every failure except cancellation ends in an empty
//! output plus a log line. Bitmaps live in an [`ImageArena`] that is dropped
//! before the invocation returns, on every path.

use anyhow::Result;
use image::{ImageError, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backend::onnx::{OnnxBackend, SessionCache};
use super::backend::rten::RtenBackend;
use super::backend::switcher::BackendSwitcher;
use super::backend::{BackendContext, BackendMode, OcrBackend};
use super::error::{Cancelled, OcrError, OcrResult};
use super::frame::{FrameMap, FrameStep};
use super::models::{ModelCatalog, StageModelSpec};
use super::ocr_preprocess::ContrastSharpenEnhancer;
use super::preprocess::{crop_box, fit_within};
use super::segment::{segment_words, split_tokens};
use super::stages::{
    BitmapRecycler, DropRecycler, ImageArena, ImageClassifier, OnnxClassifier, Preprocessor,
    QuadRectifier, StageSet,
};
use super::table;
use super::types::{
    BoundingBox, Group, IdAllocator, ImageMeta, Layout, PipelineOutput, Recognition, Scene,
    TableCell,
};
use crate::config::{OcrConfig, PipelineConfig};
use crate::storage::{AssetStore, DirAssetStore, ModelAssetResolver};

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Longest side of the working image
    pub max_side: u32,
    /// Recognitions below this confidence are dropped
    pub recognition_threshold: f32,
    /// Pixels added on each side of a box before it is cropped for recognition
    pub crop_padding: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_side: 1600,
            recognition_threshold: 0.3,
            crop_padding: 4.0,
        }
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_side: config.max_side,
            recognition_threshold: config.recognition_threshold,
            ..Self::default()
        }
    }
}

fn check(cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

fn fresh_meta() -> ImageMeta {
    ImageMeta {
        scale: 1.0,
        ..ImageMeta::default()
    }
}

fn load_image(path: &Path) -> OcrResult<RgbImage> {
    let decoded = image::open(path).map_err(|e| match e {
        ImageError::IoError(source) => OcrError::io(path, source),
        other => OcrError::Image(other),
    })?;
    Ok(decoded.to_rgb8())
}

/// Carry every box of the output back into the decoded `width` x `height`
/// image. Group and cell boxes left without area are dropped.
fn to_output_frame(
    groups: &mut [Group],
    table: Option<&mut Vec<TableCell>>,
    frame: &FrameMap,
    (width, height): (u32, u32),
) {
    let (width, height) = (width as f32, height as f32);
    let map = |bbox: &BoundingBox| frame.to_source(bbox).clamped(width, height);

    for group in groups.iter_mut() {
        group.bbox = group.bbox.map(|b| map(&b)).filter(BoundingBox::is_valid);
        for token in group.tokens.iter_mut() {
            token.bbox = map(&token.bbox);
        }
    }
    if let Some(cells) = table {
        for cell in cells.iter_mut() {
            cell.bbox = map(&cell.bbox);
        }
        let before = cells.len();
        cells.retain(|cell| cell.bbox.is_valid());
        if cells.len() < before {
            debug!("Dropped {} cells outside the image", before - cells.len());
        }
    }
}

/// Runs OCR invocations against a shared set of backends and stages
pub struct OcrPipeline {
    switcher: Arc<BackendSwitcher>,
    preprocessor: Preprocessor,
    recycler: Arc<dyn BitmapRecycler>,
    settings: PipelineSettings,
}

impl OcrPipeline {
    pub fn new(
        switcher: Arc<BackendSwitcher>,
        preprocessor: Preprocessor,
        recycler: Arc<dyn BitmapRecycler>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            switcher,
            preprocessor,
            recycler,
            settings,
        }
    }

    /// Wire every backend and stage from configuration.
    ///
    /// `mode` is the live backend-mode setting; the switcher follows it.
    pub fn from_config(config: &OcrConfig, mode: watch::Receiver<BackendMode>) -> Result<Self> {
        let cache_dir = config.models.resolved_cache_dir()?;
        let store: Arc<dyn AssetStore> = Arc::new(DirAssetStore::new(&config.models.asset_root));
        let resolver = Arc::new(ModelAssetResolver::new(store, &cache_dir)?);
        info!(
            "Initializing OCR pipeline: assets={:?}, cache={:?}",
            config.models.asset_root, cache_dir
        );

        let ctx = Arc::new(BackendContext {
            detection: config.detection.text_params(),
            cell_detection: config.detection.cell_params(),
            trusted_runtime_dirs: config.models.trusted_runtime_dirs.clone(),
            ..BackendContext::new(resolver)
        });

        let onnx = Arc::new(OnnxBackend::cpu(ctx.clone(), ModelCatalog::onnx()));
        let onnx_health = onnx.health().clone();
        let backends: Vec<Arc<dyn OcrBackend>> = vec![
            onnx,
            Arc::new(RtenBackend::new(ctx.clone(), ModelCatalog::rten())),
            Arc::new(OnnxBackend::accelerated(ctx.clone(), ModelCatalog::onnx())),
        ];
        let stage_sessions = Arc::new(SessionCache::new("stages"));
        let switcher = Arc::new(
            BackendSwitcher::new(backends, mode).with_cache(stage_sessions.clone()),
        );

        let classifier = |spec: StageModelSpec| -> Option<Arc<dyn ImageClassifier>> {
            Some(Arc::new(OnnxClassifier::new(
                spec,
                ctx.clone(),
                stage_sessions.clone(),
                onnx_health.clone(),
            )))
        };
        let stages = StageSet {
            page_orientation: classifier(StageModelSpec::page_orientation()),
            textline_orientation: classifier(StageModelSpec::textline_orientation()),
            scene: classifier(StageModelSpec::scene()),
            layout: classifier(StageModelSpec::layout()),
            rectifier: Some(Arc::new(QuadRectifier::default())),
            enhancer: Some(Arc::new(ContrastSharpenEnhancer::new(
                config.pipeline.enhance_settings(),
            ))),
        };

        Ok(Self::new(
            switcher,
            Preprocessor::new(stages, config.pipeline.orientation_min_confidence),
            Arc::new(DropRecycler),
            PipelineSettings::from(&config.pipeline),
        ))
    }

    pub fn switcher(&self) -> &Arc<BackendSwitcher> {
        &self.switcher
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one invocation on an image file
    pub fn run(&self, source: &Path, cancel: &CancellationToken) -> Result<PipelineOutput, Cancelled> {
        debug!("OCR invocation on {:?}", source);
        self.execute(cancel, || load_image(source))
    }

    /// Run one invocation on an already decoded image
    pub fn run_image(&self, image: RgbImage, cancel: &CancellationToken) -> Result<PipelineOutput, Cancelled> {
        self.execute(cancel, move || Ok(image))
    }

    /// [`run`](Self::run) on tokio's blocking pool
    pub async fn run_async(
        self: Arc<Self>,
        source: PathBuf,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, Cancelled> {
        let handle = tokio::task::spawn_blocking(move || self.run(&source, &cancel));
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Cancelled),
            Err(e) => {
                error!("OCR worker panicked: {}", e);
                Ok(PipelineOutput::empty(fresh_meta()))
            }
        }
    }

    fn execute(
        &self,
        cancel: &CancellationToken,
        load: impl FnOnce() -> OcrResult<RgbImage>,
    ) -> Result<PipelineOutput, Cancelled> {
        let started = Instant::now();
        let mut meta = fresh_meta();
        let mut arena = ImageArena::new(self.recycler.clone());

        let outcome = self.process(&mut arena, load, &mut meta, cancel);
        drop(arena);

        match outcome {
            Ok(output) => {
                info!(
                    "OCR complete in {:?}: {:?}/{:?}, {} groups{}",
                    started.elapsed(),
                    output.scene,
                    output.layout,
                    output.result.len(),
                    output
                        .table
                        .as_ref()
                        .map(|t| format!(", {} cells", t.len()))
                        .unwrap_or_default()
                );
                Ok(output)
            }
            Err(OcrError::Cancelled) => {
                info!("OCR invocation cancelled after {:?}", started.elapsed());
                Err(Cancelled)
            }
            Err(e) => {
                warn!("OCR invocation failed, returning empty result: {}", e);
                Ok(PipelineOutput::empty(meta))
            }
        }
    }

    fn process(
        &self,
        arena: &mut ImageArena,
        load: impl FnOnce() -> OcrResult<RgbImage>,
        meta: &mut ImageMeta,
        cancel: &CancellationToken,
    ) -> OcrResult<PipelineOutput> {
        check(cancel)?;
        let decoded = load()?;
        (meta.original_width, meta.original_height) = decoded.dimensions();
        let mut current = arena.insert(decoded);
        let mut frame = FrameMap::new();

        let resized = arena
            .get(current)
            .and_then(|image| fit_within(image, self.settings.max_side));
        if let Some((image, factor)) = resized {
            debug!(
                "Working image {}x{} (x{:.3})",
                image.width(),
                image.height(),
                factor
            );
            current = arena.supersede(current, image);
            frame.push(FrameStep::Scale(factor));
            meta.scale = 1.0 / factor;
        }

        let prep = self.preprocessor.run(arena, current, cancel)?;
        meta.rotation_degrees = prep.rotation_degrees;
        meta.rectified = prep.rectified;
        meta.enhanced = prep.enhanced;
        frame.extend(prep.frame);

        let image = arena
            .get(prep.image)
            .ok_or_else(|| OcrError::DecodeFailure("working image already released".into()))?;
        (meta.working_width, meta.working_height) = image.dimensions();

        check(cancel)?;
        let mut ids = IdAllocator::new();
        let boxes = self.switcher.detect(prep.scene, image).unwrap_or_default();
        debug!("Detected {} text boxes", boxes.len());

        let mut groups = if boxes.is_empty() {
            check(cancel)?;
            self.recognize_whole(prep.scene, image, &mut ids)
        } else {
            self.recognize_boxes(prep.scene, image, &boxes, &mut ids, cancel)?
        };

        let mut table = if prep.layout == Layout::Table {
            check(cancel)?;
            Some(self.build_table(prep.scene, image, &groups, &mut ids, cancel)?)
        } else {
            None
        };

        to_output_frame(
            &mut groups,
            table.as_mut(),
            &frame,
            (meta.original_width, meta.original_height),
        );

        Ok(PipelineOutput {
            scene: prep.scene,
            layout: prep.layout,
            image_meta: *meta,
            result: groups,
            table,
        })
    }

    fn accept(&self, recognition: Recognition) -> Option<Recognition> {
        if recognition.is_empty() || recognition.confidence < self.settings.recognition_threshold {
            debug!(
                "Dropping recognition {:?} ({:.3})",
                recognition.text, recognition.confidence
            );
            return None;
        }
        Some(recognition)
    }

    fn recognize_crop(&self, scene: Scene, image: &RgbImage, bbox: &BoundingBox) -> Option<Recognition> {
        let crop = crop_box(image, bbox, self.settings.crop_padding)?;
        self.switcher.infer(scene, &crop).and_then(|r| self.accept(r))
    }

    fn recognize_boxes(
        &self,
        scene: Scene,
        image: &RgbImage,
        boxes: &[BoundingBox],
        ids: &mut IdAllocator,
        cancel: &CancellationToken,
    ) -> Result<Vec<Group>, Cancelled> {
        let mut groups = Vec::with_capacity(boxes.len());
        for bbox in boxes.iter().filter(|b| b.is_valid()) {
            check(cancel)?;
            let Some(recognition) = self.recognize_crop(scene, image, bbox) else {
                continue;
            };
            groups.push(Group {
                id: ids.next_id(),
                tokens: split_tokens(&recognition, bbox),
                confidence: recognition.confidence,
                bbox: Some(*bbox),
            });
        }
        Ok(groups)
    }

    fn recognize_whole(&self, scene: Scene, image: &RgbImage, ids: &mut IdAllocator) -> Vec<Group> {
        let Some(recognition) = self.switcher.infer(scene, image).and_then(|r| self.accept(r)) else {
            return Vec::new();
        };
        let tokens = segment_words(&recognition, image);
        let bbox = tokens.iter().map(|t| t.bbox).reduce(|a, b| a.union(&b));
        vec![Group {
            id: ids.next_id(),
            tokens,
            confidence: recognition.confidence,
            bbox,
        }]
    }

    /// Text of the groups centered inside `cell`, else a fresh recognition of the cell
    fn cell_text(
        &self,
        scene: Scene,
        image: &RgbImage,
        cell: &BoundingBox,
        groups: &[Group],
    ) -> (String, f32) {
        let inside: Vec<&Group> = groups
            .iter()
            .filter(|g| {
                g.bbox.is_some_and(|b| {
                    let (x, y) = b.center();
                    cell.contains_point(x, y)
                })
            })
            .collect();

        if !inside.is_empty() {
            let text = inside.iter().map(|g| g.text()).collect::<Vec<_>>().join(" ");
            let confidence = inside.iter().map(|g| g.confidence).sum::<f32>() / inside.len() as f32;
            return (text, confidence);
        }

        self.recognize_crop(scene, image, cell)
            .map(|r| (r.text.trim().to_string(), r.confidence))
            .unwrap_or_default()
    }

    fn build_table(
        &self,
        scene: Scene,
        image: &RgbImage,
        groups: &[Group],
        ids: &mut IdAllocator,
        cancel: &CancellationToken,
    ) -> Result<Vec<TableCell>, Cancelled> {
        let detected: Vec<BoundingBox> = self
            .switcher
            .detect_cells(image)
            .unwrap_or_default()
            .into_iter()
            .filter(BoundingBox::is_valid)
            .collect();

        let mut cells = Vec::new();
        if detected.is_empty() {
            debug!("No cell boxes, using {} text groups as cells", groups.len());
            for group in groups {
                let Some(bbox) = group.bbox else {
                    continue;
                };
                cells.push(TableCell {
                    id: ids.next_id(),
                    text: group.text(),
                    confidence: group.confidence,
                    bbox,
                    row_index: None,
                    col_index: None,
                    row_span: 1,
                    col_span: 1,
                });
            }
        } else {
            for bbox in detected {
                check(cancel)?;
                let (text, confidence) = self.cell_text(scene, image, &bbox, groups);
                cells.push(TableCell {
                    id: ids.next_id(),
                    text,
                    confidence,
                    bbox,
                    row_index: None,
                    col_index: None,
                    row_span: 1,
                    col_span: 1,
                });
            }
        }

        table::assign(&mut cells);
        Ok(cells)
    }
}
