//! Preprocessing Pipeline
//!
//! Ordered, scene-conditional stages run on the working image:
//! page orientation, textline orientation, scene, layout, rectification and
//! enhancement. A stage that is missing or answers `None` passes the image
//! through unchanged.
//!
//! Every bitmap lives in an [`ImageArena`]. A stage that produces a new image
//! hands it to the arena and the superseded one is released right away, so
//! each bitmap is recycled exactly once whatever path the invocation takes.

pub mod classify;
pub mod rectify;

use image::imageops;
use image::RgbImage;
use imageproc::geometric_transformations::Projection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::Cancelled;
use super::frame::{FrameMap, FrameStep};
use super::types::{Layout, Scene};

pub use classify::OnnxClassifier;
pub use rectify::QuadRectifier;

/// Top class of an image classifier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub index: usize,
    pub score: f32,
}

pub trait ImageClassifier: Send + Sync {
    fn classify(&self, image: &RgbImage) -> Option<Classification>;
}

/// A rectified page and the warp that produced it
pub struct Rectification {
    pub image: RgbImage,
    /// Maps input pixel coordinates to output pixel coordinates
    pub projection: Projection,
}

/// Perspective correction; `None` when no document outline is found
pub trait Rectifier: Send + Sync {
    fn rectify(&self, image: &RgbImage) -> Option<Rectification>;
}

/// Photometric enhancement; `None` when nothing would change
pub trait Enhancer: Send + Sync {
    fn enhance(&self, image: &RgbImage) -> Option<RgbImage>;
}

/// Receives bitmaps the pipeline no longer needs
pub trait BitmapRecycler: Send + Sync {
    fn recycle(&self, image: RgbImage);
}

/// Frees bitmaps immediately
#[derive(Debug, Default)]
pub struct DropRecycler;

impl BitmapRecycler for DropRecycler {
    fn recycle(&self, image: RgbImage) {
        drop(image);
    }
}

/// Counts released bitmaps
#[derive(Debug, Default)]
pub struct CountingRecycler {
    released: AtomicUsize,
}

impl CountingRecycler {
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl BitmapRecycler for CountingRecycler {
    fn recycle(&self, image: RgbImage) {
        self.released.fetch_add(1, Ordering::SeqCst);
        drop(image);
    }
}

/// Handle to a bitmap owned by an [`ImageArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(usize);

/// Owns every bitmap of one invocation.
///
/// Released slots stay empty; whatever is still live when the arena drops is
/// released then.
pub struct ImageArena {
    slots: Vec<Option<RgbImage>>,
    recycler: Arc<dyn BitmapRecycler>,
}

impl ImageArena {
    pub fn new(recycler: Arc<dyn BitmapRecycler>) -> Self {
        Self {
            slots: Vec::new(),
            recycler,
        }
    }

    pub fn insert(&mut self, image: RgbImage) -> ImageId {
        self.slots.push(Some(image));
        ImageId(self.slots.len() - 1)
    }

    pub fn get(&self, id: ImageId) -> Option<&RgbImage> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Hand the bitmap to the recycler; false if it was already released
    pub fn release(&mut self, id: ImageId) -> bool {
        match self.slots.get_mut(id.0).and_then(Option::take) {
            Some(image) => {
                self.recycler.recycle(image);
                true
            }
            None => false,
        }
    }

    /// Replace `current` with `next`, releasing `current`
    pub fn supersede(&mut self, current: ImageId, next: RgbImage) -> ImageId {
        let id = self.insert(next);
        self.release(current);
        id
    }

    /// Bitmaps not yet released
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Bitmaps ever inserted
    pub fn created(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for ImageArena {
    fn drop(&mut self) {
        let remaining = self.live();
        for slot in self.slots.iter_mut() {
            if let Some(image) = slot.take() {
                self.recycler.recycle(image);
            }
        }
        if remaining > 0 {
            debug!("Image arena released {} remaining bitmaps", remaining);
        }
    }
}

/// Rotate clockwise by a multiple of 90 degrees; `None` for 0 or anything else
pub fn rotate_clockwise(image: &RgbImage, degrees: u32) -> Option<RgbImage> {
    match degrees % 360 {
        90 => Some(imageops::rotate90(image)),
        180 => Some(imageops::rotate180(image)),
        270 => Some(imageops::rotate270(image)),
        _ => None,
    }
}

/// Page orientation classes are content rotations of 0/90/180/270 degrees
const PAGE_ANGLES: [u32; 4] = [0, 90, 180, 270];
/// Textline orientation classes are 0/180 degrees
const TEXTLINE_ANGLES: [u32; 2] = [0, 180];

/// Optional stage implementations
#[derive(Default, Clone)]
pub struct StageSet {
    pub page_orientation: Option<Arc<dyn ImageClassifier>>,
    pub textline_orientation: Option<Arc<dyn ImageClassifier>>,
    pub scene: Option<Arc<dyn ImageClassifier>>,
    pub layout: Option<Arc<dyn ImageClassifier>>,
    pub rectifier: Option<Arc<dyn Rectifier>>,
    pub enhancer: Option<Arc<dyn Enhancer>>,
}

/// What preprocessing decided about the image
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// Final working image
    pub image: ImageId,
    pub scene: Scene,
    pub layout: Layout,
    /// Clockwise correction applied
    pub rotation_degrees: u32,
    pub rectified: bool,
    pub enhanced: bool,
    /// Geometry from the input image to `image`
    pub frame: FrameMap,
}

pub struct Preprocessor {
    stages: StageSet,
    min_confidence: f32,
}

fn check(cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

impl Preprocessor {
    pub fn new(stages: StageSet, min_confidence: f32) -> Self {
        Self {
            stages,
            min_confidence,
        }
    }

    /// Pass-through for every stage
    pub fn identity() -> Self {
        Self::new(StageSet::default(), 0.6)
    }

    fn confident(&self, classifier: &Option<Arc<dyn ImageClassifier>>, image: &RgbImage) -> Option<usize> {
        let result = classifier.as_ref()?.classify(image)?;
        if result.score >= self.min_confidence {
            Some(result.index)
        } else {
            debug!(
                "Ignoring class {} with score {:.3} < {:.3}",
                result.index, result.score, self.min_confidence
            );
            None
        }
    }

    /// Orientation correction for one classifier; returns the clockwise degrees applied
    fn orient(
        &self,
        arena: &mut ImageArena,
        current: &mut ImageId,
        frame: &mut FrameMap,
        classifier: &Option<Arc<dyn ImageClassifier>>,
        angles: &[u32],
    ) -> u32 {
        let Some(image) = arena.get(*current) else {
            return 0;
        };
        let Some(angle) = self
            .confident(classifier, image)
            .and_then(|index| angles.get(index).copied())
        else {
            return 0;
        };

        let correction = (360 - angle) % 360;
        let (width, height) = image.dimensions();
        match rotate_clockwise(image, correction) {
            Some(rotated) => {
                info!("Content rotated {}°, correcting by {}° clockwise", angle, correction);
                *current = arena.supersede(*current, rotated);
                frame.push(FrameStep::Rotate {
                    degrees: correction,
                    width,
                    height,
                });
                correction
            }
            None => 0,
        }
    }

    /// Run all stages on `input`, which the arena owns.
    ///
    /// Only the returned image is left live among the ones this call produced
    /// or received.
    pub fn run(
        &self,
        arena: &mut ImageArena,
        input: ImageId,
        cancel: &CancellationToken,
    ) -> Result<Preprocessed, Cancelled> {
        let mut current = input;
        let mut frame = FrameMap::new();

        check(cancel)?;
        let page = self.orient(
            arena,
            &mut current,
            &mut frame,
            &self.stages.page_orientation,
            &PAGE_ANGLES,
        );

        check(cancel)?;
        let line = self.orient(
            arena,
            &mut current,
            &mut frame,
            &self.stages.textline_orientation,
            &TEXTLINE_ANGLES,
        );
        let rotation_degrees = (page + line) % 360;

        check(cancel)?;
        let scene = arena
            .get(current)
            .and_then(|image| self.confident(&self.stages.scene, image))
            .map(|index| if index == 0 { Scene::Document } else { Scene::ItemPhoto })
            .unwrap_or_default();

        check(cancel)?;
        let layout = arena
            .get(current)
            .and_then(|image| self.confident(&self.stages.layout, image))
            .map(|index| if index == 0 { Layout::Table } else { Layout::TextLabel })
            .unwrap_or_default();
        debug!("Scene {:?}, layout {:?}", scene, layout);

        let mut rectified = false;
        let mut enhanced = false;
        if scene == Scene::Document {
            check(cancel)?;
            if let Some(next) = self
                .stages
                .rectifier
                .as_ref()
                .and_then(|r| arena.get(current).and_then(|image| r.rectify(image)))
            {
                current = arena.supersede(current, next.image);
                frame.push(FrameStep::Warp(next.projection));
                rectified = true;
            }

            check(cancel)?;
            if let Some(next) = self
                .stages
                .enhancer
                .as_ref()
                .and_then(|e| arena.get(current).and_then(|image| e.enhance(image)))
            {
                current = arena.supersede(current, next);
                enhanced = true;
            }
        }

        Ok(Preprocessed {
            image: current,
            scene,
            layout,
            rotation_degrees,
            rectified,
            enhanced,
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::ocr_preprocess::ContrastSharpenEnhancer;
    use image::Rgb;

    struct Fixed(Option<Classification>);

    impl ImageClassifier for Fixed {
        fn classify(&self, _image: &RgbImage) -> Option<Classification> {
            self.0
        }
    }

    fn fixed(index: usize, score: f32) -> Option<Arc<dyn ImageClassifier>> {
        Some(Arc::new(Fixed(Some(Classification { index, score }))))
    }

    struct Shrink;

    impl Rectifier for Shrink {
        fn rectify(&self, image: &RgbImage) -> Option<Rectification> {
            Some(Rectification {
                image: imageops::crop_imm(image, 0, 0, image.width() / 2, image.height() / 2)
                    .to_image(),
                projection: Projection::translate(0.0, 0.0),
            })
        }
    }

    fn setup(width: u32, height: u32) -> (Arc<CountingRecycler>, ImageArena, ImageId) {
        let recycler = Arc::new(CountingRecycler::default());
        let mut arena = ImageArena::new(recycler.clone());
        let id = arena.insert(RgbImage::from_pixel(width, height, Rgb([200, 200, 200])));
        (recycler, arena, id)
    }

    #[test]
    fn test_arena_releases_once() {
        let (recycler, mut arena, id) = setup(4, 4);
        assert!(arena.release(id));
        assert!(!arena.release(id));
        assert!(arena.get(id).is_none());
        assert_eq!(recycler.released(), 1);
        drop(arena);
        assert_eq!(recycler.released(), 1);
    }

    #[test]
    fn test_arena_drop_releases_remaining() {
        let (recycler, mut arena, _id) = setup(4, 4);
        arena.insert(RgbImage::new(2, 2));
        assert_eq!(arena.live(), 2);
        drop(arena);
        assert_eq!(recycler.released(), 2);
    }

    #[test]
    fn test_identity_is_pass_through() {
        let (recycler, mut arena, id) = setup(10, 20);
        let result = Preprocessor::identity()
            .run(&mut arena, id, &CancellationToken::new())
            .unwrap();

        assert_eq!(result.image, id);
        assert_eq!(result.scene, Scene::ItemPhoto);
        assert_eq!(result.layout, Layout::TextLabel);
        assert_eq!(result.rotation_degrees, 0);
        assert!(!result.rectified && !result.enhanced);
        assert!(result.frame.is_identity());
        assert_eq!(recycler.released(), 0);
    }

    #[test]
    fn test_page_orientation_rotates_and_releases() {
        let (recycler, mut arena, id) = setup(10, 20);
        let stages = StageSet {
            page_orientation: fixed(1, 0.9),
            ..StageSet::default()
        };
        let result = Preprocessor::new(stages, 0.6)
            .run(&mut arena, id, &CancellationToken::new())
            .unwrap();

        assert_eq!(result.rotation_degrees, 270);
        assert_eq!(arena.get(result.image).unwrap().dimensions(), (20, 10));
        assert!(matches!(
            result.frame.steps(),
            [FrameStep::Rotate {
                degrees: 270,
                width: 10,
                height: 20
            }]
        ));
        assert_eq!(recycler.released(), 1);
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn test_low_confidence_is_ignored() {
        let (_recycler, mut arena, id) = setup(10, 20);
        let stages = StageSet {
            page_orientation: fixed(2, 0.4),
            layout: fixed(0, 0.5),
            ..StageSet::default()
        };
        let result = Preprocessor::new(stages, 0.6)
            .run(&mut arena, id, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.rotation_degrees, 0);
        assert_eq!(result.layout, Layout::TextLabel);
    }

    #[test]
    fn test_document_stages_chain() {
        let (recycler, mut arena, id) = setup(40, 40);
        let stages = StageSet {
            textline_orientation: fixed(1, 0.99),
            scene: fixed(0, 0.8),
            layout: fixed(0, 0.7),
            rectifier: Some(Arc::new(Shrink)),
            enhancer: Some(Arc::new(ContrastSharpenEnhancer::default())),
            ..StageSet::default()
        };
        let result = Preprocessor::new(stages, 0.6)
            .run(&mut arena, id, &CancellationToken::new())
            .unwrap();

        assert_eq!(result.scene, Scene::Document);
        assert_eq!(result.layout, Layout::Table);
        assert_eq!(result.rotation_degrees, 180);
        assert!(result.rectified && result.enhanced);
        assert_eq!(arena.get(result.image).unwrap().dimensions(), (20, 20));
        assert!(matches!(
            result.frame.steps(),
            [FrameStep::Rotate { degrees: 180, .. }, FrameStep::Warp(_)]
        ));

        // input, rotated, rectified superseded; enhanced is the survivor
        assert_eq!(arena.created(), 4);
        assert_eq!(recycler.released(), 3);
        drop(arena);
        assert_eq!(recycler.released(), 4);
    }

    #[test]
    fn test_item_photo_skips_rectify_and_enhance() {
        let (_recycler, mut arena, id) = setup(40, 40);
        let stages = StageSet {
            scene: fixed(1, 0.9),
            rectifier: Some(Arc::new(Shrink)),
            enhancer: Some(Arc::new(ContrastSharpenEnhancer::default())),
            ..StageSet::default()
        };
        let result = Preprocessor::new(stages, 0.6)
            .run(&mut arena, id, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.image, id);
        assert!(!result.rectified && !result.enhanced);
    }

    #[test]
    fn test_cancelled_before_start() {
        let (_recycler, mut arena, id) = setup(4, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            Preprocessor::identity().run(&mut arena, id, &cancel),
            Err(Cancelled)
        ));
    }

    #[test]
    fn test_rotate_clockwise() {
        let image = RgbImage::new(3, 5);
        assert_eq!(rotate_clockwise(&image, 90).unwrap().dimensions(), (5, 3));
        assert_eq!(rotate_clockwise(&image, 180).unwrap().dimensions(), (3, 5));
        assert!(rotate_clockwise(&image, 0).is_none());
        assert!(rotate_clockwise(&image, 45).is_none());
    }
}
