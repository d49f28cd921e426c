//! Scripted backend for tests

use image::RgbImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{BackendKind, OcrBackend};
use crate::vision::types::{BoundingBox, Recognition, Scene};

/// Shared record of which backend answered which call, in order
pub type CallLog = Arc<Mutex<Vec<(BackendKind, &'static str)>>>;

pub struct FakeBackend {
    pub kind: BackendKind,
    pub available: bool,
    pub boxes: Option<Vec<BoundingBox>>,
    pub cells: Option<Vec<BoundingBox>>,
    pub recognition: Option<Recognition>,
    pub log: CallLog,
    pub invalidations: AtomicUsize,
}

impl FakeBackend {
    pub fn new(kind: BackendKind, log: &CallLog) -> Self {
        Self {
            kind,
            available: true,
            boxes: None,
            cells: None,
            recognition: None,
            log: log.clone(),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn recognizing(mut self, text: &str, confidence: f32) -> Self {
        self.recognition = Some(Recognition {
            text: text.to_string(),
            confidence,
        });
        self
    }

    pub fn detecting(mut self, boxes: Vec<BoundingBox>) -> Self {
        self.boxes = Some(boxes);
        self
    }

    pub fn detecting_cells(mut self, cells: Vec<BoundingBox>) -> Self {
        self.cells = Some(cells);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl OcrBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn detect(&self, _scene: Scene, _image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.log.lock().push((self.kind, "detect"));
        self.boxes.clone()
    }

    fn infer(&self, _scene: Scene, _image: &RgbImage) -> Option<Recognition> {
        self.log.lock().push((self.kind, "infer"));
        self.recognition.clone()
    }

    fn detect_cells(&self, _image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.log.lock().push((self.kind, "detect_cells"));
        self.cells.clone()
    }

    fn invalidate_sessions(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Erase fakes into the trait objects the switcher takes
pub fn shared(backends: &[&Arc<FakeBackend>]) -> Vec<Arc<dyn OcrBackend>> {
    backends
        .iter()
        .map(|b| Arc::clone(b) as Arc<dyn OcrBackend>)
        .collect()
}
