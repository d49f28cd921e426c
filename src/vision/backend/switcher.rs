//! Runtime Backend Switcher
//!
//! Picks a backend per call from the live backend mode and falls back in a
//! fixed, mode-specific order. The mode is observed through a watch channel
//! and cached, so the hot path never waits on the configuration owner.

use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{BackendKind, BackendMode, OcrBackend};
use crate::vision::cache::ClearableCache;
use crate::vision::types::{BoundingBox, Recognition, Scene};

struct ModeState {
    receiver: watch::Receiver<BackendMode>,
    current: BackendMode,
}

pub struct BackendSwitcher {
    backends: Vec<Arc<dyn OcrBackend>>,
    /// Session caches outside any backend, cleared with them
    caches: Vec<Arc<dyn ClearableCache>>,
    mode: Mutex<ModeState>,
}

impl BackendSwitcher {
    /// Follow a live mode setting
    pub fn new(backends: Vec<Arc<dyn OcrBackend>>, receiver: watch::Receiver<BackendMode>) -> Self {
        let current = *receiver.borrow();
        info!(
            "Backend switcher: mode={}, backends={:?}",
            current,
            backends.iter().map(|b| b.kind()).collect::<Vec<_>>()
        );
        Self {
            backends,
            caches: Vec::new(),
            mode: Mutex::new(ModeState { receiver, current }),
        }
    }

    /// Also clear `cache` whenever the backends are invalidated
    pub fn with_cache(mut self, cache: Arc<dyn ClearableCache>) -> Self {
        self.caches.push(cache);
        self
    }

    /// Use a fixed mode
    pub fn with_mode(backends: Vec<Arc<dyn OcrBackend>>, mode: BackendMode) -> Self {
        let (_sender, receiver) = watch::channel(mode);
        Self::new(backends, receiver)
    }

    pub fn backend(&self, kind: BackendKind) -> Option<&Arc<dyn OcrBackend>> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    /// Current mode; a change since the last call invalidates every backend's sessions
    pub fn mode(&self) -> BackendMode {
        let mut state = self.mode.lock();
        // A closed channel keeps the last observed mode
        if state.receiver.has_changed().unwrap_or(false) {
            let observed = *state.receiver.borrow_and_update();
            if observed != state.current {
                info!("Backend mode changed: {} -> {}", state.current, observed);
                state.current = observed;
                self.invalidate_all();
            }
        }
        state.current
    }

    /// Drop cached sessions in every backend and every attached cache
    pub fn invalidate_all(&self) {
        for backend in &self.backends {
            backend.invalidate_sessions();
        }
        for cache in &self.caches {
            let dropped = cache.clear_entries();
            debug!("{}: invalidated {} sessions", cache.cache_name(), dropped);
        }
    }

    /// Whether any backend can serve calls
    pub fn is_available(&self) -> bool {
        self.backends.iter().any(|b| b.is_available())
    }

    /// Ask backends in query order; the first non-empty answer wins.
    ///
    /// When every backend answers empty, the first empty answer is returned.
    fn query<T>(
        &self,
        operation: &str,
        call: impl Fn(&dyn OcrBackend) -> Option<T>,
        is_empty: impl Fn(&T) -> bool,
    ) -> Option<T> {
        let mode = self.mode();
        let mut empty_answer = None;

        for kind in mode.query_order() {
            let Some(backend) = self.backend(kind) else {
                continue;
            };
            if !backend.is_available() {
                debug!("{}: {} unavailable, skipping", operation, kind);
                continue;
            }
            match call(backend.as_ref()) {
                Some(value) if !is_empty(&value) => {
                    debug!("{}: answered by {}", operation, kind);
                    return Some(value);
                }
                Some(value) => {
                    debug!("{}: {} returned nothing", operation, kind);
                    empty_answer.get_or_insert(value);
                }
                None => debug!("{}: {} failed, falling back", operation, kind),
            }
        }

        empty_answer
    }

    pub fn detect(&self, scene: Scene, image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.query("detect", |b| b.detect(scene, image), Vec::is_empty)
    }

    pub fn infer(&self, scene: Scene, image: &RgbImage) -> Option<Recognition> {
        self.query("infer", |b| b.infer(scene, image), Recognition::is_empty)
    }

    pub fn detect_cells(&self, image: &RgbImage) -> Option<Vec<BoundingBox>> {
        self.query("detect_cells", |b| b.detect_cells(image), Vec::is_empty)
    }
}
