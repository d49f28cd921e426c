//! Data model produced by one pipeline invocation
//!
//! Everything here is created fresh per invocation. Ids are unique within a
//! single invocation only.

use serde::{Deserialize, Serialize};

/// Coarse image category driving model and preprocessing selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    /// Flat paper document, worth rectifying and enhancing
    Document,
    /// Photo of an item or label in the wild
    #[default]
    ItemPhoto,
}

/// Structural category of the recognized content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Table,
    #[default]
    TextLabel,
}

/// Axis-aligned box in pixel coordinates of some reference frame.
///
/// The frame is not carried by the type; every function producing boxes
/// documents which frame it returns.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub score: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32, score: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
            score,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Non-empty area with right > left and bottom > top
    pub fn is_valid(&self) -> bool {
        self.right > self.left
            && self.bottom > self.top
            && self.left.is_finite()
            && self.top.is_finite()
            && self.right.is_finite()
            && self.bottom.is_finite()
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    /// Multiply every coordinate, keeping the score
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            left: self.left * sx,
            top: self.top * sy,
            right: self.right * sx,
            bottom: self.bottom * sy,
            score: self.score,
        }
    }

    /// Clamp into `[0, width] x [0, height]`
    pub fn clamped(&self, width: f32, height: f32) -> Self {
        Self {
            left: self.left.clamp(0.0, width),
            top: self.top.clamp(0.0, height),
            right: self.right.clamp(0.0, width),
            bottom: self.bottom.clamp(0.0, height),
            score: self.score,
        }
    }

    /// Smallest box covering both
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
            score: self.score.max(other.score),
        }
    }

    /// `[left, top, right, bottom]`
    pub fn to_array(&self) -> [f32; 4] {
        [self.left, self.top, self.right, self.bottom]
    }
}

/// Text and mean per-character confidence from one recognition call
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

impl Recognition {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// One recognized span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// User-editable unit (line, cell sub-span, or single character after a split)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: u64,
    pub tokens: Vec<Token>,
    pub confidence: f32,
    /// Empty when the group has no valid geometry
    pub bbox: Option<BoundingBox>,
}

impl Group {
    /// Tokens joined by single spaces
    pub fn text(&self) -> String {
        self.tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Table cell with grid coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    pub id: u64,
    pub text: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub row_index: Option<usize>,
    pub col_index: Option<usize>,
    pub row_span: usize,
    pub col_span: usize,
}

/// Geometry of the image that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Size as decoded from the source, before orientation correction
    pub original_width: u32,
    pub original_height: u32,
    /// Size of the image the models actually saw
    pub working_width: u32,
    pub working_height: u32,
    /// Clockwise rotation applied by orientation correction
    pub rotation_degrees: u32,
    pub rectified: bool,
    pub enhanced: bool,
    /// Working-frame to output-frame multiplier
    pub scale: f32,
}

/// Externally visible result of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub scene: Scene,
    pub layout: Layout,
    pub image_meta: ImageMeta,
    pub result: Vec<Group>,
    pub table: Option<Vec<TableCell>>,
}

impl PipelineOutput {
    /// Well-formed output with nothing recognized
    pub fn empty(image_meta: ImageMeta) -> Self {
        Self {
            scene: Scene::default(),
            layout: Layout::default(),
            image_meta,
            result: Vec::new(),
            table: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty() && self.table.as_ref().map_or(true, |t| t.is_empty())
    }

    /// All group texts, one per line
    pub fn full_text(&self) -> String {
        self.result
            .iter()
            .map(Group::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Hands out ids unique within one invocation
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}
