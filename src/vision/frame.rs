//! Coordinate frames of one invocation
//!
//! Detection runs on the working image, which is the decoded image after
//! downscaling, orientation correction and rectification. A [`FrameMap`]
//! records those steps in order so boxes can be carried back to the decoded
//! image.

use imageproc::geometric_transformations::Projection;

use super::types::BoundingBox;

/// One geometric step from a frame to the next
#[derive(Debug, Clone, Copy)]
pub enum FrameStep {
    /// Uniform resize by this factor
    Scale(f32),
    /// Clockwise rotation of a `width` x `height` image
    Rotate { degrees: u32, width: u32, height: u32 },
    /// Perspective warp from the previous frame into the next
    Warp(Projection),
}

impl FrameStep {
    /// Map a point of the next frame back into the previous one
    pub fn invert_point(&self, x: f32, y: f32) -> (f32, f32) {
        match *self {
            FrameStep::Scale(factor) if factor > 0.0 => (x / factor, y / factor),
            FrameStep::Scale(_) => (x, y),
            FrameStep::Rotate {
                degrees,
                width,
                height,
            } => {
                let (w, h) = (width as f32, height as f32);
                match degrees % 360 {
                    90 => (y, h - x),
                    180 => (w - x, h - y),
                    270 => (w - y, x),
                    _ => (x, y),
                }
            }
            FrameStep::Warp(projection) => projection.invert() * (x, y),
        }
    }
}

/// Ordered steps from the decoded image to the working image
#[derive(Debug, Clone, Default)]
pub struct FrameMap {
    steps: Vec<FrameStep>,
}

impl FrameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: FrameStep) {
        self.steps.push(step);
    }

    /// Append every step of `later`
    pub fn extend(&mut self, later: FrameMap) {
        self.steps.extend(later.steps);
    }

    pub fn steps(&self) -> &[FrameStep] {
        &self.steps
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn to_source_point(&self, x: f32, y: f32) -> (f32, f32) {
        self.steps
            .iter()
            .rev()
            .fold((x, y), |(x, y), step| step.invert_point(x, y))
    }

    /// Axis-aligned hull of the box's corners in the decoded image
    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        if self.is_identity() {
            return *bbox;
        }
        let corners = [
            (bbox.left, bbox.top),
            (bbox.right, bbox.top),
            (bbox.right, bbox.bottom),
            (bbox.left, bbox.bottom),
        ]
        .map(|(x, y)| self.to_source_point(x, y));

        let (mut left, mut top) = (f32::INFINITY, f32::INFINITY);
        let (mut right, mut bottom) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for (x, y) in corners {
            left = left.min(x);
            top = top.min(y);
            right = right.max(x);
            bottom = bottom.max(y);
        }
        BoundingBox::new(left, top, right, bottom, bbox.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_box(actual: BoundingBox, expected: [f32; 4]) {
        for (a, e) in actual.to_array().iter().zip(expected) {
            assert!((a - e).abs() < 1e-3, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_rotations_undo_image_rotation() {
        // 10x20 image; a pixel near its top-left corner
        let bbox = BoundingBox::new(1.0, 2.0, 3.0, 5.0, 0.9);
        let cases = [
            (90, [15.0, 1.0, 18.0, 3.0]),
            (180, [7.0, 15.0, 9.0, 18.0]),
            (270, [2.0, 7.0, 5.0, 9.0]),
        ];
        for (degrees, rotated) in cases {
            let mut frame = FrameMap::new();
            frame.push(FrameStep::Rotate {
                degrees,
                width: 10,
                height: 20,
            });
            let rotated = BoundingBox::new(rotated[0], rotated[1], rotated[2], rotated[3], 0.9);
            assert_box(frame.to_source(&rotated), bbox.to_array());
        }
    }

    #[test]
    fn test_steps_undo_in_reverse_order() {
        let mut frame = FrameMap::new();
        frame.push(FrameStep::Scale(0.5));
        frame.push(FrameStep::Warp(Projection::translate(-20.0, 0.0)));

        let mapped = frame.to_source(&BoundingBox::new(0.0, 0.0, 10.0, 10.0, 0.7));
        assert_box(mapped, [40.0, 0.0, 60.0, 20.0]);
        assert_eq!(mapped.score, 0.7);
    }

    #[test]
    fn test_empty_frame_is_identity() {
        let bbox = BoundingBox::new(1.0, 2.0, 3.0, 4.0, 0.5);
        let frame = FrameMap::default();
        assert!(frame.is_identity());
        assert_eq!(frame.to_source(&bbox), bbox);
    }
}
