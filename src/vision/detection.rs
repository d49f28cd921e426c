//! Detection-map decoding
//!
//! Turns a per-pixel text probability map into axis-aligned boxes by
//! 8-connected flood fill over pixels above a threshold. Used for both text
//! line detection and table cell detection; the two differ only in model and
//! threshold.

use tracing::debug;

use super::types::BoundingBox;

/// Thresholds for turning a probability map into boxes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Pixels strictly above this probability are foreground
    pub threshold: f32,
    /// Components with fewer pixels are dropped as noise
    pub min_area: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            min_area: 16,
        }
    }
}

/// Scale factors from map coordinates to the original image.
///
/// Map -> resized detector input -> original image, then clamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScale {
    pub map_to_input: (f32, f32),
    pub input_to_image: (f32, f32),
    pub image_width: f32,
    pub image_height: f32,
}

impl FrameScale {
    pub fn new(
        map_size: (usize, usize),
        input_size: (u32, u32),
        image_size: (u32, u32),
    ) -> Self {
        let (map_w, map_h) = map_size;
        let (in_w, in_h) = input_size;
        let (img_w, img_h) = image_size;
        Self {
            map_to_input: (
                in_w as f32 / map_w.max(1) as f32,
                in_h as f32 / map_h.max(1) as f32,
            ),
            input_to_image: (
                img_w as f32 / in_w.max(1) as f32,
                img_h as f32 / in_h.max(1) as f32,
            ),
            image_width: img_w as f32,
            image_height: img_h as f32,
        }
    }

    /// Identity mapping for a map that already is the image
    pub fn identity(width: usize, height: usize) -> Self {
        Self {
            map_to_input: (1.0, 1.0),
            input_to_image: (1.0, 1.0),
            image_width: width as f32,
            image_height: height as f32,
        }
    }

    fn apply(&self, b: BoundingBox) -> BoundingBox {
        b.scaled(self.map_to_input.0, self.map_to_input.1)
            .scaled(self.input_to_image.0, self.input_to_image.1)
            .clamped(self.image_width, self.image_height)
    }
}

/// Borrowed single-channel probability map
#[derive(Debug, Clone, Copy)]
pub struct ProbabilityMap<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [f32],
}

impl<'a> ProbabilityMap<'a> {
    /// Interpret a raw output tensor of rank 2, 3 or 4.
    ///
    /// Channel and spatial axes are told apart by which dimension equals 1;
    /// channel-first wins when both candidates are 1. Only the first batch
    /// element is used.
    pub fn from_tensor(data: &'a [f32], shape: &[i64]) -> Option<Self> {
        let dims: Vec<usize> = shape
            .iter()
            .map(|&d| usize::try_from(d).ok())
            .collect::<Option<Vec<_>>>()?;

        let (height, width) = match dims.as_slice() {
            [h, w] => (*h, *w),
            [1, h, w] => (*h, *w),
            [h, w, 1] => (*h, *w),
            [_, 1, h, w] => (*h, *w),
            [_, h, w, 1] => (*h, *w),
            _ => {
                debug!("Detection map: unsupported shape {:?}", shape);
                return None;
            }
        };

        let plane = width.checked_mul(height)?;
        if plane == 0 || data.len() < plane {
            debug!(
                "Detection map: {}x{} plane does not fit {} values",
                width,
                height,
                data.len()
            );
            return None;
        }

        Some(Self {
            width,
            height,
            data: &data[..plane],
        })
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }
}

/// Connected foreground region in map coordinates (inclusive pixel bounds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Component {
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
    pub area: usize,
    /// Probability at the pixel the fill started from
    pub seed_score: f32,
}

impl Component {
    /// Pixel-edge rectangle in map coordinates
    pub fn to_box(&self) -> BoundingBox {
        BoundingBox::new(
            self.min_x as f32,
            self.min_y as f32,
            (self.max_x + 1) as f32,
            (self.max_y + 1) as f32,
            self.seed_score,
        )
    }
}

/// Label 8-connected components above `threshold`, keeping those of at least `min_area` pixels.
///
/// Uses an explicit stack so large maps cannot overflow the call stack.
pub fn extract_components(map: &ProbabilityMap<'_>, params: &DetectionParams) -> Vec<Component> {
    let (w, h) = (map.width, map.height);
    let mut visited = vec![false; w * h];
    let mut stack: Vec<usize> = Vec::new();
    let mut components = Vec::new();

    for seed in 0..w * h {
        if visited[seed] || !(map.data[seed] > params.threshold) {
            continue;
        }

        let (sx, sy) = (seed % w, seed / w);
        let mut component = Component {
            min_x: sx,
            min_y: sy,
            max_x: sx,
            max_y: sy,
            area: 0,
            seed_score: map.data[seed],
        };

        visited[seed] = true;
        stack.push(seed);

        while let Some(index) = stack.pop() {
            let (x, y) = (index % w, index / w);
            component.area += 1;
            component.min_x = component.min_x.min(x);
            component.max_x = component.max_x.max(x);
            component.min_y = component.min_y.min(y);
            component.max_y = component.max_y.max(y);

            let x0 = x.saturating_sub(1);
            let y0 = y.saturating_sub(1);
            let x1 = (x + 1).min(w - 1);
            let y1 = (y + 1).min(h - 1);
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let neighbor = ny * w + nx;
                    if !visited[neighbor] && map.at(nx, ny) > params.threshold {
                        visited[neighbor] = true;
                        stack.push(neighbor);
                    }
                }
            }
        }

        if component.area >= params.min_area {
            components.push(component);
        }
    }

    components
}

/// Decode a probability map into boxes in the original image frame, sorted by descending score
pub fn decode_map(map: &ProbabilityMap<'_>, params: &DetectionParams, scale: &FrameScale) -> Vec<BoundingBox> {
    let mut boxes: Vec<BoundingBox> = extract_components(map, params)
        .iter()
        .map(|c| scale.apply(c.to_box()))
        .filter(BoundingBox::is_valid)
        .collect();

    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    boxes
}

/// Decode a raw output tensor; `None` when the shape cannot be interpreted.
///
/// `input_size` is the detector input (width, height) and `image_size` the
/// frame the boxes should land in.
pub fn decode(
    data: &[f32],
    shape: &[i64],
    params: &DetectionParams,
    input_size: (u32, u32),
    image_size: (u32, u32),
) -> Option<Vec<BoundingBox>> {
    let map = ProbabilityMap::from_tensor(data, shape)?;
    let scale = FrameScale::new((map.width, map.height), input_size, image_size);
    let boxes = decode_map(&map, params, &scale);
    debug!(
        "Detection map {}x{} -> {} boxes (threshold {})",
        map.width,
        map.height,
        boxes.len(),
        params.threshold
    );
    Some(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: usize, height: usize) -> Vec<f32> {
        vec![0.0; width * height]
    }

    fn fill(data: &mut [f32], width: usize, x0: usize, y0: usize, x1: usize, y1: usize, value: f32) {
        for y in y0..y1 {
            for x in x0..x1 {
                data[y * width + x] = value;
            }
        }
    }

    #[test]
    fn test_all_zero_map_yields_no_boxes() {
        let data = blank(32, 32);
        let boxes = decode(&data, &[1, 1, 32, 32], &DetectionParams::default(), (32, 32), (32, 32)).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_single_blob_yields_one_box() {
        let mut data = blank(32, 32);
        fill(&mut data, 32, 4, 6, 14, 10, 0.9);
        let params = DetectionParams::default();
        let boxes = decode(&data, &[1, 1, 32, 32], &params, (32, 32), (32, 32)).unwrap();

        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert_eq!(b.to_array(), [4.0, 6.0, 14.0, 10.0]);
        assert!(b.width() * b.height() >= params.min_area as f32);
        assert!((b.score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_small_components_are_noise() {
        let mut data = blank(16, 16);
        fill(&mut data, 16, 2, 2, 4, 4, 0.8);
        let boxes = decode(&data, &[1, 16, 16], &DetectionParams::default(), (16, 16), (16, 16)).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        let mut data = blank(8, 8);
        for i in 0..8 {
            data[i * 8 + i] = 0.7;
        }
        let params = DetectionParams {
            threshold: 0.5,
            min_area: 8,
        };
        let map = ProbabilityMap::from_tensor(&data, &[8, 8]).unwrap();
        let components = extract_components(&map, &params);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].area, 8);
    }

    #[test]
    fn test_boxes_rescaled_and_sorted() {
        // 4x downsampled map, detector input 64x64, original 128x32
        let mut data = blank(16, 16);
        fill(&mut data, 16, 0, 0, 4, 4, 0.6);
        fill(&mut data, 16, 8, 8, 12, 12, 0.95);
        let boxes = decode(&data, &[1, 16, 16, 1], &DetectionParams::default(), (64, 64), (128, 32)).unwrap();

        assert_eq!(boxes.len(), 2);
        assert!(boxes[0].score > boxes[1].score);
        // Map [8,12) -> input [32,48) -> image x [64,96), y [16,24)
        assert_eq!(boxes[0].to_array(), [64.0, 16.0, 96.0, 24.0]);
    }

    #[test]
    fn test_boxes_clamped_to_image() {
        let mut data = blank(8, 8);
        fill(&mut data, 8, 4, 4, 8, 8, 0.9);
        let boxes = decode(&data, &[1, 1, 8, 8], &DetectionParams::default(), (8, 8), (6, 6)).unwrap();
        assert_eq!(boxes.len(), 1);
        assert!(boxes[0].right <= 6.0 && boxes[0].bottom <= 6.0);
    }

    #[test]
    fn test_unusable_shapes() {
        let data = blank(4, 4);
        assert!(ProbabilityMap::from_tensor(&data, &[1, 2, 4, 4]).is_none());
        assert!(ProbabilityMap::from_tensor(&data, &[1, 1, 8, 8]).is_none());
        assert!(ProbabilityMap::from_tensor(&data, &[16]).is_none());
        assert!(ProbabilityMap::from_tensor(&data, &[-1, 4]).is_none());
    }

    #[test]
    fn test_large_blob_does_not_overflow() {
        let data = vec![0.9; 1024 * 1024];
        let map = ProbabilityMap::from_tensor(&data, &[1024, 1024]).unwrap();
        let components = extract_components(&map, &DetectionParams::default());
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].area, 1024 * 1024);
    }
}
