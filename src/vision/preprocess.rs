//! Image to tensor conversion for the OCR models
//!
//! Handles resizing, normalization and NCHW layout for detection,
//! recognition and classification inputs.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array3, Array4};

use super::types::BoundingBox;

/// Per-channel normalization applied after scaling pixels to [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    /// Mean values [R, G, B]
    pub mean: [f32; 3],
    /// Std values [R, G, B]
    pub std: [f32; 3],
}

impl Normalization {
    /// PaddleOCR detection/recognition: maps [0, 255] to [-1, 1]
    pub const PADDLE: Self = Self {
        mean: [0.5, 0.5, 0.5],
        std: [0.5, 0.5, 0.5],
    };

    /// ImageNet statistics used by the PP-LCNet classifiers
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
}

/// Flat NCHW tensor ready to hand to a runtime
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl InputTensor {
    fn from_array(array: Array4<f32>) -> Self {
        let shape = array.shape().to_vec();
        let (data, _offset) = array.into_raw_vec_and_offset();
        Self { shape, data }
    }
}

/// Convert an RGB image to an HWC f32 array in [0, 1]
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            rgb[[y as usize, x as usize, c]] = pixel.0[c] as f32 / 255.0;
        }
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, norm: &Normalization) -> Array3<f32> {
    let (h, w, _) = image.dim();
    let mut normalized = Array3::<f32>::zeros((h, w, 3));

    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                normalized[[y, x, c]] = (image[[y, x, c]] - norm.mean[c]) / norm.std[c];
            }
        }
    }

    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

/// Stretch to exactly `width` x `height` and normalize.
///
/// Used for detector and classifier inputs; callers keep the scale factors
/// needed to map outputs back.
pub fn prepare_fixed(image: &RgbImage, width: u32, height: u32, norm: &Normalization) -> InputTensor {
    let resized = if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width, height, FilterType::Triangle)
    };
    let normalized = normalize(&rgb_to_f32(&resized), norm);
    InputTensor::from_array(hwc_to_nchw(&normalized))
}

/// Fixed-height recognition input, aspect preserved, right-padded with zeros to `width`
pub fn prepare_recognition(image: &RgbImage, height: u32, width: u32, norm: &Normalization) -> InputTensor {
    let (src_w, src_h) = image.dimensions();
    let scale = height as f32 / src_h.max(1) as f32;
    let new_w = ((src_w as f32 * scale).ceil() as u32).clamp(1, width);

    let resized = imageops::resize(image, new_w, height, FilterType::Triangle);
    let normalized = hwc_to_nchw(&normalize(&rgb_to_f32(&resized), norm));

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for c in 0..3 {
        for y in 0..height as usize {
            for x in 0..new_w as usize {
                tensor[[0, c, y, x]] = normalized[[0, c, y, x]];
            }
        }
    }

    InputTensor::from_array(tensor)
}

/// Crop `bbox` (image frame) out of `image`, grown by `padding` pixels per side.
///
/// Returns `None` when the clamped region is empty.
pub fn crop_box(image: &RgbImage, bbox: &BoundingBox, padding: f32) -> Option<RgbImage> {
    let (img_w, img_h) = image.dimensions();
    let padded = BoundingBox::new(
        bbox.left - padding,
        bbox.top - padding,
        bbox.right + padding,
        bbox.bottom + padding,
        bbox.score,
    )
    .clamped(img_w as f32, img_h as f32);

    let x = padded.left.floor() as u32;
    let y = padded.top.floor() as u32;
    let right = (padded.right.ceil() as u32).min(img_w);
    let bottom = (padded.bottom.ceil() as u32).min(img_h);
    if right <= x || bottom <= y {
        return None;
    }

    Some(imageops::crop_imm(image, x, y, right - x, bottom - y).to_image())
}

/// Downscale so the longest side is at most `max_side`. Returns the scale applied (<= 1).
pub fn fit_within(image: &RgbImage, max_side: u32) -> Option<(RgbImage, f32)> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if max_side == 0 || longest <= max_side {
        return None;
    }
    let scale = max_side as f32 / longest as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    Some((imageops::resize(image, new_w, new_h, FilterType::Triangle), scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_to_f32() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 255, 0]));

        let rgb = rgb_to_f32(&image);

        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 0.01); // R = 1.0
        assert!(rgb[[0, 0, 1]].abs() < 0.01); // G = 0.0
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc = Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| (h * 100 + w * 10 + c) as f32);

        let nchw = hwc_to_nchw(&hwc);

        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
    }

    #[test]
    fn test_normalize_paddle_range() {
        let image = Array3::<f32>::from_elem((1, 2, 3), 1.0);
        let normalized = normalize(&image, &Normalization::PADDLE);
        assert!((normalized[[0, 0, 0]] - 1.0).abs() < 1e-6);

        let image = Array3::<f32>::zeros((1, 1, 3));
        let normalized = normalize(&image, &Normalization::PADDLE);
        assert!((normalized[[0, 0, 2]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_fixed_shape() {
        let image = RgbImage::from_pixel(50, 30, Rgb([128, 128, 128]));
        let tensor = prepare_fixed(&image, 64, 32, &Normalization::PADDLE);
        assert_eq!(tensor.shape, vec![1, 3, 32, 64]);
        assert_eq!(tensor.data.len(), 3 * 32 * 64);
    }

    #[test]
    fn test_prepare_recognition_pads_right() {
        let image = RgbImage::from_pixel(20, 10, Rgb([255, 255, 255]));
        let tensor = prepare_recognition(&image, 48, 320, &Normalization::PADDLE);
        assert_eq!(tensor.shape, vec![1, 3, 48, 320]);

        // Content occupies the first 96 columns (20 * 4.8), padding is zero
        let row = &tensor.data[..320];
        assert!((row[0] - 1.0).abs() < 0.01);
        assert_eq!(row[319], 0.0);
    }

    #[test]
    fn test_prepare_recognition_caps_width() {
        let image = RgbImage::new(1000, 10);
        let tensor = prepare_recognition(&image, 48, 320, &Normalization::PADDLE);
        assert_eq!(tensor.shape, vec![1, 3, 48, 320]);
    }

    #[test]
    fn test_crop_box_clamps() {
        let image = RgbImage::new(40, 20);
        let crop = crop_box(&image, &BoundingBox::new(30.0, 10.0, 60.0, 40.0, 1.0), 2.0).unwrap();
        assert_eq!(crop.dimensions(), (12, 12));

        assert!(crop_box(&image, &BoundingBox::new(50.0, 30.0, 60.0, 40.0, 1.0), 0.0).is_none());
    }

    #[test]
    fn test_fit_within() {
        let image = RgbImage::new(4000, 1000);
        let (resized, scale) = fit_within(&image, 1600).unwrap();
        assert_eq!(resized.dimensions(), (1600, 400));
        assert!((scale - 0.4).abs() < 1e-6);

        assert!(fit_within(&RgbImage::new(100, 100), 1600).is_none());
    }
}
