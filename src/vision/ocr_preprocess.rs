//! Enhancement filters for document photos
//!
//! Contrast stretch and unsharp-style sharpening applied to Document scenes
//! before detection. Item photos are left untouched.

use image::RgbImage;
use tracing::debug;

use super::stages::Enhancer;

/// Enhancement strengths
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhanceSettings {
    /// Factor > 1.0 increases contrast, < 1.0 decreases
    pub contrast: f32,
    /// 0.0 = no sharpening, 1.0 = strong sharpening
    pub sharpen: f32,
}

impl Default for EnhanceSettings {
    fn default() -> Self {
        Self {
            contrast: 1.3,
            sharpen: 0.4,
        }
    }
}

impl EnhanceSettings {
    fn is_noop(&self) -> bool {
        (self.contrast - 1.0).abs() <= 0.01 && self.sharpen <= 0.01
    }
}

/// Contrast + sharpen enhancer
#[derive(Debug, Clone, Default)]
pub struct ContrastSharpenEnhancer {
    settings: EnhanceSettings,
}

impl ContrastSharpenEnhancer {
    pub fn new(settings: EnhanceSettings) -> Self {
        Self { settings }
    }
}

impl Enhancer for ContrastSharpenEnhancer {
    fn enhance(&self, image: &RgbImage) -> Option<RgbImage> {
        if self.settings.is_noop() {
            return None;
        }

        debug!(
            "Enhancing {}x{}: contrast={}, sharpen={}",
            image.width(),
            image.height(),
            self.settings.contrast,
            self.settings.sharpen
        );

        let mut result = image.clone();
        if (self.settings.contrast - 1.0).abs() > 0.01 {
            apply_contrast(&mut result, self.settings.contrast);
        }
        if self.settings.sharpen > 0.01 {
            result = apply_sharpen(&result, self.settings.sharpen);
        }
        Some(result)
    }
}

/// Contrast around the midpoint (128)
fn apply_contrast(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let adjusted = ((*channel as f32 - 128.0) * factor + 128.0).clamp(0.0, 255.0);
            *channel = adjusted as u8;
        }
    }
}

/// 3x3 cross sharpen kernel; border pixels are copied unchanged
fn apply_sharpen(image: &RgbImage, strength: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut result = image.clone();
    if w < 3 || h < 3 {
        return result;
    }

    // Center weight is 1 + 4*strength, neighbors are -strength
    let center_weight = 1.0 + 4.0 * strength;
    let neighbor_weight = -strength;

    for y in 1..(h - 1) {
        for x in 1..(w - 1) {
            let top = image.get_pixel(x, y - 1).0;
            let bottom = image.get_pixel(x, y + 1).0;
            let left = image.get_pixel(x - 1, y).0;
            let right = image.get_pixel(x + 1, y).0;
            let center = image.get_pixel(x, y).0;

            let out = result.get_pixel_mut(x, y);
            for c in 0..3 {
                let sharpened = center[c] as f32 * center_weight
                    + (top[c] as f32 + bottom[c] as f32 + left[c] as f32 + right[c] as f32)
                        * neighbor_weight;
                out.0[c] = sharpened.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_contrast_increase() {
        let mut image = RgbImage::from_pixel(1, 1, Rgb([100, 128, 200]));
        apply_contrast(&mut image, 2.0);
        // 100: (100-128)*2+128 = 72
        // 200: (200-128)*2+128 = 272 -> clamped to 255
        assert_eq!(image.get_pixel(0, 0).0, [72, 128, 255]);
    }

    #[test]
    fn test_sharpen_flat_image_unchanged() {
        let image = RgbImage::from_pixel(5, 5, Rgb([90, 90, 90]));
        let sharpened = apply_sharpen(&image, 0.8);
        assert_eq!(sharpened, image);
    }

    #[test]
    fn test_sharpen_boosts_edges() {
        let mut image = RgbImage::from_pixel(5, 5, Rgb([50, 50, 50]));
        image.put_pixel(2, 2, Rgb([150, 150, 150]));
        let sharpened = apply_sharpen(&image, 0.5);
        assert!(sharpened.get_pixel(2, 2).0[0] > 150);
        assert!(sharpened.get_pixel(2, 1).0[0] < 50);
    }

    #[test]
    fn test_noop_settings_pass_through() {
        let enhancer = ContrastSharpenEnhancer::new(EnhanceSettings {
            contrast: 1.0,
            sharpen: 0.0,
        });
        assert!(enhancer.enhance(&RgbImage::new(4, 4)).is_none());
    }

    #[test]
    fn test_default_enhancer_produces_new_image() {
        let enhancer = ContrastSharpenEnhancer::default();
        let image = RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]));
        let enhanced = enhancer.enhance(&image).unwrap();
        assert_eq!(enhanced.dimensions(), (4, 4));
        assert!(enhanced.get_pixel(0, 0).0[0] > 200);
    }
}
