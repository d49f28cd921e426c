//! Token splitting and whole-image word segmentation
//!
//! Recognition yields one string per crop. These helpers split it into
//! whitespace-separated tokens and give each token a share of the crop box
//! proportional to its character offsets.

use image::RgbImage;
use imageproc::contrast::otsu_level;

use super::types::{BoundingBox, Recognition, Token};

/// Split `recognition` into word tokens laid out across `bbox`
pub fn split_tokens(recognition: &Recognition, bbox: &BoundingBox) -> Vec<Token> {
    let text = recognition.text.trim();
    let total = text.chars().count();
    if total == 0 {
        return Vec::new();
    }

    let step = bbox.width() / total as f32;
    let mut tokens = Vec::new();
    let mut word_start: Option<usize> = None;
    let mut word = String::new();

    let mut flush = |start: usize, end: usize, word: &mut String| {
        if word.is_empty() {
            return;
        }
        let token_box = BoundingBox::new(
            bbox.left + step * start as f32,
            bbox.top,
            bbox.left + step * end as f32,
            bbox.bottom,
            bbox.score,
        );
        tokens.push(Token {
            text: std::mem::take(word),
            confidence: recognition.confidence,
            bbox: token_box,
        });
    };

    for (index, ch) in text.chars().enumerate() {
        if ch.is_whitespace() {
            if let Some(start) = word_start.take() {
                flush(start, index, &mut word);
            }
        } else {
            word_start.get_or_insert(index);
            word.push(ch);
        }
    }
    if let Some(start) = word_start {
        flush(start, total, &mut word);
    }

    tokens
}

/// Bounds of the pixels darker than the Otsu level, or `None` for a uniform image
pub fn ink_bounds(image: &RgbImage) -> Option<BoundingBox> {
    let gray = image::imageops::grayscale(image);
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if min >= max {
        return None;
    }
    // Otsu's lower class is everything at or below the level
    let level = otsu_level(&gray);

    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel.0[0] > level {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    let (x0, y0, x1, y1) = bounds?;
    Some(BoundingBox::new(
        x0 as f32,
        y0 as f32,
        (x1 + 1) as f32,
        (y1 + 1) as f32,
        1.0,
    ))
}

/// Segment a whole-image recognition into word tokens.
///
/// Words are laid out across the inked region, or the full image when the
/// image has no contrast.
pub fn segment_words(recognition: &Recognition, image: &RgbImage) -> Vec<Token> {
    let area = ink_bounds(image).unwrap_or_else(|| {
        BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32, 1.0)
    });
    split_tokens(recognition, &area)
}
