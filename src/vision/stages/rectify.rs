//! Document rectification
//!
//! Finds the page outline as the largest four-sided contour of an Otsu
//! binarization and warps it to an upright rectangle.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;
use tracing::debug;

use super::{Rectification, Rectifier};

/// Outline detection thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadRectifier {
    /// Minimum quad area as a fraction of the image
    pub min_area_ratio: f32,
    /// Polygon simplification tolerance as a fraction of the perimeter
    pub epsilon_ratio: f64,
    /// Quads covering more than this fraction are treated as already flat
    pub max_area_ratio: f32,
}

impl Default for QuadRectifier {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.2,
            epsilon_ratio: 0.02,
            max_area_ratio: 0.95,
        }
    }
}

/// Shoelace area of a closed polygon
fn polygon_area(points: &[Point<i32>]) -> f32 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: i64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
        })
        .sum();
    (twice.abs() as f32) / 2.0
}

/// Order corners as top-left, top-right, bottom-right, bottom-left
pub fn order_corners(points: &[Point<i32>; 4]) -> [(f32, f32); 4] {
    let as_f = |p: &Point<i32>| (p.x as f32, p.y as f32);
    let by = |key: fn(&(f32, f32)) -> f32, max: bool| {
        let mut best = as_f(&points[0]);
        for p in points.iter().map(as_f) {
            let better = if max { key(&p) > key(&best) } else { key(&p) < key(&best) };
            if better {
                best = p;
            }
        }
        best
    };

    let top_left = by(|p| p.0 + p.1, false);
    let bottom_right = by(|p| p.0 + p.1, true);
    let top_right = by(|p| p.0 - p.1, true);
    let bottom_left = by(|p| p.0 - p.1, false);
    [top_left, top_right, bottom_right, bottom_left]
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

impl QuadRectifier {
    /// Largest plausible page quad in `gray`
    pub fn find_quad(&self, gray: &GrayImage) -> Option<[Point<i32>; 4]> {
        let level = otsu_level(gray);
        let binary = threshold(gray, level, ThresholdType::Binary);
        let image_area = (gray.width() * gray.height()) as f32;

        let mut best: Option<([Point<i32>; 4], f32)> = None;
        for contour in find_contours::<i32>(&binary) {
            if contour.border_type != BorderType::Outer || contour.points.len() < 4 {
                continue;
            }
            let epsilon = arc_length(&contour.points, true) * self.epsilon_ratio;
            let polygon = approximate_polygon_dp(&contour.points, epsilon, true);
            let Ok(quad) = <[Point<i32>; 4]>::try_from(polygon) else {
                continue;
            };
            let area = polygon_area(&quad);
            if area < image_area * self.min_area_ratio {
                continue;
            }
            if best.as_ref().map_or(true, |(_, a)| area > *a) {
                best = Some((quad, area));
            }
        }

        let (quad, area) = best?;
        if area > image_area * self.max_area_ratio {
            debug!("Page outline covers the whole image, skipping rectification");
            return None;
        }
        Some(quad)
    }
}

impl Rectifier for QuadRectifier {
    fn rectify(&self, image: &RgbImage) -> Option<Rectification> {
        let gray = image::imageops::grayscale(image);
        let quad = self.find_quad(&gray)?;
        let [tl, tr, br, bl] = order_corners(&quad);

        let width = distance(tl, tr).max(distance(bl, br)).round() as u32;
        let height = distance(tl, bl).max(distance(tr, br)).round() as u32;
        if width < 2 || height < 2 {
            return None;
        }

        let target = [
            (0.0, 0.0),
            ((width - 1) as f32, 0.0),
            ((width - 1) as f32, (height - 1) as f32),
            (0.0, (height - 1) as f32),
        ];
        let projection = Projection::from_control_points([tl, tr, br, bl], target)?;

        let mut out = RgbImage::new(width, height);
        warp_into(
            image,
            &projection,
            Interpolation::Bilinear,
            Rgb([255, 255, 255]),
            &mut out,
        );
        debug!(
            "Rectified {}x{} page from {}x{} image",
            width,
            height,
            image.width(),
            image.height()
        );
        Some(Rectification {
            image: out,
            projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn page_on_background(width: u32, height: u32, rect: (u32, u32, u32, u32)) -> RgbImage {
        let mut image = RgbImage::from_pixel(width, height, Rgb([20, 20, 20]));
        let (x0, y0, x1, y1) = rect;
        for y in y0..y1 {
            for x in x0..x1 {
                image.put_pixel(x, y, Rgb([240, 240, 240]));
            }
        }
        image
    }

    #[test]
    fn test_polygon_area() {
        let square = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&square), 100.0);
    }

    #[test]
    fn test_order_corners() {
        let quad = [
            Point::new(90, 80),
            Point::new(10, 10),
            Point::new(10, 85),
            Point::new(95, 5),
        ];
        let ordered = order_corners(&quad);
        assert_eq!(ordered[0], (10.0, 10.0));
        assert_eq!(ordered[1], (95.0, 5.0));
        assert_eq!(ordered[2], (90.0, 80.0));
        assert_eq!(ordered[3], (10.0, 85.0));
    }

    #[test]
    fn test_finds_page_quad() {
        let image = page_on_background(100, 80, (20, 10, 80, 70));
        let gray = image::imageops::grayscale(&image);
        let quad = QuadRectifier::default().find_quad(&gray).unwrap();
        let area = polygon_area(&quad);
        assert!(area > 3000.0 && area < 3800.0, "area {}", area);
    }

    #[test]
    fn test_rectify_crops_to_page() {
        let image = page_on_background(100, 80, (20, 10, 80, 70));
        let Rectification {
            image: out,
            projection,
        } = QuadRectifier::default().rectify(&image).unwrap();
        let (w, h) = out.dimensions();
        assert!((55..=62).contains(&w), "width {}", w);
        assert!((55..=62).contains(&h), "height {}", h);
        // Page interior is bright
        assert!(out.get_pixel(w / 2, h / 2).0[0] > 200);

        // The page corner lands at the output origin and back
        let (x, y) = projection * (20.0, 10.0);
        assert!(x.abs() < 2.0 && y.abs() < 2.0, "corner at {:?}", (x, y));
        let (x, y) = projection.invert() * (0.0, 0.0);
        assert!((x - 20.0).abs() < 2.0 && (y - 10.0).abs() < 2.0, "origin from {:?}", (x, y));
    }

    #[test]
    fn test_blank_image_is_not_rectified() {
        let image = RgbImage::from_pixel(50, 50, Rgb([255, 255, 255]));
        assert!(QuadRectifier::default().rectify(&image).is_none());

        let gray = GrayImage::from_pixel(10, 10, Luma([0]));
        assert!(QuadRectifier::default().find_quad(&gray).is_none());
    }
}
