//! Table Structure Assignment
//!
//! Clusters cell boxes into rows and columns and infers spans by matching
//! each box against row/column bands.

use tracing::debug;

use super::types::{BoundingBox, TableCell};

/// Threshold used when no box is big enough to measure
pub const DEFAULT_THRESHOLD: f32 = 12.0;
/// Fraction of the shorter span that must overlap a band
pub const BAND_OVERLAP_RATIO: f32 = 0.3;
/// Boxes this small or smaller are ignored when averaging sizes
const MIN_MEASURABLE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Row,
    Column,
}

impl Axis {
    fn span(self, b: &BoundingBox) -> (f32, f32) {
        match self {
            Axis::Row => (b.top, b.bottom),
            Axis::Column => (b.left, b.right),
        }
    }

    fn center(self, b: &BoundingBox) -> f32 {
        let (start, end) = self.span(b);
        (start + end) / 2.0
    }
}

/// Half the mean extent along `axis`, or the default with nothing to measure
fn adaptive_threshold(boxes: &[BoundingBox], axis: Axis) -> f32 {
    let extents: Vec<f32> = boxes
        .iter()
        .map(|b| {
            let (start, end) = axis.span(b);
            end - start
        })
        .filter(|&e| e > MIN_MEASURABLE)
        .collect();

    if extents.is_empty() {
        DEFAULT_THRESHOLD
    } else {
        0.5 * extents.iter().sum::<f32>() / extents.len() as f32
    }
}

/// Greedy 1-D clustering on sorted values; returns cluster means in order
pub fn cluster_centers(values: &[f32], threshold: f32) -> Vec<f32> {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f32::total_cmp);

    // (sum, count) per cluster
    let mut clusters: Vec<(f32, usize)> = Vec::new();
    for value in sorted {
        match clusters.last_mut() {
            Some((sum, count)) if (value - *sum / *count as f32).abs() <= threshold => {
                *sum += value;
                *count += 1;
            }
            _ => clusters.push((value, 1)),
        }
    }

    clusters
        .into_iter()
        .map(|(sum, count)| sum / count as f32)
        .collect()
}

/// First hitting band and number of hits, or the nearest band with span 1
fn match_bands(span: (f32, f32), centers: &[f32], threshold: f32) -> Option<(usize, usize)> {
    if centers.is_empty() {
        return None;
    }
    let (start, end) = span;
    let span_len = (end - start).max(0.0);
    let band_len = 2.0 * threshold;

    let mut first = None;
    let mut hits = 0;
    for (index, &center) in centers.iter().enumerate() {
        let overlap = (end.min(center + threshold) - start.max(center - threshold)).max(0.0);
        let denominator = span_len.min(band_len);
        if denominator > 0.0 && overlap / denominator >= BAND_OVERLAP_RATIO {
            first.get_or_insert(index);
            hits += 1;
        }
    }

    match first {
        Some(index) => Some((index, hits)),
        None => {
            let middle = (start + end) / 2.0;
            let nearest = centers
                .iter()
                .enumerate()
                .min_by(|a, b| (a.1 - middle).abs().total_cmp(&(b.1 - middle).abs()))
                .map(|(i, _)| i)?;
            Some((nearest, 1))
        }
    }
}

/// Row and column bands derived from a set of boxes
#[derive(Debug, Clone, PartialEq)]
pub struct TableGrid {
    pub row_centers: Vec<f32>,
    pub col_centers: Vec<f32>,
    pub row_threshold: f32,
    pub col_threshold: f32,
}

impl TableGrid {
    pub fn from_boxes(boxes: &[BoundingBox]) -> Self {
        let row_threshold = adaptive_threshold(boxes, Axis::Row);
        let col_threshold = adaptive_threshold(boxes, Axis::Column);
        let rows: Vec<f32> = boxes.iter().map(|b| Axis::Row.center(b)).collect();
        let cols: Vec<f32> = boxes.iter().map(|b| Axis::Column.center(b)).collect();

        Self {
            row_centers: cluster_centers(&rows, row_threshold),
            col_centers: cluster_centers(&cols, col_threshold),
            row_threshold,
            col_threshold,
        }
    }

    /// (row, row_span) for a box
    pub fn row_of(&self, b: &BoundingBox) -> Option<(usize, usize)> {
        match_bands(Axis::Row.span(b), &self.row_centers, self.row_threshold)
    }

    /// (column, col_span) for a box
    pub fn col_of(&self, b: &BoundingBox) -> Option<(usize, usize)> {
        match_bands(Axis::Column.span(b), &self.col_centers, self.col_threshold)
    }
}

/// Fill in row/column indices and spans for every cell
pub fn assign(cells: &mut [TableCell]) {
    let boxes: Vec<BoundingBox> = cells.iter().map(|c| c.bbox).collect();
    let grid = TableGrid::from_boxes(&boxes);
    debug!(
        "Table grid: {} rows (t={:.1}), {} cols (t={:.1})",
        grid.row_centers.len(),
        grid.row_threshold,
        grid.col_centers.len(),
        grid.col_threshold
    );

    for cell in cells.iter_mut() {
        let row = grid.row_of(&cell.bbox);
        let col = grid.col_of(&cell.bbox);
        cell.row_index = row.map(|(i, _)| i);
        cell.row_span = row.map_or(1, |(_, s)| s);
        cell.col_index = col.map(|(i, _)| i);
        cell.col_span = col.map_or(1, |(_, s)| s);
    }
}
