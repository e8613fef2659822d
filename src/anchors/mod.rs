//! Anchor grids and the memoized per-head anchor cache.
//!
//! Anchors are laid out on a regular grid over score-map cells, one group of
//! base anchors per cell. The flattened ordering is row-major over cells with
//! the base anchor as the minor index, which must match the channel reshaping
//! used for classification and regression tensors. The per-head cache is
//! populated once for a fixed score-map size; anchors are stored re-centered
//! so the grid's geometric center sits at the origin, which makes later
//! placement onto a search region a pure translation.

use std::sync::OnceLock;

use crate::bbox::BoxXyxy;
use crate::util::math::hanning;
use crate::util::{SiamRpnError, SiamRpnResult};

/// Score-map size in cells, `(height, width)`.
pub type ScoreMapSize = (usize, usize);

/// Backend that produces grid anchors for a score-map size.
pub trait AnchorGenerator {
    /// Number of base anchors per grid cell.
    fn num_base_anchors(&self) -> usize;

    /// Anchor stride in pixels, `(stride_x, stride_y)`.
    fn strides(&self) -> (usize, usize);

    /// All anchors for a score-map size, in image top-left-origin coordinates.
    ///
    /// Ordering is row-major over cells, base-anchor-minor; length is
    /// `height * width * num_base_anchors`.
    fn grid_priors(&self, size: ScoreMapSize) -> Vec<BoxXyxy>;

    /// Separable 2-D Hanning window, one value per anchor.
    ///
    /// Values follow the anchor flattening order, so every base anchor of a
    /// cell carries that cell's window value. Used at inference as a
    /// centering prior.
    fn hanning_windows(&self, size: ScoreMapSize) -> Vec<f32> {
        let (h, w) = size;
        let win_h = hanning(h);
        let win_w = hanning(w);
        let reps = self.num_base_anchors();
        let mut out = Vec::with_capacity(h * w * reps);
        for wy in &win_h {
            for wx in &win_w {
                let v = wy * wx;
                for _ in 0..reps {
                    out.push(v);
                }
            }
        }
        out
    }
}

/// Multi-ratio, multi-scale anchor generator for a single pyramid stride.
///
/// Base anchors are centered on the cell origin; widths and heights follow
/// `w = stride * scale / sqrt(ratio)`, `h = stride * scale * sqrt(ratio)`,
/// enumerated ratio-major then scale-minor.
#[derive(Clone, Debug)]
pub struct SiamRpnAnchorGenerator {
    strides: (usize, usize),
    base_anchors: Vec<BoxXyxy>,
}

impl SiamRpnAnchorGenerator {
    /// Creates a generator from a stride, aspect ratios and scales.
    pub fn new(stride: usize, ratios: &[f32], scales: &[f32]) -> SiamRpnResult<Self> {
        if stride == 0 {
            return Err(SiamRpnError::InvalidInput("anchor stride must be > 0"));
        }
        if ratios.is_empty() || scales.is_empty() {
            return Err(SiamRpnError::InvalidInput(
                "anchor ratios and scales must be non-empty",
            ));
        }
        let base = stride as f32;
        let mut base_anchors = Vec::with_capacity(ratios.len() * scales.len());
        for &ratio in ratios {
            if ratio <= 0.0 {
                return Err(SiamRpnError::InvalidInput("anchor ratio must be > 0"));
            }
            let h_ratio = ratio.sqrt();
            for &scale in scales {
                let w = base * scale / h_ratio;
                let h = base * scale * h_ratio;
                base_anchors.push(BoxXyxy::new(-0.5 * w, -0.5 * h, 0.5 * w, 0.5 * h));
            }
        }
        Ok(Self {
            strides: (stride, stride),
            base_anchors,
        })
    }

    /// The generator used by the reference tracker configuration:
    /// stride 8, ratios `[0.33, 0.5, 1, 2, 3]`, a single scale of 8.
    pub fn siamese_rpn_default() -> Self {
        Self::new(8, &[0.33, 0.5, 1.0, 2.0, 3.0], &[8.0])
            .expect("default anchor parameters are valid")
    }
}

impl AnchorGenerator for SiamRpnAnchorGenerator {
    fn num_base_anchors(&self) -> usize {
        self.base_anchors.len()
    }

    fn strides(&self) -> (usize, usize) {
        self.strides
    }

    fn grid_priors(&self, size: ScoreMapSize) -> Vec<BoxXyxy> {
        let (h, w) = size;
        let (stride_x, stride_y) = self.strides;
        let mut out = Vec::with_capacity(h * w * self.base_anchors.len());
        for y in 0..h {
            for x in 0..w {
                let dx = (x * stride_x) as f32;
                let dy = (y * stride_y) as f32;
                for base in &self.base_anchors {
                    out.push(base.translated(dx, dy));
                }
            }
        }
        out
    }
}

struct CachedAnchors {
    size: ScoreMapSize,
    boxes: Vec<BoxXyxy>,
}

struct CachedWindows {
    size: ScoreMapSize,
    values: Vec<f32>,
}

/// Lazily populated anchor/window storage owned by one head instance.
///
/// Each slot is filled at most once via `OnceLock`, so a head shared across
/// threads cannot race on first population. Querying with a different size
/// after population fails with `CacheSizeConflict` rather than silently
/// reusing a stale grid.
pub(crate) struct AnchorCache {
    anchors: OnceLock<CachedAnchors>,
    windows: OnceLock<CachedWindows>,
}

impl AnchorCache {
    pub(crate) fn new() -> Self {
        Self {
            anchors: OnceLock::new(),
            windows: OnceLock::new(),
        }
    }

    /// Anchors for `size`, re-centered onto the grid center.
    pub(crate) fn grid_centered_anchors(
        &self,
        generator: &dyn AnchorGenerator,
        size: ScoreMapSize,
    ) -> SiamRpnResult<&[BoxXyxy]> {
        let entry = self.anchors.get_or_init(|| {
            let (h, w) = size;
            let (stride_x, stride_y) = generator.strides();
            let shift_x = ((w / 2) * stride_x) as f32;
            let shift_y = ((h / 2) * stride_y) as f32;
            let boxes = generator
                .grid_priors(size)
                .into_iter()
                .map(|b| b.translated(-shift_x, -shift_y))
                .collect();
            CachedAnchors { size, boxes }
        });
        if entry.size != size {
            return Err(SiamRpnError::CacheSizeConflict {
                cached: entry.size,
                requested: size,
            });
        }
        Ok(&entry.boxes)
    }

    /// Hanning window for `size`, one value per anchor.
    pub(crate) fn windows(
        &self,
        generator: &dyn AnchorGenerator,
        size: ScoreMapSize,
    ) -> SiamRpnResult<&[f32]> {
        let entry = self.windows.get_or_init(|| CachedWindows {
            size,
            values: generator.hanning_windows(size),
        });
        if entry.size != size {
            return Err(SiamRpnError::CacheSizeConflict {
                cached: entry.size,
                requested: size,
            });
        }
        Ok(&entry.values)
    }
}

#[cfg(test)]
mod tests {
    use super::{AnchorCache, AnchorGenerator, SiamRpnAnchorGenerator};
    use crate::util::SiamRpnError;

    #[test]
    fn anchor_count_matches_grid_times_base() {
        let generator = SiamRpnAnchorGenerator::siamese_rpn_default();
        let anchors = generator.grid_priors((25, 25));
        assert_eq!(anchors.len(), 25 * 25 * 5);
    }

    #[test]
    fn anchors_are_cell_major_base_minor() {
        let generator = SiamRpnAnchorGenerator::new(8, &[1.0], &[4.0, 8.0]).unwrap();
        let anchors = generator.grid_priors((3, 3));
        // Cell (1, 2) holds anchors 2 * (1*3 + 2) .. +2, both centered there.
        let idx = (3 + 2) * 2;
        for a in &anchors[idx..idx + 2] {
            let c = a.to_cxcywh();
            assert_eq!((c.cx, c.cy), (16.0, 8.0));
        }
        // Scale-minor within a cell.
        assert!(anchors[idx].width() < anchors[idx + 1].width());
    }

    #[test]
    fn cache_recenters_grid_on_origin() {
        let generator = SiamRpnAnchorGenerator::new(8, &[1.0], &[8.0]).unwrap();
        let cache = AnchorCache::new();
        let anchors = cache.grid_centered_anchors(&generator, (25, 25)).unwrap();
        // Center cell (12, 12) must land exactly on the origin.
        let center = anchors[12 * 25 + 12].to_cxcywh();
        assert_eq!((center.cx, center.cy), (0.0, 0.0));
    }

    #[test]
    fn cache_rejects_second_size() {
        let generator = SiamRpnAnchorGenerator::siamese_rpn_default();
        let cache = AnchorCache::new();
        cache.grid_centered_anchors(&generator, (25, 25)).unwrap();
        let err = cache
            .grid_centered_anchors(&generator, (17, 17))
            .unwrap_err();
        assert_eq!(
            err,
            SiamRpnError::CacheSizeConflict {
                cached: (25, 25),
                requested: (17, 17),
            }
        );
    }

    #[test]
    fn window_length_matches_anchor_count_and_peaks_at_center() {
        let generator = SiamRpnAnchorGenerator::siamese_rpn_default();
        let windows = generator.hanning_windows((25, 25));
        assert_eq!(windows.len(), 25 * 25 * 5);
        let center = (12 * 25 + 12) * 5;
        assert!((windows[center] - 1.0).abs() < 1e-6);
        assert!(windows[0].abs() < 1e-6);
    }
}
