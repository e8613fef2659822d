//! Dense per-anchor supervision targets for exemplar/search training pairs.
//!
//! A positive pair (the search image truly contains the exemplar target) goes
//! through IoU assignment and balanced sampling; a negative pair marks a small
//! neighborhood around where the non-matching target projects onto the grid
//! and samples negatives from it. Per-class label-weight masses are 0.5 each
//! so a sample contributes at most 1 in total, and the batch assembly divides
//! all weights by the batch size so sum-reduced losses average correctly.

use ndarray::{Array2, Array3, ArrayViewMut2, s};
use rand::seq::index::sample;

use super::SiameseRpnHead;
use crate::anchors::ScoreMapSize;
use crate::bbox::{BoxXyxy, BoxCxcywh};
use crate::trace::{trace_event, trace_span};
use crate::util::{SiamRpnError, SiamRpnResult};

/// One training sample's ground truth.
#[derive(Clone, Copy, Debug)]
pub struct GtInstance {
    /// Target box in the search image, corner form.
    pub bbox: BoxXyxy,
    /// True when the search image contains the exemplar target.
    pub is_positive: bool,
}

/// Dense per-anchor targets for a batch.
///
/// All tensors are indexed `(sample, anchor)` with the anchor axis in the grid
/// flattening order; box tensors carry a trailing offset axis of 4.
#[derive(Debug)]
pub struct TrackTargets {
    /// -1 ignore, 0 negative, 1 positive.
    pub labels: Array2<i64>,
    /// Per-anchor classification weights.
    pub label_weights: Array2<f32>,
    /// Encoded box offsets for positive anchors.
    pub bbox_targets: Array3<f32>,
    /// Per-offset regression weights.
    pub bbox_weights: Array3<f32>,
}

struct PairTargets {
    labels: Vec<i64>,
    label_weights: Vec<f32>,
    bbox_targets: Array2<f32>,
    bbox_weights: Array2<f32>,
}

impl PairTargets {
    fn ignore_all(num_anchors: usize) -> Self {
        Self {
            labels: vec![-1; num_anchors],
            label_weights: vec![0.0; num_anchors],
            bbox_targets: Array2::zeros((num_anchors, 4)),
            bbox_weights: Array2::zeros((num_anchors, 4)),
        }
    }
}

impl SiameseRpnHead {
    fn num_anchors(&self, size: ScoreMapSize) -> usize {
        size.0 * size.1 * self.anchor_generator.num_base_anchors()
    }

    /// Targets for a matching exemplar/search pair.
    fn positive_pair_targets(
        &mut self,
        gt_box: &BoxXyxy,
        size: ScoreMapSize,
    ) -> SiamRpnResult<PairTargets> {
        let mut out = PairTargets::ignore_all(self.num_anchors(size));

        // The grid and the search region share a center; translate the cached
        // grid-centered anchors into search-region coordinates.
        let shift = (self.train_cfg.search_size / 2) as f32;
        let anchors: Vec<BoxXyxy> = self
            .cache
            .grid_centered_anchors(self.anchor_generator.as_ref(), size)?
            .iter()
            .map(|b| b.translated(shift, shift))
            .collect();

        let assignment = self.assigner.assign(&anchors, gt_box);
        let sampling = self.sampler.sample(&assignment, &anchors, gt_box);
        let pos_inds = sampling.pos_inds;
        let mut neg_inds = sampling.neg_inds;

        // Cap negatives even when the sampler over-produced them.
        let neg_upper_bound = (self.sampler.num_samples() as f32
            * (1.0 - self.sampler.positive_fraction())) as usize;
        if neg_inds.len() > neg_upper_bound {
            neg_inds.truncate(neg_upper_bound);
        }

        if !pos_inds.is_empty() {
            let pos_weight = 1.0 / pos_inds.len() as f32;
            for &i in &pos_inds {
                out.labels[i] = 1;
                out.label_weights[i] = pos_weight / 2.0;
                out.bbox_weights.slice_mut(s![i, ..]).fill(pos_weight);
            }
            let encoded = self
                .bbox_coder
                .encode(&sampling.pos_priors, &sampling.pos_gt_boxes)?;
            for (row, &i) in pos_inds.iter().enumerate() {
                out.bbox_targets
                    .slice_mut(s![i, ..])
                    .assign(&encoded.slice(s![row, ..]));
            }
        }

        if !neg_inds.is_empty() {
            let neg_weight = 1.0 / neg_inds.len() as f32;
            for &i in &neg_inds {
                out.labels[i] = 0;
                out.label_weights[i] = neg_weight / 2.0;
            }
        }

        trace_event!(
            "positive_pair_targets",
            positives = pos_inds.len(),
            negatives = neg_inds.len()
        );
        Ok(out)
    }

    /// Targets for a non-matching exemplar/search pair.
    ///
    /// The target's center is projected onto grid cells; a 7x7 cell
    /// neighborhood around it (clamped to the grid) forms the negative
    /// candidate pool, from which up to `num_neg` anchors are drawn uniformly
    /// without replacement.
    fn negative_pair_targets(
        &mut self,
        gt_box: &BoxXyxy,
        size: ScoreMapSize,
    ) -> SiamRpnResult<PairTargets> {
        let (grid_h, grid_w) = size;
        let num_base = self.anchor_generator.num_base_anchors();
        let mut out = PairTargets::ignore_all(self.num_anchors(size));

        let BoxCxcywh { cx: target_cx, cy: target_cy, .. } = gt_box.to_cxcywh();
        let (stride_x, stride_y) = self.anchor_generator.strides();
        let half_search = (self.train_cfg.search_size / 2) as f32;

        let cx = (grid_w / 2) as i64
            + ((target_cx - half_search) / stride_x as f32 + 0.5).ceil() as i64;
        let cy = (grid_h / 2) as i64
            + ((target_cy - half_search) / stride_y as f32 + 0.5).ceil() as i64;

        let left = (cx - 3).max(0);
        let right = (cx + 4).min(grid_w as i64);
        let top = (cy - 3).max(0);
        let down = (cy + 4).min(grid_h as i64);

        let mut candidates = Vec::new();
        for y in top..down {
            for x in left..right {
                let cell = (y as usize * grid_w + x as usize) * num_base;
                candidates.extend(cell..cell + num_base);
            }
        }

        let neg_inds: Vec<usize> = if candidates.is_empty() {
            Vec::new()
        } else {
            let amount = self.train_cfg.num_neg.min(candidates.len());
            sample(&mut self.rng, candidates.len(), amount)
                .into_iter()
                .map(|i| candidates[i])
                .collect()
        };

        if !neg_inds.is_empty() {
            let neg_weight = 1.0 / neg_inds.len() as f32 / 2.0;
            for &i in &neg_inds {
                out.labels[i] = 0;
                out.label_weights[i] = neg_weight;
            }
        }

        // TODO: the sampled mask above is discarded by this overwrite, which
        // turns the whole grid into an unweighted negative sample; confirm
        // whether that is intended before changing it.
        out.labels.iter_mut().for_each(|l| *l = 0);

        trace_event!("negative_pair_targets", sampled = neg_inds.len());
        Ok(out)
    }

    /// Assembles dense targets for a batch of training pairs.
    ///
    /// Each sample dispatches on its pair label; label and box weights are
    /// divided by the batch size after stacking.
    pub fn get_targets(
        &mut self,
        batch_gt: &[GtInstance],
        size: ScoreMapSize,
    ) -> SiamRpnResult<TrackTargets> {
        if batch_gt.is_empty() {
            return Err(SiamRpnError::InvalidInput("empty ground-truth batch"));
        }
        let _span = trace_span!("get_targets", batch = batch_gt.len()).entered();

        let batch = batch_gt.len();
        let num_anchors = self.num_anchors(size);
        let mut labels = Array2::zeros((batch, num_anchors));
        let mut label_weights = Array2::zeros((batch, num_anchors));
        let mut bbox_targets = Array3::zeros((batch, num_anchors, 4));
        let mut bbox_weights = Array3::zeros((batch, num_anchors, 4));

        for (n, gt) in batch_gt.iter().enumerate() {
            let pair = if gt.is_positive {
                self.positive_pair_targets(&gt.bbox, size)?
            } else {
                self.negative_pair_targets(&gt.bbox, size)?
            };
            copy_row_i64(labels.view_mut(), n, &pair.labels);
            copy_row_f32(label_weights.view_mut(), n, &pair.label_weights);
            bbox_targets.slice_mut(s![n, .., ..]).assign(&pair.bbox_targets);
            bbox_weights.slice_mut(s![n, .., ..]).assign(&pair.bbox_weights);
        }

        let inv_batch = 1.0 / batch as f32;
        label_weights.mapv_inplace(|w| w * inv_batch);
        bbox_weights.mapv_inplace(|w| w * inv_batch);

        Ok(TrackTargets {
            labels,
            label_weights,
            bbox_targets,
            bbox_weights,
        })
    }
}

fn copy_row_i64(mut dst: ArrayViewMut2<'_, i64>, row: usize, src: &[i64]) {
    for (i, &v) in src.iter().enumerate() {
        dst[[row, i]] = v;
    }
}

fn copy_row_f32(mut dst: ArrayViewMut2<'_, f32>, row: usize, src: &[f32]) {
    for (i, &v) in src.iter().enumerate() {
        dst[[row, i]] = v;
    }
}
