//! Anchor-to-ground-truth assignment and balanced sampling.
//!
//! These are the external collaborators the training path drives: an IoU
//! threshold assigner marks each anchor positive, negative or ignored against
//! the single ground-truth box, and a fixed-budget sampler picks disjoint
//! positive/negative subsets from the assignment.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::bbox::{iou, BoxXyxy};

/// Per-anchor assignment against one ground-truth box.
///
/// `gt_inds` holds -1 for ignored anchors, 0 for negatives and 1 for anchors
/// assigned to the ground truth.
pub struct AssignResult {
    /// Assigned ground-truth index per anchor.
    pub gt_inds: Vec<i8>,
    /// IoU against the ground truth per anchor.
    pub max_overlaps: Vec<f32>,
}

/// Assigns anchors to the ground-truth box.
pub trait BoxAssigner {
    /// Produces one assignment entry per anchor.
    fn assign(&self, anchors: &[BoxXyxy], gt_box: &BoxXyxy) -> AssignResult;
}

/// IoU-threshold assigner.
///
/// Anchors with IoU below `neg_iou_thr` become negatives, at or above
/// `pos_iou_thr` positives, and anything in between is ignored.
#[derive(Clone, Copy, Debug)]
pub struct MaxIouAssigner {
    /// Minimum IoU for a positive anchor.
    pub pos_iou_thr: f32,
    /// Exclusive upper IoU bound for a negative anchor.
    pub neg_iou_thr: f32,
}

impl Default for MaxIouAssigner {
    fn default() -> Self {
        Self {
            pos_iou_thr: 0.6,
            neg_iou_thr: 0.3,
        }
    }
}

impl BoxAssigner for MaxIouAssigner {
    fn assign(&self, anchors: &[BoxXyxy], gt_box: &BoxXyxy) -> AssignResult {
        let mut gt_inds = Vec::with_capacity(anchors.len());
        let mut max_overlaps = Vec::with_capacity(anchors.len());
        for anchor in anchors {
            let overlap = iou(anchor, gt_box);
            let ind = if overlap < self.neg_iou_thr {
                0
            } else if overlap >= self.pos_iou_thr {
                1
            } else {
                -1
            };
            gt_inds.push(ind);
            max_overlaps.push(overlap);
        }
        AssignResult {
            gt_inds,
            max_overlaps,
        }
    }
}

/// Sampled positive/negative anchor index sets.
pub struct SamplingResult {
    /// Indices of sampled positive anchors.
    pub pos_inds: Vec<usize>,
    /// Indices of sampled negative anchors.
    pub neg_inds: Vec<usize>,
    /// The positive anchors themselves.
    pub pos_priors: Vec<BoxXyxy>,
    /// Ground-truth box repeated per positive anchor.
    pub pos_gt_boxes: Vec<BoxXyxy>,
}

/// Draws a fixed-budget balanced sample from an assignment.
pub trait BoxSampler {
    /// Total sample budget.
    fn num_samples(&self) -> usize;

    /// Fraction of the budget reserved for positives.
    fn positive_fraction(&self) -> f32;

    /// Samples positive and negative anchor indices.
    fn sample(
        &mut self,
        assignment: &AssignResult,
        anchors: &[BoxXyxy],
        gt_box: &BoxXyxy,
    ) -> SamplingResult;
}

/// Uniform random sampler with a positive-fraction budget split.
///
/// Positives are capped at `num * pos_fraction`; negatives fill the remaining
/// budget. Subsampling is without replacement from a seeded RNG so tests are
/// reproducible.
pub struct RandomSampler {
    num: usize,
    pos_fraction: f32,
    rng: StdRng,
}

impl RandomSampler {
    /// Creates a sampler with an explicit seed.
    pub fn new(num: usize, pos_fraction: f32, seed: u64) -> Self {
        Self {
            num,
            pos_fraction,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The reference training configuration: budget 64, a quarter positive.
    pub fn siamese_rpn_default(seed: u64) -> Self {
        Self::new(64, 0.25, seed)
    }

    fn subsample(&mut self, candidates: Vec<usize>, expected: usize) -> Vec<usize> {
        if candidates.len() <= expected {
            return candidates;
        }
        let picked = sample(&mut self.rng, candidates.len(), expected);
        picked.into_iter().map(|i| candidates[i]).collect()
    }
}

impl BoxSampler for RandomSampler {
    fn num_samples(&self) -> usize {
        self.num
    }

    fn positive_fraction(&self) -> f32 {
        self.pos_fraction
    }

    fn sample(
        &mut self,
        assignment: &AssignResult,
        anchors: &[BoxXyxy],
        gt_box: &BoxXyxy,
    ) -> SamplingResult {
        let pos_candidates: Vec<usize> = assignment
            .gt_inds
            .iter()
            .enumerate()
            .filter(|(_, &g)| g > 0)
            .map(|(i, _)| i)
            .collect();
        let neg_candidates: Vec<usize> = assignment
            .gt_inds
            .iter()
            .enumerate()
            .filter(|(_, &g)| g == 0)
            .map(|(i, _)| i)
            .collect();

        let expected_pos = (self.num as f32 * self.pos_fraction) as usize;
        let pos_inds = self.subsample(pos_candidates, expected_pos);
        let expected_neg = self.num - pos_inds.len();
        let neg_inds = self.subsample(neg_candidates, expected_neg);

        let pos_priors = pos_inds.iter().map(|&i| anchors[i]).collect();
        let pos_gt_boxes = vec![*gt_box; pos_inds.len()];
        SamplingResult {
            pos_inds,
            neg_inds,
            pos_priors,
            pos_gt_boxes,
        }
    }
}
