//! Weighted classification and regression losses.
//!
//! The head hands these losses pre-flattened tensors: one `(bg, fg)` logit row
//! and one 4-offset row per anchor, with per-anchor (or per-element) weights
//! that already encode the positive/negative normalization and batch
//! division. Both losses reduce by summation so the weights integrate exactly.

use ndarray::{ArrayView1, ArrayView2};

/// Weighted 2-way classification loss over flattened anchor logits.
pub trait ClassificationLoss {
    /// Computes the scalar loss.
    ///
    /// `labels` uses -1 for ignored anchors; ignored or zero-weight entries
    /// contribute nothing.
    fn compute(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, i64>,
        weights: ArrayView1<'_, f32>,
    ) -> f32;
}

/// Weighted regression loss over flattened per-anchor offsets.
pub trait RegressionLoss {
    /// Computes the scalar loss with one weight per offset component.
    fn compute(
        &self,
        pred: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
        weights: ArrayView2<'_, f32>,
    ) -> f32;
}

/// Softmax cross-entropy with sum reduction.
#[derive(Clone, Copy, Debug)]
pub struct CrossEntropySumLoss {
    /// Multiplier applied to the reduced loss.
    pub loss_weight: f32,
}

impl Default for CrossEntropySumLoss {
    fn default() -> Self {
        Self { loss_weight: 1.0 }
    }
}

impl ClassificationLoss for CrossEntropySumLoss {
    fn compute(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView1<'_, i64>,
        weights: ArrayView1<'_, f32>,
    ) -> f32 {
        let mut total = 0.0f32;
        for i in 0..logits.nrows() {
            let label = labels[i];
            let weight = weights[i];
            if label < 0 || weight == 0.0 {
                continue;
            }
            let bg = logits[[i, 0]];
            let fg = logits[[i, 1]];
            // log-sum-exp with the max factored out for stability
            let m = bg.max(fg);
            let lse = m + ((bg - m).exp() + (fg - m).exp()).ln();
            let picked = if label == 0 { bg } else { fg };
            total += weight * (lse - picked);
        }
        total * self.loss_weight
    }
}

/// Elementwise L1 loss with sum reduction.
#[derive(Clone, Copy, Debug)]
pub struct L1SumLoss {
    /// Multiplier applied to the reduced loss.
    pub loss_weight: f32,
}

impl Default for L1SumLoss {
    fn default() -> Self {
        Self { loss_weight: 1.2 }
    }
}

impl RegressionLoss for L1SumLoss {
    fn compute(
        &self,
        pred: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
        weights: ArrayView2<'_, f32>,
    ) -> f32 {
        let mut total = 0.0f32;
        for i in 0..pred.nrows() {
            for k in 0..pred.ncols() {
                let w = weights[[i, k]];
                if w == 0.0 {
                    continue;
                }
                total += w * (pred[[i, k]] - target[[i, k]]).abs();
            }
        }
        total * self.loss_weight
    }
}
