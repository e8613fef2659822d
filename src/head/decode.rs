//! Inference-time box selection and temporal smoothing.
//!
//! Raw classification/regression maps for a single search region are decoded
//! against the grid-centered anchors; candidates whose shape deviates from
//! the previous frame's box are discounted by scale and aspect penalties, a
//! Hanning prior pulls the selection toward the region center, and the
//! winning box is blended with the previous box so the track changes size
//! gradually.

use ndarray::Array4;

use super::{flatten_grouped, SiameseRpnHead};
use crate::bbox::BoxCxcywh;
use crate::trace::{trace_event, trace_span};
use crate::util::error::shape_mismatch;
use crate::util::math::softmax_fg;
use crate::util::SiamRpnResult;

// Floor for decoded sizes inside the penalty math; keeps the ratio terms
// finite if a regression output underflows to zero width or height.
const SIZE_FLOOR: f32 = 1e-6;

/// Symmetric ratio penalty, >= 1 and minimal when the ratio is 1.
fn change_ratio(ratio: f32) -> f32 {
    ratio.max(1.0 / ratio)
}

/// Padded square-root size used to compare box scales.
fn enlarged_size(w: f32, h: f32) -> f32 {
    let pad = (w + h) * 0.5;
    ((w + pad) * (h + pad)).sqrt()
}

impl SiameseRpnHead {
    /// Tracks `prev_bbox` into the current frame from raw network outputs.
    ///
    /// `cls_score` has shape `(1, 2A, H, W)`, `bbox_pred` `(1, 4A, H, W)`;
    /// `prev_bbox` is in original-image coordinates and `scale_factor` maps
    /// original-image to search-region scale. Returns the unpenalized
    /// foreground confidence of the selected candidate and the smoothed box
    /// in original-image coordinates.
    pub fn get_bbox(
        &self,
        cls_score: &Array4<f32>,
        bbox_pred: &Array4<f32>,
        prev_bbox: BoxCxcywh,
        scale_factor: f32,
    ) -> SiamRpnResult<(f32, BoxCxcywh)> {
        let (n, _, h, w) = cls_score.dim();
        if n != 1 || bbox_pred.dim().0 != 1 {
            return Err(shape_mismatch(
                "decode batch size",
                1usize,
                (n, bbox_pred.dim().0),
            ));
        }
        if bbox_pred.dim().2 != h || bbox_pred.dim().3 != w {
            return Err(shape_mismatch(
                "decode map sizes",
                (h, w),
                (bbox_pred.dim().2, bbox_pred.dim().3),
            ));
        }
        let _span = trace_span!("get_bbox", height = h, width = w).entered();

        // Decode-time anchors stay grid-centered: predicted boxes come out
        // relative to the search-region center.
        let size = (h, w);
        let anchors = self
            .cache
            .grid_centered_anchors(self.anchor_generator.as_ref(), size)?;
        let windows = self.cache.windows(self.anchor_generator.as_ref(), size)?;

        let cls_flat = flatten_grouped(cls_score, 2, "decode cls reshape")?;
        if cls_flat.nrows() != anchors.len() {
            return Err(shape_mismatch(
                "decode anchor count",
                anchors.len(),
                cls_flat.nrows(),
            ));
        }
        let cls_scores: Vec<f32> = (0..cls_flat.nrows())
            .map(|i| softmax_fg(cls_flat[[i, 0]], cls_flat[[i, 1]]))
            .collect();

        let reg_flat = flatten_grouped(bbox_pred, 4, "decode reg reshape")?;
        let pred_boxes: Vec<BoxCxcywh> = self
            .bbox_coder
            .decode(anchors, reg_flat.view())?
            .iter()
            .map(|b| b.to_cxcywh())
            .collect();

        let prev_scaled_size = enlarged_size(
            prev_bbox.w * scale_factor,
            prev_bbox.h * scale_factor,
        );
        let prev_aspect = prev_bbox.w / prev_bbox.h;

        let mut best_idx = 0usize;
        let mut best_blended = f32::NEG_INFINITY;
        let mut penalties = Vec::with_capacity(pred_boxes.len());
        for (i, pred) in pred_boxes.iter().enumerate() {
            let pw = pred.w.max(SIZE_FLOOR);
            let ph = pred.h.max(SIZE_FLOOR);
            let scale_penalty = change_ratio(enlarged_size(pw, ph) / prev_scaled_size);
            let aspect_penalty = change_ratio(prev_aspect / (pw / ph));
            let penalty =
                (-(aspect_penalty * scale_penalty - 1.0) * self.test_cfg.penalty_k).exp();
            penalties.push(penalty);

            let penalized = penalty * cls_scores[i];
            let blended = penalized * (1.0 - self.test_cfg.window_influence)
                + windows[i] * self.test_cfg.window_influence;
            // strict comparison keeps the first occurrence on ties
            if blended > best_blended {
                best_blended = blended;
                best_idx = i;
            }
        }

        let best_score = cls_scores[best_idx];
        let best = &pred_boxes[best_idx];
        // Undo the search-region scaling before mapping back to the image.
        let best_cx = best.cx / scale_factor;
        let best_cy = best.cy / scale_factor;
        let best_w = best.w / scale_factor;
        let best_h = best.h / scale_factor;

        // The candidate center is relative to the search region; the previous
        // center re-anchors it in original-image coordinates. Width and
        // height are smoothed, the center is not.
        let lr = penalties[best_idx] * best_score * self.test_cfg.lr;
        let final_bbox = BoxCxcywh::new(
            best_cx + prev_bbox.cx,
            best_cy + prev_bbox.cy,
            prev_bbox.w * (1.0 - lr) + best_w * lr,
            prev_bbox.h * (1.0 - lr) + best_h * lr,
        );

        trace_event!("decoded_bbox", best_idx = best_idx, score = best_score);
        Ok((best_score, final_bbox))
    }
}
