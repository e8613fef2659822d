//! Delta-based box encoding between anchors and absolute boxes.

use ndarray::{Array2, ArrayView2};

use super::BoxXyxy;
use crate::util::error::shape_mismatch;
use crate::util::SiamRpnResult;

/// Encodes boxes against reference anchors and decodes network offsets back.
pub trait BoxCoder {
    /// Encodes each ground-truth box against its anchor as a 4-offset row.
    fn encode(&self, anchors: &[BoxXyxy], gt_boxes: &[BoxXyxy]) -> SiamRpnResult<Array2<f32>>;

    /// Decodes one 4-offset row per anchor into absolute corner-form boxes.
    fn decode(&self, anchors: &[BoxXyxy], deltas: ArrayView2<'_, f32>)
        -> SiamRpnResult<Vec<BoxXyxy>>;
}

/// Normalized center/size delta coder.
///
/// Offsets are `dx = (gx - px) / pw`, `dy = (gy - py) / ph`,
/// `dw = ln(gw / pw)`, `dh = ln(gh / ph)`, optionally shifted and scaled by
/// per-component means and standard deviations.
#[derive(Clone, Debug)]
pub struct DeltaXywhCoder {
    /// Per-component offset means.
    pub means: [f32; 4],
    /// Per-component offset standard deviations.
    pub stds: [f32; 4],
}

impl Default for DeltaXywhCoder {
    fn default() -> Self {
        Self {
            means: [0.0; 4],
            stds: [1.0; 4],
        }
    }
}

impl BoxCoder for DeltaXywhCoder {
    fn encode(&self, anchors: &[BoxXyxy], gt_boxes: &[BoxXyxy]) -> SiamRpnResult<Array2<f32>> {
        if anchors.len() != gt_boxes.len() {
            return Err(shape_mismatch(
                "box encode",
                anchors.len(),
                gt_boxes.len(),
            ));
        }
        let mut out = Array2::zeros((anchors.len(), 4));
        for (i, (anchor, gt)) in anchors.iter().zip(gt_boxes).enumerate() {
            let p = anchor.to_cxcywh();
            let g = gt.to_cxcywh();
            let raw = [
                (g.cx - p.cx) / p.w,
                (g.cy - p.cy) / p.h,
                (g.w / p.w).ln(),
                (g.h / p.h).ln(),
            ];
            for k in 0..4 {
                out[[i, k]] = (raw[k] - self.means[k]) / self.stds[k];
            }
        }
        Ok(out)
    }

    fn decode(
        &self,
        anchors: &[BoxXyxy],
        deltas: ArrayView2<'_, f32>,
    ) -> SiamRpnResult<Vec<BoxXyxy>> {
        if deltas.nrows() != anchors.len() || deltas.ncols() != 4 {
            return Err(shape_mismatch(
                "box decode",
                (anchors.len(), 4),
                deltas.dim(),
            ));
        }
        let mut out = Vec::with_capacity(anchors.len());
        for (i, anchor) in anchors.iter().enumerate() {
            let p = anchor.to_cxcywh();
            let dx = deltas[[i, 0]] * self.stds[0] + self.means[0];
            let dy = deltas[[i, 1]] * self.stds[1] + self.means[1];
            let dw = deltas[[i, 2]] * self.stds[2] + self.means[2];
            let dh = deltas[[i, 3]] * self.stds[3] + self.means[3];
            let cx = p.cx + p.w * dx;
            let cy = p.cy + p.h * dy;
            let w = p.w * dw.exp();
            let h = p.h * dh.exp();
            out.push(
                super::BoxCxcywh::new(cx, cy, w, h).to_xyxy(),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{BoxCoder, DeltaXywhCoder};
    use crate::bbox::BoxXyxy;
    use ndarray::Array2;

    #[test]
    fn zero_offsets_decode_to_anchor() {
        let coder = DeltaXywhCoder::default();
        let anchors = vec![BoxXyxy::new(-32.0, -32.0, 32.0, 32.0)];
        let deltas = Array2::zeros((1, 4));
        let boxes = coder.decode(&anchors, deltas.view()).unwrap();
        assert_eq!(boxes[0], anchors[0]);
    }

    #[test]
    fn encode_rejects_mismatched_lengths() {
        let coder = DeltaXywhCoder::default();
        let anchors = vec![BoxXyxy::new(0.0, 0.0, 1.0, 1.0); 2];
        let gts = vec![BoxXyxy::new(0.0, 0.0, 1.0, 1.0)];
        assert!(coder.encode(&anchors, &gts).is_err());
    }
}
