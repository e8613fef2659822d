//! Bounding-box value types and overlap computation.
//!
//! Boxes come in two equivalent forms: corner form `[x1, y1, x2, y2]` used by
//! anchors and ground truth, and center-size form `[cx, cy, w, h]` used by the
//! tracking state and the decoder output. Conversions are exact up to float
//! rounding.

pub mod coder;

pub use coder::{BoxCoder, DeltaXywhCoder};

/// Axis-aligned box in corner form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxXyxy {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

/// Axis-aligned box in center-size form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxCxcywh {
    /// Center x.
    pub cx: f32,
    /// Center y.
    pub cy: f32,
    /// Width.
    pub w: f32,
    /// Height.
    pub h: f32,
}

impl BoxXyxy {
    /// Creates a corner-form box.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box width (may be non-positive for degenerate boxes).
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    /// Box height.
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Converts to center-size form.
    pub fn to_cxcywh(&self) -> BoxCxcywh {
        BoxCxcywh {
            cx: (self.x1 + self.x2) * 0.5,
            cy: (self.y1 + self.y2) * 0.5,
            w: self.width(),
            h: self.height(),
        }
    }

    /// Returns the box translated by `(dx, dy)`.
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }
}

impl BoxCxcywh {
    /// Creates a center-size box.
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    /// Converts to corner form.
    pub fn to_xyxy(&self) -> BoxXyxy {
        BoxXyxy {
            x1: self.cx - self.w * 0.5,
            y1: self.cy - self.h * 0.5,
            x2: self.cx + self.w * 0.5,
            y2: self.cy + self.h * 0.5,
        }
    }
}

/// Intersection-over-union of two corner-form boxes.
///
/// Degenerate boxes (zero or negative area) yield 0.
pub fn iou(a: &BoxXyxy, b: &BoxXyxy) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let area_a = a.width().max(0.0) * a.height().max(0.0);
    let area_b = b.width().max(0.0) * b.height().max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::{iou, BoxCxcywh, BoxXyxy};

    #[test]
    fn corner_center_round_trip() {
        let b = BoxXyxy::new(10.0, 20.0, 40.0, 60.0);
        let c = b.to_cxcywh();
        assert_eq!(c, BoxCxcywh::new(25.0, 40.0, 30.0, 40.0));
        assert_eq!(c.to_xyxy(), b);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BoxXyxy::new(0.0, 0.0, 10.0, 10.0);
        assert!((iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoxXyxy::new(0.0, 0.0, 10.0, 10.0);
        let b = BoxXyxy::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoxXyxy::new(0.0, 0.0, 10.0, 10.0);
        let b = BoxXyxy::new(5.0, 0.0, 15.0, 10.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }
}
