//! Depth-wise cross-correlation and the per-level correlation head.
//!
//! The correlation head compares a fixed exemplar (kernel) feature against
//! every location of a larger search feature: per channel, the search map is
//! convolved with the kernel map as a filter, yielding one scalar response per
//! channel at each valid placement. Learned transforms before and after the
//! correlation are injected as [`FeatureTransform`] strategies since weight
//! learning lives outside this crate.

use ndarray::{Array1, Array2, Array4};

use crate::util::error::shape_mismatch;
use crate::util::SiamRpnResult;

/// A learned feature-map transform, e.g. a convolution block with loaded weights.
pub trait FeatureTransform {
    /// Applies the transform to a `(batch, channels, height, width)` tensor.
    fn apply(&self, input: &Array4<f32>) -> SiamRpnResult<Array4<f32>>;
}

/// Pass-through transform.
pub struct Identity;

impl FeatureTransform for Identity {
    fn apply(&self, input: &Array4<f32>) -> SiamRpnResult<Array4<f32>> {
        Ok(input.clone())
    }
}

/// 1x1 convolution: a channel-space linear map with optional bias and ReLU.
pub struct PointwiseConv {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
    relu: bool,
}

impl PointwiseConv {
    /// Creates a pointwise convolution from a `(out_channels, in_channels)`
    /// weight matrix.
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>, relu: bool) -> SiamRpnResult<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.nrows() {
                return Err(shape_mismatch("pointwise bias", weight.nrows(), b.len()));
            }
        }
        Ok(Self { weight, bias, relu })
    }
}

impl FeatureTransform for PointwiseConv {
    fn apply(&self, input: &Array4<f32>) -> SiamRpnResult<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        if c != self.weight.ncols() {
            return Err(shape_mismatch(
                "pointwise input channels",
                self.weight.ncols(),
                c,
            ));
        }
        let out_c = self.weight.nrows();
        let mut out = Array4::zeros((n, out_c, h, w));
        for b in 0..n {
            for o in 0..out_c {
                let bias = self.bias.as_ref().map_or(0.0, |v| v[o]);
                for y in 0..h {
                    for x in 0..w {
                        let mut acc = bias;
                        for i in 0..c {
                            acc += self.weight[[o, i]] * input[[b, i, y, x]];
                        }
                        out[[b, o, y, x]] = if self.relu { acc.max(0.0) } else { acc };
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Valid-mode per-channel cross-correlation of `search` with `kernel`.
///
/// Output spatial size is `search - kernel + 1` in each dimension; batch and
/// channel counts must agree.
pub fn depthwise_correlation(
    search: &Array4<f32>,
    kernel: &Array4<f32>,
) -> SiamRpnResult<Array4<f32>> {
    let (sn, sc, sh, sw) = search.dim();
    let (kn, kc, kh, kw) = kernel.dim();
    if sn != kn || sc != kc {
        return Err(shape_mismatch(
            "depthwise correlation batch/channels",
            (sn, sc),
            (kn, kc),
        ));
    }
    if kh > sh || kw > sw {
        return Err(shape_mismatch(
            "depthwise correlation kernel size",
            format!("<= {:?}", (sh, sw)),
            (kh, kw),
        ));
    }
    let oh = sh - kh + 1;
    let ow = sw - kw + 1;
    let mut out = Array4::zeros((sn, sc, oh, ow));
    for n in 0..sn {
        for c in 0..sc {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0f32;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            acc += search[[n, c, oy + ky, ox + kx]] * kernel[[n, c, ky, kx]];
                        }
                    }
                    out[[n, c, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(out)
}

/// One level's correlation head.
///
/// Applies independent transforms to the kernel and search features, runs the
/// depth-wise correlation, then maps correlation channels to the output
/// channel count (2 or 4 per base anchor) via the head transform.
pub struct CorrelationHead {
    kernel_transform: Box<dyn FeatureTransform>,
    search_transform: Box<dyn FeatureTransform>,
    head_transform: Box<dyn FeatureTransform>,
}

impl CorrelationHead {
    /// Assembles a head from its three transforms.
    pub fn new(
        kernel_transform: Box<dyn FeatureTransform>,
        search_transform: Box<dyn FeatureTransform>,
        head_transform: Box<dyn FeatureTransform>,
    ) -> Self {
        Self {
            kernel_transform,
            search_transform,
            head_transform,
        }
    }

    /// A head whose transforms all pass features through unchanged.
    pub fn passthrough() -> Self {
        Self::new(Box::new(Identity), Box::new(Identity), Box::new(Identity))
    }

    /// Computes the raw response map for one exemplar/search feature pair.
    pub fn forward(
        &self,
        kernel_feat: &Array4<f32>,
        search_feat: &Array4<f32>,
    ) -> SiamRpnResult<Array4<f32>> {
        let kernel = self.kernel_transform.apply(kernel_feat)?;
        let search = self.search_transform.apply(search_feat)?;
        let response = depthwise_correlation(&search, &kernel)?;
        self.head_transform.apply(&response)
    }
}
