//! The Siamese region-proposal tracking head.
//!
//! The head owns per-level correlation heads plus the injected collaborators
//! (anchor generator, box coder, assigner, sampler, losses) and drives three
//! operations: `forward` fuses per-level correlation responses into one
//! classification map and one regression map; `get_targets` and `loss` form
//! the training path; `get_bbox` is the inference-time decoder that turns raw
//! maps into the next frame's box.

mod decode;
mod targets;

pub use targets::{GtInstance, TrackTargets};

use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::anchors::{AnchorCache, AnchorGenerator, SiamRpnAnchorGenerator};
use crate::assign::{BoxAssigner, BoxSampler, MaxIouAssigner, RandomSampler};
use crate::bbox::{BoxCoder, DeltaXywhCoder};
use crate::corr::CorrelationHead;
use crate::loss::{ClassificationLoss, CrossEntropySumLoss, L1SumLoss, RegressionLoss};
use crate::trace::{trace_event, trace_span};
use crate::util::error::shape_mismatch;
use crate::util::math::softmax;
use crate::util::{SiamRpnError, SiamRpnResult};

/// Training-time settings.
#[derive(Clone, Copy, Debug)]
pub struct TrainConfig {
    /// Search-region side length in pixels.
    pub search_size: usize,
    /// Negative-pair sample budget.
    pub num_neg: usize,
    /// Seed for the negative-pair sampling RNG.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            search_size: 255,
            num_neg: 16,
            seed: 0,
        }
    }
}

/// Inference-time settings.
#[derive(Clone, Copy, Debug)]
pub struct TestConfig {
    /// Strength of the scale/aspect penalty decay.
    pub penalty_k: f32,
    /// Blend factor of the Hanning centering prior.
    pub window_influence: f32,
    /// Base rate for exponential size smoothing.
    pub lr: f32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            penalty_k: 0.05,
            window_influence: 0.42,
            lr: 0.38,
        }
    }
}

/// Head-level settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeadConfig {
    /// Fuse levels with learned softmax weights instead of uniform averaging.
    pub weighted_sum: bool,
    /// Training settings.
    pub train: TrainConfig,
    /// Inference settings.
    pub test: TestConfig,
}

/// Per-level fusion weights for classification and regression maps.
pub enum FusionWeights {
    /// Average all levels.
    Uniform,
    /// Softmax-normalized learnable weights, one per level and map kind.
    Learned {
        /// Raw (pre-softmax) classification weights.
        cls: Vec<f32>,
        /// Raw (pre-softmax) regression weights.
        reg: Vec<f32>,
    },
}

/// Named scalar loss terms produced by [`SiameseRpnHead::loss`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RpnLosses {
    /// Classification loss.
    pub cls: f32,
    /// Box regression loss.
    pub bbox: f32,
}

/// Injected collaborators and per-level correlation heads.
pub struct HeadComponents {
    /// Anchor generator backend.
    pub anchor_generator: Box<dyn AnchorGenerator>,
    /// Box offset coder.
    pub bbox_coder: Box<dyn BoxCoder>,
    /// Anchor-to-ground-truth assigner.
    pub assigner: Box<dyn BoxAssigner>,
    /// Balanced sampler.
    pub sampler: Box<dyn BoxSampler>,
    /// Classification loss.
    pub loss_cls: Box<dyn ClassificationLoss>,
    /// Regression loss.
    pub loss_bbox: Box<dyn RegressionLoss>,
    /// Per-level classification correlation heads.
    pub cls_heads: Vec<CorrelationHead>,
    /// Per-level regression correlation heads.
    pub reg_heads: Vec<CorrelationHead>,
}

impl HeadComponents {
    /// Wires the reference collaborators around caller-provided level heads.
    pub fn with_level_heads(
        cls_heads: Vec<CorrelationHead>,
        reg_heads: Vec<CorrelationHead>,
        seed: u64,
    ) -> Self {
        Self {
            anchor_generator: Box::new(SiamRpnAnchorGenerator::siamese_rpn_default()),
            bbox_coder: Box::new(DeltaXywhCoder::default()),
            assigner: Box::new(MaxIouAssigner::default()),
            sampler: Box::new(RandomSampler::siamese_rpn_default(seed)),
            loss_cls: Box::new(CrossEntropySumLoss::default()),
            loss_bbox: Box::new(L1SumLoss::default()),
            cls_heads,
            reg_heads,
        }
    }
}

/// Siamese RPN tracking head.
pub struct SiameseRpnHead {
    pub(crate) anchor_generator: Box<dyn AnchorGenerator>,
    pub(crate) bbox_coder: Box<dyn BoxCoder>,
    pub(crate) assigner: Box<dyn BoxAssigner>,
    pub(crate) sampler: Box<dyn BoxSampler>,
    loss_cls: Box<dyn ClassificationLoss>,
    loss_bbox: Box<dyn RegressionLoss>,
    cls_heads: Vec<CorrelationHead>,
    reg_heads: Vec<CorrelationHead>,
    fusion: FusionWeights,
    pub(crate) train_cfg: TrainConfig,
    pub(crate) test_cfg: TestConfig,
    pub(crate) cache: AnchorCache,
    pub(crate) rng: StdRng,
}

impl std::fmt::Debug for SiameseRpnHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiameseRpnHead")
            .field("train_cfg", &self.train_cfg)
            .field("test_cfg", &self.test_cfg)
            .finish_non_exhaustive()
    }
}

impl SiameseRpnHead {
    /// Builds a head from its components and configuration.
    pub fn new(components: HeadComponents, config: HeadConfig) -> SiamRpnResult<Self> {
        let levels = components.cls_heads.len();
        if levels == 0 {
            return Err(SiamRpnError::InvalidInput(
                "head needs at least one pyramid level",
            ));
        }
        if components.reg_heads.len() != levels {
            return Err(shape_mismatch(
                "cls/reg level heads",
                levels,
                components.reg_heads.len(),
            ));
        }
        let fusion = if config.weighted_sum {
            FusionWeights::Learned {
                cls: vec![1.0; levels],
                reg: vec![1.0; levels],
            }
        } else {
            FusionWeights::Uniform
        };
        Ok(Self {
            anchor_generator: components.anchor_generator,
            bbox_coder: components.bbox_coder,
            assigner: components.assigner,
            sampler: components.sampler,
            loss_cls: components.loss_cls,
            loss_bbox: components.loss_bbox,
            cls_heads: components.cls_heads,
            reg_heads: components.reg_heads,
            fusion,
            train_cfg: config.train,
            test_cfg: config.test,
            cache: AnchorCache::new(),
            rng: StdRng::seed_from_u64(config.train.seed),
        })
    }

    /// Number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.cls_heads.len()
    }

    /// Installs trained raw fusion weights (weighted-sum mode only).
    pub fn set_fusion_weights(&mut self, cls: Vec<f32>, reg: Vec<f32>) -> SiamRpnResult<()> {
        let levels = self.num_levels();
        if cls.len() != levels || reg.len() != levels {
            return Err(shape_mismatch(
                "fusion weights",
                levels,
                (cls.len(), reg.len()),
            ));
        }
        match &mut self.fusion {
            FusionWeights::Uniform => Err(SiamRpnError::InvalidInput(
                "head was built without learned fusion weights",
            )),
            FusionWeights::Learned { cls: c, reg: r } => {
                *c = cls;
                *r = reg;
                Ok(())
            }
        }
    }

    fn fusion_weights(&self) -> (Vec<f32>, Vec<f32>) {
        match &self.fusion {
            FusionWeights::Uniform => {
                let w = vec![1.0 / self.num_levels() as f32; self.num_levels()];
                (w.clone(), w)
            }
            FusionWeights::Learned { cls, reg } => (softmax(cls), softmax(reg)),
        }
    }

    /// Fuses per-level correlation responses into one classification map of
    /// shape `(N, 2A, H, W)` and one regression map of shape `(N, 4A, H, W)`.
    pub fn forward(
        &self,
        z_feats: &[Array4<f32>],
        x_feats: &[Array4<f32>],
    ) -> SiamRpnResult<(Array4<f32>, Array4<f32>)> {
        let levels = self.num_levels();
        if z_feats.len() != levels || x_feats.len() != levels {
            return Err(shape_mismatch(
                "pyramid level count",
                levels,
                (z_feats.len(), x_feats.len()),
            ));
        }
        let batch = z_feats[0].dim().0;
        for feat in z_feats.iter().chain(x_feats) {
            if feat.dim().0 != batch {
                return Err(shape_mismatch("feature batch size", batch, feat.dim().0));
            }
        }
        let _span = trace_span!("head_forward", levels = levels, batch = batch).entered();

        let (cls_weight, reg_weight) = self.fusion_weights();
        let mut cls_score: Option<Array4<f32>> = None;
        let mut bbox_pred: Option<Array4<f32>> = None;
        for i in 0..levels {
            let cls_single = self.cls_heads[i].forward(&z_feats[i], &x_feats[i])?;
            let reg_single = self.reg_heads[i].forward(&z_feats[i], &x_feats[i])?;
            accumulate(&mut cls_score, cls_single, cls_weight[i], "fused cls map")?;
            accumulate(&mut bbox_pred, reg_single, reg_weight[i], "fused reg map")?;
        }
        // levels >= 1, so both accumulators are populated
        Ok((cls_score.unwrap(), bbox_pred.unwrap()))
    }

    /// Computes the named losses from fused maps and assembled targets.
    ///
    /// Classification output is realigned from `(N, 2A, H, W)` to one
    /// `(bg, fg)` row per anchor in the anchor flattening order; regression
    /// output likewise to 4-offset rows.
    pub fn loss(
        &self,
        cls_score: &Array4<f32>,
        bbox_pred: &Array4<f32>,
        targets: &TrackTargets,
    ) -> SiamRpnResult<RpnLosses> {
        let _span = trace_span!("head_loss").entered();
        let cls_flat = flatten_grouped(cls_score, 2, "cls score reshape")?;
        let reg_flat = flatten_grouped(bbox_pred, 4, "bbox pred reshape")?;

        let rows = targets.labels.len();
        if cls_flat.nrows() != rows {
            return Err(shape_mismatch("cls/target length", rows, cls_flat.nrows()));
        }
        if reg_flat.nrows() != rows {
            return Err(shape_mismatch("reg/target length", rows, reg_flat.nrows()));
        }

        let labels = targets
            .labels
            .view()
            .into_shape(rows)
            .map_err(|_| shape_mismatch("labels reshape", rows, targets.labels.dim()))?
            .to_owned();
        let label_weights = targets
            .label_weights
            .view()
            .into_shape(rows)
            .map_err(|_| shape_mismatch("label weights reshape", rows, targets.label_weights.dim()))?
            .to_owned();
        let bbox_targets = targets
            .bbox_targets
            .view()
            .into_shape((rows, 4))
            .map_err(|_| shape_mismatch("bbox targets reshape", (rows, 4), targets.bbox_targets.dim()))?
            .to_owned();
        let bbox_weights = targets
            .bbox_weights
            .view()
            .into_shape((rows, 4))
            .map_err(|_| shape_mismatch("bbox weights reshape", (rows, 4), targets.bbox_weights.dim()))?
            .to_owned();

        let cls = self
            .loss_cls
            .compute(cls_flat.view(), labels.view(), label_weights.view());
        let bbox = self
            .loss_bbox
            .compute(reg_flat.view(), bbox_targets.view(), bbox_weights.view());
        trace_event!("loss_terms", cls = cls, bbox = bbox);
        Ok(RpnLosses { cls, bbox })
    }
}

fn accumulate(
    acc: &mut Option<Array4<f32>>,
    response: Array4<f32>,
    weight: f32,
    context: &'static str,
) -> SiamRpnResult<()> {
    match acc {
        None => {
            *acc = Some(response * weight);
            Ok(())
        }
        Some(sum) => {
            if sum.dim() != response.dim() {
                return Err(shape_mismatch(context, sum.dim(), response.dim()));
            }
            *sum += &(response * weight);
            Ok(())
        }
    }
}

/// Realigns a `(N, groups*A, H, W)` map into `(N*H*W*A, groups)` rows.
///
/// The row order is batch, then row-major cells, then base anchor, matching
/// the anchor grid flattening; within a row the `groups` channel blocks are
/// gathered across the channel dimension.
pub(crate) fn flatten_grouped(
    map: &Array4<f32>,
    groups: usize,
    context: &'static str,
) -> SiamRpnResult<Array2<f32>> {
    let (n, c, h, w) = map.dim();
    if c % groups != 0 {
        return Err(shape_mismatch(
            context,
            format!("channels divisible by {groups}"),
            c,
        ));
    }
    let num_base = c / groups;
    let mut data = Vec::with_capacity(n * h * w * num_base * groups);
    for b in 0..n {
        for y in 0..h {
            for x in 0..w {
                for a in 0..num_base {
                    for g in 0..groups {
                        data.push(map[[b, g * num_base + a, y, x]]);
                    }
                }
            }
        }
    }
    Array2::from_shape_vec((n * h * w * num_base, groups), data)
        .map_err(|_| shape_mismatch(context, (n * h * w * num_base, groups), (n, c, h, w)))
}
