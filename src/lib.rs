//! SiamRPN is a Siamese region-proposal tracking head.
//!
//! Given pre-computed exemplar (template) and search-region features, the
//! head scores every anchor location via depth-wise cross-correlation, turns
//! ground-truth boxes into dense per-anchor training targets with distinct
//! positive-pair and negative-pair regimes, and at inference decodes the raw
//! maps into a single tracked box with penalty scoring, a Hanning centering
//! prior and temporal smoothing. Feature extraction, learned convolution
//! weights and loss backpropagation live outside this crate and are injected
//! as strategy objects.

pub mod anchors;
pub mod assign;
pub mod bbox;
pub mod corr;
pub mod head;
pub mod loss;
pub(crate) mod trace;
pub mod util;

pub use anchors::{AnchorGenerator, ScoreMapSize, SiamRpnAnchorGenerator};
pub use assign::{
    AssignResult, BoxAssigner, BoxSampler, MaxIouAssigner, RandomSampler, SamplingResult,
};
pub use bbox::{iou, BoxCoder, BoxCxcywh, BoxXyxy, DeltaXywhCoder};
pub use corr::{
    depthwise_correlation, CorrelationHead, FeatureTransform, Identity, PointwiseConv,
};
pub use head::{
    GtInstance, HeadComponents, HeadConfig, RpnLosses, SiameseRpnHead, TestConfig, TrackTargets,
    TrainConfig,
};
pub use loss::{ClassificationLoss, CrossEntropySumLoss, L1SumLoss, RegressionLoss};
pub use util::{SiamRpnError, SiamRpnResult};
