//! Error types for siamrpn.

use thiserror::Error;

/// Result alias for siamrpn operations.
pub type SiamRpnResult<T> = std::result::Result<T, SiamRpnError>;

/// Errors that can occur when running the tracking head.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SiamRpnError {
    /// Tensor shapes disagree between inputs that must align.
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Operation or tensor pair being checked.
        context: &'static str,
        /// Human-readable expected shape.
        expected: String,
        /// Human-readable actual shape.
        got: String,
    },
    /// The anchor/window cache was queried with a second distinct score-map size.
    #[error("score-map size conflict: cache holds {cached:?}, requested {requested:?}")]
    CacheSizeConflict {
        /// Size the cache was populated with (height, width).
        cached: (usize, usize),
        /// Size of the current query (height, width).
        requested: (usize, usize),
    },
    /// The input data or parameters are invalid.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

/// Builds a `ShapeMismatch` from anything displayable as a shape.
pub(crate) fn shape_mismatch(
    context: &'static str,
    expected: impl std::fmt::Debug,
    got: impl std::fmt::Debug,
) -> SiamRpnError {
    SiamRpnError::ShapeMismatch {
        context,
        expected: format!("{expected:?}"),
        got: format!("{got:?}"),
    }
}
