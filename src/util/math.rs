//! Mathematical helpers for scoring and windowing.

/// Samples a 1-D Hanning (raised-cosine) window of length `len`.
///
/// Endpoints are zero; a single-sample window is the constant 1.
pub(crate) fn hanning(len: usize) -> Vec<f32> {
    if len == 0 {
        return Vec::new();
    }
    if len == 1 {
        return vec![1.0];
    }
    let denom = (len - 1) as f32;
    (0..len)
        .map(|n| 0.5 - 0.5 * (std::f32::consts::TAU * n as f32 / denom).cos())
        .collect()
}

/// Two-way softmax over `(bg, fg)` logits, returning the foreground probability.
pub(crate) fn softmax_fg(bg: f32, fg: f32) -> f32 {
    // Subtract the max before exponentiating to stay finite for large logits.
    let m = bg.max(fg);
    let eb = (bg - m).exp();
    let ef = (fg - m).exp();
    ef / (eb + ef)
}

/// Softmax over a small weight vector (multi-level fusion weights).
pub(crate) fn softmax(values: &[f32]) -> Vec<f32> {
    let m = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - m).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
