// =============================================================================
// Volume SMA — confirmation baseline for the entry filter
// =============================================================================

/// Trailing simple moving average of volumes, one output per full window.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
pub fn volume_sma(volumes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || volumes.len() < period {
        return Vec::new();
    }
    volumes
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

/// Ratio of the latest volume to its SMA baseline. `None` when the baseline
/// is unavailable or zero.
pub fn volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    let baseline = *volume_sma(volumes, period).last()?;
    if baseline <= 0.0 {
        return None;
    }
    let current = *volumes.last()?;
    let ratio = current / baseline;
    ratio.is_finite().then_some(ratio)
}
