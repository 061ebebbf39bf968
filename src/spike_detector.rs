// =============================================================================
// Spike Detector (C4) — multi-window lookback with a volatility gate
// =============================================================================
//
// Free functions over a `&HistoryRing`; no internal state beyond what's
// read from the ring on each call.
// =============================================================================

use serde::Serialize;

use crate::history_ring::HistoryRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpikeReport {
    pub max_change_pct: f64,
    pub max_change_window_secs: u64,
    pub direction: SpikeDirection,
    pub is_volatility_filtered: bool,
    pub is_spike: bool,
}

/// Evaluate the spike condition at `(now_ms, price)` against the configured
/// windows. Windows for which history doesn't reach back far enough are
/// skipped; if none qualify, returns `None` (spec.md §8 boundary: fewer
/// than 2 samples in every window -> no spike, no error).
pub fn evaluate(
    ring: &HistoryRing,
    now_ms: i64,
    price: f64,
    windows_secs: &[u64],
    threshold_pct: f64,
    max_volatility_cv: f64,
) -> Option<SpikeReport> {
    let mut best: Option<(f64, u64)> = None; // (change_pct, window_secs)

    for &window in windows_secs {
        let base_ts = now_ms - (window as i64) * 1000;
        let Some(base_point) = ring.price_at_or_before(base_ts) else { continue };
        if base_point.price <= 0.0 {
            continue;
        }
        let change_pct = 100.0 * (price - base_point.price) / base_point.price;

        best = Some(match best {
            None => (change_pct, window),
            Some((best_change, best_window)) => {
                let (a, b) = (change_pct.abs(), best_change.abs());
                // Tie-break: shorter window wins.
                if a > b || (a == b && window < best_window) {
                    (change_pct, window)
                } else {
                    (best_change, best_window)
                }
            }
        });
    }

    let (max_change_pct, max_change_window_secs) = best?;

    let shortest_window = windows_secs.iter().copied().min().unwrap_or(0);
    let cv = volatility_cv(ring, now_ms, shortest_window);
    let is_volatility_filtered = cv.map(|c| c > max_volatility_cv).unwrap_or(false);

    let direction = if max_change_pct >= 0.0 { SpikeDirection::Up } else { SpikeDirection::Down };
    let is_spike = max_change_pct.abs() >= threshold_pct && !is_volatility_filtered;

    Some(SpikeReport { max_change_pct, max_change_window_secs, direction, is_volatility_filtered, is_spike })
}

/// Coefficient of variation (`100 * stdev / mean`) over the samples in the
/// shortest configured window, ending at `now_ms`.
fn volatility_cv(ring: &HistoryRing, now_ms: i64, window_secs: u64) -> Option<f64> {
    let from_ts = now_ms - (window_secs as i64) * 1000;
    let samples = ring.samples_in_range(from_ts, now_ms);
    if samples.len() < 2 {
        return None;
    }
    let mean: f64 = samples.iter().map(|p| p.price).sum::<f64>() / samples.len() as f64;
    if mean == 0.0 {
        return None;
    }
    let variance: f64 = samples.iter().map(|p| (p.price - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    Some(100.0 * variance.sqrt() / mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_spike_with_insufficient_history() {
        let ring = HistoryRing::new(100);
        ring.append(0, 0.5);
        let report = evaluate(&ring, 1000, 0.52, &[600], 3.0, 100.0);
        assert!(report.is_none());
    }

    #[test]
    fn downward_spike_detected() {
        let ring = HistoryRing::new(100);
        ring.append(0, 0.5);
        ring.append(30_000, 0.5);
        ring.append(600_000, 0.5);
        ring.append(601_000, 0.482);

        let report = evaluate(&ring, 601_000, 0.482, &[600], 3.0, 100.0).unwrap();
        assert!(report.is_spike);
        assert_eq!(report.direction, SpikeDirection::Down);
        assert!((report.max_change_pct - (-3.6)).abs() < 0.01);
    }

    #[test]
    fn tie_break_prefers_shorter_window() {
        let ring = HistoryRing::new(1000);
        ring.append(-1_800_000, 0.50);
        ring.append(-600_000, 0.50);
        ring.append(0, 0.55);

        let report = evaluate(&ring, 0, 0.55, &[600, 1800], 1.0, 100.0).unwrap();
        assert_eq!(report.max_change_window_secs, 600);
    }

    #[test]
    fn volatility_gate_suppresses_spike() {
        let ring = HistoryRing::new(1000);
        // High-frequency noisy samples inside the shortest window inflate CV.
        for i in 0..20 {
            let noisy = if i % 2 == 0 { 0.50 } else { 0.30 };
            ring.append(i * 1000, noisy);
        }
        ring.append(20_000, 0.54);

        let report = evaluate(&ring, 20_000, 0.54, &[20], 3.0, 5.0).unwrap();
        assert!(report.is_volatility_filtered);
        assert!(!report.is_spike);
    }

    #[test]
    fn sub_threshold_change_is_not_a_spike() {
        let ring = HistoryRing::new(100);
        ring.append(0, 0.50);
        ring.append(600_000, 0.505);
        let report = evaluate(&ring, 600_000, 0.505, &[600], 3.0, 100.0).unwrap();
        assert!(!report.is_spike);
    }
}
