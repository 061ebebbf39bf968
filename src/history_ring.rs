// =============================================================================
// Price History Ring (C3) — bounded, time-indexed PricePoint sequence
// =============================================================================
//
// Single-writer (Price Stream), many-reader (Spike Detector, snapshot
// publisher). Timestamps are non-decreasing; the ring evicts the oldest
// sample on overflow.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default capacity covers the longest default spike window (3600s) at a
/// conservative 1 sample/sec plus margin.
pub const DEFAULT_CAPACITY: usize = 3600 + 600;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

/// A bounded ring of `PricePoint`s ordered by non-decreasing timestamp.
pub struct HistoryRing {
    capacity: usize,
    points: RwLock<VecDeque<PricePoint>>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), points: RwLock::new(VecDeque::with_capacity(capacity)) }
    }

    /// Append a sample, evicting the oldest one if at capacity. O(1)
    /// amortized.
    pub fn append(&self, timestamp_ms: i64, price: f64) {
        let mut points = self.points.write();
        if let Some(last) = points.back() {
            debug_assert!(timestamp_ms >= last.timestamp_ms, "history ring timestamps must be non-decreasing");
        }
        if points.len() == self.capacity {
            points.pop_front();
        }
        points.push_back(PricePoint { timestamp_ms, price });
    }

    /// Binary search for the most recent sample with `timestamp_ms <=
    /// target_ts`. Returns `None` if history doesn't reach that far back.
    pub fn price_at_or_before(&self, target_ts: i64) -> Option<PricePoint> {
        let points = self.points.read();
        if points.is_empty() {
            return None;
        }
        // partition_point finds the first index where timestamp > target;
        // the sample just before it is the one we want.
        let idx = points.partition_point(|p| p.timestamp_ms <= target_ts);
        if idx == 0 {
            None
        } else {
            Some(points[idx - 1])
        }
    }

    /// All samples with `from_ts <= timestamp_ms <= to_ts`, oldest first.
    pub fn samples_in_range(&self, from_ts: i64, to_ts: i64) -> Vec<PricePoint> {
        let points = self.points.read();
        let start = points.partition_point(|p| p.timestamp_ms < from_ts);
        points
            .iter()
            .skip(start)
            .take_while(|p| p.timestamp_ms <= to_ts)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<PricePoint> {
        self.points.read().back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_at_capacity() {
        let ring = HistoryRing::new(3);
        ring.append(1, 0.1);
        ring.append(2, 0.2);
        ring.append(3, 0.3);
        ring.append(4, 0.4);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.price_at_or_before(1), None);
        assert_eq!(ring.price_at_or_before(2).unwrap().price, 0.2);
    }

    #[test]
    fn price_at_or_before_exact_and_gap() {
        let ring = HistoryRing::new(10);
        ring.append(100, 0.5);
        ring.append(200, 0.55);
        ring.append(400, 0.60);

        assert_eq!(ring.price_at_or_before(50), None);
        assert_eq!(ring.price_at_or_before(100).unwrap().price, 0.5);
        assert_eq!(ring.price_at_or_before(150).unwrap().price, 0.5);
        assert_eq!(ring.price_at_or_before(400).unwrap().price, 0.60);
        assert_eq!(ring.price_at_or_before(1000).unwrap().price, 0.60);
    }

    #[test]
    fn samples_in_range_bounds() {
        let ring = HistoryRing::new(10);
        for i in 0..5 {
            ring.append(i * 10, i as f64);
        }
        let samples = ring.samples_in_range(10, 30);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].timestamp_ms, 10);
        assert_eq!(samples[2].timestamp_ms, 30);
    }

    #[test]
    fn empty_ring_returns_none() {
        let ring = HistoryRing::new(10);
        assert_eq!(ring.price_at_or_before(0), None);
        assert!(ring.is_empty());
    }
}
