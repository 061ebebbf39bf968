// =============================================================================
// Price Stream (C2) — stream-primary, poll-fallback price feed
// =============================================================================
//
// Merges `ExchangeClient::subscribe_market` with a REST poll fallback via
// `tokio::select!`, producing a single authoritative `(price, timestamp)`
// pair with sequence numbers and a warmup gate.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::exchange::{ExchangeClient, MarketEvent};
use crate::history_ring::HistoryRing;

const DEFAULT_POLL_INTERVAL_LIVE: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL_DISCONNECTED: Duration = Duration::from_secs(1);
const STALENESS_THRESHOLD: Duration = Duration::from_secs(10);

/// A single price update, with a strictly increasing sequence number.
#[derive(Debug, Clone, Copy)]
pub struct PriceUpdate {
    pub price: f64,
    pub timestamp_ms: i64,
    pub sequence: u64,
    pub fallback_pricing: bool,
}

struct Latest {
    price: f64,
    timestamp_ms: i64,
}

/// Owns the authoritative `(price, timestamp)` pair for one bot's token,
/// backed by the shared `HistoryRing`. Single-writer: only the task spawned
/// by `run` mutates it.
pub struct PriceStream {
    latest: RwLock<Option<Latest>>,
    sequence: AtomicU64,
    last_stream_emit_ms: AtomicI64,
    warm: std::sync::atomic::AtomicBool,
    ring: Arc<HistoryRing>,
}

impl PriceStream {
    pub fn new(ring: Arc<HistoryRing>) -> Self {
        Self {
            latest: RwLock::new(None),
            sequence: AtomicU64::new(0),
            last_stream_emit_ms: AtomicI64::new(i64::MIN),
            warm: std::sync::atomic::AtomicBool::new(false),
            ring,
        }
    }

    pub fn current(&self) -> Option<(f64, i64)> {
        self.latest.read().as_ref().map(|l| (l.price, l.timestamp_ms))
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// Applies dedup (only emit on price change or ≥1s elapsed) and the
    /// monotonic-timestamp clamp, then records the point in the ring.
    fn emit(&self, price: f64, mut timestamp_ms: i64, fallback_pricing: bool) -> Option<PriceUpdate> {
        {
            let latest = self.latest.read();
            if let Some(l) = latest.as_ref() {
                if timestamp_ms <= l.timestamp_ms {
                    timestamp_ms = l.timestamp_ms + 1;
                }
                let unchanged = (price - l.price).abs() < f64::EPSILON;
                let recent = timestamp_ms - l.timestamp_ms < 1000;
                if unchanged && recent {
                    return None;
                }
            }
        }

        *self.latest.write() = Some(Latest { price, timestamp_ms });
        self.ring.append(timestamp_ms, price);
        self.warm.store(true, Ordering::Release);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Some(PriceUpdate { price, timestamp_ms, sequence, fallback_pricing })
    }

    /// Runs until `shutdown` resolves. Feeds `on_update` for every accepted
    /// `PriceUpdate`; `stream_disconnected`/`stream_reconnected` transitions
    /// are reported via `on_disconnect_change`.
    #[instrument(skip_all, fields(token_id))]
    pub async fn run(
        self: Arc<Self>,
        client: Arc<dyn ExchangeClient>,
        token_id: String,
        reconnect_min_secs: u64,
        reconnect_max_secs: u64,
        mut on_update: impl FnMut(PriceUpdate) + Send,
        mut on_disconnect_change: impl FnMut(bool) + Send,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) {
        let mut market_events = client.subscribe_market(&token_id, reconnect_min_secs, reconnect_max_secs);
        let mut disconnected = false;
        let mut poll_interval = tokio::time::interval(DEFAULT_POLL_INTERVAL_LIVE);

        loop {
            let now_stale = {
                let last = self.last_stream_emit_ms.load(Ordering::Relaxed);
                last == i64::MIN || (chrono::Utc::now().timestamp_millis() - last) > STALENESS_THRESHOLD.as_millis() as i64
            };
            let next_disconnected = disconnected || now_stale;
            if next_disconnected != disconnected {
                disconnected = next_disconnected;
                on_disconnect_change(disconnected);
                poll_interval = tokio::time::interval(if disconnected {
                    DEFAULT_POLL_INTERVAL_DISCONNECTED
                } else {
                    DEFAULT_POLL_INTERVAL_LIVE
                });
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("price stream shutting down");
                    return;
                }

                maybe_event = market_events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if let Some((price, ts)) = price_from_event(&event) {
                                self.last_stream_emit_ms.store(ts, Ordering::Relaxed);
                                if let Some(update) = self.emit(price, ts, false) {
                                    on_update(update);
                                }
                            }
                        }
                        None => {
                            warn!("market event channel closed, relying on poll fallback");
                            // Sleep briefly so we don't spin on a closed channel.
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }

                _ = poll_interval.tick() => {
                    match client.get_market_price(&token_id).await {
                        Ok(price) => {
                            let ts = chrono::Utc::now().timestamp_millis();
                            let fallback = disconnected;
                            if let Some(update) = self.emit(price, ts, fallback) {
                                on_update(update);
                            }
                        }
                        Err(e) => debug!(error = %e, "poll fallback failed, will retry next tick"),
                    }
                }
            }
        }
    }
}

fn price_from_event(event: &MarketEvent) -> Option<(f64, i64)> {
    match event {
        MarketEvent::LastTrade { timestamp_ms, price } => Some((*price, *timestamp_ms)),
        MarketEvent::PriceChange { timestamp_ms, best_bid, best_ask } => {
            if best_bid <= &0.0 {
                return None;
            }
            let spread_pct = 100.0 * (best_ask - best_bid) / best_bid;
            let price = if spread_pct <= 10.0 { (best_bid + best_ask) / 2.0 } else { *best_ask };
            Some((price, *timestamp_ms))
        }
        MarketEvent::Book { timestamp_ms, book } => {
            let bid = book.best_bid()?;
            let ask = book.best_ask()?;
            if bid <= 0.0 {
                return None;
            }
            let spread_pct = 100.0 * (ask - bid) / bid;
            let price = if spread_pct <= 10.0 { (bid + ask) / 2.0 } else { ask };
            Some((price, *timestamp_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_unchanged_rapid_updates() {
        let ring = Arc::new(HistoryRing::new(100));
        let stream = PriceStream::new(ring);
        assert!(stream.emit(0.5, 1000, false).is_some());
        assert!(stream.emit(0.5, 1200, false).is_none());
        assert!(stream.emit(0.5, 2200, false).is_some());
    }

    #[test]
    fn changed_price_always_emits() {
        let ring = Arc::new(HistoryRing::new(100));
        let stream = PriceStream::new(ring);
        stream.emit(0.5, 1000, false);
        let update = stream.emit(0.51, 1050, false).unwrap();
        assert_eq!(update.sequence, 2);
    }

    #[test]
    fn non_increasing_timestamp_is_clamped() {
        let ring = Arc::new(HistoryRing::new(100));
        let stream = PriceStream::new(ring);
        stream.emit(0.5, 1000, false);
        let update = stream.emit(0.52, 1000, false).unwrap();
        assert_eq!(update.timestamp_ms, 1001);
    }

    #[test]
    fn first_emit_marks_warm() {
        let ring = Arc::new(HistoryRing::new(100));
        let stream = PriceStream::new(ring);
        assert!(!stream.is_warm());
        stream.emit(0.5, 1000, false);
        assert!(stream.is_warm());
    }

    #[test]
    fn price_from_book_event_uses_midpoint_rule() {
        use crate::exchange::{BookLevel, OrderBook};
        let book = OrderBook {
            bids: vec![BookLevel { price: 0.49, size_shares: 10.0 }],
            asks: vec![BookLevel { price: 0.50, size_shares: 10.0 }],
        };
        let event = MarketEvent::Book { timestamp_ms: 1, book };
        let (price, _) = price_from_event(&event).unwrap();
        assert!((price - 0.495).abs() < 1e-9);
    }
}
