// =============================================================================
// Activity log — append-only, bounded ring per BotSession
// =============================================================================
//
// The source's activity payloads are free-form dictionaries keyed by
// `kind`; here they become a tagged enum so every consumer gets
// compile-time exhaustiveness over the kind set (spec.md §9's "dynamic
// typing translation" note, applied).
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of activities retained per bot before the oldest is
/// evicted. Matches the order of magnitude spec.md §3 names ("~1000").
pub const MAX_ACTIVITIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Spike,
    Signal,
    Order,
    Fill,
    Exit,
    Pnl,
    Cooldown,
    Confirm,
    Error,
    System,
}

/// Typed payload for an `Activity`, keyed by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityDetails {
    Spike { max_change_pct: f64, window_sec: u64, direction: String, is_volatility_filtered: bool },
    Signal { action: String, price: f64, reason: String },
    Order { side: String, amount_usd: f64, limit_price: f64, client_order_id: String },
    Fill { side: String, fill_price: f64, fill_shares: f64, order_id: String, simulated: bool, fallback_pricing: bool },
    Exit { reason: String, exit_price: f64 },
    Pnl { pnl_usd: f64, pnl_pct: f64, realized_pnl_usd: f64 },
    Cooldown { seconds_remaining: u64 },
    Confirm { decision_id: u64 },
    Error { code: String, recoverable: bool },
    System { message: String },
    PreCheckFailed { rule: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub bot_id: String,
    pub kind: ActivityKind,
    pub message: String,
    pub details: ActivityDetails,
}

impl Activity {
    pub fn new(bot_id: &str, kind: ActivityKind, message: impl Into<String>, details: ActivityDetails) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            bot_id: bot_id.to_string(),
            kind,
            message: message.into(),
            details,
        }
    }
}

/// Bounded, append-only activity ring. Ring-by-truncation, matching
/// `app_state.rs`'s `push_error`/`push_decision` pattern.
#[derive(Default)]
pub struct ActivityRing {
    entries: RwLock<Vec<Activity>>,
}

impl ActivityRing {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    pub fn push(&self, activity: Activity) {
        let mut entries = self.entries.write();
        entries.push(activity);
        while entries.len() > MAX_ACTIVITIES {
            entries.remove(0);
        }
    }

    /// Most recent `limit` activities, newest last.
    pub fn recent(&self, limit: usize) -> Vec<Activity> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let ring = ActivityRing::new();
        for i in 0..(MAX_ACTIVITIES + 10) {
            ring.push(Activity::new(
                "bot-1",
                ActivityKind::System,
                format!("event {i}"),
                ActivityDetails::System { message: format!("event {i}") },
            ));
        }
        assert_eq!(ring.len(), MAX_ACTIVITIES);
        let recent = ring.recent(1);
        assert_eq!(recent[0].message, format!("event {}", MAX_ACTIVITIES + 9));
    }

    #[test]
    fn recent_caps_at_requested_limit() {
        let ring = ActivityRing::new();
        for i in 0..5 {
            ring.push(Activity::new("bot-1", ActivityKind::System, format!("e{i}"), ActivityDetails::System { message: format!("e{i}") }));
        }
        assert_eq!(ring.recent(2).len(), 2);
        assert_eq!(ring.recent(100).len(), 5);
    }
}
