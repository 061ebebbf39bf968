// =============================================================================
// Registry & Broadcast (C9)
// =============================================================================
//
// `Registry` maps bot_id -> BotSession (Create/Get/List/Update/Delete,
// mirroring spec.md §4.9). `EventBus` is a typed publish/subscribe layer
// over `tokio::sync::broadcast`, chosen over `app_state.rs`'s version-poll
// idiom specifically for its native Lagged-receiver semantics, which match
// the drop-oldest + one-`subscriber_lagged`-event-per-drain rule.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::activity::Activity;
use crate::config::{BotConfig, ConfigPaths, GlobalSettings};
use crate::session::{BotHandle, BotSession, BotSummary, SessionContext};
use crate::strategy::{Position, Target};
use crate::types::BotStatus;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Typed events published on the bus. The `type` tag matches spec.md §6's
/// push-frame table verbatim via `rename_all = "snake_case"`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Init { timestamp: DateTime<Utc>, bots: Vec<BotSummary> },
    PriceUpdate { bot_id: String, timestamp: DateTime<Utc>, price: f64, best_bid: Option<f64>, best_ask: Option<f64> },
    PositionUpdate { bot_id: String, timestamp: DateTime<Utc>, position: Option<Position> },
    TargetUpdate { bot_id: String, timestamp: DateTime<Utc>, target: Option<Target> },
    SpikeDetected { bot_id: String, timestamp: DateTime<Utc>, max_change_pct: f64, window_sec: u64, direction: String },
    Activity { bot_id: String, timestamp: DateTime<Utc>, activity: Activity },
    TradeExecuted { bot_id: String, timestamp: DateTime<Utc>, side: String, amount_usd: f64, fill_price: f64, order_id: String, simulated: bool },
    PositionClosed { bot_id: String, timestamp: DateTime<Utc>, pnl_usd: f64, pnl_pct: f64, reason: String },
    BotCreated { bot_id: String, timestamp: DateTime<Utc>, snapshot: BotSummary },
    BotUpdated { bot_id: String, timestamp: DateTime<Utc>, snapshot: BotSummary },
    BotDeleted { bot_id: String, timestamp: DateTime<Utc> },
    BotStarted { bot_id: String, timestamp: DateTime<Utc>, snapshot: BotSummary },
    BotStopped { bot_id: String, timestamp: DateTime<Utc>, snapshot: BotSummary },
    BotPaused { bot_id: String, timestamp: DateTime<Utc>, snapshot: BotSummary },
    BotResumed { bot_id: String, timestamp: DateTime<Utc>, snapshot: BotSummary },
    SettingsUpdated { timestamp: DateTime<Utc>, settings: GlobalSettings },
    Error { bot_id: Option<String>, timestamp: DateTime<Utc>, message: String, recoverable: bool },
    SubscriberLagged { timestamp: DateTime<Utc>, skipped: u64 },
}

/// Publish/subscribe bus. Publishing never blocks: a full subscriber queue
/// simply drops its oldest entries (broadcast's native behavior), and the
/// subscriber's next `recv()` surfaces a `Lagged` error that callers should
/// translate into exactly one `subscriber_lagged` event.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: BusEvent) {
        // No active subscribers is not an error; the event is simply dropped.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

/// Drains `rx` once, translating a `Lagged` gap into a single synthetic
/// `subscriber_lagged` event. Callers (the WS handler) loop this.
pub async fn recv_or_lagged(rx: &mut broadcast::Receiver<BusEvent>) -> Option<BusEvent> {
    match rx.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "event bus subscriber lagged, dropping oldest events");
            Some(BusEvent::SubscriberLagged { timestamp: Utc::now(), skipped })
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

/// Maps `bot_id` -> running session. The sole owner of bot lifecycle;
/// HTTP handlers only ever go through here.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<BotHandle>>>,
    paths: ConfigPaths,
    ctx: SessionContext,
}

impl Registry {
    pub fn new(paths: ConfigPaths, ctx: SessionContext) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), paths, ctx }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.ctx.bus.clone()
    }

    /// Load every persisted bot at startup and materialize a session for
    /// each, logging (but never auto-reopening) any recovered open position.
    pub async fn load_all(&self) -> Result<()> {
        let configs = BotConfig::load_all(&self.paths.bots_dir).context("failed to load persisted bot configs")?;
        for config in configs {
            if let Err(e) = self.create_from_config(config).await {
                warn!(error = %e, "failed to materialize persisted bot, skipping");
            }
        }
        Ok(())
    }

    pub async fn create(&self, config: BotConfig) -> Result<BotSummary> {
        config.save(&self.paths.bots_dir)?;
        let handle = self.create_from_config(config).await?;
        let summary = handle.session.summary();
        self.ctx.bus.publish(BusEvent::BotCreated { bot_id: summary.id.clone(), timestamp: Utc::now(), snapshot: summary.clone() });
        Ok(summary)
    }

    async fn create_from_config(&self, config: BotConfig) -> Result<Arc<BotHandle>> {
        let bot_id = config.id.clone();
        let settlement_path = self.paths.settlements_dir.join(format!("{bot_id}.json"));
        let handle = Arc::new(BotSession::spawn(config, self.ctx.clone(), settlement_path).await?);
        self.sessions.write().insert(bot_id, handle.clone());
        Ok(handle)
    }

    pub fn get(&self, bot_id: &str) -> Option<Arc<BotHandle>> {
        self.sessions.read().get(bot_id).cloned()
    }

    pub fn list(&self) -> Vec<BotSummary> {
        self.sessions.read().values().map(|h| h.session.summary()).collect()
    }

    /// Every live session handle, used by graceful shutdown to fan out
    /// close/stop across all bots in parallel.
    pub fn handles(&self) -> Vec<Arc<BotHandle>> {
        self.sessions.read().values().cloned().collect()
    }

    pub async fn update(&self, bot_id: &str, config: BotConfig) -> Result<BotSummary> {
        let handle = self.get(bot_id).context("bot not found")?;
        if handle.session.status() == BotStatus::Running {
            bail!("cannot update a running bot; stop it first");
        }
        config.save(&self.paths.bots_dir)?;
        handle.session.update_config(config);
        let summary = handle.session.summary();
        self.ctx.bus.publish(BusEvent::BotUpdated { bot_id: bot_id.to_string(), timestamp: Utc::now(), snapshot: summary.clone() });
        Ok(summary)
    }

    /// `force=true` stops a running bot first rather than rejecting.
    pub async fn delete(&self, bot_id: &str, force: bool) -> Result<()> {
        let handle = self.get(bot_id).context("bot not found")?;
        if handle.session.status() == BotStatus::Running {
            if !force {
                bail!("cannot delete a running bot without force");
            }
            handle.session.stop(false).await;
        }
        self.sessions.write().remove(bot_id);
        BotConfig::delete(bot_id, &self.paths.bots_dir)?;
        info!(bot_id, "bot deleted (settlement record left on disk)");
        self.ctx.bus.publish(BusEvent::BotDeleted { bot_id: bot_id.to_string(), timestamp: Utc::now() });
        Ok(())
    }

    pub fn init_snapshot(&self) -> BusEvent {
        BusEvent::Init { timestamp: Utc::now(), bots: self.list() }
    }
}
