// =============================================================================
// Bot Session (C8) — one running bot's decision loop
// =============================================================================
//
// A single task owns Strategy/Target state for one bot: it is the sole
// consumer of `PriceStream` updates and the sole caller of `Executor`,
// matching spec.md §4.8/§5's single-writer invariant. Everything else
// (the control surface, the registry) only ever talks to `BotSession`
// through its command channel and read-only getters.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::activity::{Activity, ActivityDetails, ActivityKind, ActivityRing};
use crate::config::{BotConfig, GlobalSettings};
use crate::exchange::{ExchangeClient, WalletCredentials};
use crate::execution::{ExecutionOutcome, Executor};
use crate::history_ring::HistoryRing;
use crate::price_stream::{PriceStream, PriceUpdate};
use crate::registry::{BusEvent, EventBus};
use crate::risk::{DailyLossRegistry, RiskCheckInput};
use crate::spike_detector;
use crate::strategy::{DecisionKind, Position, StrategyEngine, StrategyState, TradeDecision};
use crate::types::{BotStatus, Side};

/// How long `stop()` waits for an in-flight EXITING settlement before
/// forcing the task down anyway.
const DEFAULT_EXIT_GRACE_SECONDS: u64 = 15;

/// Shared, process-wide collaborators every `BotSession` needs. Cheap to
/// clone (everything inside is already an `Arc`).
#[derive(Clone)]
pub struct SessionContext {
    pub client: Arc<dyn ExchangeClient>,
    pub bus: Arc<EventBus>,
    pub daily_loss: Arc<DailyLossRegistry>,
    pub killswitch: Arc<AtomicBool>,
    pub global_settings: Arc<RwLock<GlobalSettings>>,
}

/// Minimal bot snapshot carried by `bot_*` and `init` events and returned
/// from the control surface's list/get endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BotSummary {
    pub id: String,
    pub name: String,
    pub status: BotStatus,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default, Clone)]
struct SessionCounters {
    trades_this_session: u32,
    session_realized_pnl_usd: f64,
    last_signal_time: Option<DateTime<Utc>>,
    last_exit_time: Option<DateTime<Utc>>,
}

#[derive(Default, Serialize, Deserialize)]
struct SettlementRecord {
    position: Option<Position>,
}

impl SettlementRecord {
    fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("reading settlement record {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing settlement record {}", path.display()))
    }

    fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn clear(path: &PathBuf) {
        std::fs::remove_file(path).ok();
    }
}

enum Command {
    Start,
    Pause,
    Resume,
    Stop { force: bool, done: oneshot::Sender<()> },
    ManualTrade { side: Side, done: oneshot::Sender<Result<(), String>> },
    Close { done: oneshot::Sender<Result<(), String>> },
    Shutdown,
}

/// One bot's runtime state plus the command channel used to drive it.
/// Position/Target mutation happens only inside the task spawned by
/// `spawn()` — everything here is either read-only or routes through that
/// task via `cmd_tx`.
pub struct BotSession {
    id: String,
    name: RwLock<String>,
    config: RwLock<BotConfig>,
    status: RwLock<BotStatus>,
    strategy: StrategyEngine,
    history: Arc<HistoryRing>,
    price_stream: Arc<PriceStream>,
    activities: ActivityRing,
    executor: Executor,
    ctx: SessionContext,
    counters: RwLock<SessionCounters>,
    settlement_path: PathBuf,
    cmd_tx: mpsc::Sender<Command>,
    created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
}

pub struct BotHandle {
    pub session: Arc<BotSession>,
    task: tokio::task::JoinHandle<()>,
}

impl BotHandle {
    /// Abort the decision task outright. Only used by the registry when a
    /// bot is deleted while stopped; a running bot should be stopped first.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl BotSession {
    /// Build the session and spawn its command-processing task. The task
    /// starts idle (`Created`) and only runs the price stream / decision
    /// loop once `start()` is called.
    pub async fn spawn(config: BotConfig, ctx: SessionContext, settlement_path: PathBuf) -> Result<BotHandle> {
        config.validate().context("bot config failed validation")?;

        let id = config.id.clone();
        let name = config.name.clone();
        let history = Arc::new(HistoryRing::new(crate::history_ring::DEFAULT_CAPACITY));
        let price_stream = Arc::new(PriceStream::new(history.clone()));
        let executor = Executor::new(ctx.client.clone());
        let activities = ActivityRing::new();

        match SettlementRecord::load(&settlement_path) {
            Ok(record) => {
                if let Some(position) = record.position {
                    warn!(bot_id = %id, side = %position.side, entry_price = position.entry_price, "recovered an open position from a prior crash; not reopening it automatically");
                    activities.push(Activity::new(
                        &id,
                        ActivityKind::System,
                        format!("recovered-open-position: {} {} shares @ {:.4}, not reopened", position.side, position.shares, position.entry_price),
                        ActivityDetails::System { message: "recovered open position from settlement record; bot starts flat".into() },
                    ));
                }
            }
            Err(e) => warn!(bot_id = %id, error = %e, "failed to read settlement record, starting flat"),
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let now = Utc::now();

        let session = Arc::new(BotSession {
            id: id.clone(),
            name: RwLock::new(name),
            strategy: StrategyEngine::new(&config),
            config: RwLock::new(config),
            status: RwLock::new(BotStatus::Created),
            history,
            price_stream,
            activities,
            executor,
            ctx,
            counters: RwLock::new(SessionCounters::default()),
            settlement_path,
            cmd_tx,
            created_at: now,
            updated_at: RwLock::new(now),
        });

        let task = tokio::spawn(run_command_loop(session.clone(), cmd_rx));
        Ok(BotHandle { session, task })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> BotStatus {
        *self.status.read()
    }

    pub fn strategy(&self) -> &StrategyEngine {
        &self.strategy
    }

    pub fn history(&self) -> &Arc<HistoryRing> {
        &self.history
    }

    pub fn price_stream(&self) -> &Arc<PriceStream> {
        &self.price_stream
    }

    pub fn activities(&self) -> &ActivityRing {
        &self.activities
    }

    pub fn config(&self) -> BotConfig {
        self.config.read().clone()
    }

    /// On-demand order book read for the control surface. Independent of
    /// the decision loop; does not touch strategy state.
    pub async fn order_book(&self, depth: u32) -> Result<crate::exchange::OrderBook, String> {
        let config = self.config();
        let token_id = resolve_token_id(&self.ctx, &config).await?;
        self.ctx.client.get_order_book(&token_id, depth).await.map_err(|e| e.to_string())
    }

    /// Ad-hoc spike read for the control surface's `spike-status` endpoint.
    /// Evaluated against the latest known price; never feeds the decision
    /// loop itself.
    pub fn spike_status(&self) -> Option<spike_detector::SpikeReport> {
        let (price, timestamp_ms) = self.price_stream.current()?;
        let config = self.config();
        spike_detector::evaluate(&self.history, timestamp_ms, price, &config.spike_windows_seconds, config.spike_threshold_pct, config.max_volatility_cv)
    }

    pub fn summary(&self) -> BotSummary {
        let config = self.config.read();
        BotSummary {
            id: self.id.clone(),
            name: self.name.read().clone(),
            status: self.status(),
            dry_run: config.dry_run,
            created_at: self.created_at,
            updated_at: *self.updated_at.read(),
        }
    }

    pub fn update_config(&self, config: BotConfig) {
        self.strategy.update_params(&config);
        *self.name.write() = config.name.clone();
        *self.config.write() = config;
        *self.updated_at.write() = Utc::now();
    }

    pub async fn start(&self) -> Result<()> {
        self.cmd_tx.send(Command::Start).await.context("bot task is gone")
    }

    pub async fn pause(&self) -> Result<()> {
        self.cmd_tx.send(Command::Pause).await.context("bot task is gone")
    }

    pub async fn resume(&self) -> Result<()> {
        self.cmd_tx.send(Command::Resume).await.context("bot task is gone")
    }

    /// Stops the bot, waiting for the task to acknowledge shutdown. If a
    /// close is in flight (EXITING) the task waits up to
    /// `DEFAULT_EXIT_GRACE_SECONDS` for settlement before tearing down
    /// regardless (spec.md §5).
    pub async fn stop(&self, force: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { force, done: done_tx }).await.is_err() {
            *self.status.write() = BotStatus::Stopped;
            return;
        }
        let _ = tokio::time::timeout(std::time::Duration::from_secs(DEFAULT_EXIT_GRACE_SECONDS + 5), done_rx).await;
        *self.status.write() = BotStatus::Stopped;
    }

    pub async fn manual_trade(&self, side: Side) -> Result<(), String> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ManualTrade { side, done: done_tx }).await.is_err() {
            return Err("bot is not running".into());
        }
        done_rx.await.unwrap_or_else(|_| Err("bot task dropped the request".into()))
    }

    pub async fn manual_close(&self) -> Result<(), String> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { done: done_tx }).await.is_err() {
            return Err("bot is not running".into());
        }
        done_rx.await.unwrap_or_else(|_| Err("bot task dropped the request".into()))
    }

    fn publish(&self, event: BusEvent) {
        self.ctx.bus.publish(event);
    }
}

async fn run_command_loop(session: Arc<BotSession>, mut cmd_rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Start => {
                *session.status.write() = BotStatus::Running;
                session.publish(BusEvent::BotStarted { bot_id: session.id.clone(), timestamp: Utc::now(), snapshot: session.summary() });
                run_until_stopped(&session, &mut cmd_rx).await;
                if *session.status.read() != BotStatus::Error {
                    *session.status.write() = BotStatus::Stopped;
                }
            }
            Command::Stop { done, .. } => {
                let _ = done.send(());
            }
            Command::ManualTrade { done, .. } => {
                let _ = done.send(Err("bot is not running".into()));
            }
            Command::Close { done } => {
                let _ = done.send(Err("bot is not running".into()));
            }
            Command::Pause | Command::Resume => {}
            Command::Shutdown => break,
        }
    }
}

/// The active run loop: price stream + command handling, until `Stop` or
/// the channel closes. Returns once the bot is fully idle again.
async fn run_until_stopped(session: &Arc<BotSession>, cmd_rx: &mut mpsc::Receiver<Command>) {
    let config = session.config();
    let token_id = match resolve_token_id(&session.ctx, &config).await {
        Ok(t) => t,
        Err(e) => {
            error!(bot_id = %session.id, error = %e, "failed to resolve token id, bot entering error state");
            session.activities.push(Activity::new(&session.id, ActivityKind::Error, format!("startup failed: {e}"), ActivityDetails::Error { code: "startup_failed".into(), recoverable: false }));
            *session.status.write() = BotStatus::Error;
            return;
        }
    };

    let (price_tx, mut price_rx) = mpsc::unbounded_channel::<PriceUpdate>();
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel::<bool>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let (reconnect_min, reconnect_max) = {
        let s = session.ctx.global_settings.read();
        (s.stream_reconnect_min_seconds, s.stream_reconnect_max_seconds)
    };

    let stream = session.price_stream.clone();
    let client = session.ctx.client.clone();
    let stream_token = token_id.clone();
    let stream_task = tokio::spawn(async move {
        stream
            .run(
                client,
                stream_token,
                reconnect_min,
                reconnect_max,
                move |u| {
                    let _ = price_tx.send(u);
                },
                move |disconnected| {
                    let _ = disc_tx.send(disconnected);
                },
                shutdown_rx,
            )
            .await;
    });

    let mut paused = false;

    'outer: loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => break 'outer,
                    Some(Command::Start) => {}
                    Some(Command::Pause) => {
                        paused = true;
                        *session.status.write() = BotStatus::Paused;
                        session.publish(BusEvent::BotPaused { bot_id: session.id.clone(), timestamp: Utc::now(), snapshot: session.summary() });
                    }
                    Some(Command::Resume) => {
                        paused = false;
                        *session.status.write() = BotStatus::Running;
                        session.publish(BusEvent::BotResumed { bot_id: session.id.clone(), timestamp: Utc::now(), snapshot: session.summary() });
                    }
                    Some(Command::Stop { force, done }) => {
                        wait_for_exit_settlement(session, force).await;
                        let _ = done.send(());
                        break 'outer;
                    }
                    Some(Command::ManualTrade { side, done }) => {
                        let result = handle_manual_trade(session, side, &token_id).await;
                        let _ = done.send(result);
                    }
                    Some(Command::Close { done }) => {
                        let result = handle_manual_close(session, &token_id).await;
                        let _ = done.send(result);
                    }
                }
            }
            disconnected = disc_rx.recv() => {
                if let Some(d) = disconnected {
                    let message = if d { "price stream disconnected, falling back to polling" } else { "price stream reconnected" };
                    session.activities.push(Activity::new(&session.id, ActivityKind::System, message, ActivityDetails::System { message: message.into() }));
                }
            }
            update = price_rx.recv() => {
                match update {
                    Some(update) if !paused => handle_price_update(session, update, &token_id).await,
                    Some(_) => {}
                    None => {
                        warn!(bot_id = %session.id, "price stream task ended unexpectedly");
                        break 'outer;
                    }
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = stream_task.await;
}

/// If a close decision is mid-flight (EXITING), wait briefly for it to
/// settle so we don't tear down with a dangling unconfirmed order.
/// `force` skips the wait outright.
async fn wait_for_exit_settlement(session: &Arc<BotSession>, force: bool) {
    if force || session.strategy.state() != StrategyState::Exiting {
        return;
    }
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(DEFAULT_EXIT_GRACE_SECONDS);
    while tokio::time::Instant::now() < deadline {
        if session.strategy.state() != StrategyState::Exiting {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    warn!(bot_id = %session.id, "exit grace period elapsed with settlement still pending, stopping anyway");
}

async fn resolve_token_id(ctx: &SessionContext, config: &BotConfig) -> Result<String, String> {
    if let Some(token_id) = &config.token_id {
        return Ok(token_id.clone());
    }
    let slug = config.market_slug.as_ref().ok_or("neither token_id nor market_slug is configured")?;
    ctx.client.resolve_token_id(slug, config.outcome_index).await.map_err(|e| e.to_string())
}

async fn handle_price_update(session: &Arc<BotSession>, update: PriceUpdate, token_id: &str) {
    let config = session.config();
    let spike = spike_detector::evaluate(
        &session.history,
        update.timestamp_ms,
        update.price,
        &config.spike_windows_seconds,
        config.spike_threshold_pct,
        config.max_volatility_cv,
    );

    session.publish(BusEvent::PriceUpdate { bot_id: session.id.clone(), timestamp: Utc::now(), price: update.price, best_bid: None, best_ask: None });

    if let Some(report) = &spike {
        if report.is_spike {
            let direction = format!("{:?}", report.direction).to_lowercase();
            session.activities.push(Activity::new(
                &session.id,
                ActivityKind::Spike,
                format!("spike {direction} {:.2}% over {}s", report.max_change_pct, report.max_change_window_secs),
                ActivityDetails::Spike { max_change_pct: report.max_change_pct, window_sec: report.max_change_window_secs, direction: direction.clone(), is_volatility_filtered: report.is_volatility_filtered },
            ));
            session.publish(BusEvent::SpikeDetected { bot_id: session.id.clone(), timestamp: Utc::now(), max_change_pct: report.max_change_pct, window_sec: report.max_change_window_secs, direction });
        }
    }

    let now = Utc::now();
    let decision = session.strategy.on_price_update(now, update.price, spike.as_ref());
    let Some(decision) = decision else { return };

    session.counters.write().last_signal_time = Some(now);
    let is_close = matches!(decision.kind, DecisionKind::Close { .. });
    if is_close {
        session.strategy.mark_exiting();
    }
    process_decision(session, decision, update.price, token_id).await;
}

async fn process_decision(session: &Arc<BotSession>, decision: TradeDecision, stream_price: f64, token_id: &str) {
    let config = session.config();
    let wallet = WalletCredentials {
        wallet_secret: config.wallet_secret_encrypted.0.clone(),
        signature_mode: config.signature_mode,
        funder_address: config.funder_address.clone(),
    };

    let book = match session.ctx.client.get_order_book(token_id, 10).await {
        Ok(b) => b,
        Err(e) => {
            warn!(bot_id = %session.id, error = %e, "order book fetch failed, dropping decision");
            session.strategy.revert_to_pre_decision_state();
            return;
        }
    };
    let (usd_balance, usd_allowance) = match session.ctx.client.get_balance_and_allowance(&wallet).await {
        Ok(b) => (b.usd_balance, b.usd_allowance),
        Err(_) => (0.0, 0.0),
    };

    let (order_side, amount_usd, limit_price) = match &decision.kind {
        DecisionKind::Open { side, amount_usd, limit_price, .. } => (*side, *amount_usd, *limit_price),
        DecisionKind::Close { limit_price, .. } => {
            let position = session.strategy.position();
            let amount = position.as_ref().map(|p| p.amount_usd).unwrap_or(0.0);
            // Closing reverses the order action, mirroring the Executor's own rule.
            let side = match position.as_ref().map(|p| p.side) {
                Some(Side::Long) => Side::Short,
                Some(Side::Short) => Side::Long,
                None => Side::Long,
            };
            (side, amount, *limit_price)
        }
    };
    let is_buy = order_side == Side::Long;

    let counters = session.counters.read().clone();
    let settings = session.ctx.global_settings.read().clone();
    let has_position = session.strategy.position().is_some();
    let decision_closes_position = matches!(decision.kind, DecisionKind::Close { .. });
    let now = Utc::now();

    let risk_input = RiskCheckInput {
        killswitch_on: session.ctx.killswitch.load(Ordering::Acquire),
        trades_this_session: counters.trades_this_session,
        max_trades_per_session: config.max_trades_per_session,
        session_realized_pnl_usd: counters.session_realized_pnl_usd,
        session_loss_limit_usd: config.session_loss_limit_usd,
        daily_loss_limit_usd: settings.daily_loss_limit_usd,
        now,
        last_signal_time: counters.last_signal_time,
        cooldown_seconds: config.cooldown_seconds,
        last_exit_time: counters.last_exit_time,
        settlement_delay_seconds: config.settlement_delay_seconds,
        has_position,
        decision_closes_position,
        dry_run: config.dry_run,
        usd_balance,
        usd_allowance,
        amount_usd,
        is_buy,
        book: &book,
        min_bid_liquidity_usd: config.min_bid_liquidity_usd,
        min_ask_liquidity_usd: config.min_ask_liquidity_usd,
        max_spread_pct: config.max_spread_pct,
        slippage_tolerance: settings.slippage_tolerance,
        reference_price: stream_price,
        expected_fill_price: limit_price,
    };

    let outcome = session
        .executor
        .execute(&session.id, &decision, now, &wallet, token_id, config.dry_run, stream_price, risk_input, &session.ctx.daily_loss, &session.strategy, &session.activities)
        .await;

    apply_outcome(session, outcome, order_side, decision_closes_position, now);
}

fn apply_outcome(session: &Arc<BotSession>, outcome: ExecutionOutcome, order_side: Side, was_close: bool, now: DateTime<Utc>) {
    match outcome {
        ExecutionOutcome::Filled { fill_price, fill_shares, order_id, simulated, realized_pnl } => {
            {
                let mut counters = session.counters.write();
                counters.trades_this_session += 1;
                if let Some((pnl_usd, _)) = realized_pnl {
                    counters.session_realized_pnl_usd += pnl_usd;
                }
                if was_close {
                    counters.last_exit_time = Some(now);
                }
            }

            session.publish(BusEvent::TradeExecuted {
                bot_id: session.id.clone(),
                timestamp: now,
                side: order_side.to_string(),
                amount_usd: fill_shares * fill_price,
                fill_price,
                order_id,
                simulated,
            });

            if let Some((pnl_usd, pnl_pct)) = realized_pnl {
                session.publish(BusEvent::PositionClosed { bot_id: session.id.clone(), timestamp: now, pnl_usd, pnl_pct, reason: "settled".into() });
            }

            session.publish(BusEvent::PositionUpdate { bot_id: session.id.clone(), timestamp: now, position: session.strategy.position() });
            session.publish(BusEvent::TargetUpdate { bot_id: session.id.clone(), timestamp: now, target: session.strategy.target() });

            save_settlement(session);
        }
        ExecutionOutcome::PreCheckFailed(failure) => {
            session.publish(BusEvent::Error { bot_id: Some(session.id.clone()), timestamp: now, message: failure.to_string(), recoverable: true });
        }
        ExecutionOutcome::Rejected(reason) => {
            session.publish(BusEvent::Error { bot_id: Some(session.id.clone()), timestamp: now, message: reason, recoverable: false });
        }
        ExecutionOutcome::TransientFailExhausted(reason) => {
            session.publish(BusEvent::Error { bot_id: Some(session.id.clone()), timestamp: now, message: reason, recoverable: true });
        }
    }
}

fn save_settlement(session: &Arc<BotSession>) {
    let record = SettlementRecord { position: session.strategy.position() };
    if record.position.is_none() {
        SettlementRecord::clear(&session.settlement_path);
    } else if let Err(e) = record.save(&session.settlement_path) {
        warn!(bot_id = %session.id, error = %e, "failed to persist settlement record");
    }
}

async fn handle_manual_trade(session: &Arc<BotSession>, side: Side, token_id: &str) -> Result<(), String> {
    let price = session.price_stream.current().map(|(p, _)| p).ok_or("price stream has not warmed up yet")?;
    let Some(decision) = session.strategy.manual_open(side, price) else {
        return Err("bot already holds a position".into());
    };
    process_decision(session, decision, price, token_id).await;
    Ok(())
}

async fn handle_manual_close(session: &Arc<BotSession>, token_id: &str) -> Result<(), String> {
    let price = session.price_stream.current().map(|(p, _)| p).ok_or("price stream has not warmed up yet")?;
    let Some(decision) = session.strategy.manual_close(price) else {
        return Err("no open position to close".into());
    };
    session.strategy.mark_exiting();
    process_decision(session, decision, price, token_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptedSecret;
    use crate::exchange::mock::MockExchangeClient;
    use crate::types::{EntryMode, RebuyStrategy, SignatureMode, StrategyMode};

    fn bare_config(dry_run: bool) -> BotConfig {
        BotConfig {
            id: "bot-1".into(),
            name: "test".into(),
            description: None,
            market_slug: None,
            outcome_index: 0,
            token_id: Some("tok-1".into()),
            wallet_secret_encrypted: EncryptedSecret("enc:x".into()),
            signature_mode: SignatureMode::Direct,
            funder_address: None,
            spike_threshold_pct: 3.0,
            take_profit_pct: 5.0,
            stop_loss_pct: 3.0,
            max_hold_seconds: 3600,
            cooldown_seconds: 30,
            settlement_delay_seconds: 2,
            trade_size_usd: 5.0,
            max_balance_usd: 1000.0,
            strategy_mode: StrategyMode::SpikeFade,
            rebuy_strategy: RebuyStrategy::Immediate,
            rebuy_delay_seconds: 0,
            rebuy_drop_pct: 1.0,
            entry_mode: EntryMode::ImmediateBuy,
            entry_delay_seconds: 0,
            max_trades_per_session: 20,
            session_loss_limit_usd: 50.0,
            dry_run,
            spike_windows_seconds: vec![600],
            max_volatility_cv: 100.0,
            min_bid_liquidity_usd: 10.0,
            min_ask_liquidity_usd: 10.0,
            max_spread_pct: 5.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_ctx() -> SessionContext {
        SessionContext {
            client: Arc::new(MockExchangeClient::new(0.50)),
            bus: Arc::new(EventBus::new()),
            daily_loss: Arc::new(DailyLossRegistry::new()),
            killswitch: Arc::new(AtomicBool::new(false)),
            global_settings: Arc::new(RwLock::new(GlobalSettings::default())),
        }
    }

    #[tokio::test]
    async fn spawned_session_starts_created_and_transitions_to_running() {
        let dir = std::env::temp_dir().join(format!("spike-trader-session-test-{}", uuid::Uuid::new_v4()));
        let handle = BotSession::spawn(bare_config(true), test_ctx(), dir.join("bot-1.json")).await.unwrap();
        assert_eq!(handle.session.status(), BotStatus::Created);
        handle.session.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handle.session.status(), BotStatus::Running);
        handle.session.stop(true).await;
        assert_eq!(handle.session.status(), BotStatus::Stopped);
    }

    #[tokio::test]
    async fn update_config_while_stopped_updates_strategy_params() {
        let dir = std::env::temp_dir().join(format!("spike-trader-session-test-{}", uuid::Uuid::new_v4()));
        let handle = BotSession::spawn(bare_config(true), test_ctx(), dir.join("bot-1.json")).await.unwrap();
        let mut updated = bare_config(true);
        updated.trade_size_usd = 9.0;
        handle.session.update_config(updated);
        assert_eq!(handle.session.config().trade_size_usd, 9.0);
    }

    #[tokio::test]
    async fn manual_trade_rejected_while_not_running() {
        let dir = std::env::temp_dir().join(format!("spike-trader-session-test-{}", uuid::Uuid::new_v4()));
        let handle = BotSession::spawn(bare_config(true), test_ctx(), dir.join("bot-1.json")).await.unwrap();
        let result = handle.session.manual_trade(Side::Long).await;
        assert!(result.is_err());
    }
}
