// =============================================================================
// Strategy / Target State Machine (C5) — the "Train of Trade" cycle
// =============================================================================
//
// Two orthogonal observables (`has_position`, `has_target`) drive five
// states: FLAT, ARMED, HOLDING, EXITING, COOLDOWN. Two selectable modes
// share this state space: Spike-fade and Train-of-Trade (spec.md §4.5,
// DESIGN.md Open Question 1).
//
// Position/Target mutation happens only through the methods below, called
// from a single decision task per bot (spec.md §4.8's single-writer
// invariant) — this module does not spawn tasks or hold locks itself.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::BotConfig;
use crate::spike_detector::{SpikeDirection, SpikeReport};
use crate::types::{EntryMode, RebuyStrategy, Side, StrategyMode, TargetAction, TargetCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyState {
    Flat,
    Armed,
    Holding,
    Exiting,
    Cooldown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub amount_usd: f64,
    pub shares: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub deadline: DateTime<Utc>,
    pub pending_settlement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub action: TargetAction,
    pub price: f64,
    pub condition: TargetCondition,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TimeExit,
    ManualClose,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TimeExit => "time_exit",
            ExitReason::ManualClose => "manual_close",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub enum DecisionKind {
    Open { side: Side, amount_usd: f64, limit_price: f64, reason: String },
    Close { reason: ExitReason, limit_price: f64 },
}

/// A proposed trade. Carries a monotonically increasing `decision_id` so
/// the Executor can treat repeated emission of the same id as a no-op
/// (spec.md §4.5 Idempotency, §8 invariant 5).
#[derive(Debug, Clone)]
pub struct TradeDecision {
    pub decision_id: u64,
    pub kind: DecisionKind,
}

struct Params {
    spike_threshold_pct: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_hold_seconds: u64,
    cooldown_seconds: u64,
    trade_size_usd: f64,
    strategy_mode: StrategyMode,
    rebuy_strategy: RebuyStrategy,
    rebuy_delay_seconds: u64,
    rebuy_drop_pct: f64,
    entry_mode: EntryMode,
    entry_delay_seconds: u64,
}

impl From<&BotConfig> for Params {
    fn from(c: &BotConfig) -> Self {
        Self {
            spike_threshold_pct: c.spike_threshold_pct,
            take_profit_pct: c.take_profit_pct,
            stop_loss_pct: c.stop_loss_pct,
            max_hold_seconds: c.max_hold_seconds,
            cooldown_seconds: c.cooldown_seconds,
            trade_size_usd: c.trade_size_usd,
            strategy_mode: c.strategy_mode,
            rebuy_strategy: c.rebuy_strategy,
            rebuy_delay_seconds: c.rebuy_delay_seconds,
            rebuy_drop_pct: c.rebuy_drop_pct,
            entry_mode: c.entry_mode,
            entry_delay_seconds: c.entry_delay_seconds,
        }
    }
}

/// Owns at most one Target and at most one Position (spec.md §3 invariant).
pub struct StrategyEngine {
    params: RwLock<Params>,
    state: RwLock<StrategyState>,
    position: RwLock<Option<Position>>,
    target: RwLock<Option<Target>>,
    cooldown_started_at: RwLock<Option<DateTime<Utc>>>,
    warmed_since: RwLock<Option<DateTime<Utc>>>,
    next_decision_id: AtomicU64,
}

impl StrategyEngine {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            params: RwLock::new(Params::from(config)),
            state: RwLock::new(StrategyState::Flat),
            position: RwLock::new(None),
            target: RwLock::new(None),
            cooldown_started_at: RwLock::new(None),
            warmed_since: RwLock::new(None),
            next_decision_id: AtomicU64::new(1),
        }
    }

    pub fn update_params(&self, config: &BotConfig) {
        *self.params.write() = Params::from(config);
    }

    pub fn state(&self) -> StrategyState {
        *self.state.read()
    }

    pub fn position(&self) -> Option<Position> {
        self.position.read().clone()
    }

    pub fn target(&self) -> Option<Target> {
        self.target.read().clone()
    }

    fn next_id(&self) -> u64 {
        self.next_decision_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Call once per received price update. `spike` is `None` unless the
    /// Spike Detector signalled on this tick.
    pub fn on_price_update(&self, now: DateTime<Utc>, price: f64, spike: Option<&SpikeReport>) -> Option<TradeDecision> {
        self.mark_warm(now);

        match self.state() {
            StrategyState::Flat => self.evaluate_flat(now, price, spike),
            StrategyState::Armed => self.evaluate_armed(now, price),
            StrategyState::Holding => self.evaluate_holding(now, price),
            StrategyState::Exiting => None,
            StrategyState::Cooldown => {
                self.maybe_leave_cooldown(now);
                match self.state() {
                    StrategyState::Armed => self.evaluate_armed(now, price),
                    StrategyState::Flat => self.evaluate_flat(now, price, spike),
                    _ => None,
                }
            }
        }
    }

    fn mark_warm(&self, now: DateTime<Utc>) {
        let mut warmed = self.warmed_since.write();
        if warmed.is_none() {
            *warmed = Some(now);
        }
    }

    fn evaluate_flat(&self, now: DateTime<Utc>, price: f64, spike: Option<&SpikeReport>) -> Option<TradeDecision> {
        let params = self.params.read();
        match params.entry_mode {
            EntryMode::ImmediateBuy => {
                drop(params);
                Some(self.open_decision(Side::Long, price, "immediate_buy entry_mode"))
            }
            EntryMode::DelayedBuy => {
                let warmed = (*self.warmed_since.read())?;
                let delay = params.entry_delay_seconds as i64;
                drop(params);
                if (now - warmed).num_seconds() >= delay {
                    Some(self.open_decision(Side::Long, price, "delayed_buy entry_mode"))
                } else {
                    None
                }
            }
            EntryMode::WaitForSpike => {
                let threshold = params.spike_threshold_pct;
                let mode = params.strategy_mode;
                drop(params);
                let spike = spike?;
                if !spike.is_spike || spike.max_change_pct.abs() < threshold {
                    return None;
                }
                let side = match spike.direction {
                    SpikeDirection::Up => Side::Short,
                    SpikeDirection::Down => Side::Long,
                };
                let reason = match mode {
                    StrategyMode::SpikeFade => format!("spike_fade {:?}", spike.direction),
                    StrategyMode::TrainOfTrade => format!("train_of_trade entry {:?}", spike.direction),
                };
                Some(self.open_decision(side, price, reason))
            }
        }
    }

    fn evaluate_armed(&self, now: DateTime<Utc>, price: f64) -> Option<TradeDecision> {
        let target = self.target.read().clone()?;
        if !target.condition.holds(price, target.price) {
            return None;
        }
        let _ = now;
        let side = match target.action {
            TargetAction::Buy => Side::Long,
            TargetAction::Sell => Side::Short,
        };
        Some(self.open_decision(side, price, target.reason.clone()))
    }

    fn evaluate_holding(&self, now: DateTime<Utc>, price: f64) -> Option<TradeDecision> {
        let position = self.position.read().clone()?;
        let hit = match position.side {
            Side::Long => {
                if price >= position.take_profit_price {
                    Some(ExitReason::TakeProfit)
                } else if price <= position.stop_loss_price {
                    Some(ExitReason::StopLoss)
                } else {
                    None
                }
            }
            Side::Short => {
                if price <= position.take_profit_price {
                    Some(ExitReason::TakeProfit)
                } else if price >= position.stop_loss_price {
                    Some(ExitReason::StopLoss)
                } else {
                    None
                }
            }
        }
        .or_else(|| if now >= position.deadline { Some(ExitReason::TimeExit) } else { None })?;

        Some(TradeDecision { decision_id: self.next_id(), kind: DecisionKind::Close { reason: hit, limit_price: price } })
    }

    /// Cooldown and settlement-delay are enforced downstream by the risk
    /// validator (`last_signal_time`/`last_exit_time`); this dwell only
    /// covers the Train-of-Trade rebuy delay before re-arming.
    fn maybe_leave_cooldown(&self, now: DateTime<Utc>) {
        let Some(started) = *self.cooldown_started_at.read() else { return };
        let params = self.params.read();
        let dwell = if params.strategy_mode == StrategyMode::TrainOfTrade { params.rebuy_delay_seconds as i64 } else { 0 };
        drop(params);
        if (now - started).num_seconds() >= dwell {
            let has_target = self.target.read().is_some();
            *self.state.write() = if has_target { StrategyState::Armed } else { StrategyState::Flat };
        }
    }

    /// Force a manual entry, bypassing spike/entry-mode evaluation. Refuses
    /// if a position is already open.
    pub fn manual_open(&self, side: Side, price: f64) -> Option<TradeDecision> {
        if self.position.read().is_some() {
            return None;
        }
        Some(self.open_decision(side, price, "manual_trade"))
    }

    /// Force a manual close, bypassing TP/SL/time-exit evaluation.
    pub fn manual_close(&self, price: f64) -> Option<TradeDecision> {
        self.position.read().as_ref()?;
        Some(TradeDecision {
            decision_id: self.next_id(),
            kind: DecisionKind::Close { reason: ExitReason::ManualClose, limit_price: price },
        })
    }

    fn open_decision(&self, side: Side, price: f64, reason: impl Into<String>) -> TradeDecision {
        let params = self.params.read();
        TradeDecision {
            decision_id: self.next_id(),
            kind: DecisionKind::Open { side, amount_usd: params.trade_size_usd, limit_price: price, reason: reason.into() },
        }
    }

    /// Apply a confirmed Filled outcome for an *opening* decision. Only the
    /// Executor calls this, and only after a confirmed fill — never
    /// speculatively (spec.md §4.7 state-update rule).
    pub fn apply_open_fill(&self, side: Side, fill_price: f64, fill_shares: f64, amount_usd: f64, now: DateTime<Utc>) {
        let params = self.params.read();
        let (tp, sl) = match side {
            Side::Long => (
                fill_price * (1.0 + params.take_profit_pct / 100.0),
                fill_price * (1.0 - params.stop_loss_pct / 100.0),
            ),
            Side::Short => (
                fill_price * (1.0 - params.take_profit_pct / 100.0),
                fill_price * (1.0 + params.stop_loss_pct / 100.0),
            ),
        };
        let deadline = now + chrono::Duration::seconds(params.max_hold_seconds as i64);
        let strategy_mode = params.strategy_mode;
        let take_profit_pct = params.take_profit_pct;
        drop(params);

        *self.position.write() = Some(Position {
            side,
            entry_price: fill_price,
            entry_time: now,
            amount_usd,
            shares: fill_shares,
            take_profit_price: tp,
            stop_loss_price: sl,
            deadline,
            pending_settlement: false,
        });

        // Train-of-Trade: the exit target is always explicit and mirrors
        // the position's closing side/price (spec.md §4.5).
        if strategy_mode == StrategyMode::TrainOfTrade {
            let (action, condition, target_price) = match side {
                Side::Long => (TargetAction::Sell, TargetCondition::Ge, fill_price * (1.0 + take_profit_pct / 100.0)),
                Side::Short => (TargetAction::Buy, TargetCondition::Le, fill_price * (1.0 - take_profit_pct / 100.0)),
            };
            *self.target.write() = Some(Target { action, price: target_price, condition, reason: "train_of_trade exit target".into(), created_at: now });
        } else {
            *self.target.write() = None;
        }

        *self.state.write() = StrategyState::Holding;
    }

    /// Apply a confirmed Filled outcome for a *closing* decision. Computes
    /// realized P&L and arms the next Train-of-Trade target per
    /// `rebuy_strategy`.
    pub fn apply_close_fill(&self, exit_price: f64, now: DateTime<Utc>) -> Option<(f64, f64)> {
        let position = self.position.write().take()?;
        let pnl_usd = match position.side {
            Side::Long => position.shares * (exit_price - position.entry_price),
            Side::Short => position.shares * (position.entry_price - exit_price),
        };
        let pnl_pct = match position.side {
            Side::Long => 100.0 * (exit_price / position.entry_price - 1.0),
            Side::Short => 100.0 * (position.entry_price / exit_price - 1.0),
        };

        let params = self.params.read();
        if params.strategy_mode == StrategyMode::TrainOfTrade {
            let rebuy_price = match params.rebuy_strategy {
                RebuyStrategy::Immediate => exit_price,
                RebuyStrategy::WaitForDrop => exit_price * (1.0 - params.rebuy_drop_pct / 100.0),
            };
            drop(params);
            *self.target.write() = Some(Target {
                action: TargetAction::Buy,
                price: rebuy_price,
                condition: TargetCondition::Le,
                reason: "train_of_trade rebuy target".into(),
                created_at: now,
            });
        } else {
            drop(params);
            *self.target.write() = None;
        }

        *self.cooldown_started_at.write() = Some(now);
        *self.state.write() = StrategyState::Cooldown;

        Some((pnl_usd, pnl_pct))
    }

    /// Called by the Executor when it submits a closing order, moving the
    /// state to EXITING while awaiting settlement.
    pub fn mark_exiting(&self) {
        *self.state.write() = StrategyState::Exiting;
    }

    /// Called when an opening/closing order is rejected or fails — the
    /// Position/Target are left unchanged (no speculative mutation); the
    /// state returns to where decisions can be re-evaluated.
    pub fn revert_to_pre_decision_state(&self) {
        let mut state = self.state.write();
        *state = if self.position.read().is_some() {
            StrategyState::Holding
        } else if self.target.read().is_some() {
            StrategyState::Armed
        } else {
            StrategyState::Flat
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(strategy_mode: StrategyMode, entry_mode: EntryMode) -> BotConfig {
        use crate::config::EncryptedSecret;
        use crate::types::SignatureMode;
        BotConfig {
            id: "bot-1".into(),
            name: "test".into(),
            description: None,
            market_slug: Some("m".into()),
            outcome_index: 0,
            token_id: None,
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
            strategy_mode,
            rebuy_strategy: RebuyStrategy::Immediate,
            rebuy_delay_seconds: 0,
            rebuy_drop_pct: 1.0,
            entry_mode,
            entry_delay_seconds: 0,
            max_trades_per_session: 20,
            session_loss_limit_usd: 50.0,
            dry_run: true,
            spike_windows_seconds: vec![600],
            max_volatility_cv: 100.0,
            min_bid_liquidity_usd: 10.0,
            min_ask_liquidity_usd: 10.0,
            max_spread_pct: 5.0,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn downward_spike_fade_opens_long_then_tp_exits() {
        let config = cfg(StrategyMode::SpikeFade, EntryMode::WaitForSpike);
        let engine = StrategyEngine::new(&config);

        let spike = SpikeReport {
            max_change_pct: -3.6,
            max_change_window_secs: 600,
            direction: SpikeDirection::Down,
            is_volatility_filtered: false,
            is_spike: true,
        };
        let decision = engine.on_price_update(now(), 0.482, Some(&spike)).unwrap();
        let DecisionKind::Open { side, .. } = decision.kind else { panic!("expected open") };
        assert_eq!(side, Side::Long);

        engine.apply_open_fill(Side::Long, 0.482, 5.0 / 0.482, 5.0, now());
        assert_eq!(engine.state(), StrategyState::Holding);

        let exit = engine.on_price_update(now(), 0.5065, None).unwrap();
        match exit.kind {
            DecisionKind::Close { reason, .. } => assert_eq!(reason, ExitReason::TakeProfit),
            _ => panic!("expected close"),
        }
    }

    #[test]
    fn upward_spike_fade_opens_short_then_sl_exits() {
        let config = cfg(StrategyMode::SpikeFade, EntryMode::WaitForSpike);
        let engine = StrategyEngine::new(&config);

        let spike = SpikeReport {
            max_change_pct: 4.17,
            max_change_window_secs: 600,
            direction: SpikeDirection::Up,
            is_volatility_filtered: false,
            is_spike: true,
        };
        let decision = engine.on_price_update(now(), 0.625, Some(&spike)).unwrap();
        let DecisionKind::Open { side, .. } = decision.kind else { panic!("expected open") };
        assert_eq!(side, Side::Short);

        engine.apply_open_fill(Side::Short, 0.625, 5.0 / 0.625, 5.0, now());
        let exit = engine.on_price_update(now(), 0.645, None).unwrap();
        match exit.kind {
            DecisionKind::Close { reason, .. } => assert_eq!(reason, ExitReason::StopLoss),
            _ => panic!("expected close"),
        }
    }

    #[test]
    fn train_of_trade_immediate_rebuy_arms_target_after_exit() {
        let config = cfg(StrategyMode::TrainOfTrade, EntryMode::ImmediateBuy);
        let engine = StrategyEngine::new(&config);

        let t0 = now();
        let open = engine.on_price_update(t0, 0.500, None).unwrap();
        assert!(matches!(open.kind, DecisionKind::Open { .. }));
        engine.apply_open_fill(Side::Long, 0.500, 10.0, 5.0, t0);

        let exit = engine.on_price_update(t0, 0.525, None).unwrap();
        assert!(matches!(exit.kind, DecisionKind::Close { .. }));
        let (pnl_usd, pnl_pct) = engine.apply_close_fill(0.525, t0).unwrap();
        assert!(pnl_usd > 0.0);
        assert!((pnl_pct - 5.0).abs() < 0.01);

        let target = engine.target().unwrap();
        assert_eq!(target.action, TargetAction::Buy);
        assert!((target.price - 0.525).abs() < 1e-9);
        assert_eq!(engine.state(), StrategyState::Cooldown);

        // rebuy_delay_seconds=0 for immediate rebuy: the very next tick
        // clears cooldown and re-evaluates ARMED on the same call. Cooldown
        // and settlement-delay gating happen downstream in the risk
        // validator, not here.
        let t1 = t0 + chrono::Duration::seconds(1);
        let rebuy = engine.on_price_update(t1, 0.520, None).unwrap();
        assert!(matches!(rebuy.kind, DecisionKind::Open { .. }));
        assert_eq!(engine.state(), StrategyState::Armed);
    }

    #[test]
    fn decision_ids_strictly_increase() {
        let config = cfg(StrategyMode::SpikeFade, EntryMode::ImmediateBuy);
        let engine = StrategyEngine::new(&config);
        let d1 = engine.on_price_update(now(), 0.5, None).unwrap();
        engine.apply_open_fill(Side::Long, 0.5, 10.0, 5.0, now());
        let d2 = engine.manual_close(0.5).unwrap();
        assert!(d2.decision_id > d1.decision_id);
    }
}
