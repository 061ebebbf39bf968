// =============================================================================
// Order Executor (C7) — turns a decision into a submitted order with retries
// =============================================================================
//
// Wraps `ExchangeClient::place_order` with a bounded retry policy, applies
// the ten pre-trade checks first, and is the *only* caller of
// `StrategyEngine::apply_open_fill`/`apply_close_fill` — Position state
// updates only on a confirmed Filled outcome, never speculatively.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityDetails, ActivityKind, ActivityRing};
use crate::error::{ExchangeError, PermanentReason};
use crate::exchange::{ExchangeClient, OrderOutcome, TimeInForce, WalletCredentials};
use crate::risk::{self, DailyLossRegistry, RiskCheckFailure, RiskCheckInput};
use crate::strategy::{DecisionKind, StrategyEngine, TradeDecision};
use crate::types::Side;

/// Backoff schedule for `Transient` retries: 250ms, 500ms, 1s, 2s.
const RETRY_BACKOFF_MS: [u64; 4] = [250, 500, 1000, 2000];

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// `realized_pnl` is `Some((pnl_usd, pnl_pct))` for a closing fill, `None`
    /// for an opening one.
    Filled { fill_price: f64, fill_shares: f64, order_id: String, simulated: bool, realized_pnl: Option<(f64, f64)> },
    PreCheckFailed(RiskCheckFailure),
    Rejected(String),
    TransientFailExhausted(String),
}

pub struct Executor {
    client: Arc<dyn ExchangeClient>,
}

impl Executor {
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        Self { client }
    }

    /// Run pre-trade checks, then place (or simulate) the order, then apply
    /// the confirmed fill to `strategy`. Callers are responsible for having
    /// already moved the strategy to `EXITING` via `mark_exiting()` before
    /// invoking this for a `Close` decision.
    #[instrument(skip(self, strategy, activities, daily_loss, risk_input), fields(bot_id, decision_id = decision.decision_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        bot_id: &str,
        decision: &TradeDecision,
        now: DateTime<Utc>,
        wallet: &WalletCredentials,
        token_id: &str,
        dry_run: bool,
        stream_price: f64,
        risk_input: RiskCheckInput<'_>,
        daily_loss: &DailyLossRegistry,
        strategy: &StrategyEngine,
        activities: &ActivityRing,
    ) -> ExecutionOutcome {
        let warnings = match risk::evaluate(&risk_input, daily_loss) {
            Ok(warnings) => warnings,
            Err(failure) => {
                activities.push(Activity::new(
                    bot_id,
                    ActivityKind::Error,
                    format!("pre-check failed: {failure}"),
                    ActivityDetails::PreCheckFailed { rule: failure.rule.to_string(), reason: failure.reason.clone() },
                ));
                strategy.revert_to_pre_decision_state();
                return ExecutionOutcome::PreCheckFailed(failure);
            }
        };
        for warning in &warnings.0 {
            activities.push(Activity::new(bot_id, ActivityKind::System, warning.clone(), ActivityDetails::System { message: warning.clone() }));
        }

        let (order_side, amount_usd, limit_price, is_open) = match &decision.kind {
            DecisionKind::Open { side, amount_usd, limit_price, .. } => (*side, *amount_usd, *limit_price, true),
            DecisionKind::Close { limit_price, .. } => {
                let Some(position) = strategy.position() else {
                    warn!(bot_id, "close decision with no open position, dropping");
                    return ExecutionOutcome::Rejected("no open position to close".into());
                };
                // Closing reverses the order action: a LONG position closes
                // via SELL, a SHORT position closes via BUY-to-cover.
                let order_side = match position.side {
                    Side::Long => Side::Short,
                    Side::Short => Side::Long,
                };
                (order_side, position.amount_usd, *limit_price, false)
            }
        };

        let client_order_id = format!("decision-{}", decision.decision_id);

        activities.push(Activity::new(
            bot_id,
            ActivityKind::Order,
            format!("submitting {order_side} order for ${amount_usd:.2} @ {limit_price:.4}"),
            ActivityDetails::Order { side: order_side.to_string(), amount_usd, limit_price, client_order_id: client_order_id.clone() },
        ));

        let outcome = if dry_run {
            Ok(OrderOutcome::Filled {
                fill_price: stream_price,
                fill_shares: amount_usd / stream_price,
                order_id: format!("sim-{}", Uuid::new_v4()),
                simulated: true,
            })
        } else {
            self.place_with_retry(wallet, token_id, order_side, amount_usd, limit_price, &client_order_id).await
        };

        match outcome {
            Ok(OrderOutcome::Filled { fill_price, fill_shares, order_id, simulated }) => {
                activities.push(Activity::new(
                    bot_id,
                    ActivityKind::Fill,
                    format!("filled {fill_shares:.4} shares @ {fill_price:.4}"),
                    ActivityDetails::Fill { side: order_side.to_string(), fill_price, fill_shares, order_id: order_id.clone(), simulated, fallback_pricing: false },
                ));

                let realized_pnl = if is_open {
                    strategy.apply_open_fill(order_side, fill_price, fill_shares, amount_usd, now);
                    None
                } else if let Some((pnl_usd, pnl_pct)) = strategy.apply_close_fill(fill_price, now) {
                    daily_loss.record_realized_pnl(pnl_usd, now);
                    activities.push(Activity::new(
                        bot_id,
                        ActivityKind::Pnl,
                        format!("realized pnl {pnl_usd:.2} ({pnl_pct:.2}%)"),
                        ActivityDetails::Pnl { pnl_usd, pnl_pct, realized_pnl_usd: pnl_usd },
                    ));
                    Some((pnl_usd, pnl_pct))
                } else {
                    None
                };

                ExecutionOutcome::Filled { fill_price, fill_shares, order_id, simulated, realized_pnl }
            }
            Ok(OrderOutcome::Rejected { reason_code }) => {
                activities.push(Activity::new(
                    bot_id,
                    ActivityKind::Error,
                    format!("order rejected: {reason_code}"),
                    ActivityDetails::Error { code: reason_code.clone(), recoverable: false },
                ));
                strategy.revert_to_pre_decision_state();
                ExecutionOutcome::Rejected(reason_code)
            }
            Err(e) => {
                let reason = e.to_string();
                activities.push(Activity::new(
                    bot_id,
                    ActivityKind::Error,
                    format!("order failed after retries: {reason}"),
                    ActivityDetails::Error { code: reason.clone(), recoverable: e.is_transient() },
                ));
                strategy.revert_to_pre_decision_state();
                if e.is_transient() {
                    ExecutionOutcome::TransientFailExhausted(reason)
                } else {
                    ExecutionOutcome::Rejected(reason)
                }
            }
        }
    }

    async fn place_with_retry(
        &self,
        wallet: &WalletCredentials,
        token_id: &str,
        side: Side,
        amount_usd: f64,
        limit_price: f64,
        client_order_id: &str,
    ) -> Result<OrderOutcome, ExchangeError> {
        let mut last_err = ExchangeError::Permanent(PermanentReason::Rejected("no attempts made".into()));
        for (attempt, backoff_ms) in RETRY_BACKOFF_MS.iter().enumerate() {
            match self.client.place_order(wallet, token_id, side, amount_usd, limit_price, TimeInForce::Fok, client_order_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    warn!(attempt, backoff_ms, error = %e, "transient exchange error, retrying");
                    last_err = e;
                    tokio::time::sleep(std::time::Duration::from_millis(*backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        info!(client_order_id, "retries exhausted");
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptedSecret;
    use crate::exchange::mock::MockExchangeClient;
    use crate::exchange::BookLevel;
    use crate::types::SignatureMode;

    fn wallet() -> WalletCredentials {
        WalletCredentials { wallet_secret: "enc:x".into(), signature_mode: SignatureMode::Direct, funder_address: None }
    }

    fn healthy_book() -> crate::exchange::OrderBook {
        crate::exchange::OrderBook {
            bids: vec![BookLevel { price: 0.49, size_shares: 100.0 }],
            asks: vec![BookLevel { price: 0.51, size_shares: 100.0 }],
        }
    }

    fn risk_input(book: &crate::exchange::OrderBook, amount_usd: f64) -> RiskCheckInput<'_> {
        RiskCheckInput {
            killswitch_on: false,
            trades_this_session: 0,
            max_trades_per_session: 20,
            session_realized_pnl_usd: 0.0,
            session_loss_limit_usd: 50.0,
            daily_loss_limit_usd: 200.0,
            now: Utc::now(),
            last_signal_time: None,
            cooldown_seconds: 30,
            last_exit_time: None,
            settlement_delay_seconds: 2,
            has_position: false,
            decision_closes_position: false,
            dry_run: false,
            usd_balance: 1000.0,
            usd_allowance: 1000.0,
            amount_usd,
            is_buy: true,
            book,
            min_bid_liquidity_usd: 10.0,
            min_ask_liquidity_usd: 10.0,
            max_spread_pct: 5.0,
            slippage_tolerance: 0.05,
            reference_price: 0.50,
            expected_fill_price: 0.50,
        }
    }

    fn bare_config() -> crate::config::BotConfig {
        crate::config::BotConfig {
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
            strategy_mode: crate::types::StrategyMode::SpikeFade,
            rebuy_strategy: crate::types::RebuyStrategy::Immediate,
            rebuy_delay_seconds: 0,
            rebuy_drop_pct: 1.0,
            entry_mode: crate::types::EntryMode::ImmediateBuy,
            entry_delay_seconds: 0,
            max_trades_per_session: 20,
            session_loss_limit_usd: 50.0,
            dry_run: false,
            spike_windows_seconds: vec![600],
            max_volatility_cv: 100.0,
            min_bid_liquidity_usd: 10.0,
            min_ask_liquidity_usd: 10.0,
            max_spread_pct: 5.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dry_run_synthesizes_a_simulated_fill() {
        let client = Arc::new(MockExchangeClient::new(0.50));
        let executor = Executor::new(client);
        let config = bare_config();
        let strategy = StrategyEngine::new(&config);
        let activities = ActivityRing::new();
        let daily_loss = DailyLossRegistry::new();
        let book = healthy_book();
        let decision = TradeDecision { decision_id: 1, kind: DecisionKind::Open { side: Side::Long, amount_usd: 5.0, limit_price: 0.50, reason: "test".into() } };

        let outcome = executor
            .execute("bot-1", &decision, Utc::now(), &wallet(), "tok", true, 0.50, risk_input(&book, 5.0), &daily_loss, &strategy, &activities)
            .await;

        match outcome {
            ExecutionOutcome::Filled { simulated, .. } => assert!(simulated),
            other => panic!("expected a filled outcome, got {other:?}"),
        }
        assert_eq!(strategy.state(), crate::strategy::StrategyState::Holding);
    }

    #[tokio::test]
    async fn pre_check_failure_reverts_strategy_without_touching_position() {
        let client = Arc::new(MockExchangeClient::new(0.50));
        let executor = Executor::new(client);
        let config = bare_config();
        let strategy = StrategyEngine::new(&config);
        let activities = ActivityRing::new();
        let daily_loss = DailyLossRegistry::new();
        let book = healthy_book();
        let mut input = risk_input(&book, 5.0);
        input.killswitch_on = true;
        let decision = TradeDecision { decision_id: 1, kind: DecisionKind::Open { side: Side::Long, amount_usd: 5.0, limit_price: 0.50, reason: "test".into() } };

        let outcome = executor
            .execute("bot-1", &decision, Utc::now(), &wallet(), "tok", false, 0.50, input, &daily_loss, &strategy, &activities)
            .await;

        assert!(matches!(outcome, ExecutionOutcome::PreCheckFailed(_)));
        assert!(strategy.position().is_none());
        assert_eq!(strategy.state(), crate::strategy::StrategyState::Flat);
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        let client = Arc::new(MockExchangeClient::new(0.50));
        client.push_outcome(Err(ExchangeError::Transient("timeout".into())));
        client.push_outcome(Ok(OrderOutcome::Filled { fill_price: 0.50, fill_shares: 10.0, order_id: "o1".into(), simulated: false }));
        let executor = Executor::new(client);
        let config = bare_config();
        let strategy = StrategyEngine::new(&config);
        let activities = ActivityRing::new();
        let daily_loss = DailyLossRegistry::new();
        let book = healthy_book();
        let decision = TradeDecision { decision_id: 1, kind: DecisionKind::Open { side: Side::Long, amount_usd: 5.0, limit_price: 0.50, reason: "test".into() } };

        let outcome = executor
            .execute("bot-1", &decision, Utc::now(), &wallet(), "tok", false, 0.50, risk_input(&book, 5.0), &daily_loss, &strategy, &activities)
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Filled { .. }));
    }

    #[tokio::test]
    async fn permanent_rejection_stops_without_retry() {
        let client = Arc::new(MockExchangeClient::new(0.50));
        client.push_outcome(Ok(OrderOutcome::Rejected { reason_code: "not_enough_liquidity".into() }));
        let executor = Executor::new(client);
        let config = bare_config();
        let strategy = StrategyEngine::new(&config);
        let activities = ActivityRing::new();
        let daily_loss = DailyLossRegistry::new();
        let book = healthy_book();
        let decision = TradeDecision { decision_id: 1, kind: DecisionKind::Open { side: Side::Long, amount_usd: 5.0, limit_price: 0.50, reason: "test".into() } };

        let outcome = executor
            .execute("bot-1", &decision, Utc::now(), &wallet(), "tok", false, 0.50, risk_input(&book, 5.0), &daily_loss, &strategy, &activities)
            .await;

        assert!(matches!(outcome, ExecutionOutcome::Rejected(_)));
    }
}
