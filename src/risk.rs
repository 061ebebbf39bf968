// =============================================================================
// Risk & Pre-trade Validator (C6) — ten ordered checks guarding every decision
// =============================================================================
//
// A decision is admitted only if every check below passes, evaluated in
// order; the first failure stops evaluation and carries a rule name plus a
// reason so it can be surfaced as a `PRE_CHECK_FAILED` activity.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;

use crate::exchange::OrderBook;

/// The name of the failing rule plus a human-readable reason. Maps directly
/// onto a `PRE_CHECK_FAILED` activity.
#[derive(Debug, Clone)]
pub struct RiskCheckFailure {
    pub rule: &'static str,
    pub reason: String,
}

impl std::fmt::Display for RiskCheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule, self.reason)
    }
}

fn fail(rule: &'static str, reason: impl Into<String>) -> RiskCheckFailure {
    RiskCheckFailure { rule, reason: reason.into() }
}

/// Non-fatal downgrades produced when a check would have failed but the
/// decision is running in dry-run mode (only check 8, balance/allowance,
/// downgrades; check 9, order-book health, still blocks).
#[derive(Debug, Default)]
pub struct RiskWarnings(pub Vec<String>);

/// Everything the validator needs to decide on one proposed decision. Built
/// fresh by the Executor from the bot's session state, the latest order
/// book, and the process-wide daily loss registry.
pub struct RiskCheckInput<'a> {
    pub killswitch_on: bool,

    pub trades_this_session: u32,
    pub max_trades_per_session: u32,

    pub session_realized_pnl_usd: f64,
    pub session_loss_limit_usd: f64,

    pub daily_loss_limit_usd: f64,

    pub now: DateTime<Utc>,
    pub last_signal_time: Option<DateTime<Utc>>,
    pub cooldown_seconds: u64,

    pub last_exit_time: Option<DateTime<Utc>>,
    pub settlement_delay_seconds: u64,

    pub has_position: bool,
    pub decision_closes_position: bool,

    pub dry_run: bool,
    pub usd_balance: f64,
    pub usd_allowance: f64,
    pub amount_usd: f64,

    pub is_buy: bool,
    pub book: &'a OrderBook,
    pub min_bid_liquidity_usd: f64,
    pub min_ask_liquidity_usd: f64,
    pub max_spread_pct: f64,

    pub slippage_tolerance: f64,
    pub reference_price: f64,
    pub expected_fill_price: f64,
}

/// Run all ten checks in spec order. On success, returns any warnings
/// produced by checks that were downgraded under dry-run.
pub fn evaluate(input: &RiskCheckInput, daily_loss: &DailyLossRegistry) -> Result<RiskWarnings, RiskCheckFailure> {
    let mut warnings = RiskWarnings::default();

    // 1. Killswitch.
    if input.killswitch_on {
        return Err(fail("killswitch", "global killswitch is active"));
    }

    // 2. Session cap.
    if input.max_trades_per_session > 0 && input.trades_this_session >= input.max_trades_per_session {
        return Err(fail(
            "session_cap",
            format!("{} trades this session reached the cap of {}", input.trades_this_session, input.max_trades_per_session),
        ));
    }

    // 3. Session loss limit.
    if input.session_loss_limit_usd > 0.0 && input.session_realized_pnl_usd <= -input.session_loss_limit_usd {
        return Err(fail(
            "session_loss_limit",
            format!("session realized pnl {:.2} breached limit -{:.2}", input.session_realized_pnl_usd, input.session_loss_limit_usd),
        ));
    }

    // 4. Daily loss limit, across all bots in-process.
    let cumulative_loss = daily_loss.cumulative_loss(input.now);
    if cumulative_loss > input.daily_loss_limit_usd {
        return Err(fail(
            "daily_loss_limit",
            format!("cumulative daily loss {:.2} exceeds limit {:.2}", cumulative_loss, input.daily_loss_limit_usd),
        ));
    }

    // 5. Cooldown.
    if let Some(last_signal) = input.last_signal_time {
        let elapsed = (input.now - last_signal).num_seconds().max(0) as u64;
        if elapsed < input.cooldown_seconds {
            return Err(fail("cooldown", format!("{elapsed}s elapsed, need {}s", input.cooldown_seconds)));
        }
    }

    // 6. Settlement delay.
    if let Some(last_exit) = input.last_exit_time {
        let elapsed = (input.now - last_exit).num_seconds().max(0) as u64;
        if elapsed < input.settlement_delay_seconds {
            return Err(fail("settlement_delay", format!("{elapsed}s elapsed, need {}s", input.settlement_delay_seconds)));
        }
    }

    // 7. Concurrent-position guard.
    if input.has_position && !input.decision_closes_position {
        return Err(fail("concurrent_position", "bot already holds a position"));
    }

    // 8. Balance/allowance: evaluated in dry-run too, but a failure only
    // downgrades to a warning instead of blocking.
    if !input.dry_run {
        if input.usd_balance < input.amount_usd {
            return Err(fail("insufficient_balance", format!("balance {:.2} < required {:.2}", input.usd_balance, input.amount_usd)));
        }
        if input.usd_allowance < input.amount_usd {
            return Err(fail("insufficient_allowance", format!("allowance {:.2} < required {:.2}", input.usd_allowance, input.amount_usd)));
        }
    } else if input.usd_balance < input.amount_usd || input.usd_allowance < input.amount_usd {
        warnings.0.push(format!(
            "dry_run: balance {:.2}/allowance {:.2} would be insufficient for {:.2}",
            input.usd_balance, input.usd_allowance, input.amount_usd
        ));
    }

    // 9. Order-book health. Still blocks in dry-run; only check 8 downgrades.
    if input.is_buy {
        let ask_depth = input.book.ask_depth_usd();
        if ask_depth < input.min_ask_liquidity_usd {
            return Err(fail(
                "order_book_depth",
                format!("ask depth {:.2} below minimum {:.2}", ask_depth, input.min_ask_liquidity_usd),
            ));
        }
    } else {
        let bid_depth = input.book.bid_depth_usd();
        if bid_depth < input.min_bid_liquidity_usd {
            return Err(fail(
                "order_book_depth",
                format!("bid depth {:.2} below minimum {:.2}", bid_depth, input.min_bid_liquidity_usd),
            ));
        }
    }

    if let Some(spread_pct) = input.book.spread_pct() {
        if spread_pct > input.max_spread_pct {
            return Err(fail(
                "spread_gate",
                format!("spread {:.2}% exceeds maximum {:.2}%", spread_pct, input.max_spread_pct),
            ));
        }
    }

    // 10. Slippage envelope.
    if input.reference_price > 0.0 {
        let limit = if input.is_buy {
            input.reference_price * (1.0 + input.slippage_tolerance)
        } else {
            input.reference_price * (1.0 - input.slippage_tolerance)
        };
        let breached = if input.is_buy { input.expected_fill_price > limit } else { input.expected_fill_price < limit };
        if breached {
            return Err(fail(
                "slippage_envelope",
                format!("expected fill {:.4} breaches envelope {:.4} (reference {:.4})", input.expected_fill_price, limit, input.reference_price),
            ));
        }
    }

    Ok(warnings)
}

/// Process-wide cumulative realized loss for the current calendar day,
/// aggregated across every bot. Date rollover resets the counter.
pub struct DailyLossRegistry {
    inner: RwLock<(NaiveDate, f64)>,
}

impl Default for DailyLossRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DailyLossRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new((Utc::now().date_naive(), 0.0)) }
    }

    fn maybe_reset(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let needs_reset = { self.inner.read().0 != today };
        if needs_reset {
            let mut inner = self.inner.write();
            if inner.0 != today {
                *inner = (today, 0.0);
            }
        }
    }

    /// Record one bot's realized P&L for a closed trade. Only losses
    /// accumulate; winning trades do not offset the day's loss total
    /// (spec.md §4.6's "cumulative realized loss today" wording).
    pub fn record_realized_pnl(&self, pnl_usd: f64, now: DateTime<Utc>) {
        self.maybe_reset(now);
        if pnl_usd < 0.0 {
            let mut inner = self.inner.write();
            inner.1 += -pnl_usd;
        }
    }

    pub fn cumulative_loss(&self, now: DateTime<Utc>) -> f64 {
        self.maybe_reset(now);
        self.inner.read().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::BookLevel;

    fn healthy_book() -> OrderBook {
        OrderBook {
            bids: vec![BookLevel { price: 0.49, size_shares: 100.0 }],
            asks: vec![BookLevel { price: 0.51, size_shares: 100.0 }],
        }
    }

    fn base_input(book: &OrderBook) -> RiskCheckInput<'_> {
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
            dry_run: true,
            usd_balance: 1000.0,
            usd_allowance: 1000.0,
            amount_usd: 5.0,
            is_buy: true,
            book,
            min_bid_liquidity_usd: 10.0,
            min_ask_liquidity_usd: 10.0,
            max_spread_pct: 5.0,
            slippage_tolerance: 0.01,
            reference_price: 0.50,
            expected_fill_price: 0.50,
        }
    }

    #[test]
    fn healthy_decision_passes() {
        let book = healthy_book();
        let daily_loss = DailyLossRegistry::new();
        let input = base_input(&book);
        assert!(evaluate(&input, &daily_loss).is_ok());
    }

    #[test]
    fn killswitch_blocks_first() {
        let book = healthy_book();
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.killswitch_on = true;
        input.max_trades_per_session = 0; // would also fail, killswitch must win
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "killswitch");
    }

    #[test]
    fn cooldown_blocks_rapid_repeat_signal() {
        let book = healthy_book();
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.last_signal_time = Some(input.now - chrono::Duration::seconds(5));
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "cooldown");
    }

    #[test]
    fn insufficient_balance_blocks_live_trade() {
        let book = healthy_book();
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.dry_run = false;
        input.usd_balance = 4.99;
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "insufficient_balance");
    }

    #[test]
    fn insufficient_balance_is_a_warning_in_dry_run() {
        let book = healthy_book();
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.dry_run = true;
        input.usd_balance = 4.99;
        let warnings = evaluate(&input, &daily_loss).unwrap();
        assert_eq!(warnings.0.len(), 1);
    }

    #[test]
    fn wide_spread_blocks_dry_run_too() {
        let book = OrderBook {
            bids: vec![BookLevel { price: 0.40, size_shares: 100.0 }],
            asks: vec![BookLevel { price: 0.50, size_shares: 100.0 }],
        };
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.dry_run = true;
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "spread_gate");
    }

    #[test]
    fn thin_ask_depth_blocks_dry_run_too() {
        let book = OrderBook {
            bids: vec![BookLevel { price: 0.49, size_shares: 100.0 }],
            asks: vec![BookLevel { price: 0.51, size_shares: 1.0 }],
        };
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.dry_run = true;
        input.min_ask_liquidity_usd = 10.0;
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "order_book_depth");
    }

    #[test]
    fn wide_spread_blocks_live_trade() {
        let book = OrderBook {
            bids: vec![BookLevel { price: 0.40, size_shares: 100.0 }],
            asks: vec![BookLevel { price: 0.50, size_shares: 100.0 }],
        };
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.dry_run = false;
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "spread_gate");
    }

    #[test]
    fn slippage_envelope_blocks_buy_above_tolerance() {
        let book = healthy_book();
        let daily_loss = DailyLossRegistry::new();
        let mut input = base_input(&book);
        input.expected_fill_price = 0.52; // > 0.50 * 1.01
        let err = evaluate(&input, &daily_loss).unwrap_err();
        assert_eq!(err.rule, "slippage_envelope");
    }

    #[test]
    fn daily_loss_registry_resets_on_new_day() {
        let registry = DailyLossRegistry::new();
        let now = Utc::now();
        registry.record_realized_pnl(-10.0, now);
        assert_eq!(registry.cumulative_loss(now), 10.0);

        let tomorrow = now + chrono::Duration::days(1);
        assert_eq!(registry.cumulative_loss(tomorrow), 0.0);
    }

    #[test]
    fn winning_trades_do_not_reduce_daily_loss() {
        let registry = DailyLossRegistry::new();
        let now = Utc::now();
        registry.record_realized_pnl(-10.0, now);
        registry.record_realized_pnl(20.0, now);
        assert_eq!(registry.cumulative_loss(now), 10.0);
    }
}
