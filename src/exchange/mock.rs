// =============================================================================
// MockExchangeClient — in-memory fill simulator for unit tests (C6/C7)
// =============================================================================
//
// Grounded on execution.rs's demo-mode synthesis path: orders fill
// immediately at a configured price with no network call.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ExchangeError;
use crate::types::Side;

use super::{
    BalanceAndAllowance, ExchangeClient, MarketEvent, OrderBook, OrderEvent, OrderOutcome,
    TimeInForce, WalletCredentials,
};

pub struct MockExchangeClient {
    pub book: Mutex<OrderBook>,
    pub balance: Mutex<BalanceAndAllowance>,
    /// Queue of canned outcomes for `place_order`, consumed in order.
    pub place_order_outcomes: Mutex<Vec<Result<OrderOutcome, ExchangeError>>>,
    pub market_price: Mutex<f64>,
}

impl MockExchangeClient {
    pub fn new(market_price: f64) -> Self {
        Self {
            book: Mutex::new(OrderBook::default()),
            balance: Mutex::new(BalanceAndAllowance { usd_balance: 1000.0, usd_allowance: 1000.0 }),
            place_order_outcomes: Mutex::new(Vec::new()),
            market_price: Mutex::new(market_price),
        }
    }

    pub fn push_outcome(&self, outcome: Result<OrderOutcome, ExchangeError>) {
        self.place_order_outcomes.lock().push(outcome);
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn resolve_token_id(&self, market_slug: &str, outcome_index: u32) -> Result<String, ExchangeError> {
        Ok(format!("{market_slug}:{outcome_index}"))
    }

    async fn get_order_book(&self, _token_id: &str, _depth: u32) -> Result<OrderBook, ExchangeError> {
        Ok(self.book.lock().clone())
    }

    async fn get_market_price(&self, _token_id: &str) -> Result<f64, ExchangeError> {
        Ok(*self.market_price.lock())
    }

    async fn get_balance_and_allowance(
        &self,
        _wallet: &WalletCredentials,
    ) -> Result<BalanceAndAllowance, ExchangeError> {
        Ok(*self.balance.lock())
    }

    async fn place_order(
        &self,
        _wallet: &WalletCredentials,
        _token_id: &str,
        _side: Side,
        amount_usd: f64,
        limit_price: f64,
        _tif: TimeInForce,
        order_id: &str,
    ) -> Result<OrderOutcome, ExchangeError> {
        let mut outcomes = self.place_order_outcomes.lock();
        if !outcomes.is_empty() {
            return outcomes.remove(0);
        }
        Ok(OrderOutcome::Filled {
            fill_price: limit_price,
            fill_shares: amount_usd / limit_price,
            order_id: order_id.to_string(),
            simulated: false,
        })
    }

    fn subscribe_market(&self, _token_id: &str, _min: u64, _max: u64) -> mpsc::Receiver<MarketEvent> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }

    fn subscribe_user(&self, _wallet: &WalletCredentials) -> Option<mpsc::Receiver<OrderEvent>> {
        None
    }
}
