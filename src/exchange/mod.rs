// =============================================================================
// Exchange Client Adapter — the only module that speaks the exchange's wire
// protocol (spec.md §4.1)
// =============================================================================

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::Side;

/// One level of an order book: a price and the size resting there, in
/// shares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size_shares: f64,
}

/// Best-first bids and asks for one outcome token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Total USD notional resting on the bid side (price * size, summed).
    pub fn bid_depth_usd(&self) -> f64 {
        self.bids.iter().map(|l| l.price * l.size_shares).sum()
    }

    /// Total USD notional resting on the ask side.
    pub fn ask_depth_usd(&self) -> f64 {
        self.asks.iter().map(|l| l.price * l.size_shares).sum()
    }

    /// Spread as a percentage of the best bid, per the glossary definition.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        if bid <= 0.0 {
            return None;
        }
        Some(100.0 * (ask - bid) / bid)
    }
}

/// Balance and allowance snapshot for one wallet, in USD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BalanceAndAllowance {
    pub usd_balance: f64,
    pub usd_allowance: f64,
}

/// Result of `PlaceOrder`. Only `Filled` may ever update a Position (C7's
/// state-update rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderOutcome {
    Filled { fill_price: f64, fill_shares: f64, order_id: String, simulated: bool },
    Rejected { reason_code: String },
}

/// A raw event from the market data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketEvent {
    Book { timestamp_ms: i64, book: OrderBook },
    PriceChange { timestamp_ms: i64, best_bid: f64, best_ask: f64 },
    LastTrade { timestamp_ms: i64, price: f64 },
}

/// An authoritative fill confirmation from the (optional) user stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub fill_price: f64,
    pub fill_shares: f64,
}

/// Time-in-force for a placed order. This system only ever submits
/// fill-or-kill orders so outcomes stay binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Fok,
}

/// Credentials used to authenticate a wallet's signed requests.
#[derive(Clone)]
pub struct WalletCredentials {
    pub wallet_secret: String,
    pub signature_mode: crate::types::SignatureMode,
    pub funder_address: Option<String>,
}

/// The single narrow boundary over the exchange's REST + market-stream +
/// user-stream. Any concrete exchange can be swapped in behind this trait
/// (spec.md §6).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Resolve a market slug + outcome index to its token id. Implementors
    /// cache this with a TTL since it rarely changes.
    async fn resolve_token_id(&self, market_slug: &str, outcome_index: u32) -> Result<String, ExchangeError>;

    async fn get_order_book(&self, token_id: &str, depth: u32) -> Result<OrderBook, ExchangeError>;

    /// Implements the exchange's published pricing rule: if
    /// `best_ask - best_bid <= 0.10`, return the midpoint; otherwise the
    /// last trade price; `NoPrice` (a `Permanent` error) if neither exists.
    async fn get_market_price(&self, token_id: &str) -> Result<f64, ExchangeError>;

    async fn get_balance_and_allowance(
        &self,
        wallet: &WalletCredentials,
    ) -> Result<BalanceAndAllowance, ExchangeError>;

    #[allow(clippy::too_many_arguments)]
    async fn place_order(
        &self,
        wallet: &WalletCredentials,
        token_id: &str,
        side: Side,
        amount_usd: f64,
        limit_price: f64,
        tif: TimeInForce,
        client_order_id: &str,
    ) -> Result<OrderOutcome, ExchangeError>;

    /// Subscribe to the raw market event stream for one token. The
    /// returned stream auto-reconnects with exponential backoff bounded by
    /// the caller-supplied min/max seconds.
    fn subscribe_market(
        &self,
        token_id: &str,
        reconnect_min_secs: u64,
        reconnect_max_secs: u64,
    ) -> tokio::sync::mpsc::Receiver<MarketEvent>;

    /// Optional authoritative fill stream. `None` if the concrete exchange
    /// doesn't expose one; callers fall back to the synchronous
    /// `place_order` response only.
    fn subscribe_user(&self, _wallet: &WalletCredentials) -> Option<tokio::sync::mpsc::Receiver<OrderEvent>> {
        None
    }
}
