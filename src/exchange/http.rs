// =============================================================================
// HTTP Exchange Client — HMAC-signed REST + reconnecting market stream
// =============================================================================
//
// SECURITY: wallet secrets are never logged. All signed requests carry a
// recvWindow to tolerate clock drift between this process and the exchange.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::error::{ExchangeError, PermanentReason};
use crate::types::{SignatureMode, Side};

use super::{
    BalanceAndAllowance, BookLevel, ExchangeClient, MarketEvent, OrderBook, OrderEvent,
    OrderOutcome, TimeInForce, WalletCredentials,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
/// The exchange's published pricing rule switches from midpoint to last
/// trade once the spread exceeds this absolute width (spec.md §4.1).
const MIDPOINT_SPREAD_CUTOFF: f64 = 0.10;

/// Cache entry for a resolved `market_slug -> token_id` mapping.
struct TokenIdCacheEntry {
    token_id: String,
    resolved_at: std::time::Instant,
}

const TOKEN_ID_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

/// HMAC-signed REST client over the exchange's CLOB-style API, plus a
/// reconnecting market data stream. The one concrete `ExchangeClient`
/// implementation; any other exchange can be swapped in behind the trait.
#[derive(Clone)]
pub struct HttpExchangeClient {
    base_url: String,
    ws_url: String,
    client: reqwest::Client,
    token_id_cache: Arc<RwLock<HashMap<(String, u32), TokenIdCacheEntry>>>,
}

impl HttpExchangeClient {
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            client,
            token_id_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sign(secret: &str, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the signed query string for a request. In `direct` mode the
    /// wallet's own secret signs; in `proxy` mode the funder address is
    /// included in the signed payload so the relayer can attribute the
    /// order to the right proxy wallet.
    fn signed_query(&self, wallet: &WalletCredentials, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let mut base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        if wallet.signature_mode == SignatureMode::Proxy {
            if let Some(funder) = &wallet.funder_address {
                base.push_str(&format!("&funder={funder}"));
            }
        }
        let sig = Self::sign(&wallet.wallet_secret, &base);
        format!("{base}&signature={sig}")
    }

    fn classify_status(status: reqwest::StatusCode, body: &serde_json::Value) -> ExchangeError {
        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            return ExchangeError::Transient(format!("exchange returned {status}: {body}"));
        }
        let reason = body["reason"].as_str().unwrap_or("");
        match reason {
            "insufficient_balance" => PermanentReason::InsufficientBalance.into(),
            "insufficient_allowance" => PermanentReason::InsufficientAllowance.into(),
            "market_closed" => PermanentReason::MarketClosed.into(),
            _ => PermanentReason::Rejected(format!("{status}: {body}")).into(),
        }
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    #[instrument(skip(self), name = "exchange::resolve_token_id")]
    async fn resolve_token_id(&self, market_slug: &str, outcome_index: u32) -> Result<String, ExchangeError> {
        let key = (market_slug.to_string(), outcome_index);
        if let Some(entry) = self.token_id_cache.read().get(&key) {
            if entry.resolved_at.elapsed() < TOKEN_ID_CACHE_TTL {
                return Ok(entry.token_id.clone());
            }
        }

        let url = format!("{}/markets/{market_slug}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed market response: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let token_id = body["outcomes"]
            .as_array()
            .and_then(|arr| arr.get(outcome_index as usize))
            .and_then(|o| o["token_id"].as_str())
            .ok_or_else(|| PermanentReason::NoOrderbook)?
            .to_string();

        self.token_id_cache.write().insert(
            key,
            TokenIdCacheEntry { token_id: token_id.clone(), resolved_at: std::time::Instant::now() },
        );

        debug!(market_slug, outcome_index, %token_id, "resolved token id");
        Ok(token_id)
    }

    #[instrument(skip(self), name = "exchange::get_order_book")]
    async fn get_order_book(&self, token_id: &str, depth: u32) -> Result<OrderBook, ExchangeError> {
        let url = format!("{}/book?token_id={token_id}&depth={depth}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed book response: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let parse_levels = |arr: Option<&Vec<serde_json::Value>>| -> Vec<BookLevel> {
            arr.map(|levels| {
                levels
                    .iter()
                    .filter_map(|l| {
                        let price = l["price"].as_str()?.parse().ok()?;
                        let size_shares = l["size"].as_str()?.parse().ok()?;
                        Some(BookLevel { price, size_shares })
                    })
                    .collect()
            })
            .unwrap_or_default()
        };

        Ok(OrderBook {
            bids: parse_levels(body["bids"].as_array()),
            asks: parse_levels(body["asks"].as_array()),
        })
    }

    #[instrument(skip(self), name = "exchange::get_market_price")]
    async fn get_market_price(&self, token_id: &str) -> Result<f64, ExchangeError> {
        let book = self.get_order_book(token_id, 1).await?;

        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            if ask - bid <= MIDPOINT_SPREAD_CUTOFF {
                return Ok((bid + ask) / 2.0);
            }
        }

        let url = format!("{}/last-trade-price?token_id={token_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed last-trade response: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        body["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PermanentReason::NoOrderbook.into())
    }

    #[instrument(skip(self, wallet), name = "exchange::get_balance_and_allowance")]
    async fn get_balance_and_allowance(
        &self,
        wallet: &WalletCredentials,
    ) -> Result<BalanceAndAllowance, ExchangeError> {
        let qs = self.signed_query(wallet, "");
        let url = format!("{}/balance-allowance?{qs}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed balance response: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        let usd_balance = body["balance"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let usd_allowance = body["allowance"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        Ok(BalanceAndAllowance { usd_balance, usd_allowance })
    }

    #[instrument(skip(self, wallet), name = "exchange::place_order")]
    async fn place_order(
        &self,
        wallet: &WalletCredentials,
        token_id: &str,
        side: Side,
        amount_usd: f64,
        limit_price: f64,
        tif: TimeInForce,
        client_order_id: &str,
    ) -> Result<OrderOutcome, ExchangeError> {
        let TimeInForce::Fok = tif;
        let params = format!(
            "token_id={token_id}&side={side}&amount_usd={amount_usd}&price={limit_price}&tif=FOK&client_order_id={client_order_id}"
        );
        let qs = self.signed_query(wallet, &params);
        let url = format!("{}/order?{qs}", self.base_url);

        debug!(token_id, %side, amount_usd, limit_price, client_order_id, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("malformed order response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        match body["status"].as_str() {
            Some("filled") => Ok(OrderOutcome::Filled {
                fill_price: body["fill_price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(limit_price),
                fill_shares: body["fill_shares"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                order_id: body["order_id"].as_str().unwrap_or_default().to_string(),
                simulated: false,
            }),
            _ => Ok(OrderOutcome::Rejected {
                reason_code: body["reason"].as_str().unwrap_or("unknown").to_string(),
            }),
        }
    }

    fn subscribe_market(
        &self,
        token_id: &str,
        reconnect_min_secs: u64,
        reconnect_max_secs: u64,
    ) -> mpsc::Receiver<MarketEvent> {
        let (tx, rx) = mpsc::channel(256);
        let ws_url = format!("{}/ws/market/{token_id}", self.ws_url);
        let token_id = token_id.to_string();

        tokio::spawn(async move {
            let mut backoff_secs = reconnect_min_secs.max(1);
            loop {
                info!(token_id = %token_id, url = %ws_url, "connecting to market stream");
                match tokio_tungstenite::connect_async(&ws_url).await {
                    Ok((ws_stream, _)) => {
                        backoff_secs = reconnect_min_secs.max(1);
                        let (mut write, mut read) = ws_stream.split();
                        let _ = write.send(Message::Text("{\"subscribe\":true}".into())).await;

                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    if let Some(event) = parse_market_event(&text) {
                                        if tx.send(event).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok(Message::Close(_)) => break,
                                Err(e) => {
                                    warn!(token_id = %token_id, error = %e, "market stream error");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        warn!(token_id = %token_id, error = %e, "market stream connect failed");
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(reconnect_max_secs.max(backoff_secs));
            }
        });

        rx
    }

    fn subscribe_user(&self, _wallet: &WalletCredentials) -> Option<mpsc::Receiver<OrderEvent>> {
        None
    }
}

fn parse_market_event(text: &str) -> Option<MarketEvent> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let ts = v["timestamp_ms"].as_i64().unwrap_or(0);
    match v["type"].as_str()? {
        "last_trade" => Some(MarketEvent::LastTrade { timestamp_ms: ts, price: v["price"].as_f64()? }),
        "price_change" => Some(MarketEvent::PriceChange {
            timestamp_ms: ts,
            best_bid: v["best_bid"].as_f64()?,
            best_ask: v["best_ask"].as_f64()?,
        }),
        "book" => {
            let parse = |arr: &serde_json::Value| -> Vec<BookLevel> {
                arr.as_array()
                    .map(|levels| {
                        levels
                            .iter()
                            .filter_map(|l| {
                                Some(BookLevel { price: l["price"].as_f64()?, size_shares: l["size"].as_f64()? })
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            };
            Some(MarketEvent::Book {
                timestamp_ms: ts,
                book: OrderBook { bids: parse(&v["bids"]), asks: parse(&v["asks"]) },
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orderbook_spread_and_depth() {
        let book = OrderBook {
            bids: vec![BookLevel { price: 0.49, size_shares: 100.0 }],
            asks: vec![BookLevel { price: 0.51, size_shares: 80.0 }],
        };
        assert!((book.spread_pct().unwrap() - (100.0 * 0.02 / 0.49)).abs() < 1e-9);
        assert!((book.bid_depth_usd() - 49.0).abs() < 1e-9);
        assert!((book.ask_depth_usd() - 40.8).abs() < 1e-9);
    }

    #[test]
    fn parse_last_trade_event() {
        let text = r#"{"type":"last_trade","timestamp_ms":1000,"price":0.55}"#;
        match parse_market_event(text) {
            Some(MarketEvent::LastTrade { timestamp_ms, price }) => {
                assert_eq!(timestamp_ms, 1000);
                assert!((price - 0.55).abs() < 1e-9);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn signed_query_includes_funder_for_proxy_mode() {
        let client = HttpExchangeClient::new("https://example", "wss://example");
        let wallet = WalletCredentials {
            wallet_secret: "secret".into(),
            signature_mode: SignatureMode::Proxy,
            funder_address: Some("0xabc".into()),
        };
        let qs = client.signed_query(&wallet, "token_id=1");
        assert!(qs.contains("funder=0xabc"));
        assert!(qs.contains("signature="));
    }
}
