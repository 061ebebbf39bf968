// =============================================================================
// Spike Trader — Main Entry Point
// =============================================================================
//
// Every persisted bot is materialized on start but stays in its last
// lifecycle status; trading only ever switches on explicitly through the
// control surface (spec.md §4.9 crash recovery).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod activity;
mod api;
mod config;
mod error;
mod exchange;
mod execution;
mod history_ring;
mod price_stream;
mod registry;
mod risk;
mod session;
mod spike_detector;
mod strategy;
mod types;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::config::{ConfigPaths, GlobalSettings};
use crate::exchange::http::HttpExchangeClient;
use crate::exchange::ExchangeClient;
use crate::registry::{EventBus, Registry};
use crate::risk::DailyLossRegistry;
use crate::session::SessionContext;
use crate::types::BotStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("spike-trader starting up");

    let paths = ConfigPaths::default();
    let global_settings = GlobalSettings::load(&paths.global_settings_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load global settings, using defaults");
        GlobalSettings::default()
    });

    // ── 2. Build the exchange client ─────────────────────────────────────
    let base_url = std::env::var("EXCHANGE_BASE_URL").unwrap_or_else(|_| "https://clob.polymarket.com".into());
    let ws_url = std::env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com".into());
    let client: Arc<dyn ExchangeClient> = Arc::new(HttpExchangeClient::new(base_url, ws_url));

    // ── 3. Build shared session context & registry ──────────────────────
    let ctx = SessionContext {
        client,
        bus: Arc::new(EventBus::new()),
        daily_loss: Arc::new(DailyLossRegistry::new()),
        killswitch: Arc::new(AtomicBool::new(false)),
        global_settings: Arc::new(RwLock::new(global_settings)),
    };

    let registry = Arc::new(Registry::new(paths.clone(), ctx.clone()));
    registry.load_all().await?;
    info!(count = registry.list().len(), "persisted bots materialized");

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        registry: registry.clone(),
        paths,
        global_settings: ctx.global_settings.clone(),
        killswitch: ctx.killswitch.clone(),
    });

    let bind_addr = std::env::var("SPIKE_TRADER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 5. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    let killswitch_on_shutdown = ctx.global_settings.read().killswitch_on_shutdown;
    let handles = registry.handles();

    if killswitch_on_shutdown {
        let running: Vec<_> = handles.iter().filter(|h| h.session.status() == BotStatus::Running).collect();
        info!(count = running.len(), "killswitch_on_shutdown is set, closing open positions before exit");
        let closes = running.iter().map(|h| async move {
            if let Err(e) = h.session.manual_close().await {
                debug!(bot_id = h.session.id(), error = %e, "shutdown close skipped");
            }
        });
        futures_util::future::join_all(closes).await;
    }

    let stops = handles.iter().map(|h| h.session.stop(false));
    futures_util::future::join_all(stops).await;

    info!("spike-trader shut down complete");
    Ok(())
}
