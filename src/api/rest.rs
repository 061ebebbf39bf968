// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor. This surface is a thin mapping onto
// `Registry`/`BotSession` methods (spec.md §4.10) — no trading logic lives
// here.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::api::ApiState;
use crate::config::{BotConfig, EncryptedSecret, GlobalSettings};
use crate::error::ApiError;
use crate::registry::BusEvent;
use crate::types::{EntryMode, RebuyStrategy, SignatureMode, Side, StrategyMode};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Bot CRUD ────────────────────────────────────────────────
        .route("/api/v1/bots", get(list_bots).post(create_bot))
        .route("/api/v1/bots/:id", get(get_bot).put(update_bot).delete(delete_bot))
        // ── Lifecycle ───────────────────────────────────────────────
        .route("/api/v1/bots/:id/start", post(start_bot))
        .route("/api/v1/bots/:id/stop", post(stop_bot))
        .route("/api/v1/bots/:id/pause", post(pause_bot))
        .route("/api/v1/bots/:id/resume", post(resume_bot))
        // ── Manual orders ───────────────────────────────────────────
        .route("/api/v1/bots/:id/trade", post(manual_trade))
        .route("/api/v1/bots/:id/close", post(manual_close))
        // ── Read-only diagnostics ───────────────────────────────────
        .route("/api/v1/bots/:id/activities", get(bot_activities))
        .route("/api/v1/bots/:id/chart-data", get(bot_chart_data))
        .route("/api/v1/bots/:id/orderbook", get(bot_orderbook))
        .route("/api/v1/bots/:id/target", get(bot_target))
        .route("/api/v1/bots/:id/spike-status", get(bot_spike_status))
        // ── Global settings / profiles / killswitch ─────────────────
        .route("/api/v1/settings", get(get_settings).post(set_settings))
        .route("/api/v1/profiles", get(profiles))
        .route("/api/v1/kill", post(kill))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn not_found(bot_id: &str) -> ApiError {
    ApiError::new("not_found", format!("bot '{bot_id}' not found"))
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    bots: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse { status: "ok", bots: state.registry.list().len(), server_time: Utc::now().timestamp_millis() })
}

// =============================================================================
// Bot CRUD
// =============================================================================

/// Request body for create/update. Mirrors `BotConfig` minus the
/// server-assigned `id`/`created_at`/`updated_at`.
#[derive(Debug, Deserialize)]
struct BotConfigPayload {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    market_slug: Option<String>,
    #[serde(default)]
    outcome_index: u32,
    #[serde(default)]
    token_id: Option<String>,
    wallet_secret_encrypted: String,
    signature_mode: SignatureMode,
    #[serde(default)]
    funder_address: Option<String>,
    spike_threshold_pct: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_hold_seconds: u64,
    cooldown_seconds: u64,
    settlement_delay_seconds: u64,
    trade_size_usd: f64,
    max_balance_usd: f64,
    strategy_mode: StrategyMode,
    rebuy_strategy: RebuyStrategy,
    rebuy_delay_seconds: u64,
    rebuy_drop_pct: f64,
    entry_mode: EntryMode,
    entry_delay_seconds: u64,
    max_trades_per_session: u32,
    session_loss_limit_usd: f64,
    #[serde(default)]
    dry_run: bool,
    spike_windows_seconds: Vec<u64>,
    max_volatility_cv: f64,
    min_bid_liquidity_usd: f64,
    min_ask_liquidity_usd: f64,
    max_spread_pct: f64,
}

impl BotConfigPayload {
    fn into_config(self, id: String, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> BotConfig {
        BotConfig {
            id,
            name: self.name,
            description: self.description,
            market_slug: self.market_slug,
            outcome_index: self.outcome_index,
            token_id: self.token_id,
            wallet_secret_encrypted: EncryptedSecret(self.wallet_secret_encrypted),
            signature_mode: self.signature_mode,
            funder_address: self.funder_address,
            spike_threshold_pct: self.spike_threshold_pct,
            take_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
            max_hold_seconds: self.max_hold_seconds,
            cooldown_seconds: self.cooldown_seconds,
            settlement_delay_seconds: self.settlement_delay_seconds,
            trade_size_usd: self.trade_size_usd,
            max_balance_usd: self.max_balance_usd,
            strategy_mode: self.strategy_mode,
            rebuy_strategy: self.rebuy_strategy,
            rebuy_delay_seconds: self.rebuy_delay_seconds,
            rebuy_drop_pct: self.rebuy_drop_pct,
            entry_mode: self.entry_mode,
            entry_delay_seconds: self.entry_delay_seconds,
            max_trades_per_session: self.max_trades_per_session,
            session_loss_limit_usd: self.session_loss_limit_usd,
            dry_run: self.dry_run,
            spike_windows_seconds: self.spike_windows_seconds,
            max_volatility_cv: self.max_volatility_cv,
            min_bid_liquidity_usd: self.min_bid_liquidity_usd,
            min_ask_liquidity_usd: self.min_ask_liquidity_usd,
            max_spread_pct: self.max_spread_pct,
            created_at,
            updated_at,
        }
    }
}

async fn list_bots(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn create_bot(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<BotConfigPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let config = payload.into_config(uuid::Uuid::new_v4().to_string(), now, now);
    config.validate()?;
    let summary = state.registry.create(config).await.map_err(|e| ApiError::new("internal", e.to_string()))?;
    info!(bot_id = %summary.id, "bot created via control surface");
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_bot(_auth: AuthBearer, State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(handle.session.summary()))
}

async fn update_bot(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(payload): Json<BotConfigPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = state.registry.get(&id).ok_or_else(|| not_found(&id))?.session.config();
    let config = payload.into_config(id.clone(), existing.created_at, Utc::now());
    config.validate()?;
    let summary = state.registry.update(&id, config).await.map_err(|e| ApiError::new("bot_running", e.to_string()))?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

async fn delete_bot(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.delete(&id, query.force).await.map_err(|e| ApiError::new("bot_running", e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Lifecycle
// =============================================================================

async fn start_bot(_auth: AuthBearer, State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    handle.session.start().await.map_err(|e| ApiError::new("internal", e.to_string()))?;
    Ok(Json(handle.session.summary()))
}

#[derive(Deserialize)]
struct StopQuery {
    #[serde(default)]
    force: bool,
}

async fn stop_bot(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    handle.session.stop(query.force).await;
    Ok(Json(handle.session.summary()))
}

async fn pause_bot(_auth: AuthBearer, State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    handle.session.pause().await.map_err(|e| ApiError::new("internal", e.to_string()))?;
    Ok(Json(handle.session.summary()))
}

async fn resume_bot(_auth: AuthBearer, State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    handle.session.resume().await.map_err(|e| ApiError::new("internal", e.to_string()))?;
    Ok(Json(handle.session.summary()))
}

// =============================================================================
// Manual orders
// =============================================================================

#[derive(Deserialize)]
struct TradeRequest {
    side: Side,
}

async fn manual_trade(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<TradeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    handle.session.manual_trade(req.side).await.map_err(|e| ApiError::new("invalid_request", e))?;
    Ok(StatusCode::ACCEPTED)
}

async fn manual_close(_auth: AuthBearer, State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    handle.session.manual_close().await.map_err(|e| ApiError::new("invalid_request", e))?;
    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Read-only diagnostics
// =============================================================================

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_activity_limit")]
    limit: usize,
}

fn default_activity_limit() -> usize {
    100
}

async fn bot_activities(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(handle.session.activities().recent(query.limit)))
}

#[derive(Deserialize)]
struct ChartDataQuery {
    from_ts: Option<i64>,
    to_ts: Option<i64>,
}

async fn bot_chart_data(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<ChartDataQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    let to_ts = query.to_ts.unwrap_or_else(|| Utc::now().timestamp_millis());
    let from_ts = query.from_ts.unwrap_or(to_ts - 3_600_000);
    Ok(Json(handle.session.history().samples_in_range(from_ts, to_ts)))
}

#[derive(Deserialize)]
struct DepthQuery {
    #[serde(default = "default_orderbook_depth")]
    depth: u32,
}

fn default_orderbook_depth() -> u32 {
    10
}

async fn bot_orderbook(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    let book = handle.session.order_book(query.depth).await.map_err(|e| ApiError::new("internal", e))?;
    Ok(Json(book))
}

async fn bot_target(_auth: AuthBearer, State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(handle.session.strategy().target()))
}

async fn bot_spike_status(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry.get(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(handle.session.spike_status()))
}

// =============================================================================
// Global settings
// =============================================================================

async fn get_settings(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.global_settings.read().clone())
}

async fn set_settings(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(settings): Json<GlobalSettings>,
) -> Result<impl IntoResponse, ApiError> {
    settings.save(&state.paths.global_settings_path).map_err(|e| ApiError::new("internal", e.to_string()))?;
    *state.global_settings.write() = settings.clone();
    state.registry.bus().publish(BusEvent::SettingsUpdated { timestamp: Utc::now(), settings: settings.clone() });
    info!("global settings updated via control surface");
    Ok(Json(settings))
}

// =============================================================================
// Profiles — named parameter presets for the bot-creation dialog
// =============================================================================

#[derive(Serialize)]
struct StrategyProfile {
    name: &'static str,
    description: &'static str,
    strategy_mode: StrategyMode,
    spike_threshold_pct: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    max_hold_seconds: u64,
    cooldown_seconds: u64,
}

async fn profiles(_auth: AuthBearer) -> impl IntoResponse {
    Json(vec![
        StrategyProfile {
            name: "conservative_fade",
            description: "Wide spike threshold, tight risk, single-shot fade",
            strategy_mode: StrategyMode::SpikeFade,
            spike_threshold_pct: 5.0,
            take_profit_pct: 3.0,
            stop_loss_pct: 2.0,
            max_hold_seconds: 1800,
            cooldown_seconds: 60,
        },
        StrategyProfile {
            name: "balanced_fade",
            description: "Default spike-fade parameters",
            strategy_mode: StrategyMode::SpikeFade,
            spike_threshold_pct: 3.0,
            take_profit_pct: 5.0,
            stop_loss_pct: 3.0,
            max_hold_seconds: 3600,
            cooldown_seconds: 30,
        },
        StrategyProfile {
            name: "train_of_trade",
            description: "Continuous rebuy/exit cycling after every close",
            strategy_mode: StrategyMode::TrainOfTrade,
            spike_threshold_pct: 3.0,
            take_profit_pct: 4.0,
            stop_loss_pct: 3.0,
            max_hold_seconds: 3600,
            cooldown_seconds: 15,
        },
    ])
}

// =============================================================================
// Global killswitch
// =============================================================================

#[derive(Serialize)]
struct KillResponse {
    killswitch_on: bool,
}

async fn kill(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.killswitch.store(true, Ordering::Release);
    warn!("global killswitch engaged via control surface");
    state.registry.bus().publish(BusEvent::Error { bot_id: None, timestamp: Utc::now(), message: "global killswitch engaged".into(), recoverable: true });
    Json(KillResponse { killswitch_on: true })
}
