// =============================================================================
// WebSocket Handler — broadcast-bus push channel
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate `init` snapshot of every bot.
//   2. Every subsequent broadcast-bus event, as it is published.
//
// A client may send a `subscribe_bot` text frame to narrow which per-bot
// events it cares about; this is routing-only — global events (init,
// settings_updated, subscriber_lagged, and bot-less errors) are always
// delivered regardless of subscription (spec.md §4.10).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::ApiState;
use crate::registry::{recv_or_lagged, BusEvent};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Inbound client frame. Only `subscribe_bot` is meaningful today; other
/// shapes are ignored rather than rejected, so older dashboard builds don't
/// break the connection.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    SubscribeBot { bot_id: String },
    #[serde(other)]
    Unknown,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>, Query(query): Query<WsQuery>) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state)).into_response()
}

/// `None` means "subscribed to every bot" (the initial state, and the state
/// after a client subscribes to nothing in particular).
fn event_bot_id(event: &BusEvent) -> Option<&str> {
    match event {
        BusEvent::Init { .. } | BusEvent::SettingsUpdated { .. } | BusEvent::SubscriberLagged { .. } => None,
        BusEvent::Error { bot_id, .. } => bot_id.as_deref(),
        BusEvent::PriceUpdate { bot_id, .. }
        | BusEvent::PositionUpdate { bot_id, .. }
        | BusEvent::TargetUpdate { bot_id, .. }
        | BusEvent::SpikeDetected { bot_id, .. }
        | BusEvent::Activity { bot_id, .. }
        | BusEvent::TradeExecuted { bot_id, .. }
        | BusEvent::PositionClosed { bot_id, .. }
        | BusEvent::BotCreated { bot_id, .. }
        | BusEvent::BotUpdated { bot_id, .. }
        | BusEvent::BotDeleted { bot_id, .. }
        | BusEvent::BotStarted { bot_id, .. }
        | BusEvent::BotStopped { bot_id, .. }
        | BusEvent::BotPaused { bot_id, .. }
        | BusEvent::BotResumed { bot_id, .. } => Some(bot_id),
    }
}

fn should_deliver(event: &BusEvent, subscribed: &HashSet<String>) -> bool {
    if subscribed.is_empty() {
        return true;
    }
    match event_bot_id(event) {
        Some(bot_id) => subscribed.contains(bot_id),
        None => true,
    }
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<ApiState>) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut bus_rx = state.registry.bus().subscribe();
    let mut subscribed: HashSet<String> = HashSet::new();

    if let Err(e) = send_event(&mut sender, &state.registry.init_snapshot()).await {
        debug!(error = %e, "failed to send initial ws snapshot, disconnecting");
        return;
    }

    loop {
        tokio::select! {
            event = recv_or_lagged(&mut bus_rx) => {
                match event {
                    Some(event) => {
                        if should_deliver(&event, &subscribed) {
                            if let Err(e) = send_event(&mut sender, &event).await {
                                debug!(error = %e, "ws send failed, disconnecting");
                                break;
                            }
                        }
                    }
                    None => {
                        info!("event bus closed, disconnecting ws client");
                        break;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::SubscribeBot { bot_id }) => {
                                debug!(bot_id = %bot_id, "ws client subscribed to bot");
                                subscribed.insert(bot_id);
                            }
                            Ok(ClientFrame::Unknown) | Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("ws close frame received, disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "ws receive error, disconnecting");
                        break;
                    }
                    None => {
                        info!("ws stream ended");
                        break;
                    }
                }
            }
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &BusEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize bus event, dropping frame");
            Ok(())
        }
    }
}
