// =============================================================================
// Control Surface (C10) — HTTP + WS
// =============================================================================
//
// Thin mapping onto Registry/BotSession methods; no trading logic lives
// here (spec.md §4.10).
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{ConfigPaths, GlobalSettings};
use crate::registry::Registry;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub paths: ConfigPaths,
    pub global_settings: Arc<RwLock<GlobalSettings>>,
    pub killswitch: Arc<AtomicBool>,
}
