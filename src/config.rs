// =============================================================================
// Configuration — per-bot BotConfig and process-wide GlobalSettings
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default...)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::types::{EntryMode, RebuyStrategy, SignatureMode, StrategyMode};

/// Smallest `trade_size_usd` the exchange will accept. Checked by
/// `BotConfig::validate`.
pub const EXCHANGE_MIN_NOTIONAL: f64 = 1.0;

fn default_spike_windows() -> Vec<u64> {
    vec![600, 1800, 3600]
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_settlement_delay_seconds() -> u64 {
    2
}

fn default_max_volatility_cv() -> f64 {
    5.0
}

fn default_max_spread_pct() -> f64 {
    2.0
}

fn default_min_liquidity_usd() -> f64 {
    50.0
}

fn default_outcome_index() -> u32 {
    0
}

fn default_rebuy_delay_seconds() -> u64 {
    0
}

fn default_entry_delay_seconds() -> u64 {
    0
}

/// An opaque ciphertext wallet secret with an `enc:` prefix. Encryption at
/// rest is an external collaborator's concern; this type only guarantees
/// the value is never logged or broadcast in clear text.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedSecret(pub String);

impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptedSecret(<redacted>)")
    }
}

/// Per-bot, persisted configuration. One JSON file per bot named by
/// `bot_id`, mode 0600 on POSIX.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    /// Either resolved at load time via `ResolveTokenId`, or set directly.
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default = "default_outcome_index")]
    pub outcome_index: u32,
    #[serde(default)]
    pub token_id: Option<String>,

    pub wallet_secret_encrypted: EncryptedSecret,
    pub signature_mode: SignatureMode,
    #[serde(default)]
    pub funder_address: Option<String>,

    #[serde(default = "default_spike_threshold_pct")]
    pub spike_threshold_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_max_hold_seconds")]
    pub max_hold_seconds: u64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_settlement_delay_seconds")]
    pub settlement_delay_seconds: u64,
    #[serde(default = "default_trade_size_usd")]
    pub trade_size_usd: f64,
    #[serde(default = "default_max_balance_usd")]
    pub max_balance_usd: f64,

    #[serde(default)]
    pub strategy_mode: StrategyMode,
    #[serde(default)]
    pub rebuy_strategy: RebuyStrategy,
    #[serde(default = "default_rebuy_delay_seconds")]
    pub rebuy_delay_seconds: u64,
    #[serde(default = "default_rebuy_drop_pct")]
    pub rebuy_drop_pct: f64,
    #[serde(default)]
    pub entry_mode: EntryMode,
    #[serde(default = "default_entry_delay_seconds")]
    pub entry_delay_seconds: u64,

    #[serde(default = "default_max_trades_per_session")]
    pub max_trades_per_session: u32,
    #[serde(default = "default_session_loss_limit_usd")]
    pub session_loss_limit_usd: f64,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_spike_windows")]
    pub spike_windows_seconds: Vec<u64>,
    #[serde(default = "default_max_volatility_cv")]
    pub max_volatility_cv: f64,

    #[serde(default = "default_min_liquidity_usd")]
    pub min_bid_liquidity_usd: f64,
    #[serde(default = "default_min_liquidity_usd")]
    pub min_ask_liquidity_usd: f64,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_spike_threshold_pct() -> f64 {
    3.0
}
fn default_take_profit_pct() -> f64 {
    5.0
}
fn default_stop_loss_pct() -> f64 {
    3.0
}
fn default_max_hold_seconds() -> u64 {
    3600
}
fn default_trade_size_usd() -> f64 {
    5.0
}
fn default_max_balance_usd() -> f64 {
    1000.0
}
fn default_rebuy_drop_pct() -> f64 {
    1.0
}
fn default_max_trades_per_session() -> u32 {
    20
}
fn default_session_loss_limit_usd() -> f64 {
    50.0
}

impl Default for StrategyMode {
    fn default() -> Self {
        StrategyMode::SpikeFade
    }
}
impl Default for RebuyStrategy {
    fn default() -> Self {
        RebuyStrategy::Immediate
    }
}
impl Default for EntryMode {
    fn default() -> Self {
        EntryMode::WaitForSpike
    }
}

impl BotConfig {
    /// Validate the invariants spec.md §3 states as prose. Run at load time
    /// and on every create/update through the control surface.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_loss_pct <= 0.0 {
            return Err(ConfigError::MustBePositive { field: "stop_loss_pct", value: self.stop_loss_pct });
        }
        if self.take_profit_pct <= 0.0 {
            return Err(ConfigError::MustBePositive { field: "take_profit_pct", value: self.take_profit_pct });
        }
        if self.trade_size_usd < EXCHANGE_MIN_NOTIONAL {
            return Err(ConfigError::BelowExchangeMinimum(self.trade_size_usd, EXCHANGE_MIN_NOTIONAL));
        }
        if self.signature_mode == SignatureMode::Proxy && self.funder_address.is_none() {
            return Err(ConfigError::MissingFunderAddress);
        }
        if self.spike_windows_seconds.iter().any(|&w| w == 0) {
            return Err(ConfigError::MustBePositive { field: "spike_windows_seconds", value: 0.0 });
        }
        Ok(())
    }

    /// Load one bot config from its JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bot config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse bot config from {}", path.display()))?;
        config.validate().with_context(|| format!("bot config {} failed validation", config.id))?;
        Ok(config)
    }

    /// Persist this bot config atomically (write-temp-then-rename), mode
    /// 0600 on POSIX.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).context("failed to create bot config directory")?;
        let path = dir.join(format!("{}.json", self.id));
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(self).context("failed to serialise bot config")?;
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp bot config to {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp_path, perms)
                .with_context(|| format!("failed to chmod {}", tmp_path.display()))?;
        }

        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp bot config to {}", path.display()))?;

        info!(bot_id = %self.id, path = %path.display(), "bot config saved (atomic)");
        Ok(())
    }

    pub fn delete(bot_id: &str, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(format!("{bot_id}.json"));
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete bot config {}", path.display()))?;
        }
        Ok(())
    }

    /// Load every `*.json` bot config file found directly under `dir`.
    pub fn load_all(dir: impl AsRef<Path>) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut configs = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                match BotConfig::load(&path) {
                    Ok(cfg) => configs.push(cfg),
                    Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to load bot config, skipping"),
                }
            }
        }
        Ok(configs)
    }
}

/// Process-wide mutable settings, read-copy-update (§5). Persisted without
/// secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_slippage_tolerance")]
    pub slippage_tolerance: f64,
    #[serde(default = "default_min_liquidity_usd")]
    pub min_bid_liquidity_usd: f64,
    #[serde(default = "default_min_liquidity_usd")]
    pub min_ask_liquidity_usd: f64,
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    #[serde(default = "default_true")]
    pub stream_enabled: bool,
    #[serde(default = "default_reconnect_min")]
    pub stream_reconnect_min_seconds: u64,
    #[serde(default = "default_reconnect_max")]
    pub stream_reconnect_max_seconds: u64,
    #[serde(default)]
    pub killswitch_on_shutdown: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_daily_loss_limit_usd")]
    pub daily_loss_limit_usd: f64,
}

fn default_true() -> bool {
    true
}
fn default_slippage_tolerance() -> f64 {
    0.01
}
fn default_reconnect_min() -> u64 {
    1
}
fn default_reconnect_max() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_daily_loss_limit_usd() -> f64 {
    200.0
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            slippage_tolerance: default_slippage_tolerance(),
            min_bid_liquidity_usd: default_min_liquidity_usd(),
            min_ask_liquidity_usd: default_min_liquidity_usd(),
            max_spread_pct: default_max_spread_pct(),
            stream_enabled: true,
            stream_reconnect_min_seconds: default_reconnect_min(),
            stream_reconnect_max_seconds: default_reconnect_max(),
            killswitch_on_shutdown: false,
            log_level: default_log_level(),
            daily_loss_limit_usd: default_daily_loss_limit_usd(),
        }
    }
}

impl GlobalSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read global settings from {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse global settings from {}", path.display()))?;
        info!(path = %path.display(), "global settings loaded");
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise global settings")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;
        info!(path = %path.display(), "global settings saved (atomic)");
        Ok(())
    }
}

/// Where bot config files and the global settings file live on disk.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub bots_dir: PathBuf,
    pub settlements_dir: PathBuf,
    pub global_settings_path: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            bots_dir: PathBuf::from("./data/bots"),
            settlements_dir: PathBuf::from("./data/settlements"),
            global_settings_path: PathBuf::from("./data/settings.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> BotConfig {
        BotConfig {
            id: "bot-1".into(),
            name: "Spike Bot".into(),
            description: None,
            market_slug: Some("will-it-rain".into()),
            outcome_index: 0,
            token_id: None,
            wallet_secret_encrypted: EncryptedSecret("enc:abc".into()),
            signature_mode: SignatureMode::Direct,
            funder_address: None,
            spike_threshold_pct: default_spike_threshold_pct(),
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            max_hold_seconds: default_max_hold_seconds(),
            cooldown_seconds: default_cooldown_seconds(),
            settlement_delay_seconds: default_settlement_delay_seconds(),
            trade_size_usd: default_trade_size_usd(),
            max_balance_usd: default_max_balance_usd(),
            strategy_mode: StrategyMode::SpikeFade,
            rebuy_strategy: RebuyStrategy::Immediate,
            rebuy_delay_seconds: 0,
            rebuy_drop_pct: default_rebuy_drop_pct(),
            entry_mode: EntryMode::WaitForSpike,
            entry_delay_seconds: 0,
            max_trades_per_session: default_max_trades_per_session(),
            session_loss_limit_usd: default_session_loss_limit_usd(),
            dry_run: true,
            spike_windows_seconds: default_spike_windows(),
            max_volatility_cv: default_max_volatility_cv(),
            min_bid_liquidity_usd: default_min_liquidity_usd(),
            min_ask_liquidity_usd: default_min_liquidity_usd(),
            max_spread_pct: default_max_spread_pct(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_accepts_default_sample() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_proxy_without_funder() {
        let mut cfg = sample_config();
        cfg.signature_mode = SignatureMode::Proxy;
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingFunderAddress)));
    }

    #[test]
    fn validate_rejects_zero_stop_loss() {
        let mut cfg = sample_config();
        cfg.stop_loss_pct = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::MustBePositive { field: "stop_loss_pct", .. })));
    }

    #[test]
    fn validate_rejects_below_exchange_minimum() {
        let mut cfg = sample_config();
        cfg.trade_size_usd = 0.1;
        assert!(matches!(cfg.validate(), Err(ConfigError::BelowExchangeMinimum(_, _))));
    }

    #[test]
    fn deserialise_empty_json_uses_global_settings_defaults() {
        let settings: GlobalSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.log_level, "info");
        assert!(settings.stream_enabled);
        assert!(!settings.killswitch_on_shutdown);
    }

    #[test]
    fn roundtrip_bot_config_save_load() {
        let dir = std::env::temp_dir().join(format!("spike-trader-test-{}", uuid::Uuid::new_v4()));
        let cfg = sample_config();
        cfg.save(&dir).unwrap();
        let loaded = BotConfig::load(dir.join("bot-1.json")).unwrap();
        assert_eq!(loaded.id, cfg.id);
        assert_eq!(loaded.trade_size_usd, cfg.trade_size_usd);
        std::fs::remove_dir_all(&dir).ok();
    }
}
