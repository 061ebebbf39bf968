// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// A bot's position direction. LONG = bought the outcome token expecting a
/// rise; SHORT = sold it expecting a fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Action a `Target` intends to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetAction {
    Buy,
    Sell,
}

/// The comparison a `Target`'s price must satisfy to fire. BUY targets use
/// `Le` (fire at-or-below); SELL targets use `Ge` (fire at-or-above).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetCondition {
    Le,
    Ge,
}

impl TargetCondition {
    pub fn holds(&self, price: f64, target: f64) -> bool {
        match self {
            TargetCondition::Le => price <= target,
            TargetCondition::Ge => price >= target,
        }
    }
}

/// `direct`: the bot's own wallet signs orders. `proxy`: a funder/relayer
/// address signs on the bot wallet's behalf (Gnosis-safe-style proxy
/// wallet), requiring `funder_address` to be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    Direct,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuyStrategy {
    Immediate,
    WaitForDrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    ImmediateBuy,
    WaitForSpike,
    DelayedBuy,
}

/// Spike-fade reacts once per spike signal; Train-of-Trade keeps an
/// explicit rebuy/exit target cycling continuously. See DESIGN.md Open
/// Question 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    SpikeFade,
    TrainOfTrade,
}

/// Lifecycle status of a `BotSession`, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotStatus::Created => "created",
            BotStatus::Running => "running",
            BotStatus::Paused => "paused",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_condition_holds() {
        assert!(TargetCondition::Le.holds(0.40, 0.50));
        assert!(!TargetCondition::Le.holds(0.60, 0.50));
        assert!(TargetCondition::Ge.holds(0.60, 0.50));
        assert!(!TargetCondition::Ge.holds(0.40, 0.50));
    }

    #[test]
    fn status_display() {
        assert_eq!(BotStatus::Running.to_string(), "running");
    }
}
