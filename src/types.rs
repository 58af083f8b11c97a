// =============================================================================
// Shared types used across the signal tracker
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Direction of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// `true` when `price` has reached `target` in the profitable direction
    /// (at or above for longs, at or below for shorts).
    pub fn reached_profit(self, price: f64, target: f64) -> bool {
        match self {
            Self::Long => price >= target,
            Self::Short => price <= target,
        }
    }

    /// `true` when `price` has reached `trigger` in the adverse direction
    /// (at or below for longs, at or above for shorts).
    pub fn reached_adverse(self, price: f64, trigger: f64) -> bool {
        match self {
            Self::Long => price <= trigger,
            Self::Short => price >= trigger,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LONG" => Ok(Self::Long),
            "SHORT" => Ok(Self::Short),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

/// Exchanges with a streaming ticker feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Bybit,
    Bingx,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::Bybit
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bybit => write!(f, "Bybit"),
            Self::Bingx => write!(f, "BingX"),
        }
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bybit" => Ok(Self::Bybit),
            "bingx" => Ok(Self::Bingx),
            other => Err(format!("unknown exchange '{other}'")),
        }
    }
}

/// A validated trading signal, produced once at the ingester boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSignal {
    /// Symbol without separators, e.g. `BTCUSDT`.
    pub coin: String,
    pub side: Side,
    /// tp1..tp5, strictly monotonic away from entry in the trade direction.
    pub targets: [f64; 5],
    pub stop_loss: f64,
    #[serde(default)]
    pub exchange: Option<Exchange>,
}
