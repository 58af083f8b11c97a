// =============================================================================
// Runtime Configuration — tracker settings with atomic save
// =============================================================================
//
// Every tunable of the tracker lives in `tracker_config.json`. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// Secrets and deployment values come from the environment (`.env` is loaded
// first) and override whatever the file says. The bot token is never written
// back to disk.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::feed::FeedSettings;
use crate::ledger::RetryPolicy;
use crate::notify::telegram::{ChatIds, DeliveryPolicy};
use crate::position::LadderSettings;
use crate::tracker::TrackerSettings;
use crate::types::Exchange;

pub const CONFIG_PATH: &str = "tracker_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ledger_path() -> String {
    "ledger.csv".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8436".to_string()
}

fn default_exchanges() -> Vec<Exchange> {
    vec![Exchange::Bybit, Exchange::Bingx]
}

fn default_tracker_poll_ms() -> u64 {
    300
}

fn default_ingest_poll_ms() -> u64 {
    900
}

fn default_utc_offset_hours() -> i32 {
    3
}

fn default_feed_buffer_capacity() -> usize {
    64
}

fn default_reconnect_base_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    120
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_ledger_max_attempts() -> u32 {
    5
}

fn default_ledger_retry_delay_secs() -> u64 {
    10
}

fn default_telegram_max_attempts() -> u32 {
    30
}

// =============================================================================
// TelegramConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token. Environment only (`TOKEN`).
    #[serde(default, skip_serializing)]
    pub bot_token: String,

    /// Signal and take-profit channel (`CHANNEL_NAME`).
    #[serde(default)]
    pub main_chat: String,

    /// Averaging and breakeven channel (`AV_CHANNEL_NAME`).
    #[serde(default)]
    pub averaging_chat: String,

    /// Connectivity and persistence problems (`TECH_CHANNEL_NAME`).
    #[serde(default)]
    pub tech_chat: String,

    #[serde(default = "default_telegram_max_attempts")]
    pub max_attempts: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            main_chat: String::new(),
            averaging_chat: String::new(),
            tech_chat: String::new(),
            max_attempts: default_telegram_max_attempts(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Deployment ----------------------------------------------------------

    /// CSV ledger file.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: String,

    /// Health API listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub telegram: TelegramConfig,

    // --- Feeds ----------------------------------------------------------------

    /// Exchanges to open a price feed for.
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<Exchange>,

    /// Feed used when a signal names no exchange or one without a feed.
    #[serde(default)]
    pub default_exchange: Exchange,

    #[serde(default = "default_feed_buffer_capacity")]
    pub feed_buffer_capacity: usize,

    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    /// Keep-alive period for feeds without an app-level ping.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Silence tolerated past a keep-alive before reconnecting.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    // --- Tracking ---------------------------------------------------------------

    #[serde(default)]
    pub ladder: LadderSettings,

    /// Tracker price poll period.
    #[serde(default = "default_tracker_poll_ms")]
    pub tracker_poll_ms: u64,

    /// Telegram channel poll period.
    #[serde(default = "default_ingest_poll_ms")]
    pub ingest_poll_ms: u64,

    /// Timezone of opened-at stamps (hours east of UTC).
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,

    /// Appended to every position alert.
    #[serde(default)]
    pub alert_footer: Option<String>,

    // --- Ledger -------------------------------------------------------------------

    #[serde(default = "default_ledger_max_attempts")]
    pub ledger_max_attempts: u32,

    #[serde(default = "default_ledger_retry_delay_secs")]
    pub ledger_retry_delay_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            bind_addr: default_bind_addr(),
            telegram: TelegramConfig::default(),
            exchanges: default_exchanges(),
            default_exchange: Exchange::default(),
            feed_buffer_capacity: default_feed_buffer_capacity(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            ladder: LadderSettings::default(),
            tracker_poll_ms: default_tracker_poll_ms(),
            ingest_poll_ms: default_ingest_poll_ms(),
            utc_offset_hours: default_utc_offset_hours(),
            alert_footer: None,
            ledger_max_attempts: default_ledger_max_attempts(),
            ledger_retry_delay_secs: default_ledger_retry_delay_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tracker config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse tracker config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchanges = ?config.exchanges,
            ledger = %config.ledger_path,
            "tracker config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (`.tmp` then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise tracker config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "tracker config saved (atomic)");
        Ok(())
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = get("TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(chat) = get("CHANNEL_NAME") {
            self.telegram.main_chat = chat;
        }
        if let Some(chat) = get("AV_CHANNEL_NAME") {
            self.telegram.averaging_chat = chat;
        }
        if let Some(chat) = get("TECH_CHANNEL_NAME") {
            self.telegram.tech_chat = chat;
        }
        if let Some(path) = get("LEDGER_PATH") {
            self.ledger_path = path;
        }
        if let Some(addr) = get("TRACKER_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(exchange) = get("TRACKER_EXCHANGE") {
            self.default_exchange = exchange
                .parse()
                .map_err(|e: String| anyhow::anyhow!("TRACKER_EXCHANGE: {e}"))?;
        }
        Ok(())
    }

    /// Reject settings the tracker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let steps = &self.ladder.averaging_percentages;
        if steps.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            bail!("averaging percentages must be positive: {steps:?}");
        }
        if steps.windows(2).any(|w| w[1] < w[0]) {
            bail!("averaging percentages must be non-decreasing: {steps:?}");
        }
        if !(0.0..0.1).contains(&self.ladder.fee_rate) {
            bail!("fee rate {} is out of range", self.ladder.fee_rate);
        }
        if self.ladder.entry_volume <= 0.0 {
            bail!("entry volume must be positive");
        }
        if self.exchanges.is_empty() {
            bail!("at least one exchange feed must be enabled");
        }
        if self.tracker_poll_ms == 0 || self.ingest_poll_ms == 0 {
            bail!("poll intervals must be non-zero");
        }
        if self.reconnect_base_secs == 0 || self.reconnect_max_secs < self.reconnect_base_secs {
            bail!(
                "reconnect backoff {}s..{}s is invalid",
                self.reconnect_base_secs,
                self.reconnect_max_secs
            );
        }
        if self.ping_interval_secs == 0 || self.ping_timeout_secs == 0 {
            bail!("feed keep-alive interval and timeout must be non-zero");
        }
        if self.ledger_max_attempts == 0 {
            bail!("ledger_max_attempts must be at least 1");
        }
        Ok(())
    }

    // --- Derived settings ----------------------------------------------------

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            ladder: self.ladder.clone(),
            poll_interval: Duration::from_millis(self.tracker_poll_ms),
            utc_offset_hours: self.utc_offset_hours,
            footer: self.alert_footer.clone().filter(|f| !f.is_empty()),
        }
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            buffer_capacity: self.feed_buffer_capacity.max(1),
            reconnect_base: Duration::from_secs(self.reconnect_base_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.ledger_max_attempts,
            delay: Duration::from_secs(self.ledger_retry_delay_secs),
        }
    }

    pub fn chat_ids(&self) -> ChatIds {
        ChatIds {
            main: self.telegram.main_chat.clone(),
            averaging: self.telegram.averaging_chat.clone(),
            tech: self.telegram.tech_chat.clone(),
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: self.telegram.max_attempts.max(1),
            ..DeliveryPolicy::default()
        }
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_poll_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8436");
        assert_eq!(cfg.exchanges, vec![Exchange::Bybit, Exchange::Bingx]);
        assert_eq!(cfg.default_exchange, Exchange::Bybit);
        assert_eq!(cfg.tracker_poll_ms, 300);
        assert_eq!(cfg.ingest_poll_ms, 900);
        assert_eq!(cfg.utc_offset_hours, 3);
        assert_eq!(cfg.telegram.max_attempts, 30);
        assert!((cfg.ladder.fee_rate - 0.0008).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ledger_path, "ledger.csv");
        assert_eq!(cfg.reconnect_base_secs, 5);
        assert_eq!(cfg.reconnect_max_secs, 120);
        assert_eq!(cfg.feed_settings().ping_interval, Duration::from_secs(20));
        assert_eq!(cfg.feed_settings().ping_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ledger_max_attempts, 5);
        assert_eq!(cfg.telegram.max_attempts, 30);
        assert!(cfg.alert_footer.is_none());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "default_exchange": "bingx", "exchanges": ["bingx"], "tracker_poll_ms": 500 }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.default_exchange, Exchange::Bingx);
        assert_eq!(cfg.exchanges, vec![Exchange::Bingx]);
        assert_eq!(cfg.tracker_settings().poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.feed_settings().reconnect_max, Duration::from_secs(120));
    }

    #[test]
    fn env_overrides_file_values_and_token_is_not_saved() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TOKEN", "123:abc"),
            ("CHANNEL_NAME", "@signals"),
            ("TECH_CHANNEL_NAME", "@tech"),
            ("AV_CHANNEL_NAME", ""),
            ("LEDGER_PATH", "/data/sheet.csv"),
            ("TRACKER_EXCHANGE", "BingX"),
        ]);
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.telegram.bot_token, "123:abc");
        assert_eq!(cfg.chat_ids().main, "@signals");
        assert_eq!(cfg.chat_ids().tech, "@tech");
        assert_eq!(cfg.chat_ids().averaging, "");
        assert_eq!(cfg.ledger_path, "/data/sheet.csv");
        assert_eq!(cfg.default_exchange, Exchange::Bingx);

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("123:abc"));

        let mut bad = AppConfig::default();
        let err = bad.apply_overrides(|k| (k == "TRACKER_EXCHANGE").then(|| "kraken".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut cfg = AppConfig::default();
        cfg.ladder.averaging_percentages = [0.1, 0.3, 0.2, 0.4, 0.8];
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.exchanges.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.reconnect_max_secs = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_is_atomic_and_complete() {
        let path = std::env::temp_dir().join(format!("tracker-config-{}.json", uuid::Uuid::new_v4()));
        let mut cfg = AppConfig::default();
        cfg.alert_footer = Some("@desk".into());
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.alert_footer.as_deref(), Some("@desk"));
        assert_eq!(loaded.ladder, cfg.ladder);
        std::fs::remove_file(&path).unwrap();

        assert!(AppConfig::load(&path).is_err());
    }
}
