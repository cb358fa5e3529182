//! Configuration management
//!
//! Loads the JSON configuration file, applies `.env`/environment overrides
//! for credentials and a handful of operational knobs, and validates the
//! ratio tables before anything trades on them.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::RetryPolicy;
use crate::strategy::cases::CaseTable;
use crate::strategy::levels::DEFAULT_RATIOS;
use crate::strategy::swing::ZigZagParams;
use crate::{Symbol, Timeframe};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub scanner: ScannerConfig,
    pub swing: SwingConfig,
    pub levels: LevelsConfig,
    pub cases: CaseTable,
    pub execution: ExecutionConfig,
    pub notifications: NotificationConfig,
    pub state: StateConfig,
}

impl Config {
    /// Load configuration from a JSON file and apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay credentials and operational overrides from the environment
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("BINANCE_API_KEY") {
            self.exchange.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("BINANCE_API_SECRET") {
            self.exchange.api_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("TELEGRAM_TOKEN") {
            self.notifications.telegram_token = Some(token);
        }
        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
            self.notifications.telegram_chat_id = Some(chat);
        }
        if let Ok(mode) = std::env::var("BOT_TRADING_MODE") {
            self.trading.mode = match mode.to_lowercase().as_str() {
                "paper" => TradingMode::Paper,
                "live" | "real" => TradingMode::Live,
                other => bail!("BOT_TRADING_MODE must be 'paper' or 'live', got '{}'", other),
            };
        }
        if let Ok(secs) = std::env::var("BOT_SCAN_INTERVAL") {
            self.scanner.scan_interval_secs = secs
                .parse()
                .with_context(|| format!("Invalid BOT_SCAN_INTERVAL: {}", secs))?;
        }
        if let Ok(tf) = std::env::var("BOT_TIMEFRAME") {
            self.scanner.timeframe = tf.parse()?;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot trade safely
    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;
        if t.margin_per_trade <= 0.0 {
            bail!("trading.margin_per_trade must be positive");
        }
        if t.leverage < 1.0 {
            bail!("trading.leverage must be >= 1");
        }
        if !(0.0..0.1).contains(&t.commission) {
            bail!("trading.commission must be a fraction in [0, 0.1)");
        }
        if self.scanner.scan_interval_secs == 0 || self.scanner.monitor_interval_millis == 0 {
            bail!("scanner intervals must be non-zero");
        }
        if !(0.0..=100.0).contains(&self.scanner.rsi_threshold) {
            bail!("scanner.rsi_threshold must be within 0..=100");
        }
        if self.levels.ratios.is_empty() {
            bail!("levels.ratios must not be empty");
        }
        if self.execution.retry_attempts == 0 {
            bail!("execution.retry_attempts must be at least 1");
        }
        let zz = self.swing.params_for(self.scanner.timeframe);
        if zz.deviation_pct <= 0.0 || zz.depth == 0 {
            bail!("zig-zag deviation and depth must be positive");
        }
        if self.swing.min_bars < zz.depth * 2 {
            bail!("swing.min_bars must cover at least two zig-zag depths");
        }
        if let Err(e) = self.cases.validate() {
            bail!("invalid case table: {}", e);
        }
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.trading.mode == TradingMode::Live
    }
}

/// Exchange connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    pub base_url: String,
    pub recv_window_ms: u64,
    /// Requests per second allowed by the client-side limiter
    pub rate_limit: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: "https://fapi.binance.com".to_string(),
            recv_window_ms: 5_000,
            rate_limit: 10,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

/// Sizing and account parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub mode: TradingMode,
    /// Explicit universe. Empty means "top pairs by volume".
    pub pairs: Vec<String>,
    /// Margin committed by each entry order
    pub margin_per_trade: f64,
    pub leverage: f64,
    /// Free margin that must remain for a proposal to be admitted
    pub min_available_margin: f64,
    /// Starting balance of the simulated ledger
    pub initial_balance: f64,
    /// Fee per side as a fraction of notional
    pub commission: f64,
    /// Adverse slippage applied to simulated market fills
    pub slippage: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            mode: TradingMode::Paper,
            pairs: Vec::new(),
            margin_per_trade: 3.0,
            leverage: 10.0,
            min_available_margin: 3.0,
            initial_balance: 30.0,
            commission: 0.0006,
            slippage: 0.0,
        }
    }
}

impl TradingConfig {
    pub fn pairs(&self) -> Vec<Symbol> {
        self.pairs.iter().map(Symbol::new).collect()
    }

    /// Contract quantity bought by one entry order at `price`
    pub fn quantity_for(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        self.margin_per_trade * self.leverage / price
    }
}

/// Scan and monitor cadence, universe selection and the RSI gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub timeframe: Timeframe,
    pub candle_limit: u32,
    pub scan_interval_secs: u64,
    pub first_scan_delay_secs: u64,
    pub monitor_interval_millis: u64,
    /// Minimum RSI for a setup to be considered; 0 disables the gate
    pub rsi_threshold: f64,
    pub rsi_timeframe: Timeframe,
    pub rsi_period: usize,
    pub top_pairs_limit: usize,
    pub excluded_pairs: Vec<String>,
    /// Upper bound on symbols evaluated concurrently in one cycle
    pub max_concurrent_evaluations: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            timeframe: Timeframe::H4,
            candle_limit: 1000,
            scan_interval_secs: 60,
            first_scan_delay_secs: 5,
            monitor_interval_millis: 2_000,
            rsi_threshold: 70.0,
            rsi_timeframe: Timeframe::M5,
            rsi_period: 14,
            top_pairs_limit: 100,
            excluded_pairs: [
                "USDCUSDT",
                "TUSDUSDT",
                "BUSDUSDT",
                "FDUSDUSDT",
                "USDPUSDT",
                "BTCDOMUSDT",
                "DAIUSDT",
                "EURUSDT",
                "GBPUSDT",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_concurrent_evaluations: 8,
        }
    }
}

impl ScannerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_millis)
    }

    pub fn is_excluded(&self, symbol: &Symbol) -> bool {
        self.excluded_pairs
            .iter()
            .any(|p| p.eq_ignore_ascii_case(symbol.as_str()))
    }
}

/// Zig-zag sensitivity and swing guards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwingConfig {
    pub min_bars: usize,
    pub max_pivot_age_bars: Option<usize>,
    /// A swing whose retracement already reached this ratio is skipped
    pub invalidation_ratio: Option<f64>,
    /// Overrides the timeframe preset when set together with `depth`
    pub deviation_pct: Option<f64>,
    pub depth: Option<usize>,
    /// Per-timeframe zig-zag presets keyed by interval ("1h", "4h", ...)
    pub presets: HashMap<String, ZigZagParams>,
}

impl Default for SwingConfig {
    fn default() -> Self {
        let presets = [
            ("1m", 0.3, 5),
            ("5m", 0.5, 5),
            ("15m", 1.0, 5),
            ("30m", 1.5, 6),
            ("1h", 2.0, 8),
            ("2h", 2.5, 9),
            ("4h", 3.0, 10),
            ("1d", 5.0, 10),
        ]
        .into_iter()
        .map(|(tf, dev, depth)| (tf.to_string(), ZigZagParams::new(dev, depth)))
        .collect();

        SwingConfig {
            min_bars: 200,
            max_pivot_age_bars: Some(200),
            invalidation_ratio: None,
            deviation_pct: None,
            depth: None,
            presets,
        }
    }
}

impl SwingConfig {
    pub fn params_for(&self, timeframe: Timeframe) -> ZigZagParams {
        if let (Some(dev), Some(depth)) = (self.deviation_pct, self.depth) {
            return ZigZagParams::new(dev, depth);
        }
        self.presets
            .get(timeframe.as_str())
            .copied()
            .unwrap_or_else(|| ZigZagParams::new(2.0, 8))
    }
}

/// Retracement ratios published with each level set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelsConfig {
    pub ratios: Vec<f64>,
}

impl Default for LevelsConfig {
    fn default() -> Self {
        Self {
            ratios: DEFAULT_RATIOS.to_vec(),
        }
    }
}

/// Retry behaviour of order commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub retry_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_multiplier: f64,
    /// Capacity of each symbol worker's event queue
    pub worker_queue: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_initial_backoff_ms: 250,
            retry_max_backoff_ms: 5_000,
            retry_multiplier: 2.0,
            worker_queue: 256,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry_attempts)
            .with_initial_backoff(Duration::from_millis(self.retry_initial_backoff_ms))
            .with_max_backoff(Duration::from_millis(self.retry_max_backoff_ms))
            .with_multiplier(self.retry_multiplier)
    }
}

/// Operator notifications
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub telegram_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
}

/// Persistence location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub state_dir: PathBuf,
    pub auto_backup: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            auto_backup: true,
        }
    }
}
