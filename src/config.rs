use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::domain::VenueId;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Postgres ledger; the in-memory ledger is used when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub venues: Vec<VenueConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_true")]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum concurrently open positions across all venues
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_max_positions_per_venue")]
    pub max_positions_per_venue: usize,
    /// Seconds a symbol is blocked after an entry was approved
    #[serde(default = "default_entry_cooldown_secs")]
    pub entry_cooldown_secs: u64,
    /// Free balance a venue must keep before new entries are allowed
    #[serde(default = "default_min_available_balance")]
    pub min_available_balance: Decimal,
    /// Per-trade collateral cap as a fraction of the venue's capital
    #[serde(default = "default_max_trade_collateral_pct")]
    pub max_trade_collateral_pct: Decimal,
    /// Slack allowed above the per-trade cap (0.05 = 5%)
    #[serde(default = "default_trade_collateral_tolerance")]
    pub trade_collateral_tolerance: Decimal,
    /// Open collateral cap as a fraction of total capital
    #[serde(default = "default_max_total_exposure_pct")]
    pub max_total_exposure_pct: Decimal,
    #[serde(default = "default_win_rate_window")]
    pub win_rate_window: usize,
    #[serde(default = "default_win_rate_window")]
    pub win_rate_min_results: usize,
    #[serde(default = "default_min_win_rate")]
    pub min_win_rate: Decimal,
    /// Realized daily loss (quote currency) that pauses new entries
    #[serde(default)]
    pub daily_loss_limit: Option<Decimal>,
    /// Strategies whose P&L is booked as overlay rather than directional
    #[serde(default)]
    pub overlay_strategies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Try a resting limit at last price before a market exit on leveraged venues
    #[serde(default = "default_true")]
    pub maker_exit_enabled: bool,
    #[serde(default = "default_maker_exit_wait_ms")]
    pub maker_exit_wait_ms: u64,
    /// Recent fills scanned when pricing a close the venue performed
    #[serde(default = "default_fill_lookback")]
    pub fill_lookback: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Positions younger than this are never treated as phantom or ghost
    #[serde(default = "default_open_grace_secs")]
    pub open_grace_secs: u64,
    /// Symbols closed this recently are never treated as phantom
    #[serde(default = "default_recent_close_secs")]
    pub recent_close_secs: u64,
    #[serde(default = "default_reentry_cooldown_secs")]
    pub reentry_cooldown_secs: u64,
    /// Favourable move (fraction of entry) that pre-activates trailing stops on restore
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    /// Text webhook for escalations
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub venue: VenueId,
    #[serde(default)]
    pub mode: VenueMode,
    /// Quote balance the paper venue starts with
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,
    #[serde(default)]
    pub maker_fee: Option<Decimal>,
    #[serde(default)]
    pub taker_fee: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            max_positions_per_venue: default_max_positions_per_venue(),
            entry_cooldown_secs: default_entry_cooldown_secs(),
            min_available_balance: default_min_available_balance(),
            max_trade_collateral_pct: default_max_trade_collateral_pct(),
            trade_collateral_tolerance: default_trade_collateral_tolerance(),
            max_total_exposure_pct: default_max_total_exposure_pct(),
            win_rate_window: default_win_rate_window(),
            win_rate_min_results: default_win_rate_window(),
            min_win_rate: default_min_win_rate(),
            daily_loss_limit: None,
            overlay_strategies: Vec::new(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            maker_exit_enabled: true,
            maker_exit_wait_ms: default_maker_exit_wait_ms(),
            fill_lookback: default_fill_lookback(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            open_grace_secs: default_open_grace_secs(),
            recent_close_secs: default_recent_close_secs(),
            reentry_cooldown_secs: default_reentry_cooldown_secs(),
            trailing_activation_pct: default_trailing_activation_pct(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_open_positions() -> usize {
    5
}

fn default_max_positions_per_venue() -> usize {
    3
}

fn default_entry_cooldown_secs() -> u64 {
    60
}

fn default_min_available_balance() -> Decimal {
    dec!(10)
}

fn default_max_trade_collateral_pct() -> Decimal {
    dec!(0.10)
}

fn default_trade_collateral_tolerance() -> Decimal {
    dec!(0.05)
}

fn default_max_total_exposure_pct() -> Decimal {
    dec!(0.50)
}

fn default_win_rate_window() -> usize {
    20
}

fn default_min_win_rate() -> Decimal {
    dec!(0.40)
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_maker_exit_wait_ms() -> u64 {
    3_000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_open_grace_secs() -> u64 {
    60
}

fn default_recent_close_secs() -> u64 {
    30
}

fn default_reentry_cooldown_secs() -> u64 {
    300
}

fn default_trailing_activation_pct() -> Decimal {
    dec!(0.01)
}

fn default_fill_lookback() -> usize {
    20
}

fn default_max_connections() -> u32 {
    5
}

fn default_starting_balance() -> Decimal {
    dec!(1000)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from `config/` and `BASTION_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("dry_run", true)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("BASTION_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (BASTION_RISK__MAX_OPEN_POSITIONS, etc.)
            .add_source(
                Environment::with_prefix("BASTION")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Paper configuration with one paper venue per known venue
    pub fn default_config() -> Self {
        Self {
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            database: None,
            notify: NotifyConfig::default(),
            venues: VenueId::ALL
                .iter()
                .map(|venue| VenueConfig {
                    venue: *venue,
                    mode: VenueMode::Paper,
                    starting_balance: default_starting_balance(),
                    maker_fee: None,
                    taker_fee: None,
                })
                .collect(),
            logging: LoggingConfig::default(),
            dry_run: true,
        }
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let unit = |v: Decimal| v > Decimal::ZERO && v <= Decimal::ONE;

        if self.risk.max_open_positions == 0 {
            errors.push("risk.max_open_positions must be at least 1".to_string());
        }
        if self.risk.max_positions_per_venue == 0 {
            errors.push("risk.max_positions_per_venue must be at least 1".to_string());
        }
        if !unit(self.risk.max_trade_collateral_pct) {
            errors.push("risk.max_trade_collateral_pct must be in (0, 1]".to_string());
        }
        if !unit(self.risk.max_total_exposure_pct) {
            errors.push("risk.max_total_exposure_pct must be in (0, 1]".to_string());
        }
        if self.risk.trade_collateral_tolerance < Decimal::ZERO {
            errors.push("risk.trade_collateral_tolerance must not be negative".to_string());
        }
        if self.risk.min_win_rate < Decimal::ZERO || self.risk.min_win_rate > Decimal::ONE {
            errors.push("risk.min_win_rate must be in [0, 1]".to_string());
        }
        if self.risk.win_rate_window == 0 {
            errors.push("risk.win_rate_window must be at least 1".to_string());
        }
        if let Some(limit) = self.risk.daily_loss_limit {
            if limit <= Decimal::ZERO {
                errors.push("risk.daily_loss_limit must be positive".to_string());
            }
        }

        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }
        if self.execution.base_backoff_ms > self.execution.max_backoff_ms {
            errors.push("execution.base_backoff_ms exceeds execution.max_backoff_ms".to_string());
        }

        if self.reconciliation.interval_secs == 0 {
            errors.push("reconciliation.interval_secs must be at least 1".to_string());
        }

        if self.venues.is_empty() {
            errors.push("at least one venue must be configured".to_string());
        }
        for (i, venue) in self.venues.iter().enumerate() {
            if self.venues[..i].iter().any(|v| v.venue == venue.venue) {
                errors.push(format!("venue {} configured twice", venue.venue));
            }
            if self.dry_run && venue.mode == VenueMode::Live {
                errors.push(format!("venue {} is live but dry_run is set", venue.venue));
            }
        }

        if let Some(db) = &self.database {
            if db.url.trim().is_empty() {
                errors.push("database.url must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
