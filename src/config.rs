//! Runtime configuration.
//!
//! Two groups: [`TradeConfig`] describes the instrument and the guard/cadence
//! tuning of the engine, [`VenueConfig`] carries venue credentials and
//! endpoints. Both load from environment variables so the binary can run off
//! a plain `.env` file. Guard constants and cadences are configuration with
//! documented defaults, never protocol behavior.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set in environment")]
    Missing(&'static str),

    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError> {
    let raw = env_var(name)?;
    raw.parse()
        .map_err(|_| ConfigError::Invalid { name, value: raw })
}

fn env_parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Instrument and engine tuning.
#[derive(Debug, Clone)]
pub struct TradeConfig {
    /// Traded instrument symbol (e.g., "PEPEUSDT").
    pub symbol: String,
    /// Base asset code (left part of the symbol).
    pub base_asset: String,
    /// Decimal scale the venue accepts for base-asset quantities.
    pub base_asset_scale: u32,
    /// Quote asset code (right part of the symbol).
    pub quote_asset: String,
    /// Decimal scale of the quote asset; one tick is `10^-quote_asset_scale`.
    pub quote_asset_scale: u32,
    /// Quote-asset budget per opened position.
    pub notional_per_trade: Decimal,
    /// Distance between a position's open and close price, in ticks.
    pub gap_size_points: u32,
    /// Minimum tick distance allowed between two pending opens.
    pub proximity_ticks: u32,
    /// Maximum |quantity - executed_qty| still treated as a full fill.
    pub fill_tolerance: Decimal,
    /// Ceiling on consecutive opened-but-unfinished positions.
    pub combo_ceiling: u32,
    /// Decay ticks the combo counter must stay saturated before resetting.
    pub combo_window_ticks: u32,
    /// Minimum age before a pending open is eligible for the stale sweep.
    pub min_order_age: Duration,
    /// Cadence of the stale-order sweep.
    pub sweep_interval: Duration,
    /// Cadence of the combo-counter decay.
    pub combo_decay_interval: Duration,
    /// Cadence of the open-order reconciliation.
    pub reconcile_interval: Duration,
    /// Cadence of the user-data session keep-alive.
    pub keep_alive_interval: Duration,
    /// Directory holding the position snapshot store.
    pub data_dir: String,
}

impl TradeConfig {
    /// Load from environment variables (`TRADE_*`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            symbol: env_var("TRADE_SYMBOL")?,
            base_asset: env_var("TRADE_BASE_ASSET")?,
            base_asset_scale: env_parse("TRADE_BASE_ASSET_SCALE")?,
            quote_asset: env_var("TRADE_QUOTE_ASSET")?,
            quote_asset_scale: env_parse("TRADE_QUOTE_ASSET_SCALE")?,
            notional_per_trade: env_parse("TRADE_NOTIONAL_PER_TRADE")?,
            gap_size_points: env_parse("TRADE_GAP_SIZE_POINTS")?,
            proximity_ticks: env_parse_or("TRADE_PROXIMITY_TICKS", 3)?,
            fill_tolerance: env_parse_or("TRADE_FILL_TOLERANCE", Decimal::new(1, 3))?,
            combo_ceiling: env_parse_or("TRADE_COMBO_CEILING", 5)?,
            combo_window_ticks: env_parse_or("TRADE_COMBO_WINDOW_TICKS", 60)?,
            min_order_age: Duration::from_secs(env_parse_or("TRADE_MIN_ORDER_AGE_SECS", 60)?),
            sweep_interval: Duration::from_secs(env_parse_or("TRADE_SWEEP_INTERVAL_SECS", 20)?),
            combo_decay_interval: Duration::from_secs(env_parse_or(
                "TRADE_COMBO_DECAY_INTERVAL_SECS",
                60,
            )?),
            reconcile_interval: Duration::from_secs(env_parse_or(
                "TRADE_RECONCILE_INTERVAL_SECS",
                20 * 60,
            )?),
            keep_alive_interval: Duration::from_secs(env_parse_or(
                "TRADE_KEEP_ALIVE_INTERVAL_SECS",
                20 * 60 + 60,
            )?),
            data_dir: env_parse_or("TRADE_DATA_DIR", "./gridpilot-data".to_string())?,
        })
    }

    /// Smallest representable price increment of the quote asset.
    pub fn tick(&self) -> Decimal {
        Decimal::new(1, self.quote_asset_scale)
    }

    /// Signed price distance expressed in ticks.
    pub fn in_ticks(&self, delta: Decimal) -> Decimal {
        delta * Decimal::from(10u64.pow(self.quote_asset_scale))
    }

    /// The quote-asset offset between a position's open and close price.
    pub fn gap_offset(&self) -> Decimal {
        Decimal::from(self.gap_size_points) * self.tick()
    }
}

/// Venue credentials and endpoints.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub api_key: String,
    pub api_secret: String,
    /// REST base URL (e.g., "https://api.binance.com").
    pub rest_url: String,
    /// WebSocket stream base URL (e.g., "wss://stream.binance.com:9443").
    pub ws_url: String,
}

impl VenueConfig {
    /// Load from environment variables (`VENUE_*`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: env_var("VENUE_API_KEY")?,
            api_secret: env_var("VENUE_API_SECRET")?,
            rest_url: env_parse_or("VENUE_REST_URL", "https://api.binance.com".to_string())?,
            ws_url: env_parse_or("VENUE_WS_URL", "wss://stream.binance.com:9443".to_string())?,
        })
    }
}
