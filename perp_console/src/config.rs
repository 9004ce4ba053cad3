/// config.rs — Centralised configuration loaded from .env
///
/// Loading happens once at startup; the binary splits `AppConfig` into the
/// per-component settings structs.
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::advisor::DEFAULT_GEMINI_MODEL;
use crate::credentials::Credentials;
use crate::exchange::DEFAULT_BASE_URL;
use crate::models::{MarginMode, PositionMode, TradeConfig, VolatilityThreshold};
use crate::orchestrator::OrderSettings;
use crate::session::PollSettings;
use crate::signer::DEFAULT_RECV_WINDOW_MS;

pub const DEFAULT_CREDENTIALS_PATH: &str = ".perp_console/credentials.json";

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── BingX credentials (optional seed; the store wins if present) ───
    pub seed_credentials: Option<Credentials>,
    pub credentials_path: PathBuf,

    // ── REST endpoint / transport ────────────────────────────────────
    pub rest_url:       String,
    pub recv_window_ms: u64,
    pub http_timeout:   Duration,

    // ── Instrument & order sizing ────────────────────────────────────
    pub symbol:         String,
    pub order_quantity: f64,
    /// Decimal places for limit prices (BTC-USDT ticks at 0.1)
    pub price_decimals: usize,

    // ── Polling cadence ──────────────────────────────────────────────
    pub ticker_poll:       Duration,
    pub position_poll:     Duration,
    pub price_history_len: usize,

    // ── Advisor ──────────────────────────────────────────────────────
    pub gemini_api_key:  Option<String>,
    pub gemini_model:    String,
    pub advisor_timeout: Duration,

    // ── Default trade config ─────────────────────────────────────────
    pub trade: TradeConfig,
}

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env

        let seed_credentials = match (env::var("BINGX_API_KEY"), env::var("BINGX_API_SECRET")) {
            (Ok(k), Ok(s)) => Some(Credentials::new(k, s)).filter(Credentials::is_complete),
            _ => None,
        };

        let trade = TradeConfig {
            leverage:             parse_env("LEVERAGE", 20u32)?,
            volatility_threshold: VolatilityThreshold::try_from(parse_env("VOLATILITY_THRESHOLD", 0.5)?)
                .context("Config key VOLATILITY_THRESHOLD")?,
            take_profit_percent:  parse_env("TP_PERCENT", 1.5)?,
            margin_mode:          env::var("MARGIN_MODE")
                .unwrap_or_else(|_| "ISOLATED".into())
                .parse::<MarginMode>()
                .context("Config key MARGIN_MODE")?,
            position_mode:        env::var("POSITION_MODE")
                .unwrap_or_else(|_| "HEDGE".into())
                .parse::<PositionMode>()
                .context("Config key POSITION_MODE")?,
        };
        trade.validate().context("Default trade config")?;

        Ok(Self {
            seed_credentials,
            credentials_path: env::var("CREDENTIALS_PATH")
                .unwrap_or_else(|_| DEFAULT_CREDENTIALS_PATH.into())
                .into(),

            rest_url:       env::var("BINGX_REST_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            recv_window_ms: parse_env("RECV_WINDOW_MS", DEFAULT_RECV_WINDOW_MS)?,
            http_timeout:   Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", 10u64)?),

            symbol:         env::var("SYMBOL").unwrap_or_else(|_| "BTC-USDT".into()),
            order_quantity: parse_env("ORDER_QUANTITY", 0.001)?,
            price_decimals: parse_env("PRICE_PRECISION", 1usize)?,

            ticker_poll:       Duration::from_millis(parse_env("TICKER_POLL_MS", 3_000u64)?),
            position_poll:     Duration::from_millis(parse_env("POSITION_POLL_MS", 5_000u64)?),
            price_history_len: parse_env("PRICE_HISTORY_LEN", 60usize)?,

            gemini_api_key:  env::var("GEMINI_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            gemini_model:    env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.into()),
            advisor_timeout: Duration::from_millis(parse_env("ADVISOR_TIMEOUT_MS", 8_000u64)?),

            trade,
        })
    }

    pub fn order_settings(&self) -> OrderSettings {
        OrderSettings {
            symbol:          self.symbol.clone(),
            quantity:        self.order_quantity,
            price_decimals:  self.price_decimals,
            advisor_timeout: self.advisor_timeout,
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            symbol:          self.symbol.clone(),
            ticker_every:    self.ticker_poll,
            positions_every: self.position_poll,
            history_len:     self.price_history_len,
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}
