use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::signer::RequestParams;

pub const MAX_LEVERAGE: u32 = 125;
/// Base-asset precision for BTC-USDT quantities.
pub const QUANTITY_DECIMALS: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy  => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
    Both,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long  => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Both  => "BOTH",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit  => "LIMIT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl FromStr for MarginMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ISOLATED" => Ok(MarginMode::Isolated),
            "CROSS" | "CROSSED" => Ok(MarginMode::Cross),
            other => Err(ValidationError::UnknownVariant { field: "margin mode", value: other.into() }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionMode {
    OneWay,
    Hedge,
}

impl FromStr for PositionMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ONE_WAY" | "ONEWAY" => Ok(PositionMode::OneWay),
            "HEDGE" => Ok(PositionMode::Hedge),
            other => Err(ValidationError::UnknownVariant { field: "position mode", value: other.into() }),
        }
    }
}

/// Volatility trigger levels offered to the user, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityThreshold {
    P0_3,
    P0_5,
    P1_0,
    P1_5,
}

impl VolatilityThreshold {
    pub const ALL: [VolatilityThreshold; 4] = [
        VolatilityThreshold::P0_3,
        VolatilityThreshold::P0_5,
        VolatilityThreshold::P1_0,
        VolatilityThreshold::P1_5,
    ];

    pub fn percent(&self) -> f64 {
        match self {
            VolatilityThreshold::P0_3 => 0.3,
            VolatilityThreshold::P0_5 => 0.5,
            VolatilityThreshold::P1_0 => 1.0,
            VolatilityThreshold::P1_5 => 1.5,
        }
    }

    /// True when the absolute 24h change has crossed this level.
    pub fn is_crossed_by(&self, change_percent: f64) -> bool {
        change_percent.abs() >= self.percent()
    }
}

impl TryFrom<f64> for VolatilityThreshold {
    type Error = ValidationError;

    fn try_from(v: f64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| (t.percent() - v).abs() < 1e-9)
            .ok_or(ValidationError::VolatilityThreshold(v))
    }
}

impl fmt::Display for VolatilityThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeConfig {
    pub leverage:             u32,
    pub volatility_threshold: VolatilityThreshold,
    pub take_profit_percent:  f64,
    pub margin_mode:          MarginMode,
    pub position_mode:        PositionMode,
}

impl TradeConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=MAX_LEVERAGE).contains(&self.leverage) {
            return Err(ValidationError::Leverage(self.leverage));
        }
        if !self.take_profit_percent.is_finite() || self.take_profit_percent <= 0.0 {
            return Err(ValidationError::TakeProfitPercent(self.take_profit_percent));
        }
        Ok(())
    }
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            leverage:             20,
            volatility_threshold: VolatilityThreshold::P0_5,
            take_profit_percent:  1.5,
            margin_mode:          MarginMode::Isolated,
            position_mode:        PositionMode::Hedge,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub last_price:           f64,
    pub price_change_percent: f64,
    pub high_price:           f64,
    pub low_price:            f64,
    pub volume:               f64,
}

/// Exchange position record after the parsing boundary, before policy
/// filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPosition {
    pub position_id:       Option<String>,
    pub symbol:            String,
    pub position_side:     PositionSide,
    pub avg_price:         f64,
    pub position_amt:      f64,
    pub leverage:          u32,
    pub isolated_margin:   Option<f64>,
    pub margin:            Option<f64>,
    pub unrealized_profit: f64,
    pub margin_mode:       Option<MarginMode>,
}

/// Local position model. Always LONG; rebuilt from scratch on every poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id:                     String,
    pub symbol:                 String,
    pub side:                   PositionSide,
    pub entry_price:            f64,
    pub mark_price:             f64,
    pub quantity:               f64,
    pub leverage:               u32,
    pub margin:                 f64,
    /// Resting TP orders are not read back from the exchange.
    pub take_profit_price:      Option<f64>,
    pub unrealized_pnl:         f64,
    /// `None` when the margin is zero or unusable.
    pub unrealized_pnl_percent: Option<f64>,
    pub margin_mode:            MarginMode,
    pub observed_at:            DateTime<Utc>,
}

/// Quantity exactly as it goes on the wire.
pub fn format_quantity(quantity: f64) -> String {
    format!("{:.*}", QUANTITY_DECIMALS, quantity)
}

/// False when the quantity rounds to zero (or worse) at wire precision.
pub fn is_tradable_quantity(quantity: f64) -> bool {
    quantity.is_finite() && format_quantity(quantity).parse::<f64>().is_ok_and(|q| q > 0.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol:          String,
    pub side:            Side,
    pub position_side:   PositionSide,
    pub order_type:      OrderType,
    pub quantity:        f64,
    pub price:           Option<f64>,
    pub reduce_only:     bool,
    pub leverage:        Option<u32>,
    pub price_decimals:  usize,
}

impl OrderRequest {
    /// MARKET BUY opening the long leg.
    pub fn long_entry(symbol: &str, quantity: f64, leverage: u32) -> Self {
        Self {
            symbol:         symbol.to_owned(),
            side:           Side::Buy,
            position_side:  PositionSide::Long,
            order_type:     OrderType::Market,
            quantity,
            price:          None,
            reduce_only:    false,
            leverage:       Some(leverage),
            price_decimals: 1,
        }
    }

    /// Reduce-only LIMIT SELL closing the long at `price`.
    pub fn take_profit(symbol: &str, quantity: f64, price: f64, price_decimals: usize) -> Self {
        Self {
            symbol:        symbol.to_owned(),
            side:          Side::Sell,
            position_side: PositionSide::Long,
            order_type:    OrderType::Limit,
            quantity,
            price:         Some(price),
            reduce_only:   true,
            leverage:      None,
            price_decimals,
        }
    }

    /// Wire parameters in the order they are signed and sent.
    pub fn to_params(&self) -> RequestParams {
        RequestParams::new()
            .with("symbol", self.symbol.as_str())
            .with("side", self.side.as_str())
            .with("positionSide", self.position_side.as_str())
            .with("type", self.order_type.as_str())
            .with("quantity", format_quantity(self.quantity))
            .with_opt("price", self.price.map(|p| format!("{:.*}", self.price_decimals, p)))
            .with_opt("reduceOnly", self.reduce_only.then(|| "true".to_owned()))
            .with_opt("leverage", self.leverage.map(|l| l.to_string()))
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} qty={}",
            self.order_type.as_str(),
            self.side.as_str(),
            self.position_side.as_str(),
            self.symbol,
            format_quantity(self.quantity)
        )?;
        if let Some(p) = self.price {
            write!(f, " @ {:.*}", self.price_decimals, p)?;
        }
        if self.reduce_only {
            write!(f, " reduceOnly")?;
        }
        Ok(())
    }
}

/// Decoded `{code, msg, data}` envelope. `data` is only decoded on success.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeResponse<T> {
    pub code: i64,
    pub msg:  String,
    pub data: Option<T>,
}

impl<T> ExchangeResponse<T> {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
}
