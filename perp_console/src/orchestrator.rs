/// orchestrator.rs — "Open protected long": market entry + reduce-only TP
///
/// ORDER FLOW:
///   1. Validate the trade config locally (no network on failure)
///   2. Ask the advisor, bounded by a timeout; advice is informational only
///   3. Read the latest published mark price, derive the TP price
///        tp = mark × (1 + tp% / 100), rounded to the price precision
///   4. MARKET BUY, positionSide LONG
///   5. Entry rejected  → Rejected, no TP is sent
///      Entry accepted  → reduce-only LIMIT SELL at tp, same quantity
///   6. TP rejected / unreachable → PartiallyProtected (live, unhedged long)
///      TP accepted              → Filled
///
/// The two legs are never sent concurrently: the TP is only valid once the
/// entry quantity is known to be on the book. Callers keep at most one
/// `open_long` in flight.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::advisor::{Advice, AdviceRequest, AdviceSignal, SignalAdvisor};
use crate::error::{ExchangeError, ValidationError};
use crate::exchange::Exchange;
use crate::market::MarketWatch;
use crate::models::{format_quantity, is_tradable_quantity, OrderRequest, TradeConfig};
use crate::session::SessionContext;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSettings {
    pub symbol:          String,
    pub quantity:        f64,
    pub price_decimals:  usize,
    pub advisor_timeout: Duration,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            symbol:          "BTC-USDT".into(),
            quantity:        0.001,
            price_decimals:  1,
            advisor_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Success,
    Retryable,
    Rejected,
    /// Entry is live without its protective exit.
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled {
        entry_order_id:       String,
        take_profit_order_id: Option<String>,
        take_profit_price:    f64,
    },
    Rejected {
        code:   i64,
        reason: String,
    },
    PartiallyProtected {
        entry_order_id: String,
        take_profit:    OrderRequest,
        reason:         String,
    },
    TransportFailure {
        detail: String,
    },
}

impl OrderOutcome {
    pub fn severity(&self) -> Severity {
        match self {
            OrderOutcome::Filled { .. }             => Severity::Success,
            OrderOutcome::TransportFailure { .. }   => Severity::Retryable,
            OrderOutcome::Rejected { .. }           => Severity::Rejected,
            OrderOutcome::PartiallyProtected { .. } => Severity::Critical,
        }
    }
}

impl fmt::Display for OrderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderOutcome::Filled { entry_order_id, take_profit_price, .. } => write!(
                f,
                "LONG opened (order {entry_order_id}), take-profit resting at {take_profit_price}"
            ),
            OrderOutcome::Rejected { code, reason } => {
                write!(f, "exchange rejected entry (code {code}): {reason}")
            }
            OrderOutcome::PartiallyProtected { entry_order_id, take_profit, reason } => write!(
                f,
                "UNPROTECTED LONG: entry {entry_order_id} filled but take-profit [{take_profit}] failed: {reason}; place the exit manually"
            ),
            OrderOutcome::TransportFailure { detail } => {
                write!(f, "could not reach the exchange, retry: {detail}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderReport {
    pub outcome:  OrderOutcome,
    pub advisory: Option<Advice>,
}

impl OrderReport {
    /// Advisory warning to show next to the outcome, if any.
    pub fn advisory_warning(&self) -> Option<String> {
        self.advisory
            .as_ref()
            .filter(|a| a.signal == AdviceSignal::Wait)
            .map(|a| format!("weak signal ({:.0}%): {}", a.confidence, a.reason))
    }
}

/// mark × (1 + pct/100), rounded half away from zero to `decimals`.
pub fn take_profit_price(mark_price: f64, take_profit_percent: f64, decimals: usize) -> f64 {
    let raw = mark_price * (1.0 + take_profit_percent / 100.0);
    let scale = 10f64.powi(decimals as i32);
    (raw * scale).round() / scale
}

pub struct OrderOrchestrator {
    exchange: Arc<dyn Exchange>,
    session:  SessionContext,
    market:   MarketWatch,
    advisor:  Option<Arc<dyn SignalAdvisor>>,
    settings: OrderSettings,
}

impl OrderOrchestrator {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        session:  SessionContext,
        market:   MarketWatch,
        settings: OrderSettings,
    ) -> Self {
        Self { exchange, session, market, advisor: None, settings }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn SignalAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn settings(&self) -> &OrderSettings {
        &self.settings
    }

    /// Local checks only. Nothing here touches the network.
    pub fn preflight(&self, config: &TradeConfig) -> Result<(), ValidationError> {
        config.validate()?;
        if !is_tradable_quantity(self.settings.quantity) {
            return Err(ValidationError::Quantity(self.settings.quantity));
        }
        if !self.session.is_connected() {
            return Err(ValidationError::NotConnected);
        }
        self.mark_price().map(|_| ())
    }

    fn mark_price(&self) -> Result<f64, ValidationError> {
        self.market
            .borrow()
            .as_ref()
            .map(|s| s.mark_price())
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or(ValidationError::NoMarkPrice)
    }

    pub async fn open_long(&self, config: &TradeConfig) -> Result<OrderReport, ValidationError> {
        self.preflight(config)?;

        let advisory = self.consult_advisor(config).await;

        // Re-read after the advisor round trip so the TP brackets the fill.
        let mark = self.mark_price()?;
        let tp_price = take_profit_price(mark, config.take_profit_percent, self.settings.price_decimals);
        let symbol = self.settings.symbol.as_str();
        let quantity = self.settings.quantity;

        info!(
            %symbol,
            qty = %format_quantity(quantity),
            leverage = config.leverage,
            mark,
            tp_price,
            margin_mode = ?config.margin_mode,
            position_mode = ?config.position_mode,
            "▶ Opening protected LONG"
        );

        let entry = OrderRequest::long_entry(symbol, quantity, config.leverage);
        let entry_resp = match self.exchange.place_order(&entry).await {
            Ok(r) => r,
            // Credentials went away after preflight; nothing was sent.
            Err(ExchangeError::MissingCredentials) => return Err(ValidationError::NotConnected),
            Err(e) => return Ok(self.report(transport_failure("entry", e), advisory)),
        };

        if !entry_resp.is_success() {
            let outcome = OrderOutcome::Rejected { code: entry_resp.code, reason: entry_resp.msg };
            return Ok(self.report(outcome, advisory));
        }
        let entry_order_id = match entry_resp.data {
            Some(ack) => ack.order_id,
            None => {
                warn!("Entry accepted without an order id; placing take-profit anyway");
                "unknown".to_owned()
            }
        };

        let take_profit = OrderRequest::take_profit(symbol, quantity, tp_price, self.settings.price_decimals);
        let outcome = match self.exchange.place_order(&take_profit).await {
            Ok(r) if r.is_success() => OrderOutcome::Filled {
                entry_order_id,
                take_profit_order_id: r.data.map(|a| a.order_id),
                take_profit_price: tp_price,
            },
            Ok(r) => OrderOutcome::PartiallyProtected {
                entry_order_id,
                take_profit,
                reason: format!("code {}: {}", r.code, r.msg),
            },
            Err(e) => OrderOutcome::PartiallyProtected {
                entry_order_id,
                take_profit,
                reason: e.to_string(),
            },
        };
        Ok(self.report(outcome, advisory))
    }

    async fn consult_advisor(&self, config: &TradeConfig) -> Option<Advice> {
        let advisor = self.advisor.as_ref()?;
        let request = self
            .market
            .borrow()
            .as_ref()
            .map(|s| AdviceRequest::from_snapshot(s, config.volatility_threshold))?;

        let limit = self.settings.advisor_timeout;
        match timeout(limit, advisor.advise(&request)).await {
            Ok(Ok(advice)) => {
                if advice.signal == AdviceSignal::Wait {
                    warn!(reason = %advice.reason, confidence = advice.confidence, "Advisor says WAIT; proceeding");
                } else {
                    info!(reason = %advice.reason, confidence = advice.confidence, "Advisor says OPEN");
                }
                Some(advice)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Advisor unavailable");
                None
            }
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Advisor timed out");
                None
            }
        }
    }

    fn report(&self, outcome: OrderOutcome, advisory: Option<Advice>) -> OrderReport {
        match &outcome {
            OrderOutcome::Filled { .. } => info!(outcome = %outcome, "✔ Order workflow complete"),
            OrderOutcome::Rejected { .. } | OrderOutcome::TransportFailure { .. } => {
                warn!(outcome = %outcome, "✘ Order workflow failed")
            }
            OrderOutcome::PartiallyProtected { .. } => {
                error!(outcome = %outcome, "✘ Entry without protective take-profit")
            }
        }
        OrderReport { outcome, advisory }
    }
}

fn transport_failure(leg: &str, e: ExchangeError) -> OrderOutcome {
    OrderOutcome::TransportFailure { detail: format!("{leg}: {e}") }
}
