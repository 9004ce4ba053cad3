/// market.rs — Ticker poll, price history and MACD(12, 26, 9)
///
/// The feed is the only writer of the market snapshot. Everything else
/// (orchestrator, reconciler, console) reads the latest published value
/// through a `watch::Receiver`.
///
///   EMA_t      = α·P_t + (1 − α)·EMA_{t−1},   α = 2 / (n + 1)
///   MACD_t     = EMA12_t − EMA26_t
///   SIGNAL_t   = EMA9(MACD)_t
///   HIST_t     = MACD_t − SIGNAL_t
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::exchange::Exchange;
use crate::models::{Ticker, VolatilityThreshold};

pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

pub type MarketWatch = watch::Receiver<Option<Arc<MarketSnapshot>>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd:      f64,
    pub signal:    f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub ticker:      Ticker,
    /// Oldest first, bounded by the feed's history length.
    pub prices:      Vec<f64>,
    pub macd:        Vec<MacdPoint>,
    pub trend:       Trend,
    pub observed_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(ticker: Ticker, prices: Vec<f64>, observed_at: DateTime<Utc>) -> Self {
        let macd = macd_series(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        let trend = trend_of(&macd);
        Self { ticker, prices, macd, trend, observed_at }
    }

    /// Reference price for TP computation and position display.
    pub fn mark_price(&self) -> f64 {
        self.ticker.last_price
    }

    pub fn volatility_crossed(&self, threshold: VolatilityThreshold) -> bool {
        threshold.is_crossed_by(self.ticker.price_change_percent)
    }
}

fn ema_step(prev: f64, value: f64, period: usize) -> f64 {
    let alpha = 2.0 / (period as f64 + 1.0);
    alpha * value + (1.0 - alpha) * prev
}

/// One MACD point per input price. EMAs are seeded with the first value.
pub fn macd_series(prices: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<MacdPoint> {
    let Some(&first) = prices.first() else {
        return Vec::new();
    };
    let (mut ema_fast, mut ema_slow, mut ema_signal) = (first, first, 0.0);
    let mut out = Vec::with_capacity(prices.len());

    for (i, &p) in prices.iter().enumerate() {
        ema_fast = ema_step(ema_fast, p, fast);
        ema_slow = ema_step(ema_slow, p, slow);
        let macd = ema_fast - ema_slow;
        ema_signal = if i == 0 { macd } else { ema_step(ema_signal, macd, signal) };
        out.push(MacdPoint { macd, signal: ema_signal, histogram: macd - ema_signal });
    }
    out
}

pub fn trend_of(series: &[MacdPoint]) -> Trend {
    match series.last() {
        Some(p) if series.len() >= 2 && p.histogram > f64::EPSILON  => Trend::Bullish,
        Some(p) if series.len() >= 2 && p.histogram < -f64::EPSILON => Trend::Bearish,
        _ => Trend::Neutral,
    }
}

pub struct MarketFeed {
    exchange: Arc<dyn Exchange>,
    symbol:   String,
    history:  VecDeque<f64>,
    capacity: usize,
    tx:       watch::Sender<Option<Arc<MarketSnapshot>>>,
}

impl MarketFeed {
    pub fn new(exchange: Arc<dyn Exchange>, symbol: &str, capacity: usize) -> (Self, MarketWatch) {
        let (tx, rx) = watch::channel(None);
        let capacity = capacity.max(1);
        let feed = Self {
            exchange,
            symbol: symbol.to_owned(),
            history: VecDeque::with_capacity(capacity),
            capacity,
            tx,
        };
        (feed, rx)
    }

    /// Fetch one tick. A missing tick leaves the published snapshot alone.
    pub async fn poll_once(&mut self) -> bool {
        let Some(ticker) = self.exchange.ticker(&self.symbol).await else {
            return false;
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(ticker.last_price);

        let snapshot = MarketSnapshot::new(ticker, self.history.iter().copied().collect(), Utc::now());
        debug!(
            symbol = %self.symbol,
            price = snapshot.mark_price(),
            trend = ?snapshot.trend,
            "Ticker"
        );
        self.tx.send_replace(Some(Arc::new(snapshot)));
        true
    }

    pub async fn run(mut self, every: Duration, cancel: CancellationToken) {
        let mut ticks = interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(symbol = %self.symbol, every_ms = every.as_millis() as u64, "Market feed started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
        }
        info!(symbol = %self.symbol, "Market feed stopped");
    }
}
