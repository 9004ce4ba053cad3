/// reconciler.rs — Exchange position list → local LONG-only snapshot
///
/// STATES:
///   Disconnected ── credentials appear ──▶ Polling
///   Polling ── credentials removed ──▶ Disconnected (snapshot cleared)
///
/// Each Polling tick republishes the whole snapshot; nothing is merged, so a
/// position closed between polls simply disappears. A failed fetch keeps the
/// previous snapshot and is retried on the next tick.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::market::MarketWatch;
use crate::models::{MarginMode, Position, PositionSide, RawPosition};
use crate::session::SessionContext;

pub type PositionsWatch = watch::Receiver<Arc<Vec<Position>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Polling,
}

/// unrealizedPnl / margin × 100, or `None` when the margin can't divide.
pub fn pnl_percent(unrealized_pnl: f64, margin: f64) -> Option<f64> {
    if !margin.is_finite() || margin <= 0.0 {
        return None;
    }
    Some(unrealized_pnl / margin * 100.0).filter(|v| v.is_finite())
}

/// Keep LONG records only and map them into the local model.
pub fn build_snapshot(
    raw:         &[RawPosition],
    mark_price:  Option<f64>,
    observed_at: DateTime<Utc>,
) -> Vec<Position> {
    raw.iter()
        .filter(|p| p.position_side == PositionSide::Long)
        .map(|p| {
            let isolated = p.isolated_margin.unwrap_or(0.0);
            let margin = p
                .isolated_margin
                .filter(|m| *m > 0.0)
                .or(p.margin)
                .unwrap_or(0.0);
            Position {
                id:                     p
                    .position_id
                    .clone()
                    .unwrap_or_else(|| format!("{}-LONG", p.symbol)),
                symbol:                 p.symbol.clone(),
                side:                   PositionSide::Long,
                entry_price:            p.avg_price,
                mark_price:             mark_price.unwrap_or(p.avg_price),
                quantity:               p.position_amt.abs(),
                leverage:               p.leverage,
                margin,
                take_profit_price:      None,
                unrealized_pnl:         p.unrealized_profit,
                unrealized_pnl_percent: pnl_percent(p.unrealized_profit, isolated),
                margin_mode:            p.margin_mode.unwrap_or(MarginMode::Cross),
                observed_at,
            }
        })
        .collect()
}

pub struct PositionReconciler {
    exchange: Arc<dyn Exchange>,
    session:  SessionContext,
    market:   MarketWatch,
    tx:       watch::Sender<Arc<Vec<Position>>>,
    state:    LinkState,
}

impl PositionReconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        session:  SessionContext,
        market:   MarketWatch,
    ) -> (Self, PositionsWatch) {
        let (tx, rx) = watch::channel(Arc::new(Vec::new()));
        let reconciler = Self {
            exchange,
            session,
            market,
            tx,
            state: LinkState::Disconnected,
        };
        (reconciler, rx)
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// One reconciliation pass. Returns the published count, or the fetch
    /// error (snapshot left untouched).
    pub async fn tick(&mut self) -> Result<usize, ExchangeError> {
        match (self.state, self.session.is_connected()) {
            (LinkState::Disconnected, false) => return Ok(0),
            (LinkState::Disconnected, true) => {
                info!("Credentials available, position polling on");
                self.state = LinkState::Polling;
            }
            (LinkState::Polling, false) => {
                info!("Credentials removed, position polling off");
                self.state = LinkState::Disconnected;
                self.tx.send_replace(Arc::new(Vec::new()));
                return Ok(0);
            }
            (LinkState::Polling, true) => {}
        }

        let raw = match self.exchange.positions().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Position sync failed; keeping previous snapshot");
                return Err(e);
            }
        };

        let mark = self
            .market
            .borrow()
            .as_ref()
            .map(|s| s.mark_price())
            .filter(|p| p.is_finite() && *p > 0.0);
        let snapshot = build_snapshot(&raw, mark, Utc::now());
        let dropped = raw.len() - snapshot.len();
        if dropped > 0 {
            debug!(dropped, "Ignoring non-LONG positions");
        }
        let count = snapshot.len();
        self.tx.send_replace(Arc::new(snapshot));
        Ok(count)
    }

    pub async fn run(mut self, every: Duration, cancel: CancellationToken) {
        let mut ticks = interval(every);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every_ms = every.as_millis() as u64, "Position reconciler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        info!("Position reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::market::MarketSnapshot;
    use crate::models::{ExchangeResponse, OrderAck, OrderRequest, Ticker};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Reply = Result<Vec<RawPosition>, ExchangeError>;

    struct PositionScript {
        replies: Mutex<VecDeque<Reply>>,
        calls:   AtomicUsize,
    }

    impl PositionScript {
        fn with(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Exchange for PositionScript {
        async fn ticker(&self, _symbol: &str) -> Option<Ticker> {
            None
        }

        async fn place_order(&self, _o: &OrderRequest) -> Result<ExchangeResponse<OrderAck>, ExchangeError> {
            unreachable!("reconciler never places orders")
        }

        async fn positions(&self) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn raw(id: &str, side: PositionSide, isolated_margin: f64, pnl: f64) -> RawPosition {
        RawPosition {
            position_id:       Some(id.into()),
            symbol:            "BTC-USDT".into(),
            position_side:     side,
            avg_price:         49_800.0,
            position_amt:      0.002,
            leverage:          20,
            isolated_margin:   Some(isolated_margin),
            margin:            None,
            unrealized_profit: pnl,
            margin_mode:       Some(MarginMode::Isolated),
        }
    }

    fn mixed_book() -> Vec<RawPosition> {
        vec![
            raw("L1", PositionSide::Long, 5.0, 1.0),
            raw("S1", PositionSide::Short, 5.0, -1.0),
            raw("L2", PositionSide::Long, 4.0, -0.5),
            raw("S2", PositionSide::Short, 2.0, 0.3),
            raw("L3", PositionSide::Long, 10.0, 2.5),
        ]
    }

    fn market_at(price: f64) -> MarketWatch {
        let ticker = Ticker {
            last_price:           price,
            price_change_percent: 0.0,
            high_price:           price,
            low_price:            price,
            volume:               0.0,
        };
        let (_tx, rx) = watch::channel(Some(Arc::new(MarketSnapshot::new(ticker, vec![price], Utc::now()))));
        rx
    }

    fn connected() -> SessionContext {
        SessionContext::in_memory(Some(Credentials::new("key", "secret")))
    }

    #[test]
    fn drops_everything_but_long() {
        let snap = build_snapshot(&mixed_book(), Some(50_000.0), Utc::now());
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|p| p.side == PositionSide::Long));
        let ids: Vec<&str> = snap.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "L2", "L3"]);
    }

    #[test]
    fn maps_fields_and_pnl_percent() {
        let snap = build_snapshot(&mixed_book(), Some(50_000.0), Utc::now());
        let first = &snap[0];
        assert_eq!(first.entry_price, 49_800.0);
        assert_eq!(first.mark_price, 50_000.0);
        assert_eq!(first.quantity, 0.002);
        assert_eq!(first.margin, 5.0);
        assert_eq!(first.unrealized_pnl_percent, Some(20.0));
        assert_eq!(snap[1].unrealized_pnl_percent, Some(-12.5));
        assert_eq!(first.margin_mode, MarginMode::Isolated);
    }

    #[test]
    fn zero_margin_yields_undefined_percent() {
        let mut p = raw("L0", PositionSide::Long, 0.0, 3.0);
        p.margin = Some(7.5);
        let snap = build_snapshot(&[p], None, Utc::now());
        assert_eq!(snap[0].unrealized_pnl_percent, None);
        assert_eq!(snap[0].margin, 7.5);
        // No ticker yet: fall back to the entry price.
        assert_eq!(snap[0].mark_price, 49_800.0);

        assert_eq!(pnl_percent(1.0, 0.0), None);
        assert_eq!(pnl_percent(1.0, f64::NAN), None);
        assert_eq!(pnl_percent(f64::INFINITY, 1.0), None);
    }

    #[test]
    fn missing_id_gets_stable_fallback() {
        let mut p = raw("x", PositionSide::Long, 1.0, 0.0);
        p.position_id = None;
        let snap = build_snapshot(&[p], None, Utc::now());
        assert_eq!(snap[0].id, "BTC-USDT-LONG");
    }

    #[tokio::test]
    async fn publishes_long_only_snapshot() {
        let exchange = PositionScript::with(vec![Ok(mixed_book())]);
        let (mut rec, rx) = PositionReconciler::new(exchange, connected(), market_at(50_100.0));

        assert_eq!(rec.tick().await.unwrap(), 3);
        assert_eq!(rec.state(), LinkState::Polling);
        let snap = rx.borrow().clone();
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|p| p.mark_price == 50_100.0));
    }

    #[tokio::test]
    async fn closed_positions_disappear() {
        let exchange = PositionScript::with(vec![Ok(mixed_book()), Ok(vec![raw("L2", PositionSide::Long, 4.0, 0.1)])]);
        let (mut rec, rx) = PositionReconciler::new(exchange, connected(), market_at(50_000.0));

        rec.tick().await.unwrap();
        rec.tick().await.unwrap();
        let snap = rx.borrow().clone();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, "L2");
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_snapshot() {
        let exchange = PositionScript::with(vec![
            Ok(mixed_book()),
            Err(ExchangeError::Transport("timeout".into())),
        ]);
        let (mut rec, rx) = PositionReconciler::new(exchange.clone(), connected(), market_at(50_000.0));

        rec.tick().await.unwrap();
        assert!(rec.tick().await.is_err());
        assert_eq!(rx.borrow().len(), 3);
        assert_eq!(rec.state(), LinkState::Polling);

        // Next tick retries.
        assert_eq!(rec.tick().await.unwrap(), 0);
        assert_eq!(exchange.calls(), 3);
    }

    #[tokio::test]
    async fn follows_credential_lifecycle() {
        let session = SessionContext::in_memory(None);
        let exchange = PositionScript::with(vec![Ok(mixed_book())]);
        let (mut rec, rx) = PositionReconciler::new(exchange.clone(), session.clone(), market_at(50_000.0));

        assert_eq!(rec.tick().await.unwrap(), 0);
        assert_eq!(rec.state(), LinkState::Disconnected);
        assert_eq!(exchange.calls(), 0);

        session.connect(Credentials::new("key", "secret")).unwrap();
        assert_eq!(rec.tick().await.unwrap(), 3);
        assert_eq!(rec.state(), LinkState::Polling);

        session.disconnect().unwrap();
        assert_eq!(rec.tick().await.unwrap(), 0);
        assert_eq!(rec.state(), LinkState::Disconnected);
        assert!(rx.borrow().is_empty());
        assert_eq!(exchange.calls(), 1);
    }
}
