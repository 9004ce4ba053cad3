/// session.rs — Session context + the two background polling tasks
///
/// `SessionContext` replaces a process-wide credential singleton: it is
/// created once, handed to the exchange client and the orchestrator, and is
/// the only place credentials are written (on explicit user action).
///
/// `TradingSession` owns the market feed and the position reconciler. Both
/// run until `shutdown()` (or drop) cancels their shared token.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::credentials::{CredentialStore, Credentials};
use crate::error::StoreError;
use crate::exchange::Exchange;
use crate::market::{MarketFeed, MarketWatch};
use crate::reconciler::{PositionReconciler, PositionsWatch};

#[derive(Clone)]
pub struct SessionContext {
    credentials: Arc<watch::Sender<Option<Credentials>>>,
    store:       Option<CredentialStore>,
}

impl SessionContext {
    /// Load persisted credentials; their presence decides the initial
    /// connection state.
    pub fn open(store: CredentialStore) -> Result<Self, StoreError> {
        let initial = store.load()?;
        info!(
            path = %store.path().display(),
            connected = initial.is_some(),
            "Session opened"
        );
        let (tx, _) = watch::channel(initial);
        Ok(Self { credentials: Arc::new(tx), store: Some(store) })
    }

    /// No persistence.
    pub fn in_memory(initial: Option<Credentials>) -> Self {
        let (tx, _) = watch::channel(initial.filter(Credentials::is_complete));
        Self { credentials: Arc::new(tx), store: None }
    }

    /// Persist and publish a new credential pair.
    pub fn connect(&self, creds: Credentials) -> Result<(), StoreError> {
        if !creds.is_complete() {
            return Err(StoreError::Incomplete);
        }
        if let Some(store) = &self.store {
            store.save(&creds)?;
        }
        self.credentials.send_replace(Some(creds));
        info!("Exchange credentials set");
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.clear()?;
        }
        self.credentials.send_replace(None);
        info!("Exchange credentials cleared");
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.credentials.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credentials>> {
        self.credentials.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub symbol:           String,
    pub ticker_every:     Duration,
    pub positions_every:  Duration,
    pub history_len:      usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            symbol:          "BTC-USDT".into(),
            ticker_every:    Duration::from_millis(3_000),
            positions_every: Duration::from_millis(5_000),
            history_len:     60,
        }
    }
}

pub struct TradingSession {
    market:    MarketWatch,
    positions: PositionsWatch,
    cancel:    CancellationToken,
    tasks:     Vec<JoinHandle<()>>,
}

impl TradingSession {
    /// Spawn both polling loops. Must be called inside a Tokio runtime.
    pub fn start(exchange: Arc<dyn Exchange>, context: SessionContext, settings: &PollSettings) -> Self {
        let cancel = CancellationToken::new();

        let (feed, market) = MarketFeed::new(exchange.clone(), &settings.symbol, settings.history_len);
        let (reconciler, positions) = PositionReconciler::new(exchange, context, market.clone());

        let tasks = vec![
            tokio::spawn(feed.run(settings.ticker_every, cancel.child_token())),
            tokio::spawn(reconciler.run(settings.positions_every, cancel.child_token())),
        ];

        Self { market, positions, cancel, tasks }
    }

    pub fn market(&self) -> MarketWatch {
        self.market.clone()
    }

    pub fn positions(&self) -> PositionsWatch {
        self.positions.clone()
    }

    /// Cancel both loops and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!(error = %e, "Polling task ended abnormally");
            }
        }
        info!("Session closed");
    }
}

impl Drop for TradingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
