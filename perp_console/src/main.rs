/// main.rs — Console entry point
///
/// FLOW:
///   1. Load config from .env (BINGX_*, SYMBOL, TP_PERCENT, ...)
///   2. Open the session context (persisted credentials decide connection)
///   3. Sync the signing clock with BingX server time
///   4. Start the ticker feed and position reconciler
///   5. Read commands from stdin until `quit` / Ctrl-C, one at a time
///   6. Cancel both polling loops and wait for them
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perp_console::advisor::{GeminiAdvisor, SignalAdvisor};
use perp_console::config::AppConfig;
use perp_console::credentials::{CredentialStore, Credentials};
use perp_console::exchange::{BingxClient, Exchange};
use perp_console::market::MarketWatch;
use perp_console::orchestrator::{OrderOrchestrator, Severity};
use perp_console::reconciler::PositionsWatch;
use perp_console::session::{SessionContext, TradingSession};
use perp_console::TradeConfig;

const HELP: &str = "commands: long [tp%] [leverage] | ticker | positions | config | connect <key> <secret> | disconnect | help | quit";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║   PERP CONSOLE  ·  LONG ONLY  •  TP REQUIRED ║");
    info!("╚══════════════════════════════════════════════╝");

    let cfg = AppConfig::from_env()?;
    info!(
        "Config: symbol={} qty={} lev={}x tp={}% vol={} rest={}",
        cfg.symbol, cfg.order_quantity, cfg.trade.leverage,
        cfg.trade.take_profit_percent, cfg.trade.volatility_threshold, cfg.rest_url
    );

    let context = SessionContext::open(CredentialStore::new(&cfg.credentials_path))
        .context("Failed to open credential store")?;
    if !context.is_connected() {
        if let Some(seed) = cfg.seed_credentials.clone() {
            context.connect(seed).context("Failed to store seed credentials")?;
        } else {
            warn!("No API credentials: use `connect <key> <secret>` to enable trading");
        }
    }

    let client = BingxClient::new(&cfg.rest_url, cfg.recv_window_ms, cfg.http_timeout, context.clone())
        .context("HTTP client build failed")?;
    if let Err(e) = client.sync_time().await {
        warn!(error = %e, "Time sync failed; signing with local clock");
    }
    let exchange: Arc<dyn Exchange> = Arc::new(client);

    let session = TradingSession::start(exchange.clone(), context.clone(), &cfg.poll_settings());

    let mut orchestrator = OrderOrchestrator::new(
        exchange,
        context.clone(),
        session.market(),
        cfg.order_settings(),
    );
    if let Some(key) = &cfg.gemini_api_key {
        match GeminiAdvisor::new(key, &cfg.gemini_model, cfg.advisor_timeout) {
            Ok(advisor) => {
                let advisor: Arc<dyn SignalAdvisor> = Arc::new(advisor);
                orchestrator = orchestrator.with_advisor(advisor);
                info!(model = %cfg.gemini_model, "Advisor enabled");
            }
            Err(e) => warn!(error = %e, "Advisor disabled"),
        }
    }

    info!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("stdin read failed")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        };
        let Some(line) = line else { break };
        let words: Vec<&str> = line.split_whitespace().collect();

        // Commands run to completion before the next line is read, so at
        // most one order workflow is ever in flight.
        match words.as_slice() {
            [] => {}
            ["quit"] | ["exit"] => break,
            ["help"] => info!("{HELP}"),
            ["ticker"] => show_market(&session.market(), &cfg.trade),
            ["positions"] => show_positions(&session.positions()),
            ["config"] => info!("{:?}", cfg.trade),
            ["connect", key, secret] => {
                if let Err(e) = context.connect(Credentials::new(*key, *secret)) {
                    error!("✘ {e}");
                }
            }
            ["disconnect"] => {
                if let Err(e) = context.disconnect() {
                    error!("✘ {e}");
                }
            }
            ["long", rest @ ..] => match trade_config(&cfg.trade, rest) {
                Ok(trade) => open_long(&orchestrator, &trade).await,
                Err(e) => error!("✘ {e}"),
            },
            _ => warn!("Unknown command. {HELP}"),
        }
    }

    session.shutdown().await;
    Ok(())
}

fn trade_config(defaults: &TradeConfig, args: &[&str]) -> Result<TradeConfig> {
    let mut trade = defaults.clone();
    if let Some(tp) = args.first() {
        trade.take_profit_percent = tp.parse().with_context(|| format!("bad tp% `{tp}`"))?;
    }
    if let Some(lev) = args.get(1) {
        trade.leverage = lev
            .trim_start_matches('x')
            .parse()
            .with_context(|| format!("bad leverage `{lev}`"))?;
    }
    Ok(trade)
}

async fn open_long(orchestrator: &OrderOrchestrator, trade: &TradeConfig) {
    match orchestrator.open_long(trade).await {
        Ok(report) => {
            if let Some(w) = report.advisory_warning() {
                warn!("⚠ {w}");
            }
            match report.outcome.severity() {
                Severity::Success => info!("✔ {}", report.outcome),
                Severity::Retryable | Severity::Rejected => warn!("✘ {}", report.outcome),
                Severity::Critical => error!("‼ {}", report.outcome),
            }
        }
        Err(e) => error!("✘ Order not sent: {e}"),
    }
}

fn show_market(market: &MarketWatch, trade: &TradeConfig) {
    let snap = market.borrow().clone();
    match snap {
        Some(s) => {
            let t = &s.ticker;
            info!(
                "{:.1}  24h {:+.2}%  H {:.1}  L {:.1}  vol {:.2}  trend {:?}  vol≥{}: {}",
                t.last_price, t.price_change_percent, t.high_price, t.low_price, t.volume,
                s.trend, trade.volatility_threshold,
                if s.volatility_crossed(trade.volatility_threshold) { "yes" } else { "no" }
            );
        }
        None => info!("No ticker yet"),
    }
}

fn show_positions(positions: &PositionsWatch) {
    let snap = positions.borrow().clone();
    if snap.is_empty() {
        info!("No open LONG positions");
        return;
    }
    for p in snap.iter() {
        let pnl_pct = p
            .unrealized_pnl_percent
            .map(|v| format!("{v:+.2}%"))
            .unwrap_or_else(|| "n/a".into());
        info!(
            "{} {} {:?} qty={} entry={:.1} mark={:.1} {}x margin={:.2} pnl={:+.2} ({})",
            p.id, p.symbol, p.margin_mode, p.quantity, p.entry_price, p.mark_price,
            p.leverage, p.margin, p.unrealized_pnl, pnl_pct
        );
    }
}
