use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trendflip::broker::{CandleSource, OrderGateway, PaperBroker, RestBroker};
use trendflip::execution::{ExecutionContext, ExecutionMode, FillJournal};
use trendflip::persistence::StateStore;
use trendflip::streams::{MarketDataAdapter, TickHandler, WsMarketDataAdapter};
use trendflip::trading_core::{Trader, TraderServices, TraderState};
use trendflip::TraderConfig;

#[derive(Parser, Debug)]
#[command(name = "trendflip")]
#[command(about = "Candle-aligned trend-flip trading orchestrator")]
struct Args {
    /// Instance configuration (JSON)
    #[arg(short, long, default_value = "config/instances.json")]
    config: PathBuf,

    /// Position state file. Backtests use a `.backtest.json` sibling
    #[arg(short, long, default_value = "state/positions.json")]
    state: PathBuf,

    /// Run the live scheduler
    #[arg(long, conflicts_with = "backtest")]
    run: bool,

    /// Replay the last `--period` days against a paper venue
    #[arg(long, requires = "period")]
    backtest: bool,

    /// Backtest period in days
    #[arg(long)]
    period: Option<u32>,

    /// Append every fill to this CSV file
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = if args.debug { "trendflip=debug" } else { "trendflip=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let config = TraderConfig::load(&args.config)?;
    let tz = config.tz()?;
    let enabled: Vec<_> = config.instances.iter().filter(|i| i.enabled).cloned().collect();
    for skipped in config.instances.iter().filter(|i| !i.enabled) {
        info!(instance = %skipped.name, "Instance disabled, skipping");
    }

    let mode = match (args.backtest, args.period) {
        (true, Some(days)) => ExecutionMode::Backtest { days },
        _ => ExecutionMode::Live,
    };

    if !args.run && !args.backtest {
        info!(
            "Config {} OK: {} enabled instance(s). Pass --run or --backtest to trade",
            args.config.display(),
            enabled.len()
        );
        return Ok(());
    }

    info!("Starting trendflip in {} mode ({})", mode, tz);

    let rest = Arc::new(RestBroker::from_env().context("Broker credentials missing")?);
    let mut feed = None;
    let (candles, orders, ticks): (Arc<dyn CandleSource>, Arc<dyn OrderGateway>, _) = match mode {
        ExecutionMode::Live => {
            let ws = WsMarketDataAdapter::from_env()?;
            feed = Some(ws.clone());
            let adapter: Arc<dyn MarketDataAdapter> = ws;
            let candles: Arc<dyn CandleSource> = rest.clone();
            let orders: Arc<dyn OrderGateway> = rest;
            (candles, orders, Some(TickHandler::new(adapter)))
        }
        ExecutionMode::Backtest { .. } => {
            let paper = Arc::new(PaperBroker::with_upstream(rest));
            let candles: Arc<dyn CandleSource> = paper.clone();
            let orders: Arc<dyn OrderGateway> = paper;
            (candles, orders, None)
        }
    };

    // One journal for every instance so the header is written once
    let journal = match &args.journal {
        Some(path) => match FillJournal::open(path) {
            Ok(journal) => Some(Arc::new(journal)),
            Err(e) => {
                warn!("Fill journal disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    let services = TraderServices {
        candles,
        orders,
        store: Arc::new(StateStore::new(&args.state)),
        ticks,
        journal,
    };

    let mut traders = Vec::new();
    let mut tasks = JoinSet::new();
    for instance in enabled {
        let ctx = match mode {
            ExecutionMode::Live => ExecutionContext::live(tz),
            ExecutionMode::Backtest { days } => ExecutionContext::backtest(tz, days),
        };
        let trader = Trader::new(instance, ctx, services.clone());
        traders.push(trader.clone());
        tasks.spawn(async move {
            let result = trader.start().await;
            (trader, result)
        });
    }

    if traders.is_empty() {
        warn!("No enabled instances in {}", args.config.display());
        return Ok(());
    }

    let wait_all = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((trader, Ok(()))) => info!(instance = trader.name(), "Instance finished"),
                Ok((trader, Err(e))) => error!(instance = trader.name(), "Instance failed: {:#}", e),
                Err(e) => error!("Instance task panicked: {}", e),
            }
        }
    };

    tokio::select! {
        _ = wait_all => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl-C => Shutting down...");
            for trader in &traders {
                trader.stop();
            }
        }
    }

    if let Some(feed) = feed {
        feed.shutdown();
    }

    let completed = traders
        .iter()
        .filter(|t| t.state() == TraderState::CompletedForDay)
        .count();
    info!(
        "{} of {} instance(s) completed the day. Restart before the next market open",
        completed,
        traders.len()
    );
    Ok(())
}
