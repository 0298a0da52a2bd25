mod api;
mod config;
mod core;
mod db;
mod error;
mod notifications;
mod rpc;
mod signals;
mod sink;
pub mod tags;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::config::Config;
use crate::core::Market;
use crate::core::monitor::{CycleReport, Monitor};
use crate::db::SharedDatabase;
use crate::notifications::Notifier;
use crate::rpc::{ChainFetcher, EthRpc};
use crate::signals::SignalEngine;
use crate::signals::aggregators::SignalParams;
use crate::sink::{ContractSink, RiskSink};
use crate::tags::AddressBook;

#[derive(Parser)]
#[command(author, version, about = "DEX market risk monitor", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Monitor loop and query API together (default)
    Run,
    /// Monitor loop only
    Monitor,
    /// Query API only
    Serve,
    /// One cycle, print the per-market report, exit
    Once,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chainmonitor=info".parse()?))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    tracing::info!("chainmonitor starting...");

    let mut config = Config::load(&cli.config)?;
    config.apply_env();
    tracing::info!("Config: {:?}", config);

    let markets = config.load_markets()?;
    if command == Command::Serve {
        config.validate_offline(&markets)?;
    } else {
        config.validate(&markets)?;
    }
    tracing::info!(
        "{} markets configured, {} monitored",
        markets.len(),
        markets.iter().filter(|m| m.is_monitored()).count()
    );

    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let db = SharedDatabase::open(db_path)
        .with_context(|| format!("opening database {}", config.database.path))?;
    tracing::info!("Database opened at {}", config.database.path);

    match command {
        Command::Once => {
            let monitor = Arc::new(build_monitor(&config, &markets, db)?);
            let report = monitor.run_once().await;
            print_report(&report);
            Ok(())
        }
        Command::Serve => serve_only(&config, markets, db).await,
        Command::Monitor | Command::Run => {
            let (stop_tx, stop_rx) = watch::channel(false);

            let api = if command == Command::Run && config.api.enabled {
                let state = ApiState::new(db.clone(), markets.clone());
                let (_, handle) = api::start_api_server(state, &config.api, stop_rx.clone())?;
                Some(handle)
            } else {
                None
            };

            let monitor = Arc::new(build_monitor(&config, &markets, db)?);
            let loop_handle = tokio::spawn(Arc::clone(&monitor).run(stop_rx));

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("Shutdown requested");
            stop_tx.send(true).ok();

            loop_handle.await.context("monitor task")?;
            if let Some(handle) = api {
                handle.await.context("API task")?;
            }
            tracing::info!("chainmonitor stopped");
            Ok(())
        }
    }
}

fn build_monitor(config: &Config, markets: &[Market], db: SharedDatabase) -> Result<Monitor> {
    let mut book = AddressBook::from_markets(markets);
    if let Some(csv_path) = &config.database.exchange_csv {
        let csv_path = Path::new(csv_path);
        if csv_path.exists() {
            match book.load_exchange_csv(csv_path) {
                Ok(count) => tracing::info!("Loaded {count} exchange addresses from CSV"),
                Err(e) => tracing::warn!("Failed to load exchange address CSV: {e}"),
            }
        }
    }
    tracing::info!("Address book: {} tagged addresses", book.len());

    let rpc = EthRpc::new(&config.chain).context("building RPC client")?;
    let fetcher = ChainFetcher::new(rpc, book.exchange_addresses(), config.chain.block_time_secs);
    let engine = SignalEngine::new(config.weights()?, SignalParams::from(&config.signals));
    let weights = engine.weights();
    tracing::info!(
        "Signal weights: dex {:.2}, whale {:.2}, cex {:.2}",
        weights.dex(),
        weights.whale(),
        weights.cex()
    );

    let mut monitor = Monitor::new(
        markets.to_vec(),
        Arc::new(fetcher),
        db,
        engine,
        book,
        &config.monitor,
        config.chain.lookback_blocks,
    )
    .with_notifier(Notifier::new(&config.notifications));

    if config.sink.is_active() {
        match ContractSink::new(&config.chain.rpc_url, &config.sink) {
            Ok(sink) => {
                tracing::info!(
                    "On-chain sink enabled: contract {:?}, sender {:?}",
                    sink.contract_address(),
                    sink.sender()
                );
                let timeout = Duration::from_secs(config.sink.submit_timeout_secs);
                monitor = monitor.with_sink(Arc::new(sink) as Arc<dyn RiskSink>, timeout);
            }
            Err(e) => tracing::warn!("On-chain sink disabled: {e}"),
        }
    } else {
        tracing::info!("On-chain sink disabled (no PRIVATE_KEY or contract address)");
    }

    Ok(monitor)
}

async fn serve_only(config: &Config, markets: Vec<Market>, db: SharedDatabase) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (_, handle) = api::start_api_server(ApiState::new(db, markets), &config.api, stop_rx)?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    stop_tx.send(true).ok();
    handle.await.context("API task")?;
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "cycle {} → {} ({} ok, {} failed)",
        report.started.format("%Y-%m-%d %H:%M:%S"),
        report.finished.format("%H:%M:%S"),
        report.succeeded(),
        report.failed()
    );
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(s) => println!(
                "  {} {:<28} score {:>5.1}  level {} {}",
                s.risk_level.emoji(),
                outcome.label,
                s.total_score,
                s.risk_level.as_u8(),
                if s.alert_id.is_some() { "(changed)" } else { "" }
            ),
            Err(e) => println!("  ✗ {:<28} {e}", outcome.label),
        }
    }
}
