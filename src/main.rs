use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use market_screener::cache::DiskCache;
use market_screener::config::AppConfig;
use market_screener::exchange::Exchange;
use market_screener::exchange::binance::BinanceExchange;
use market_screener::exchange::bybit::BybitExchange;
use market_screener::mdf::MarketDataFetcher;
use market_screener::model::ExchangeKind;
use market_screener::notifier::Notifier;
use market_screener::notifier::terminal::TerminalNotifier;
use market_screener::orchestrator::Orchestrator;
use market_screener::plan::{self, DeepSeekPlanProvider, PlanProvider};
use market_screener::screener::{NeutralFallbackQuickScore, QuickScoreProvider};
use market_screener::signal_tracker::SignalTracker;
use market_screener::storage::Storage;
use market_screener::storage::sqlite::SqliteStorage;
use market_screener::store::SubscriptionStore;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "market-screener", about = "Signal and screening orchestrator")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = market_screener::config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    let storage = open_storage(&config).await?;
    let exchanges = build_exchanges(&config);

    if exchanges.is_empty() {
        tracing::warn!("no exchanges enabled; nothing to do");
        return Ok(());
    }

    let cache = DiskCache::new(&config.general.cache_dir);
    let mdf = Arc::new(MarketDataFetcher::new(exchanges, cache));

    let notifier: Arc<dyn Notifier> = Arc::new(TerminalNotifier);

    let plan_provider: Arc<dyn PlanProvider> = if config.llm.enabled {
        let limiter = plan::default_llm_limiter();
        Arc::new(
            DeepSeekPlanProvider::new(&config.llm, limiter)
                .change_context(AppError::Runtime)
                .attach("failed to construct plan provider")?,
        )
    } else {
        info!("llm disabled in config; auto-plan will always degrade to hold");
        Arc::new(plan::MockPlanProvider::new(None))
    };

    let quick_score: Option<Arc<dyn QuickScoreProvider>> = Some(Arc::new(NeutralFallbackQuickScore));

    let store = Arc::new(SubscriptionStore::new(Arc::clone(&storage), config.limits));
    let tracker = Arc::new(SignalTracker::new(Arc::clone(&storage)));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&storage),
        mdf,
        notifier,
        plan_provider,
        quick_score,
        store,
        tracker,
        config.orchestrator,
    ));

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let orchestrator_handle = tokio::spawn(async move {
        orchestrator.run(run_cancel).await;
    });

    tokio::signal::ctrl_c().await.change_context(AppError::Runtime)?;
    info!("ctrl+c received, shutting down");
    cancel.cancel();

    let _ = tokio::time::timeout(Duration::from_secs(10), orchestrator_handle).await;
    info!("shutdown complete");
    Ok(())
}

async fn open_storage(config: &AppConfig) -> Result<Arc<dyn Storage>, Report<AppError>> {
    let data_dir = &config.general.data_dir;
    std::fs::create_dir_all(data_dir)
        .change_context(AppError::Storage)
        .attach_with(|| format!("data_dir: {data_dir}"))?;

    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(Path::new(&config.general.database_path))
            .await
            .change_context(AppError::Storage)?,
    );
    Ok(storage)
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn build_exchanges(config: &AppConfig) -> HashMap<ExchangeKind, Arc<dyn Exchange>> {
    config
        .exchanges
        .iter()
        .filter(|e| e.enabled)
        .filter_map(|e| match e.name.as_str() {
            "binance" => Some((ExchangeKind::Binance, Arc::new(BinanceExchange::new(e.requests_per_second)) as Arc<dyn Exchange>)),
            "bybit" => Some((ExchangeKind::Bybit, Arc::new(BybitExchange::new(e.requests_per_second)) as Arc<dyn Exchange>)),
            other => {
                tracing::warn!(name = other, "unknown exchange in config, skipping");
                None
            }
        })
        .collect()
}
