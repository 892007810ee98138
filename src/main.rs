mod chart;
mod config;
mod consumer;
mod error;
mod exchange;
mod model;
mod notifier;
mod producer;
mod screener;
mod settings_store;
mod text;

use std::sync::Arc;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use exchange::ExchangeClient;
use exchange::binance::BinanceExchange;
use notifier::Notifier;
use notifier::telegram::TelegramNotifier;
use screener::Screener;
use settings_store::SettingsStore;
use settings_store::postgres::PostgresSettingsStore;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("settings store error")]
    Settings,
    #[display("screener runtime error")]
    Screener,
}

/// Real-time cryptocurrency volume-surge screener.
///
/// No subcommands: the pipeline always runs its data plane. All tuning is
/// environment-variable configuration (see `config::load`) plus the
/// hot-reloadable `settings` database row.
#[derive(Parser)]
#[command(name = "volume-surge-screener", about = "Real-time cryptocurrency volume-surge screener")]
struct Cli;

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let _cli = Cli::parse();
    let config = config::load().change_context(AppError::Config)?;

    init_tracing(&config);

    info!(
        exchange = %config.general.exchange,
        market_type = %config.general.market_type,
        environment = ?config.general.environment,
        "volume-surge screener starting"
    );

    let client: Arc<dyn ExchangeClient> = Arc::new(BinanceExchange::new(config.general.market_type));
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new());
    let settings_store: Arc<dyn SettingsStore> = Arc::new(
        PostgresSettingsStore::connect(&config.database.connection_string())
            .await
            .change_context(AppError::Settings)?,
    );

    let screener = Arc::new(
        Screener::bootstrap(
            client,
            notifier,
            settings_store,
            config.general.exchange,
            config.general.market_type,
        )
        .await
        .change_context(AppError::Screener)?,
    );

    let shutdown_screener = Arc::clone(&screener);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl+c received, shutting down");
            shutdown_screener.stop();
        }
    });

    let result = screener.run().await.change_context(AppError::Screener);

    info!("shutdown complete");
    result
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
