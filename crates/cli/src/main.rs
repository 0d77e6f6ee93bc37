use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use clap::{Parser, Subcommand};
use tracing::info;

use opt_trade_core::{
    session, BrokerGateway, Candle, ConfigLoader, SecurityConfig, TickSink,
};
use opt_trade_data::DatabaseClient;
use opt_trade_kite::{spawn_feed, KiteClient};
use opt_trade_signals::TickIngestor;

/// Bars each underlying needs on hand before the strategy can run.
const REQUIRED_CANDLES: i64 = 210;
/// Pause between historical fetches, inside the broker's rate limits.
const FETCH_PAUSE_SECS: u64 = 5;
/// Give up bootstrapping an underlying after this long.
const IMPORT_TIMEOUT_SECS: u64 = 300;

#[derive(Parser)]
#[command(name = "opt-trade")]
#[command(about = "Intraday options trading engine for NSE index options", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live trading engine
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Bootstrap historical candles for every tracked underlying
    ImportData {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Apply the database schema
    Migrate {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run { config } => run_engine(&config).await?,
        Commands::ImportData { config } => run_import_data(&config).await?,
        Commands::Migrate { config } => run_migrate(&config).await?,
    }

    Ok(())
}

async fn run_engine(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load_from(Some(config_path))?;
    info!(config = config_path, "starting the trading engine");

    let db = Arc::new(
        DatabaseClient::new(&config.database.url, config.database.max_connections).await?,
    );
    db.ensure_schema().await?;

    let broker: Arc<dyn BrokerGateway> =
        Arc::new(KiteClient::new(&config.kite, config.engine.exchange.clone()));
    let ingestor = Arc::new(TickIngestor::new());
    let sink: Arc<dyn TickSink> = ingestor.clone();
    let feed = spawn_feed(config.kite.clone(), sink);

    opt_trade_order_manager::engine::run(config, db, broker, ingestor, feed).await
}

async fn run_import_data(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load_from(Some(config_path))?;
    let db =
        DatabaseClient::new(&config.database.url, config.database.max_connections).await?;
    db.ensure_schema().await?;
    let broker = KiteClient::new(&config.kite, config.engine.exchange.clone());

    for security in &config.securities {
        let have = db.candle_count(security.token).await?;
        if have >= REQUIRED_CANDLES {
            info!(symbol = %security.symbol, candles = have, "already bootstrapped");
            continue;
        }
        import_history(&db, &broker, security)
            .await
            .with_context(|| format!("bootstrapping {}", security.symbol))?;
    }
    Ok(())
}

/// Walks backward from today in 3-day windows until enough bars are on
/// hand, then stores them in one batch. Holiday windows come back empty
/// and just push the cursor further back.
async fn import_history(
    db: &DatabaseClient,
    broker: &KiteClient,
    security: &SecurityConfig,
) -> Result<()> {
    let mut cursor = session::now_local().date();
    let mut collected: Vec<Candle> = Vec::new();
    let started = Instant::now();

    while (collected.len() as i64) < REQUIRED_CANDLES {
        if started.elapsed() > Duration::from_secs(IMPORT_TIMEOUT_SECS) {
            bail!("bootstrap taking too long for {}", security.symbol);
        }
        let start_day = cursor - chrono::Duration::days(3);
        let end_day = cursor - chrono::Duration::days(1);
        let from = day_at(start_day, 9);
        let to = day_at(end_day, 16);
        info!(symbol = %security.symbol, %from, %to, "fetching bars");

        let batch = broker.historical_candles(security.token, from, to).await?;
        collected.extend(batch);
        cursor = start_day - chrono::Duration::days(1);
        tokio::time::sleep(Duration::from_secs(FETCH_PAUSE_SECS)).await;
    }

    collected.sort_by_key(|bar| bar.bucket.as_i64());
    db.insert_candles(&collected).await?;
    info!(
        symbol = %security.symbol,
        candles = collected.len(),
        "bootstrap complete"
    );
    Ok(())
}

async fn run_migrate(config_path: &str) -> Result<()> {
    let config = ConfigLoader::load_from(Some(config_path))?;
    let db =
        DatabaseClient::new(&config.database.url, config.database.max_connections).await?;
    db.ensure_schema().await?;
    info!("schema applied");
    Ok(())
}

fn day_at(date: NaiveDate, hour: u32) -> NaiveDateTime {
    date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
}
