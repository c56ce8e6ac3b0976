//! Crypto leaderboard backtest engine CLI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::{DateTime, Utc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leaderboard_backtest::backtest::BacktestEngine;
use leaderboard_backtest::config::Config;
use leaderboard_backtest::market_feed::http::HttpMarketFeed;
use leaderboard_backtest::market_feed::MarketFeed;
use leaderboard_backtest::models::BacktestParams;
use leaderboard_backtest::scheduler::Scheduler;
use leaderboard_backtest::store::sqlite::SqliteObjectStore;
use leaderboard_backtest::store::ObjectStore;
use leaderboard_backtest::supervisor::TaskSupervisor;

#[derive(Parser)]
#[command(name = "leaderboard-backtest", about = "Crypto leaderboard backtest engine")]
struct Cli {
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a backtest synchronously over [start, end).
    Run {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
        #[arg(long, default_value_t = 30)]
        limit: usize,
        #[arg(long, default_value_t = 400_000.0)]
        min_volume_threshold: f64,
        #[arg(long, default_value_t = 365)]
        min_history_days: i64,
        #[arg(long, default_value_t = 8)]
        granularity_hours: i64,
        #[arg(long, default_value = "USDT")]
        quote_asset: String,
    },
    /// Start a backtest as an async task and print its task id.
    StartAsync {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Print the progress/status of an async task.
    Status { task_id: String },
    /// Cooperatively cancel a running async task.
    Cancel { task_id: String },
    /// Resume a task left Running by a crashed process.
    Resume { task_id: String },
    /// List tasks interrupted by a process restart.
    ListInterrupted,
    /// Mark every currently-interrupted task Failed.
    CleanupAllInterrupted,
    /// Purge expired filter-cache entries.
    CleanupFilterCache,
    /// Run one scheduler fire (gate, derive span, backfill, dispatch).
    SchedulerFire,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = Config::from_env().context("failed to load configuration")?;

    let feed: Arc<dyn MarketFeed> = Arc::new(
        HttpMarketFeed::new(
            &config.market_feed_base_url,
            Duration::from_secs(config.market_feed_timeout_secs),
        )
        .context("failed to construct market feed client")?,
    );
    let store: Arc<dyn ObjectStore> =
        Arc::new(SqliteObjectStore::open(&config.database_path).context("failed to open object store")?);

    match cli.command {
        Command::Run {
            start,
            end,
            limit,
            min_volume_threshold,
            min_history_days,
            granularity_hours,
            quote_asset,
        } => {
            let params = BacktestParams {
                start_time: start,
                end_time: end,
                symbols: None,
                limit,
                min_volume_threshold,
                quote_asset,
                min_history_days,
                granularity_hours,
            };
            let engine = BacktestEngine::new(feed, store, &config.tunables);
            engine.run(&params, None).await.context("backtest run failed")?;
        }
        Command::StartAsync { start, end } => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            let params = BacktestParams {
                start_time: start,
                end_time: end,
                ..Default::default()
            };
            let task_id = supervisor.start_async(params).await?;
            println!("{task_id}");
        }
        Command::Status { task_id } => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            match supervisor.get_progress(&task_id).await? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => anyhow::bail!("no such task: {task_id}"),
            }
        }
        Command::Cancel { task_id } => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            if supervisor.cancel(&task_id) {
                println!("cancellation requested for {task_id}");
            } else {
                anyhow::bail!("task {task_id} is not running in this process");
            }
        }
        Command::Resume { task_id } => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            supervisor.resume(&task_id).await?;
            println!("resumed {task_id}");
        }
        Command::ListInterrupted => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            let interrupted = supervisor.list_interrupted().await?;
            println!("{}", serde_json::to_string_pretty(&interrupted)?);
        }
        Command::CleanupAllInterrupted => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            let count = supervisor.cleanup_all_interrupted().await?;
            println!("marked {count} interrupted task(s) as failed");
        }
        Command::CleanupFilterCache => {
            let supervisor = TaskSupervisor::new(feed, store, config.tunables.clone());
            let purged = supervisor.cleanup().await?;
            println!("purged {purged} expired filter cache entr(y/ies)");
        }
        Command::SchedulerFire => {
            let supervisor = Arc::new(TaskSupervisor::new(feed.clone(), store.clone(), config.tunables.clone()));
            let scheduler = Scheduler::new(feed, store, supervisor);
            scheduler.fire().await?;
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
