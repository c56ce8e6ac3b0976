//! Crypto leaderboard backtest engine.
//!
//! Exposes the core modules for use by the CLI binary and integration
//! tests. `MarketFeed` and `ObjectStore` are the two external capability
//! traits; everything else is pure orchestration over them.

pub mod backfill;
pub mod backtest;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod filter;
pub mod funding;
pub mod leaderboard;
pub mod market_feed;
pub mod models;
pub mod removed_cohort;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod symbol;
pub mod window;

pub use backtest::{BacktestEngine, ProgressSink};
pub use config::Config;
pub use market_feed::MarketFeed;
pub use scheduler::Scheduler;
pub use store::ObjectStore;
pub use supervisor::TaskSupervisor;
