//! Supplementary funding-rate backfill (spec.md §4.10 step 6, SPEC_FULL.md
//! §B.1): walks recently-persisted rows whose funding window has since
//! become observable and re-enriches them in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::funding::FundingRateEnricher;
use crate::market_feed::MarketFeed;
use crate::store::ObjectStore;

/// Re-enrich every `BacktestRow` in `[since, now]` whose funding window
/// `[t, t + granularity_hours + 10min]` now lies entirely in the past, i.e.
/// it was persisted before that window closed (rows persisted with the
/// window already closed already carry complete funding data and are
/// skipped to avoid redundant feed calls).
pub async fn backfill_funding_rates(
    feed: Arc<dyn MarketFeed>,
    store: Arc<dyn ObjectStore>,
    since: DateTime<Utc>,
    granularity_hours: i64,
) -> anyhow::Result<usize> {
    let now = Utc::now();
    let rows = store.backtest_rows_in_range(since, now).await?;
    let enricher = FundingRateEnricher::new(feed);

    let mut backfilled = 0usize;
    for mut row in rows {
        let window_end = row.timestamp + chrono::Duration::hours(granularity_hours) + chrono::Duration::minutes(10);
        if window_end > now {
            continue;
        }
        let already_complete = row
            .rankings
            .iter()
            .all(|item| item.future_symbol.is_none() || !item.funding_rate_history.is_empty() || item.current_funding_rate.is_some());
        if already_complete {
            continue;
        }

        enricher.enrich(&mut row.rankings, row.timestamp, granularity_hours).await;
        if let Err(err) = store.upsert_backtest_row(&row).await {
            warn!(timestamp = %row.timestamp, error = %err, "failed to persist backfilled funding data");
            continue;
        }
        backfilled += 1;
    }

    if backfilled > 0 {
        info!(backfilled, "funding rate backfill pass completed");
    }
    Ok(backfilled)
}
