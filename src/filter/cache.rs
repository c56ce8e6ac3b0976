//! `FilterCache` (spec.md §4.3): content-addressed cache of eligibility
//! outcomes, keyed by a SHA-256 hash over the filter criteria at daily
//! granularity.
//!
//! Grounded on the upsert pattern in the teacher's `signals::db_storage`
//! cache tables (`ON CONFLICT DO UPDATE`, write failures never surface
//! to the caller). The hit/miss usage bookkeeping (`hitCount`,
//! `lastUsedAt`) has no teacher table to draw from; it's built directly
//! from spec.md §4.3's cache entry shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::eligibility::EligibilityFilter;
use crate::error::StoreError;
use crate::models::{FilterCriteria, FilterStatistics, SymbolFilterCacheEntry};
use crate::store::ObjectStore;

pub struct FilterCache {
    store: Arc<dyn ObjectStore>,
}

impl FilterCache {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// SHA-256 over the JSON object `{referenceTime: YYYY-MM-DD, quoteAsset,
    /// minVolumeThreshold, minHistoryDays, requireFutures,
    /// excludeStablecoins, includeInactive}`. `serde_json::Value`'s map is a
    /// `BTreeMap` (the `preserve_order` feature is not enabled), so object
    /// keys serialize in sorted order without extra bookkeeping here.
    pub fn compute_hash(criteria: &FilterCriteria) -> String {
        let keyed = serde_json::json!({
            "referenceTime": criteria.reference_time.format("%Y-%m-%d").to_string(),
            "quoteAsset": criteria.quote_asset,
            "minVolumeThreshold": criteria.min_volume_threshold,
            "minHistoryDays": criteria.min_history_days,
            "requireFutures": criteria.require_futures,
            "excludeStablecoins": criteria.exclude_stablecoins,
            "includeInactive": criteria.include_inactive,
        });
        let bytes = serde_json::to_vec(&keyed).expect("criteria always serializes");
        let digest = Sha256::digest(&bytes);
        hex::encode(digest)
    }

    /// Hit path returns the stored entry (with `hitCount`/`lastUsedAt`
    /// bumped); miss path runs `filter` over `candidate_symbols`, persists
    /// the result, and returns it.
    pub async fn resolve(
        &self,
        criteria: &FilterCriteria,
        candidate_symbols: &[String],
        filter: &EligibilityFilter,
    ) -> Result<SymbolFilterCacheEntry, StoreError> {
        let hash = Self::compute_hash(criteria);

        if let Some(mut entry) = self.store.get_filter_cache_entry(&hash).await? {
            entry.hit_count += 1;
            entry.last_used_at = Utc::now();
            if let Err(err) = self.store.touch_filter_cache_entry(&hash, entry.last_used_at).await {
                warn!(filter_hash = %hash, error = %err, "failed to bump filter cache usage metadata");
            }
            return Ok(entry);
        }

        let started = Instant::now();
        let outcome = filter.evaluate(candidate_symbols, criteria).await;
        let processing_time_ms = started.elapsed().as_millis() as i64;

        let mut reason_histogram: BTreeMap<String, usize> = BTreeMap::new();
        for reasons in outcome.reasons.values() {
            for reason in reasons {
                *reason_histogram.entry(reason.clone()).or_insert(0) += 1;
            }
        }

        let now = Utc::now();
        let entry = SymbolFilterCacheEntry {
            filter_hash: hash.clone(),
            criteria: criteria.clone(),
            valid_symbols: outcome.valid.clone(),
            invalid_symbols: outcome.invalid.clone(),
            invalid_reasons: outcome.reasons,
            statistics: FilterStatistics {
                valid_count: outcome.valid.len(),
                invalid_count: outcome.invalid.len(),
                reason_histogram,
            },
            processing_time_ms,
            created_at: now,
            last_used_at: now,
            hit_count: 0,
        };

        if let Err(err) = self.store.upsert_filter_cache_entry(&entry).await {
            warn!(filter_hash = %hash, error = %err, "failed to persist filter cache entry");
        }

        Ok(entry)
    }

    /// `cleanupFilterCache(olderThanDays)` (spec.md §4.3).
    pub async fn cleanup(&self, older_than_days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        self.store.purge_filter_cache(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hash_ignores_time_of_day_but_not_date() {
        let base = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        let criteria_morning = FilterCriteria {
            reference_time: base,
            quote_asset: "USDT".to_string(),
            min_volume_threshold: 10_000.0,
            min_history_days: 365,
            require_futures: true,
            exclude_stablecoins: true,
            include_inactive: false,
        };
        let mut criteria_evening = criteria_morning.clone();
        criteria_evening.reference_time = base + chrono::Duration::hours(20);

        assert_eq!(
            FilterCache::compute_hash(&criteria_morning),
            FilterCache::compute_hash(&criteria_evening)
        );

        let mut criteria_next_day = criteria_morning.clone();
        criteria_next_day.reference_time = base + chrono::Duration::days(1);
        assert_ne!(
            FilterCache::compute_hash(&criteria_morning),
            FilterCache::compute_hash(&criteria_next_day)
        );
    }
}
