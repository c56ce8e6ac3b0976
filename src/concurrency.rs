//! Generic bounded, optionally adaptive, concurrent job runner
//! (spec.md §4.1).
//!
//! Grounded on the semaphore-gated worker pattern in the teacher's
//! `signals::enrichment::DomeEnrichmentService` (an `Arc<Semaphore>` sized
//! to the desired concurrency, a shared work queue, retried jobs
//! re-submitted with backoff), generalized from a fixed worker count to a
//! pool that can shrink/grow its semaphore permits in response to observed
//! latency and error rate.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::ConcurrencyError;

#[derive(Debug, Clone)]
pub struct ConcurrencyPoolOptions {
    pub initial_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub adaptive: bool,
    pub retry: bool,
    pub max_retries: u32,
}

impl Default for ConcurrencyPoolOptions {
    fn default() -> Self {
        Self {
            initial_concurrency: 8,
            min_concurrency: 2,
            max_concurrency: 12,
            adaptive: true,
            retry: true,
            max_retries: 3,
        }
    }
}

impl From<&crate::config::ConcurrencyPoolDefaults> for ConcurrencyPoolOptions {
    fn from(d: &crate::config::ConcurrencyPoolDefaults) -> Self {
        Self {
            initial_concurrency: d.initial_concurrency,
            min_concurrency: d.min_concurrency,
            max_concurrency: d.max_concurrency,
            adaptive: d.adaptive,
            retry: d.retry,
            max_retries: d.max_retries,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyPoolMetrics {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_response_time_ms: f64,
    pub final_concurrency: usize,
    pub adjustments: u32,
}

pub struct ConcurrencyPoolResult<T, R, E: fmt::Display> {
    pub results: HashMap<T, R>,
    pub errors: HashMap<T, ConcurrencyError<E>>,
    pub metrics: ConcurrencyPoolMetrics,
}

/// Shared state sampled by the adaptive-concurrency adjustment pass
/// (spec.md §4.1: "after every 20 completions").
struct AdaptiveState {
    semaphore: Arc<Semaphore>,
    current_concurrency: AtomicUsize,
    response_times_ms: Mutex<Vec<f64>>,
    error_flags: Mutex<Vec<bool>>,
    completions_since_sample: AtomicUsize,
    adjustments: AtomicUsize,
}

/// Bounded, optionally-adaptive concurrent job runner over a finite job
/// sequence `items: Vec<T>` with a `processor: T -> Result<R, E>`.
///
/// The pool never introduces ordering between independent jobs; callers
/// must not assume completion order (spec.md §4.1).
pub struct ConcurrencyPool {
    options: ConcurrencyPoolOptions,
}

impl ConcurrencyPool {
    pub fn new(options: ConcurrencyPoolOptions) -> Self {
        Self { options }
    }

    /// Run `processor` over every item in `items`, honoring the
    /// bounded-concurrency, retry, and adaptive-adjustment contract of
    /// spec.md §4.1.
    pub async fn run<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
    ) -> ConcurrencyPoolResult<T, R, E>
    where
        T: Clone + Eq + Hash + Send + Sync + 'static,
        R: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, E>> + Send + 'static,
    {
        let state = Arc::new(AdaptiveState {
            semaphore: Arc::new(Semaphore::new(self.options.initial_concurrency.max(1))),
            current_concurrency: AtomicUsize::new(self.options.initial_concurrency.max(1)),
            response_times_ms: Mutex::new(Vec::with_capacity(32)),
            error_flags: Mutex::new(Vec::with_capacity(32)),
            completions_since_sample: AtomicUsize::new(0),
            adjustments: AtomicUsize::new(0),
        });

        let processor = Arc::new(processor);
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let state = state.clone();
            let processor = processor.clone();
            let options = self.options.clone();

            handles.push(tokio::spawn(async move {
                let mut attempt: u32 = 0;
                loop {
                    let permit = state.semaphore.clone().acquire_owned().await.expect("semaphore closed");
                    let started = Instant::now();
                    let outcome = processor(item.clone()).await;
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    drop(permit);

                    record_sample(&state, elapsed_ms, outcome.is_err());
                    if options.adaptive {
                        maybe_adjust_concurrency(&state, &options);
                    }

                    match outcome {
                        Ok(value) => return (item, Ok(value), attempt),
                        Err(err) => {
                            if options.retry && attempt < options.max_retries {
                                let delay = Duration::from_secs(2u64.saturating_pow(attempt));
                                debug!(attempt, delay_secs = delay.as_secs(), "retrying job");
                                tokio::time::sleep(delay).await;
                                attempt += 1;
                                continue;
                            }
                            return (item, Err(err), attempt);
                        }
                    }
                }
            }));
        }

        let mut results = HashMap::new();
        let mut errors = HashMap::new();
        let mut processed = 0u64;
        let mut failed = 0u64;
        let mut retried = 0u64;

        for handle in handles {
            match handle.await {
                Ok((item, Ok(value), attempt)) => {
                    if attempt > 0 {
                        retried += 1;
                    }
                    processed += 1;
                    results.insert(item, value);
                }
                Ok((item, Err(err), attempt)) => {
                    if attempt > 0 {
                        retried += 1;
                    }
                    failed += 1;
                    let err = ConcurrencyError {
                        attempts: attempt + 1,
                        cause: err,
                    };
                    warn!(error = %err, "job failed after retries exhausted");
                    errors.insert(item, err);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "job task panicked");
                    failed += 1;
                }
            }
        }

        let avg_response_time_ms = {
            let samples = state.response_times_ms.lock();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        ConcurrencyPoolResult {
            results,
            errors,
            metrics: ConcurrencyPoolMetrics {
                processed,
                failed,
                retried,
                avg_response_time_ms,
                final_concurrency: state.current_concurrency.load(Ordering::Relaxed),
                adjustments: state.adjustments.load(Ordering::Relaxed) as u32,
            },
        }
    }
}

fn record_sample(state: &AdaptiveState, elapsed_ms: f64, is_error: bool) {
    {
        let mut samples = state.response_times_ms.lock();
        samples.push(elapsed_ms);
        if samples.len() > 20 {
            let drain = samples.len() - 20;
            samples.drain(0..drain);
        }
    }
    {
        let mut flags = state.error_flags.lock();
        flags.push(is_error);
        if flags.len() > 10 {
            let drain = flags.len() - 10;
            flags.drain(0..drain);
        }
    }
    state.completions_since_sample.fetch_add(1, Ordering::Relaxed);
}

/// Adjust `state.semaphore`'s permit count per spec.md §4.1: sampled every
/// 20 completions, shrink on slow/erroring, grow by 1 on fast/clean.
fn maybe_adjust_concurrency(state: &AdaptiveState, options: &ConcurrencyPoolOptions) {
    let due = state
        .completions_since_sample
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            if n >= 20 {
                Some(0)
            } else {
                None
            }
        })
        .is_ok();
    if !due {
        return;
    }

    let avg_response_ms = {
        let samples = state.response_times_ms.lock();
        if samples.is_empty() {
            return;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    };
    let error_rate = {
        let flags = state.error_flags.lock();
        if flags.is_empty() {
            0.0
        } else {
            flags.iter().filter(|f| **f).count() as f64 / flags.len() as f64
        }
    };

    let current = state.current_concurrency.load(Ordering::Relaxed);
    let new_concurrency = if avg_response_ms > 5000.0 || error_rate > 0.10 {
        (current as f64 * 0.8).floor().max(options.min_concurrency as f64) as usize
    } else if avg_response_ms < 2000.0 && error_rate < 0.05 {
        (current + 1).min(options.max_concurrency)
    } else {
        current
    };

    if new_concurrency == current {
        return;
    }

    if new_concurrency > current {
        state.semaphore.add_permits(new_concurrency - current);
    } else {
        // Semaphore has no direct "remove permits"; forget permits acquired
        // from the surplus so the in-flight budget shrinks over time as
        // jobs complete and don't return them.
        let to_forget = current - new_concurrency;
        if let Ok(permits) = state.semaphore.clone().try_acquire_many_owned(to_forget as u32) {
            permits.forget();
        }
    }

    state.current_concurrency.store(new_concurrency, Ordering::Relaxed);
    state.adjustments.fetch_add(1, Ordering::Relaxed);
    debug!(from = current, to = new_concurrency, avg_response_ms, error_rate, "adjusted concurrency");
}
