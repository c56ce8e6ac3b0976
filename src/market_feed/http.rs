//! HTTP `MarketFeed` implementation.
//!
//! Grounded on the retry/backoff client in the teacher's
//! `scrapers::polymarket_api::PolymarketScraper`: a `reqwest::Client` with a
//! request timeout, `execute_with_retry` doing exponential backoff capped at
//! `MAX_RETRIES`, and a 429 response getting a longer sleep than a plain
//! transport error. Endpoint shapes follow the Binance spot/futures/funding
//! REST surface that spec.md §6 describes abstractly as `MarketFeed`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{ContractType, FuturesSymbolInfo, Interval, MarketFeed, SpotSymbolInfo};
use crate::error::MarketFeedError;
use crate::models::{Candle, FundingRateObservation};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const RATE_LIMIT_BACKOFF_SECS: u64 = 5;

pub struct HttpMarketFeed {
    client: Client,
    spot_base_url: String,
    futures_base_url: String,
    request_timeout: Duration,
}

impl HttpMarketFeed {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let base_url = base_url.into();
        let client = Client::builder()
            .user_agent("leaderboard-backtest/0.1")
            .build()?;
        Ok(Self {
            client,
            spot_base_url: base_url.clone(),
            futures_base_url: base_url,
            request_timeout,
        })
    }

    /// Override the futures base URL separately from the spot one (the
    /// real feed serves `/fapi` from a different host than `/api`).
    pub fn with_futures_base_url(mut self, futures_base_url: impl Into<String>) -> Self {
        self.futures_base_url = futures_base_url.into();
        self
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketFeedError> {
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..MAX_RETRIES {
            let request = self.client.get(url).query(query);

            let sent = timeout(self.request_timeout, request.send()).await;

            match sent {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response.bytes().await.map_err(MarketFeedError::Transport)?;
                        return serde_json::from_slice(&bytes).map_err(MarketFeedError::Decode);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(attempt = attempt + 1, url, "rate limited by feed");
                        if attempt + 1 >= MAX_RETRIES {
                            return Err(MarketFeedError::RateLimited);
                        }
                        sleep(Duration::from_secs(RATE_LIMIT_BACKOFF_SECS * (attempt as u64 + 1)))
                            .await;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    if let Some(err) = classify_permanent_error(status, &body) {
                        return Err(err);
                    }

                    warn!(%status, attempt = attempt + 1, url, "feed returned error status");
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(MarketFeedError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Ok(Err(transport_err)) => {
                    warn!(error = %transport_err, attempt = attempt + 1, url, "transport error");
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(MarketFeedError::Transport(transport_err));
                    }
                }
                Err(_) => {
                    warn!(attempt = attempt + 1, url, timeout = ?self.request_timeout, "request timed out");
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(MarketFeedError::Timeout(self.request_timeout));
                    }
                }
            }

            debug!(backoff_ms = backoff, "retrying after backoff");
            sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(30_000);
        }

        unreachable!("retry loop exits by return on its final attempt")
    }
}

/// 400/-1121 ("invalid symbol") is a permanent negative answer, never a
/// retry target (spec.md §4.2 rule 4, §7).
fn classify_permanent_error(status: StatusCode, body: &str) -> Option<MarketFeedError> {
    if status != StatusCode::BAD_REQUEST {
        return None;
    }
    #[derive(Deserialize)]
    struct FeedErrorBody {
        code: i64,
        msg: String,
    }
    if let Ok(parsed) = serde_json::from_str::<FeedErrorBody>(body) {
        if parsed.code == -1121 {
            return Some(MarketFeedError::InvalidSymbol {
                code: parsed.code,
                message: parsed.msg,
            });
        }
    }
    None
}

#[derive(Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "quoteAsset", default)]
    quote_asset: String,
    #[serde(rename = "contractType", default)]
    contract_type: Option<String>,
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// A raw kline row is a 12-element JSON array per the Binance kline shape.
#[derive(Deserialize)]
struct RawKline(
    i64,    // open time
    String, // open
    String, // high
    String, // low
    String, // close
    String, // volume
    i64,    // close time
    String, // quote volume
    u64,    // trades
    String, // taker buy base volume
    String, // taker buy quote volume
    String, // ignore
);

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl From<RawKline> for Candle {
    fn from(raw: RawKline) -> Self {
        Candle {
            open_time: ms_to_datetime(raw.0),
            open: parse_f64(&raw.1),
            high: parse_f64(&raw.2),
            low: parse_f64(&raw.3),
            close: parse_f64(&raw.4),
            volume: parse_f64(&raw.5),
            close_time: ms_to_datetime(raw.6),
            quote_volume: parse_f64(&raw.7),
            trades: raw.8,
            taker_buy_volume: parse_f64(&raw.9),
            taker_buy_quote_volume: parse_f64(&raw.10),
        }
    }
}

#[derive(Deserialize)]
struct RawFundingRate {
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "markPrice", default)]
    mark_price: Option<String>,
}

#[async_trait]
impl MarketFeed for HttpMarketFeed {
    async fn exchange_info(&self) -> Result<Vec<SpotSymbolInfo>, MarketFeedError> {
        let url = format!("{}/api/v3/exchangeInfo", self.spot_base_url);
        let resp: ExchangeInfoResponse = self.get_json(&url, &[]).await?;
        Ok(resp
            .symbols
            .into_iter()
            .map(|s| SpotSymbolInfo {
                symbol: s.symbol,
                status: s.status,
                quote_asset: s.quote_asset,
            })
            .collect())
    }

    async fn futures_exchange_info(&self) -> Result<Vec<FuturesSymbolInfo>, MarketFeedError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.futures_base_url);
        let resp: ExchangeInfoResponse = self.get_json(&url, &[]).await?;
        Ok(resp
            .symbols
            .into_iter()
            .map(|s| FuturesSymbolInfo {
                symbol: s.symbol,
                status: s.status,
                contract_type: match s.contract_type.as_deref() {
                    Some("PERPETUAL") => ContractType::Perpetual,
                    _ => ContractType::Other,
                },
            })
            .collect())
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketFeedError> {
        let url = format!("{}/api/v3/klines", self.spot_base_url);
        let raw: Vec<RawKline> = self
            .get_json(
                &url,
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.as_feed_str().to_string()),
                    ("startTime", start_time.timestamp_millis().to_string()),
                    ("endTime", end_time.timestamp_millis().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(raw.into_iter().map(Candle::from).collect())
    }

    async fn futures_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Candle>, MarketFeedError> {
        let url = format!("{}/fapi/v1/klines", self.futures_base_url);
        let raw: Vec<RawKline> = self
            .get_json(
                &url,
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.as_feed_str().to_string()),
                    ("startTime", start_time.timestamp_millis().to_string()),
                    ("endTime", end_time.timestamp_millis().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(raw.into_iter().map(Candle::from).collect())
    }

    async fn funding_rate_history(
        &self,
        symbol: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<FundingRateObservation>, MarketFeedError> {
        let url = format!("{}/fapi/v1/fundingRate", self.futures_base_url);
        let raw: Vec<RawFundingRate> = self
            .get_json(
                &url,
                &[
                    ("symbol", symbol.to_string()),
                    ("startTime", start_time.timestamp_millis().to_string()),
                    ("endTime", end_time.timestamp_millis().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(raw
            .into_iter()
            .map(|r| {
                let mark_price = r.mark_price.as_deref().and_then(|s| match s.parse::<f64>() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        warn!(symbol, raw = s, "funding observation markPrice unparseable, persisting null");
                        None
                    }
                });
                FundingRateObservation {
                    funding_time: ms_to_datetime(r.funding_time),
                    funding_rate: parse_f64(&r.funding_rate),
                    mark_price,
                }
            })
            .collect())
    }
}
