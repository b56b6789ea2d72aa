//! Merges exchange candles and aggregator market caps into one fully populated record.
//!
//! Upstream trouble never fails a request here: anything the providers cannot supply is
//! replaced by a deterministic estimate and tagged as such.

use crate::config::{self, Settings};
use crate::domain::market::{
    DateKey, MarketCapRecord, MarketOverrides, MarketSnapshot, MergedMarketRecord, OhlcvRecord,
    Sourced,
};
use crate::error::{PipelineError, UpstreamError};
use crate::ingest::{call_with_policy, MarketCapSource, OhlcvSource, SourceFetch, UpstreamPolicy};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;

/// Candles before the target date kept for the EMA window (11 + the current day = 12).
pub const TRAILING_DAYS: i64 = 11;

const OPEN_FACTOR: f64 = 0.999;
const HIGH_FACTOR: f64 = 1.015;
const LOW_FACTOR: f64 = 0.985;

/// Constants used when a field has to be estimated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimationConfig {
    pub reference_price: f64,
    pub reference_volume: f64,
    pub circulating_supply: f64,
}

impl EstimationConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reference_price: settings.reference_price_usd,
            reference_volume: settings.reference_volume,
            circulating_supply: settings.circulating_supply_estimate,
        }
    }
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            reference_price: config::DEFAULT_REFERENCE_PRICE_USD,
            reference_volume: config::DEFAULT_REFERENCE_VOLUME,
            circulating_supply: config::DEFAULT_CIRCULATING_SUPPLY_ESTIMATE,
        }
    }
}

/// The merged record for a date plus the candles that precede it.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    pub record: MergedMarketRecord,
    pub history: Vec<OhlcvRecord>,
}

pub struct DataAcquisitionCoordinator {
    ohlcv: Arc<dyn OhlcvSource>,
    market_cap: Arc<dyn MarketCapSource>,
    policy: UpstreamPolicy,
    estimation: EstimationConfig,
}

impl DataAcquisitionCoordinator {
    pub fn new(
        ohlcv: Arc<dyn OhlcvSource>,
        market_cap: Arc<dyn MarketCapSource>,
        policy: UpstreamPolicy,
        estimation: EstimationConfig,
    ) -> Self {
        Self {
            ohlcv,
            market_cap,
            policy,
            estimation,
        }
    }

    pub async fn acquire(&self, date: DateKey, overrides: &MarketOverrides) -> MergedMarketRecord {
        self.acquire_with_history(date, overrides).await.record
    }

    pub async fn acquire_with_history(
        &self,
        date: DateKey,
        overrides: &MarketOverrides,
    ) -> Acquisition {
        let want_candles = !overrides.covers_ohlcv();
        let want_market_cap = overrides.market_cap.is_none();

        let (candles, market_cap) = tokio::join!(
            async {
                if want_candles {
                    self.candle_window(date).await
                } else {
                    Vec::new()
                }
            },
            async {
                if want_market_cap {
                    self.market_cap_for(date).await
                } else {
                    None
                }
            },
        );

        let (current, history) = split_window(candles, date);
        let record = self.merge(date, overrides, current.as_ref(), &history, market_cap);

        tracing::debug!(
            %date,
            history_len = history.len(),
            provenance = ?record.provenance(),
            "acquired market record"
        );

        Acquisition { record, history }
    }

    /// Up to [`TRAILING_DAYS`] candles strictly before `date`, oldest first.
    pub async fn trailing_history(&self, date: DateKey) -> Vec<OhlcvRecord> {
        split_window(self.candle_window(date).await, date).1
    }

    /// Latest daily candle with deltas against the previous close.
    pub async fn current_snapshot(
        &self,
        now: DateTime<Utc>,
    ) -> Result<MarketSnapshot, PipelineError> {
        let today = now.date_naive();
        let provider = self.ohlcv.provider_name();

        let (candles, market_cap) = tokio::join!(
            call_with_policy(provider, &self.policy, || {
                self.ohlcv.fetch_candles(days_before(today, 2), today)
            }),
            self.market_cap_for(today),
        );

        let candles = candles?;
        let Some(latest) = candles.last() else {
            return Err(UpstreamError::Decode {
                provider,
                detail: format!("no daily candle available up to {today}"),
            }
            .into());
        };

        let (price_change_24h, price_change_percentage_24h) = match candles.iter().rev().nth(1) {
            Some(prev) if prev.close > 0.0 => {
                let change = latest.close - prev.close;
                (change, change / prev.close * 100.0)
            }
            _ => (0.0, 0.0),
        };

        let market_cap = match market_cap {
            Some(record) => Sourced::fetched(record.market_cap),
            None => Sourced::estimated(latest.close * self.estimation.circulating_supply),
        };

        Ok(MarketSnapshot {
            success: true,
            date: latest.date,
            current_price: latest.close,
            open_24h: latest.open,
            high_24h: latest.high,
            low_24h: latest.low,
            vwap_24h: latest.vwap,
            price_change_24h,
            price_change_percentage_24h,
            market_cap,
            total_volume: latest.volume,
            circulating_supply: self.estimation.circulating_supply,
            // Same estimate as circulating supply.
            total_supply: self.estimation.circulating_supply,
            max_supply: config::MAX_SUPPLY,
            last_updated: Utc.from_utc_datetime(&latest.date.and_time(NaiveTime::MIN)),
            data_source: provider,
        })
    }

    async fn candle_window(&self, date: DateKey) -> Vec<OhlcvRecord> {
        let provider = self.ohlcv.provider_name();
        let from = days_before(date, TRAILING_DAYS);
        let res = call_with_policy(provider, &self.policy, || {
            self.ohlcv.fetch_candles(from, date)
        })
        .await;

        match res {
            Ok(candles) => candles,
            Err(err) => {
                tracing::warn!(
                    %date,
                    provider,
                    error = %err,
                    "candle fetch failed; estimating OHLCV"
                );
                Vec::new()
            }
        }
    }

    async fn market_cap_for(&self, date: DateKey) -> Option<MarketCapRecord> {
        let provider = self.market_cap.provider_name();
        let res = call_with_policy(provider, &self.policy, || self.market_cap.fetch(date)).await;

        match res {
            Ok(SourceFetch::Found(record)) => Some(record),
            Ok(SourceFetch::Unavailable(reason)) => {
                tracing::info!(%date, provider, ?reason, "market cap unavailable; estimating");
                None
            }
            Err(err) => {
                tracing::warn!(
                    %date,
                    provider,
                    error = %err,
                    "market cap fetch failed; estimating"
                );
                None
            }
        }
    }

    fn merge(
        &self,
        date: DateKey,
        overrides: &MarketOverrides,
        current: Option<&OhlcvRecord>,
        history: &[OhlcvRecord],
        market_cap: Option<MarketCapRecord>,
    ) -> MergedMarketRecord {
        let last = history.last();
        let reference = overrides
            .close
            .or_else(|| last.map(|c| c.close))
            .unwrap_or(self.estimation.reference_price);

        let pick = |user: Option<f64>, fetched: Option<f64>, estimate: f64| match (user, fetched)
        {
            (Some(v), _) => Sourced::user_supplied(v),
            (None, Some(v)) => Sourced::fetched(v),
            (None, None) => Sourced::estimated(estimate),
        };

        let open = pick(overrides.open, current.map(|c| c.open), reference * OPEN_FACTOR);
        let high = pick(overrides.high, current.map(|c| c.high), reference * HIGH_FACTOR);
        let low = pick(overrides.low, current.map(|c| c.low), reference * LOW_FACTOR);
        let close = pick(overrides.close, current.map(|c| c.close), reference);
        let volume = pick(
            overrides.volume,
            current.map(|c| c.volume),
            last.map_or(self.estimation.reference_volume, |c| c.volume),
        );
        let market_cap = pick(
            overrides.market_cap,
            market_cap.map(|m| m.market_cap),
            close.value * self.estimation.circulating_supply,
        );

        MergedMarketRecord {
            date,
            open,
            high,
            low,
            close,
            volume,
            market_cap,
        }
    }
}

/// `date - days`, clamped to the earliest representable date.
fn days_before(date: DateKey, days: i64) -> DateKey {
    date.checked_sub_signed(Duration::days(days)).unwrap_or(NaiveDate::MIN)
}

fn split_window(
    candles: Vec<OhlcvRecord>,
    date: DateKey,
) -> (Option<OhlcvRecord>, Vec<OhlcvRecord>) {
    let mut current = None;
    let mut history = Vec::with_capacity(candles.len());
    for candle in candles {
        if candle.date == date {
            current = Some(candle);
        } else if candle.date < date {
            history.push(candle);
        }
    }
    history.sort_by_key(|c| c.date);
    let excess = history.len().saturating_sub(TRAILING_DAYS as usize);
    history.drain(..excess);
    (current, history)
}
