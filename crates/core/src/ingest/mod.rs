pub mod coingecko;
pub mod kraken;

use crate::config::Settings;
use crate::domain::market::{MarketCapRecord, OhlcvRecord};
use crate::error::UpstreamError;
use chrono::NaiveDate;
use std::future::Future;
use std::time::Duration;

/// Upper bound on retries per upstream call, whatever the configuration says.
const MAX_RETRIES: u32 = 1;

/// Outcome of a fetch that reached the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceFetch<T> {
    Found(T),
    Unavailable(UnavailableReason),
}

impl<T> SourceFetch<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(v) => Some(v),
            Self::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The date has not happened yet.
    FutureDate,
    /// The provider answered 404.
    NotFound,
    /// The provider answered but has no data for this date.
    NoCoverage,
}

#[async_trait::async_trait]
pub trait OhlcvSource: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Daily candles dated within `[from, to]`, oldest first.
    async fn fetch_candles(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<OhlcvRecord>, UpstreamError>;

    async fn fetch(&self, date: NaiveDate) -> Result<SourceFetch<OhlcvRecord>, UpstreamError> {
        let candles = self.fetch_candles(date, date).await?;
        Ok(match candles.into_iter().find(|c| c.date == date) {
            Some(candle) => SourceFetch::Found(candle),
            None => SourceFetch::Unavailable(UnavailableReason::NoCoverage),
        })
    }
}

#[async_trait::async_trait]
pub trait MarketCapSource: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch(&self, date: NaiveDate) -> Result<SourceFetch<MarketCapRecord>, UpstreamError>;
}

/// Per-call timeout and retry budget applied to every upstream request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpstreamPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl UpstreamPolicy {
    pub fn new(timeout: Duration, retries: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            retries: retries.min(MAX_RETRIES),
            backoff,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.upstream_timeout(),
            settings.upstream_retries,
            settings.upstream_retry_backoff(),
        )
    }
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Runs `op` under the policy's timeout, retrying transient failures.
pub async fn call_with_policy<T, F, Fut>(
    provider: &'static str,
    policy: &UpstreamPolicy,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let res = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(UpstreamError::Timeout {
                provider,
                timeout_ms: policy.timeout.as_millis(),
            }),
        };

        match res {
            Ok(v) => return Ok(v),
            Err(err) if err.is_transient() && attempt <= policy.retries => {
                tracing::warn!(
                    provider,
                    attempt,
                    backoff = ?policy.backoff,
                    error = %err,
                    "upstream call failed; retrying"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn transport_error(
    provider: &'static str,
    timeout: Duration,
    err: reqwest::Error,
) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout {
            provider,
            timeout_ms: timeout.as_millis(),
        }
    } else {
        UpstreamError::Transport {
            provider,
            detail: err.to_string(),
        }
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{}{}", base_url.trim_end_matches('/'), path)
}
