pub mod acquisition;
pub mod domain;
pub mod error;
pub mod features;
pub mod ingest;
pub mod model;
pub mod service;
pub mod time;

pub mod config {
    use anyhow::Context;
    use std::time::Duration;

    const DEFAULT_MODEL_PATH: &str = "models/bitcoin_next_day_high.json";
    const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 15;
    const DEFAULT_UPSTREAM_RETRIES: u32 = 1;
    const DEFAULT_UPSTREAM_RETRY_BACKOFF_MS: u64 = 250;

    /// Fallback close used when neither the caller nor the exchange provides a price.
    pub const DEFAULT_REFERENCE_PRICE_USD: f64 = 67_000.0;
    pub const DEFAULT_REFERENCE_VOLUME: f64 = 25_000.0;
    /// Fixed heuristic, not derived from the issuance schedule.
    pub const DEFAULT_CIRCULATING_SUPPLY_ESTIMATE: f64 = 19_700_000.0;
    pub const MAX_SUPPLY: f64 = 21_000_000.0;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub sentry_dsn: Option<String>,
        pub kraken_base_url: Option<String>,
        pub coingecko_base_url: Option<String>,
        pub coingecko_api_key: Option<String>,
        pub model_path: Option<String>,
        pub upstream_timeout_secs: u64,
        pub upstream_retries: u32,
        pub upstream_retry_backoff_ms: u64,
        pub reference_price_usd: f64,
        pub reference_volume: f64,
        pub circulating_supply_estimate: f64,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                kraken_base_url: std::env::var("KRAKEN_BASE_URL").ok(),
                coingecko_base_url: std::env::var("COINGECKO_BASE_URL").ok(),
                coingecko_api_key: std::env::var("COINGECKO_API_KEY")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                model_path: std::env::var("MODEL_PATH").ok(),
                upstream_timeout_secs: parse_env("UPSTREAM_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
                upstream_retries: parse_env("UPSTREAM_RETRIES")?
                    .unwrap_or(DEFAULT_UPSTREAM_RETRIES),
                upstream_retry_backoff_ms: parse_env("UPSTREAM_RETRY_BACKOFF_MS")?
                    .unwrap_or(DEFAULT_UPSTREAM_RETRY_BACKOFF_MS),
                reference_price_usd: parse_env("REFERENCE_PRICE_USD")?
                    .unwrap_or(DEFAULT_REFERENCE_PRICE_USD),
                reference_volume: parse_env("REFERENCE_VOLUME")?
                    .unwrap_or(DEFAULT_REFERENCE_VOLUME),
                circulating_supply_estimate: parse_env("CIRCULATING_SUPPLY_ESTIMATE")?
                    .unwrap_or(DEFAULT_CIRCULATING_SUPPLY_ESTIMATE),
            })
        }

        pub fn model_path(&self) -> &str {
            self.model_path
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(DEFAULT_MODEL_PATH)
        }

        pub fn upstream_timeout(&self) -> Duration {
            Duration::from_secs(self.upstream_timeout_secs)
        }

        pub fn upstream_retry_backoff(&self) -> Duration {
            Duration::from_millis(self.upstream_retry_backoff_ms)
        }
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                sentry_dsn: None,
                kraken_base_url: None,
                coingecko_base_url: None,
                coingecko_api_key: None,
                model_path: None,
                upstream_timeout_secs: DEFAULT_UPSTREAM_TIMEOUT_SECS,
                upstream_retries: DEFAULT_UPSTREAM_RETRIES,
                upstream_retry_backoff_ms: DEFAULT_UPSTREAM_RETRY_BACKOFF_MS,
                reference_price_usd: DEFAULT_REFERENCE_PRICE_USD,
                reference_volume: DEFAULT_REFERENCE_VOLUME,
                circulating_supply_estimate: DEFAULT_CIRCULATING_SUPPLY_ESTIMATE,
            }
        }
    }

    fn parse_env<T>(key: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match std::env::var(key) {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .with_context(|| format!("{key} is not a valid value: {raw}")),
            _ => Ok(None),
        }
    }
}
