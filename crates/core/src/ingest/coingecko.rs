use crate::config::Settings;
use crate::domain::market::MarketCapRecord;
use crate::error::UpstreamError;
use crate::ingest::{join_url, transport_error, MarketCapSource, SourceFetch, UnavailableReason};
use crate::time::clock::Clock;
use anyhow::Context;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const PROVIDER: &str = "coingecko";
const DEFAULT_BASE_URL: &str = "https://api.coingecko.com";
const HISTORY_PATH: &str = "/api/v3/coins/bitcoin/history";

/// Daily market-cap snapshots (00:00 UTC) from the CoinGecko coin history endpoint.
pub struct CoinGeckoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CoinGeckoClient {
    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let base_url = settings
            .coingecko_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout = settings.upstream_timeout();

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build coingecko http client")?;

        Ok(Self {
            http,
            base_url,
            api_key: settings.coingecko_api_key.clone(),
            timeout,
            clock,
        })
    }

    fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key).map_err(|e| UpstreamError::Transport {
                provider: PROVIDER,
                detail: format!("invalid api key header: {e}"),
            })?;
            headers.insert("x-cg-demo-api-key", value);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl MarketCapSource for CoinGeckoClient {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    async fn fetch(&self, date: NaiveDate) -> Result<SourceFetch<MarketCapRecord>, UpstreamError> {
        if date > self.clock.utc_today() {
            return Ok(SourceFetch::Unavailable(UnavailableReason::FutureDate));
        }

        let res = self
            .http
            .get(join_url(&self.base_url, HISTORY_PATH))
            .headers(self.headers()?)
            .query(&[
                ("date", history_date_param(date)),
                ("localization", "false".to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout, e))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout, e))?;

        match status {
            StatusCode::NOT_FOUND => {
                return Ok(SourceFetch::Unavailable(UnavailableReason::NotFound))
            }
            // Free plans only serve a limited history window.
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::debug!(%date, %status, "coingecko refused date outside plan coverage");
                return Ok(SourceFetch::Unavailable(UnavailableReason::NoCoverage));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(UpstreamError::RateLimited { provider: PROVIDER })
            }
            s if s.is_server_error() => {
                return Err(UpstreamError::Server {
                    provider: PROVIDER,
                    status: s.as_u16(),
                })
            }
            s if !s.is_success() => {
                return Err(UpstreamError::Decode {
                    provider: PROVIDER,
                    detail: format!("HTTP {s}: {text}"),
                })
            }
            _ => {}
        }

        let parsed = parse_history_response(&text)?;
        Ok(match parsed {
            Some(market_cap) => SourceFetch::Found(MarketCapRecord { date, market_cap }),
            None => SourceFetch::Unavailable(UnavailableReason::NoCoverage),
        })
    }
}

/// CoinGecko expects `dd-mm-yyyy`.
pub fn history_date_param(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    #[serde(default)]
    market_cap: Option<CurrencyMap>,
}

#[derive(Debug, Deserialize)]
struct CurrencyMap {
    #[serde(default)]
    usd: Option<f64>,
}

/// USD market cap, or `None` when the coin has no market data for the date.
pub fn parse_history_response(text: &str) -> Result<Option<f64>, UpstreamError> {
    let parsed =
        serde_json::from_str::<HistoryResponse>(text).map_err(|e| UpstreamError::Decode {
            provider: PROVIDER,
            detail: format!("failed to parse history response: {e}"),
        })?;

    Ok(parsed
        .market_data
        .and_then(|m| m.market_cap)
        .and_then(|c| c.usd)
        .filter(|v| v.is_finite() && *v > 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::{stub_http_server, AheadOfUtcClock};
    use crate::time::clock::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn client_at(base_url: String) -> CoinGeckoClient {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 10, 25, 12, 0, 0).unwrap(),
        ));
        let settings = Settings {
            coingecko_base_url: Some(base_url),
            coingecko_api_key: Some("demo-key".to_string()),
            ..Settings::default()
        };
        CoinGeckoClient::from_settings(&settings, clock).unwrap()
    }

    fn past_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 20).unwrap()
    }

    #[test]
    fn formats_date_day_first() {
        let d = NaiveDate::from_ymd_opt(2024, 10, 5).unwrap();
        assert_eq!(history_date_param(d), "05-10-2024");
    }

    #[test]
    fn extracts_usd_market_cap() {
        let body = json!({
            "id": "bitcoin",
            "market_data": {
                "current_price": {"usd": 66_572.1},
                "market_cap": {"usd": 1_316_023_477_498.0, "eur": 1.2e12},
                "total_volume": {"usd": 3.1e10}
            }
        })
        .to_string();

        assert_eq!(
            parse_history_response(&body).unwrap(),
            Some(1_316_023_477_498.0)
        );
    }

    #[test]
    fn missing_market_data_is_no_coverage() {
        let body = json!({"id": "bitcoin", "name": "Bitcoin"}).to_string();
        assert_eq!(parse_history_response(&body).unwrap(), None);
    }

    #[test]
    fn zero_market_cap_is_treated_as_absent() {
        let body = json!({"market_data": {"market_cap": {"usd": 0.0}}}).to_string();
        assert_eq!(parse_history_response(&body).unwrap(), None);
    }

    #[test]
    fn non_json_body_is_decode_error() {
        assert!(matches!(
            parse_history_response("<html>"),
            Err(UpstreamError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn future_date_is_unavailable_without_request() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 10, 25, 12, 0, 0).unwrap(),
        ));
        let settings = Settings {
            coingecko_base_url: Some("http://127.0.0.1:9".to_string()),
            ..Settings::default()
        };
        let client = CoinGeckoClient::from_settings(&settings, clock).unwrap();

        let d = NaiveDate::from_ymd_opt(2024, 11, 1).unwrap();
        assert_eq!(
            client.fetch(d).await.unwrap(),
            SourceFetch::Unavailable(UnavailableReason::FutureDate)
        );
    }

    #[tokio::test]
    async fn serves_market_cap_from_http_response() {
        let body = r#"{"id":"bitcoin","market_data":{"market_cap":{"usd":1316023477498.0}}}"#;
        let client = client_at(stub_http_server("200 OK", body).await);

        assert_eq!(
            client.fetch(past_day()).await.unwrap(),
            SourceFetch::Found(MarketCapRecord {
                date: past_day(),
                market_cap: 1_316_023_477_498.0
            })
        );
    }

    #[tokio::test]
    async fn not_found_status_is_unavailable() {
        let client = client_at(stub_http_server("404 Not Found", "{}").await);
        assert_eq!(
            client.fetch(past_day()).await.unwrap(),
            SourceFetch::Unavailable(UnavailableReason::NotFound)
        );
    }

    #[tokio::test]
    async fn plan_refusals_are_no_coverage() {
        for status in ["401 Unauthorized", "403 Forbidden"] {
            let client = client_at(stub_http_server(status, "{}").await);
            assert_eq!(
                client.fetch(past_day()).await.unwrap(),
                SourceFetch::Unavailable(UnavailableReason::NoCoverage),
                "{status}"
            );
        }
    }

    #[tokio::test]
    async fn too_many_requests_status_is_rate_limited() {
        let client = client_at(stub_http_server("429 Too Many Requests", "{}").await);
        let err = client.fetch(past_day()).await.unwrap_err();
        assert_eq!(err, UpstreamError::RateLimited { provider: PROVIDER });
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_status_is_transient() {
        let client = client_at(stub_http_server("500 Internal Server Error", "{}").await);
        let err = client.fetch(past_day()).await.unwrap_err();
        assert_eq!(
            err,
            UpstreamError::Server {
                provider: PROVIDER,
                status: 500
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn future_check_uses_utc_date() {
        let clock = Arc::new(AheadOfUtcClock {
            now: Utc.with_ymd_and_hms(2024, 10, 25, 22, 0, 0).unwrap(),
            local_today: NaiveDate::from_ymd_opt(2024, 10, 26).unwrap(),
        });
        let settings = Settings {
            coingecko_base_url: Some("http://127.0.0.1:9".to_string()),
            ..Settings::default()
        };
        let client = CoinGeckoClient::from_settings(&settings, clock).unwrap();

        let local_today = NaiveDate::from_ymd_opt(2024, 10, 26).unwrap();
        assert_eq!(
            client.fetch(local_today).await.unwrap(),
            SourceFetch::Unavailable(UnavailableReason::FutureDate)
        );
    }
}
