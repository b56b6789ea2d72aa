use crate::config::Settings;
use crate::domain::market::OhlcvRecord;
use crate::error::UpstreamError;
use crate::ingest::{join_url, transport_error, OhlcvSource, SourceFetch, UnavailableReason};
use crate::time::clock::Clock;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const PROVIDER: &str = "kraken";
const DEFAULT_BASE_URL: &str = "https://api.kraken.com";
const OHLC_PATH: &str = "/0/public/OHLC";
const PAIR: &str = "XXBTZUSD";
const DAILY_INTERVAL_MINUTES: u32 = 1440;

/// Daily BTC/USD candles from the Kraken public OHLC endpoint.
pub struct KrakenClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl KrakenClient {
    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let base_url = settings
            .kraken_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout = settings.upstream_timeout();

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build kraken http client")?;

        Ok(Self {
            http,
            base_url,
            timeout,
            clock,
        })
    }

    async fn fetch_window(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<SourceFetch<Vec<OhlcvRecord>>, UpstreamError> {
        let today = self.clock.utc_today();
        if from > today {
            return Ok(SourceFetch::Unavailable(UnavailableReason::FutureDate));
        }
        let to = to.min(today);

        // `since` is exclusive.
        let since = start_of_day_unix(from) - 1;
        let res = self
            .http
            .get(join_url(&self.base_url, OHLC_PATH))
            .query(&[
                ("pair", PAIR.to_string()),
                ("interval", DAILY_INTERVAL_MINUTES.to_string()),
                ("since", since.to_string()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout, e))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout, e))?;

        if status == StatusCode::NOT_FOUND {
            return Ok(SourceFetch::Unavailable(UnavailableReason::NotFound));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited { provider: PROVIDER });
        }
        if status.is_server_error() {
            return Err(UpstreamError::Server {
                provider: PROVIDER,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(UpstreamError::Decode {
                provider: PROVIDER,
                detail: format!("HTTP {status}: {text}"),
            });
        }

        let body = serde_json::from_str::<Value>(&text).map_err(|e| UpstreamError::Decode {
            provider: PROVIDER,
            detail: format!("response is not valid JSON: {e}"),
        })?;

        let candles = parse_ohlc_response(&body)?
            .into_iter()
            .filter(|c| c.date >= from && c.date <= to)
            .collect();
        Ok(SourceFetch::Found(candles))
    }
}

#[async_trait::async_trait]
impl OhlcvSource for KrakenClient {
    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    async fn fetch_candles(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<OhlcvRecord>, UpstreamError> {
        Ok(self.fetch_window(from, to).await?.found().unwrap_or_default())
    }

    async fn fetch(&self, date: NaiveDate) -> Result<SourceFetch<OhlcvRecord>, UpstreamError> {
        Ok(match self.fetch_window(date, date).await? {
            SourceFetch::Found(candles) => match candles.into_iter().find(|c| c.date == date) {
                Some(candle) => SourceFetch::Found(candle),
                None => SourceFetch::Unavailable(UnavailableReason::NoCoverage),
            },
            SourceFetch::Unavailable(reason) => SourceFetch::Unavailable(reason),
        })
    }
}

fn start_of_day_unix(date: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
        .timestamp()
}

/// Parses `{"error": [...], "result": {"XXBTZUSD": [row, ...]}}` where each row is
/// `[time, open, high, low, close, vwap, volume, count]`.
pub fn parse_ohlc_response(body: &Value) -> Result<Vec<OhlcvRecord>, UpstreamError> {
    if let Some(errors) = body.get("error").and_then(Value::as_array) {
        if let Some(first) = errors.iter().filter_map(Value::as_str).next() {
            return Err(classify_api_error(first));
        }
    }

    let rows = body
        .get("result")
        .and_then(|r| r.get(PAIR))
        .and_then(Value::as_array)
        .ok_or_else(|| UpstreamError::Decode {
            provider: PROVIDER,
            detail: format!("missing result.{PAIR}"),
        })?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(parse_row(row)?);
    }
    out.sort_by_key(|c| c.date);
    Ok(out)
}

fn parse_row(row: &Value) -> Result<OhlcvRecord, UpstreamError> {
    let decode = |detail: String| UpstreamError::Decode {
        provider: PROVIDER,
        detail,
    };

    let fields = row
        .as_array()
        .filter(|a| a.len() >= 7)
        .ok_or_else(|| decode(format!("malformed OHLC row: {row}")))?;

    let ts = fields[0]
        .as_i64()
        .ok_or_else(|| decode(format!("bad candle time: {}", fields[0])))?;
    let date = DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| decode(format!("candle time out of range: {ts}")))?
        .date_naive();

    let num = |idx: usize, name: &str| {
        number(&fields[idx]).ok_or_else(|| decode(format!("bad {name} in row: {row}")))
    };

    Ok(OhlcvRecord {
        date,
        open: num(1, "open")?,
        high: num(2, "high")?,
        low: num(3, "low")?,
        close: num(4, "close")?,
        vwap: number(&fields[5]).filter(|v| *v > 0.0),
        volume: num(6, "volume")?,
    })
}

// Kraken encodes prices as decimal strings.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

fn classify_api_error(message: &str) -> UpstreamError {
    if message.contains("Rate limit") || message.contains("Too many requests") {
        UpstreamError::RateLimited { provider: PROVIDER }
    } else if message.starts_with("EService") {
        UpstreamError::Server {
            provider: PROVIDER,
            status: 503,
        }
    } else {
        UpstreamError::Decode {
            provider: PROVIDER,
            detail: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::{stub_http_server, AheadOfUtcClock};
    use crate::time::clock::FixedClock;
    use serde_json::json;

    fn client_at(base_url: String) -> KrakenClient {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2023, 1, 3, 12, 0, 0).unwrap(),
        ));
        let settings = Settings {
            kraken_base_url: Some(base_url),
            ..Settings::default()
        };
        KrakenClient::from_settings(&settings, clock).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_string_encoded_rows() {
        let body = json!({
            "error": [],
            "result": {
                "XXBTZUSD": [
                    [1672617600, "16618.4", "16770.0", "16551.0", "16673.1", "16671.2", "1642.77", 12001],
                    [1672531200, "16530.0", "16630.0", "16488.9", "16618.4", "16560.1", "1009.31", 9000]
                ],
                "last": 1672617600
            }
        });

        let candles = parse_ohlc_response(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].date, day(2023, 1, 1));
        assert_eq!(candles[1].date, day(2023, 1, 2));
        assert_eq!(candles[1].close, 16673.1);
        assert_eq!(candles[1].volume, 1642.77);
        assert_eq!(candles[1].vwap, Some(16671.2));
    }

    #[test]
    fn rate_limit_error_is_classified() {
        let body = json!({"error": ["EAPI:Rate limit exceeded"]});
        assert_eq!(
            parse_ohlc_response(&body).unwrap_err(),
            UpstreamError::RateLimited { provider: PROVIDER }
        );
    }

    #[test]
    fn service_error_is_transient() {
        let body = json!({"error": ["EService:Unavailable"]});
        assert!(parse_ohlc_response(&body).unwrap_err().is_transient());
    }

    #[test]
    fn rejects_malformed_rows() {
        let body = json!({
            "error": [],
            "result": {"XXBTZUSD": [[1672531200, "abc", "1", "1", "1", "1", "1", 1]]}
        });
        assert!(matches!(
            parse_ohlc_response(&body),
            Err(UpstreamError::Decode { .. })
        ));
    }

    #[test]
    fn missing_pair_is_a_decode_error() {
        let body = json!({"error": [], "result": {}});
        assert!(parse_ohlc_response(&body).is_err());
    }

    #[test]
    fn start_of_day_is_utc_midnight() {
        assert_eq!(start_of_day_unix(day(2023, 1, 1)), 1672531200);
    }

    #[tokio::test]
    async fn future_date_is_unavailable_without_request() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 10, 25, 12, 0, 0).unwrap(),
        ));
        let settings = Settings {
            // Unroutable; the call must never be made.
            kraken_base_url: Some("http://127.0.0.1:9".to_string()),
            ..Settings::default()
        };
        let client = KrakenClient::from_settings(&settings, clock).unwrap();

        let res = client.fetch(day(2024, 10, 26)).await.unwrap();
        assert_eq!(res, SourceFetch::Unavailable(UnavailableReason::FutureDate));
    }

    #[tokio::test]
    async fn serves_candles_from_http_response() {
        let body = r#"{"error":[],"result":{"XXBTZUSD":[
            [1672531200,"16530.0","16630.0","16488.9","16618.4","16560.1","1009.31",9000],
            [1672617600,"16618.4","16770.0","16551.0","16673.1","16671.2","1642.77",12001]
        ],"last":1672617600}}"#;
        let client = client_at(stub_http_server("200 OK", body).await);

        let candle = match client.fetch(day(2023, 1, 2)).await.unwrap() {
            SourceFetch::Found(candle) => candle,
            other => panic!("expected a candle, got {other:?}"),
        };
        assert_eq!(candle.close, 16673.1);

        let window = client.fetch_candles(day(2023, 1, 1), day(2023, 1, 2)).await.unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn not_found_status_is_unavailable() {
        let client = client_at(stub_http_server("404 Not Found", "{}").await);
        assert_eq!(
            client.fetch(day(2023, 1, 2)).await.unwrap(),
            SourceFetch::Unavailable(UnavailableReason::NotFound)
        );
    }

    #[tokio::test]
    async fn too_many_requests_status_is_rate_limited() {
        let client = client_at(stub_http_server("429 Too Many Requests", "{}").await);
        let err = client.fetch(day(2023, 1, 2)).await.unwrap_err();
        assert_eq!(err, UpstreamError::RateLimited { provider: PROVIDER });
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_status_is_transient() {
        let client = client_at(stub_http_server("503 Service Unavailable", "{}").await);
        let err = client.fetch(day(2023, 1, 2)).await.unwrap_err();
        assert_eq!(
            err,
            UpstreamError::Server {
                provider: PROVIDER,
                status: 503
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rate_limit_error_in_ok_body_is_rate_limited() {
        let body = r#"{"error":["EAPI:Rate limit exceeded"]}"#;
        let client = client_at(stub_http_server("200 OK", body).await);
        assert_eq!(
            client.fetch(day(2023, 1, 2)).await.unwrap_err(),
            UpstreamError::RateLimited { provider: PROVIDER }
        );
    }

    #[tokio::test]
    async fn future_check_uses_utc_date() {
        // Local midnight has passed, UTC has not: the local date has no candle yet.
        let clock = Arc::new(AheadOfUtcClock {
            now: Utc.with_ymd_and_hms(2024, 10, 25, 22, 0, 0).unwrap(),
            local_today: day(2024, 10, 26),
        });
        let settings = Settings {
            kraken_base_url: Some("http://127.0.0.1:9".to_string()),
            ..Settings::default()
        };
        let client = KrakenClient::from_settings(&settings, clock).unwrap();

        assert_eq!(
            client.fetch(day(2024, 10, 26)).await.unwrap(),
            SourceFetch::Unavailable(UnavailableReason::FutureDate)
        );
    }
}
