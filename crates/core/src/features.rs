//! Feature construction for the next-day high model.
//!
//! Turns one merged market record (plus the candles before it) into the fixed, ordered
//! feature vector the model was trained on. The steps run in a fixed order because later
//! steps consume values produced by earlier ones:
//!
//! 1. circulating supply estimate (`marketCap / close`)
//! 2. velocity (`volume / circulatingSupply`)
//! 3. 12-day EMA of close
//! 4. natural-log of magnitude fields
//! 5. cyclical day-of-week encoding
//! 6. standardization with baked-in statistics
//! 7. projection onto [`FEATURE_NAMES`]
//!
//! **Determinism**: the output depends only on the record and history passed in. No clock,
//! no randomness, no per-request fitting of the scaler.

use crate::domain::market::{MergedMarketRecord, OhlcvRecord};
use crate::error::PipelineError;
use chrono::Datelike;
use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// Ordered model inputs.
pub const FEATURE_NAMES: [&str; 11] = [
    "circulatingSupply",
    "open_log",
    "high_log",
    "low_log",
    "close_log",
    "volume_log",
    "marketCap_log",
    "velocity_log",
    "ema_12d_log",
    "day_of_week_sin",
    "day_of_week_cos",
];

pub const EMA_SPAN: usize = 12;

/// Values at or below zero are raised to this before taking the log.
pub const LOG_EPSILON: f64 = 1e-8;

/// Lowest close used as a divisor.
pub const PRICE_FLOOR: f64 = 1.0;

const SUPPLY_FLOOR: f64 = 1.0;

const LOG_FIELDS: [(&str, &str); 8] = [
    ("open", "open_log"),
    ("high", "high_log"),
    ("low", "low_log"),
    ("close", "close_log"),
    ("volume", "volume_log"),
    ("marketCap", "marketCap_log"),
    ("velocity", "velocity_log"),
    ("ema_12d", "ema_12d_log"),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleStat {
    pub mean: f64,
    pub std: f64,
}

/// Standardization statistics captured from the training set.
///
/// `high_log` has no entry and passes through unscaled.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationStats {
    stats: BTreeMap<&'static str, ScaleStat>,
}

impl Default for NormalizationStats {
    fn default() -> Self {
        let stat = |mean, std| ScaleStat { mean, std };
        Self {
            stats: BTreeMap::from([
                ("open_log", stat(10.10, 0.95)),
                ("low_log", stat(10.08, 0.95)),
                ("close_log", stat(10.10, 0.95)),
                ("volume_log", stat(8.30, 0.80)),
                ("marketCap_log", stat(26.90, 0.95)),
                ("circulatingSupply", stat(19_000_000.0, 600_000.0)),
                ("velocity_log", stat(-8.30, 0.90)),
                ("ema_12d_log", stat(10.10, 0.94)),
            ]),
        }
    }
}

impl NormalizationStats {
    pub fn get(&self, name: &str) -> Option<ScaleStat> {
        self.stats.get(name).copied()
    }

    pub fn standardize(&self, name: &str, value: f64) -> f64 {
        match self.get(name) {
            Some(s) if s.std > 0.0 => (value - s.mean) / s.std,
            Some(s) => value - s.mean,
            None => value,
        }
    }

    /// Inverse of [`standardize`](Self::standardize).
    pub fn invert(&self, name: &str, z: f64) -> f64 {
        match self.get(name) {
            Some(s) if s.std > 0.0 => z * s.std + s.mean,
            Some(s) => z + s.mean,
            None => z,
        }
    }

    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stats.keys().copied()
    }
}

/// Fixed-order feature values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureVector {
    names: Vec<&'static str>,
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }

    /// Little-endian bytes of every value, in order.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureBuilder {
    stats: NormalizationStats,
}

impl FeatureBuilder {
    pub fn new(stats: NormalizationStats) -> Self {
        Self { stats }
    }

    pub fn stats(&self) -> &NormalizationStats {
        &self.stats
    }

    /// Builds the model input for `record`.
    ///
    /// # Arguments
    /// * `record` - Fully populated market record for the input date
    /// * `history` - Candles strictly before `record.date`, oldest first
    pub fn build(
        &self,
        record: &MergedMarketRecord,
        history: &[OhlcvRecord],
    ) -> Result<FeatureVector, PipelineError> {
        let mut x: BTreeMap<&'static str, f64> = BTreeMap::from([
            ("open", record.open.value),
            ("high", record.high.value),
            ("low", record.low.value),
            ("close", record.close.value),
            ("volume", record.volume.value),
            ("marketCap", record.market_cap.value),
        ]);

        let supply = circulating_supply(record.market_cap.value, record.close.value);
        x.insert("circulatingSupply", supply);

        x.insert("velocity", velocity(record.volume.value, supply));

        let closes: Vec<f64> = history
            .iter()
            .filter(|c| c.date < record.date)
            .map(|c| c.close)
            .chain(std::iter::once(record.close.value))
            .collect();
        if let Some(ema) = ema(&closes, EMA_SPAN) {
            x.insert("ema_12d", ema);
        }

        for (field, out) in LOG_FIELDS {
            if let Some(v) = x.get(field).copied() {
                x.insert(out, safe_ln(v));
            }
        }

        let dow = record.date.weekday().num_days_from_monday();
        let (sin, cos) = cyclical_day_of_week(dow);
        x.insert("day_of_week_sin", sin);
        x.insert("day_of_week_cos", cos);

        for name in self.stats.names() {
            if let Some(v) = x.get(name).copied() {
                x.insert(name, self.stats.standardize(name, v));
            }
        }

        select_features(&x)
    }
}

/// Supply implied by market cap and price; the price is floored to avoid dividing by zero.
pub fn circulating_supply(market_cap: f64, close: f64) -> f64 {
    market_cap / close.max(PRICE_FLOOR)
}

pub fn velocity(volume: f64, circulating_supply: f64) -> f64 {
    volume / circulating_supply.max(SUPPLY_FLOOR)
}

/// Exponential moving average over the last `span` values (oldest first).
///
/// Uses `alpha = 2 / (span + 1)`, seeded with the oldest value in the window and without
/// bias adjustment. With fewer than `span` values the average runs over exactly the values
/// available; this reduced window is an approximation, not an error.
pub fn ema(values: &[f64], span: usize) -> Option<f64> {
    if span == 0 {
        return None;
    }
    let start = values.len().saturating_sub(span);
    let window = &values[start..];
    let (first, rest) = window.split_first()?;

    let alpha = 2.0 / (span as f64 + 1.0);
    Some(rest.iter().fold(*first, |acc, v| alpha * v + (1.0 - alpha) * acc))
}

/// Natural log that never sees a non-positive argument.
pub fn safe_ln(value: f64) -> f64 {
    if value.is_nan() || value <= LOG_EPSILON {
        LOG_EPSILON.ln()
    } else {
        value.ln()
    }
}

/// Maps day-of-week (Monday = 0) onto the unit circle.
pub fn cyclical_day_of_week(dow: u32) -> (f64, f64) {
    let angle = 2.0 * PI * f64::from(dow % 7) / 7.0;
    (angle.sin(), angle.cos())
}

fn select_features(x: &BTreeMap<&'static str, f64>) -> Result<FeatureVector, PipelineError> {
    let mut values = Vec::with_capacity(FEATURE_NAMES.len());
    for name in FEATURE_NAMES {
        let v = x
            .get(name)
            .copied()
            .ok_or(PipelineError::FeatureMissing { name })?;
        values.push(v);
    }
    Ok(FeatureVector {
        names: FEATURE_NAMES.to_vec(),
        values,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::market::Sourced;
    use chrono::NaiveDate;

    pub(crate) fn record(date: NaiveDate, close: f64) -> MergedMarketRecord {
        MergedMarketRecord {
            date,
            open: Sourced::fetched(close * 0.99),
            high: Sourced::fetched(close * 1.02),
            low: Sourced::fetched(close * 0.98),
            close: Sourced::fetched(close),
            volume: Sourced::fetched(2_000.0),
            market_cap: Sourced::fetched(close * 19_250_000.0),
        }
    }

    fn history(end: NaiveDate, closes: &[f64]) -> Vec<OhlcvRecord> {
        let n = closes.len() as i64;
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| OhlcvRecord {
                date: end - chrono::Duration::days(n - i as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1_000.0,
                vwap: None,
            })
            .collect()
    }

    #[test]
    fn build_is_deterministic() {
        let d = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let builder = FeatureBuilder::default();
        let rec = record(d, 16_600.0);
        let hist = history(d, &[16_400.0, 16_500.0, 16_550.0]);

        let a = builder.build(&rec, &hist).unwrap();
        let b = builder.build(&rec, &hist).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn output_has_fixed_order_and_length() {
        let d = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let v = FeatureBuilder::default()
            .build(&record(d, 16_600.0), &[])
            .unwrap();
        assert_eq!(v.len(), FEATURE_NAMES.len());
        assert_eq!(v.names(), FEATURE_NAMES.as_slice());
        assert!(v.values().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn ema_with_short_history_uses_available_points() {
        let alpha = 2.0 / 13.0;
        let expected = {
            let e1 = alpha * 2.0 + (1.0 - alpha) * 1.0;
            alpha * 3.0 + (1.0 - alpha) * e1
        };
        assert_eq!(ema(&[1.0, 2.0, 3.0], 12), Some(expected));
    }

    #[test]
    fn ema_window_is_capped_at_span() {
        let mut values = vec![1_000.0; 5];
        values.extend(std::iter::repeat(10.0).take(12));
        let v = ema(&values, 12).unwrap();
        assert!((v - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ema_of_single_point_is_that_point() {
        assert_eq!(ema(&[42.0], 12), Some(42.0));
        assert_eq!(ema(&[], 12), None);
    }

    #[test]
    fn ema_feature_matches_reduced_window() {
        let d = NaiveDate::from_ymd_opt(2023, 1, 4).unwrap();
        let builder = FeatureBuilder::default();
        let hist = history(d, &[100.0, 110.0]);
        let v = builder.build(&record(d, 120.0), &hist).unwrap();

        let expected_ema = ema(&[100.0, 110.0, 120.0], EMA_SPAN).unwrap();
        let z = v.get("ema_12d_log").unwrap();
        let recovered = builder.stats().invert("ema_12d_log", z).exp();
        assert!((recovered - expected_ema).abs() < 1e-6);
    }

    #[test]
    fn log_transform_floors_non_positive_values() {
        assert_eq!(safe_ln(0.0), LOG_EPSILON.ln());
        assert_eq!(safe_ln(-5.0), LOG_EPSILON.ln());
        assert_eq!(safe_ln(f64::NAN), LOG_EPSILON.ln());
        assert!((safe_ln(std::f64::consts::E) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_volume_and_market_cap_still_build() {
        let d = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let mut rec = record(d, 16_600.0);
        rec.volume = Sourced::user_supplied(0.0);
        rec.market_cap = Sourced::user_supplied(0.0);

        let v = FeatureBuilder::default().build(&rec, &[]).unwrap();
        assert!(v.values().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn cyclical_encoding_wraps_without_discontinuity() {
        let (s0, c0) = cyclical_day_of_week(0);
        let (s6, c6) = cyclical_day_of_week(6);
        let (s7, c7) = cyclical_day_of_week(7);
        assert_eq!((s0, c0), (s7, c7));
        let gap_wrap = ((s6 - s0).powi(2) + (c6 - c0).powi(2)).sqrt();
        let (s1, c1) = cyclical_day_of_week(1);
        let gap_adjacent = ((s1 - s0).powi(2) + (c1 - c0).powi(2)).sqrt();
        assert!((gap_wrap - gap_adjacent).abs() < 1e-12);
    }

    #[test]
    fn sunday_is_day_six() {
        // 2023-01-01 was a Sunday.
        let d = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let v = FeatureBuilder::default()
            .build(&record(d, 16_600.0), &[])
            .unwrap();
        let (sin, cos) = cyclical_day_of_week(6);
        assert_eq!(v.get("day_of_week_sin"), Some(sin));
        assert_eq!(v.get("day_of_week_cos"), Some(cos));
    }

    #[test]
    fn high_log_is_not_standardized() {
        let d = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let rec = record(d, 16_600.0);
        let v = FeatureBuilder::default().build(&rec, &[]).unwrap();
        assert_eq!(v.get("high_log"), Some(rec.high.value.ln()));
    }

    #[test]
    fn circulating_supply_guards_zero_close() {
        assert_eq!(circulating_supply(1_000.0, 0.0), 1_000.0 / PRICE_FLOOR);
        assert_eq!(velocity(10.0, 0.0), 10.0);
    }

    #[test]
    fn selection_reports_missing_feature() {
        let mut x: BTreeMap<&'static str, f64> =
            FEATURE_NAMES.iter().map(|n| (*n, 0.0)).collect();
        x.remove("ema_12d_log");
        x.insert("extra_feature", 1.0);

        let err = select_features(&x).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::FeatureMissing {
                name: "ema_12d_log"
            }
        ));
    }
}
