use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PipelineError;

/// Calendar day a record describes.
pub type DateKey = NaiveDate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRecord {
    pub date: DateKey,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCapRecord {
    pub date: DateKey,
    pub market_cap: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Fetched,
    Estimated,
    UserSupplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sourced {
    pub value: f64,
    pub provenance: Provenance,
}

impl Sourced {
    pub fn fetched(value: f64) -> Self {
        Self {
            value,
            provenance: Provenance::Fetched,
        }
    }

    pub fn estimated(value: f64) -> Self {
        Self {
            value,
            provenance: Provenance::Estimated,
        }
    }

    pub fn user_supplied(value: f64) -> Self {
        Self {
            value,
            provenance: Provenance::UserSupplied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedMarketRecord {
    pub date: DateKey,
    pub open: Sourced,
    pub high: Sourced,
    pub low: Sourced,
    pub close: Sourced,
    pub volume: Sourced,
    pub market_cap: Sourced,
}

impl MergedMarketRecord {
    pub fn provenance(&self) -> BTreeMap<&'static str, Provenance> {
        BTreeMap::from([
            ("open", self.open.provenance),
            ("high", self.high.provenance),
            ("low", self.low.provenance),
            ("close", self.close.provenance),
            ("volume", self.volume.provenance),
            ("market_cap", self.market_cap.provenance),
        ])
    }
}

/// Caller-supplied values that take precedence over anything fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketOverrides {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
}

impl MarketOverrides {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let prices = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ];
        for (field, value) in prices {
            if let Some(v) = value {
                check_finite(field, v)?;
                if v <= 0.0 {
                    return Err(PipelineError::InvalidOverride {
                        field,
                        reason: format!("must be positive (got {v})"),
                    });
                }
            }
        }

        for (field, value) in [("volume", self.volume), ("market_cap", self.market_cap)] {
            if let Some(v) = value {
                check_finite(field, v)?;
                if v < 0.0 {
                    return Err(PipelineError::InvalidOverride {
                        field,
                        reason: format!("must be non-negative (got {v})"),
                    });
                }
            }
        }

        if let (Some(high), Some(low)) = (self.high, self.low) {
            if high < low {
                return Err(PipelineError::InvalidOverride {
                    field: "high",
                    reason: format!("high {high} is below low {low}"),
                });
            }
        }

        Ok(())
    }

    /// Whether every exchange-provided field is already supplied.
    pub fn covers_ohlcv(&self) -> bool {
        self.open.is_some()
            && self.high.is_some()
            && self.low.is_some()
            && self.close.is_some()
            && self.volume.is_some()
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), PipelineError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::InvalidOverride {
            field,
            reason: "must be a finite number".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub input_date: DateKey,
    pub target_date: DateKey,
    pub predicted_high: f64,
    pub source: PredictionSource,
    pub provenance: BTreeMap<&'static str, Provenance>,
}

/// Latest market state with day-over-day deltas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub success: bool,
    pub date: DateKey,
    pub current_price: f64,
    pub open_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub vwap_24h: Option<f64>,
    pub price_change_24h: f64,
    pub price_change_percentage_24h: f64,
    pub market_cap: Sourced,
    pub total_volume: f64,
    pub circulating_supply: f64,
    pub total_supply: f64,
    pub max_supply: f64,
    pub last_updated: DateTime<Utc>,
    pub data_source: &'static str,
}
