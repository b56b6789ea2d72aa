use crate::domain::market::{MarketOverrides, PredictionResult, PredictionSource, Provenance};
use crate::error::PipelineError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query string accepted by the predict endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictQuery {
    pub date: Option<String>,
    pub open_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub close_price: Option<f64>,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
}

impl PredictQuery {
    pub fn validate_and_into_overrides(&self) -> Result<MarketOverrides, PipelineError> {
        let overrides = MarketOverrides {
            open: self.open_price,
            high: self.high_price,
            low: self.low_price,
            close: self.close_price,
            volume: self.volume,
            market_cap: self.market_cap,
        };
        overrides.validate()?;
        Ok(overrides)
    }

    pub fn date(&self) -> Option<&str> {
        self.date.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictResponse {
    pub input_date: NaiveDate,
    pub prediction: PredictionPayload,
    pub source: PredictionSource,
    pub provenance: BTreeMap<&'static str, Provenance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionPayload {
    pub prediction_day_date: NaiveDate,
    #[serde(rename = "Predicted_high")]
    pub predicted_high: String,
}

impl From<PredictionResult> for PredictResponse {
    fn from(result: PredictionResult) -> Self {
        Self {
            input_date: result.input_date,
            prediction: PredictionPayload {
                prediction_day_date: result.target_date,
                predicted_high: format!("{:.2}", result.predicted_high),
            },
            source: result.source,
            provenance: result.provenance,
        }
    }
}
