use crate::domain::market::{MergedMarketRecord, Sourced};
use crate::error::ModelError;
use crate::features::{FeatureBuilder, FeatureVector};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the linear output maps back to a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTransform {
    /// The model predicts the high directly.
    High,
    /// The model predicts `ln(high)`.
    LogHigh,
}

/// Serialized linear model over the standardized feature vector.
///
/// Immutable once loaded; shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    pub target: TargetTransform,
    pub feature_names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl ModelArtifact {
    pub async fn load(path: &Path) -> Result<Self, ModelError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ModelError::Missing {
                    path: path.display().to_string(),
                }
            } else {
                ModelError::Io {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                }
            }
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ModelError> {
        let artifact = serde_json::from_str::<Self>(text)
            .map_err(|e| ModelError::Corrupt(format!("invalid artifact JSON: {e}")))?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(ModelError::Corrupt("name and version are required".into()));
        }
        if self.feature_names.is_empty() {
            return Err(ModelError::Corrupt("feature_names is empty".into()));
        }
        if self.feature_names.len() != self.coefficients.len() {
            return Err(ModelError::Corrupt(format!(
                "{} feature names but {} coefficients",
                self.feature_names.len(),
                self.coefficients.len()
            )));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelError::Corrupt("non-finite weight".into()));
        }
        Ok(())
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<f64, ModelError> {
        self.validate()?;

        let names_match = vector.len() == self.feature_names.len()
            && vector
                .names()
                .iter()
                .zip(&self.feature_names)
                .all(|(got, want)| *got == want.as_str());
        if !names_match {
            return Err(ModelError::SchemaMismatch(format!(
                "artifact expects {:?}, got {:?}",
                self.feature_names,
                vector.names()
            )));
        }

        let raw = self.intercept
            + self
                .coefficients
                .iter()
                .zip(vector.values())
                .map(|(w, x)| w * x)
                .sum::<f64>();

        let prediction = match self.target {
            TargetTransform::High => raw,
            TargetTransform::LogHigh => raw.exp(),
        };

        if prediction.is_finite() && prediction > 0.0 {
            Ok(prediction)
        } else {
            Err(ModelError::InvalidOutput(prediction))
        }
    }

    /// Predicts on a fixed reference record; any error means the artifact is unusable.
    pub fn smoke_test(&self, builder: &FeatureBuilder) -> Result<f64, ModelError> {
        let vector = builder
            .build(&reference_record(), &[])
            .map_err(|e| ModelError::SchemaMismatch(e.to_string()))?;
        self.predict(&vector)
    }
}

fn reference_record() -> MergedMarketRecord {
    let close = 16_600.0;
    MergedMarketRecord {
        date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default(),
        open: Sourced::estimated(16_530.0),
        high: Sourced::estimated(16_770.0),
        low: Sourced::estimated(16_490.0),
        close: Sourced::estimated(close),
        volume: Sourced::estimated(1_650.0),
        market_cap: Sourced::estimated(close * 19_250_000.0),
    }
}
