use crate::domain::market::PredictionSource;
use crate::error::{ModelError, PipelineError};
use crate::features::{FeatureBuilder, FeatureVector, NormalizationStats};
use crate::model::artifact::ModelArtifact;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Trained-model tier. Switches itself off after a permanent failure.
#[derive(Debug)]
pub struct ModelStrategy {
    artifact: Arc<ModelArtifact>,
    disabled: AtomicBool,
}

impl ModelStrategy {
    pub fn new(artifact: Arc<ModelArtifact>) -> Self {
        Self {
            artifact,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<f64, ModelError> {
        if self.is_disabled() {
            return Err(ModelError::Disabled);
        }
        let result = self.artifact.predict(vector);
        if let Err(err) = &result {
            if err.is_permanent() && !self.disabled.swap(true, Ordering::AcqRel) {
                tracing::error!(
                    model = %self.artifact.name,
                    version = %self.artifact.version,
                    error = %err,
                    "disabling model after permanent failure"
                );
            }
        }
        result
    }
}

/// Deterministic estimate of the next-day high from the standardized features.
///
/// Blends the latest close with its 12-day EMA, adds half of the day's range and a
/// quarter of any upward momentum (close above EMA).
#[derive(Debug, Clone, Default)]
pub struct FallbackStrategy {
    stats: NormalizationStats,
}

impl FallbackStrategy {
    pub fn new(stats: NormalizationStats) -> Self {
        Self { stats }
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<f64, PipelineError> {
        let feature = |name: &'static str| {
            vector
                .get(name)
                .ok_or(PipelineError::FeatureMissing { name })
        };
        let price = |name: &'static str| -> Result<f64, PipelineError> {
            Ok(self.stats.invert(name, feature(name)?).exp())
        };

        let close = price("close_log")?;
        let ema = price("ema_12d_log")?;
        let low = price("low_log")?;
        // high_log is never standardized.
        let high = feature("high_log")?.exp();

        let range = (high - low).max(0.0);
        let momentum = (close - ema).max(0.0);
        let estimate = 0.7 * close + 0.3 * ema + 0.5 * range + 0.25 * momentum;

        if estimate.is_finite() && estimate > 0.0 {
            Ok(estimate)
        } else {
            Err(PipelineError::PredictionFailure(format!(
                "fallback produced {estimate}"
            )))
        }
    }
}

/// Strategy chosen when the engine first loads.
#[derive(Debug)]
pub enum Strategy {
    Model(ModelStrategy),
    Fallback(FallbackStrategy),
}

/// Two-tier predictor: the trained model when it is healthy, the deterministic estimator
/// otherwise. Loading happens at most once per process, even under concurrent first calls.
#[derive(Debug)]
pub struct PredictionEngine {
    model_path: Option<PathBuf>,
    builder: FeatureBuilder,
    strategy: OnceCell<Strategy>,
    fallback: FallbackStrategy,
    load_attempts: AtomicU32,
}

impl PredictionEngine {
    /// Lazily loads the artifact at `model_path` on first use.
    pub fn new(model_path: Option<PathBuf>, builder: FeatureBuilder) -> Self {
        let fallback = FallbackStrategy::new(builder.stats().clone());
        Self {
            model_path,
            builder,
            strategy: OnceCell::new(),
            fallback,
            load_attempts: AtomicU32::new(0),
        }
    }

    /// Engine with an already loaded artifact.
    pub fn with_artifact(artifact: ModelArtifact, builder: FeatureBuilder) -> Self {
        let fallback = FallbackStrategy::new(builder.stats().clone());
        let strategy = Strategy::Model(ModelStrategy::new(Arc::new(artifact)));
        Self {
            model_path: None,
            builder,
            strategy: OnceCell::new_with(Some(strategy)),
            fallback,
            load_attempts: AtomicU32::new(0),
        }
    }

    /// Engine that never consults a model.
    pub fn fallback_only(builder: FeatureBuilder) -> Self {
        let fallback = FallbackStrategy::new(builder.stats().clone());
        Self {
            model_path: None,
            builder,
            strategy: OnceCell::new_with(Some(Strategy::Fallback(fallback.clone()))),
            fallback,
            load_attempts: AtomicU32::new(0),
        }
    }

    /// Resolves the strategy, loading and smoke-testing the artifact on first call.
    pub async fn ensure_loaded(&self) -> &Strategy {
        self.strategy
            .get_or_init(|| async { self.load_strategy().await })
            .await
    }

    /// True when predictions currently come from the trained model.
    pub fn model_active(&self) -> bool {
        matches!(self.strategy.get(), Some(Strategy::Model(m)) if !m.is_disabled())
    }

    pub async fn predict(
        &self,
        vector: &FeatureVector,
    ) -> Result<(f64, PredictionSource), PipelineError> {
        let fallback = match self.ensure_loaded().await {
            Strategy::Model(model) => match model.predict(vector) {
                Ok(value) => return Ok((value, PredictionSource::Model)),
                Err(ModelError::Disabled) => &self.fallback,
                Err(err) => {
                    tracing::warn!(error = %err, "model prediction failed, using fallback");
                    &self.fallback
                }
            },
            Strategy::Fallback(fallback) => fallback,
        };

        let value = fallback.predict(vector)?;
        Ok((value, PredictionSource::Fallback))
    }

    /// How many times the artifact load has run; at most once per process.
    pub fn load_attempts(&self) -> u32 {
        self.load_attempts.load(Ordering::Acquire)
    }

    async fn load_strategy(&self) -> Strategy {
        self.load_attempts.fetch_add(1, Ordering::AcqRel);
        let Some(path) = &self.model_path else {
            tracing::info!("no model path configured, serving fallback estimates");
            return Strategy::Fallback(self.fallback.clone());
        };

        let loaded = match ModelArtifact::load(path).await {
            Ok(artifact) => artifact.smoke_test(&self.builder).map(|_| artifact),
            Err(err) => Err(err),
        };

        match loaded {
            Ok(artifact) => {
                tracing::info!(
                    path = %path.display(),
                    model = %artifact.name,
                    version = %artifact.version,
                    "model artifact loaded"
                );
                Strategy::Model(ModelStrategy::new(Arc::new(artifact)))
            }
            Err(err) => {
                let err = PipelineError::ModelUnavailable(err.to_string());
                tracing::warn!(path = %path.display(), error = %err, "serving fallback estimates");
                Strategy::Fallback(self.fallback.clone())
            }
        }
    }
}
