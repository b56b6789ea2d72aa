use crate::acquisition::{DataAcquisitionCoordinator, EstimationConfig};
use crate::config::Settings;
use crate::domain::market::{MarketOverrides, MarketSnapshot, PredictionResult};
use crate::error::PipelineError;
use crate::features::FeatureBuilder;
use crate::ingest::coingecko::CoinGeckoClient;
use crate::ingest::kraken::KrakenClient;
use crate::ingest::UpstreamPolicy;
use crate::model::PredictionEngine;
use crate::time::clock::{next_day, resolve_input_date, Clock, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;

/// End-to-end next-day high prediction. One instance is shared by all requests.
pub struct InferenceService {
    coordinator: DataAcquisitionCoordinator,
    builder: FeatureBuilder,
    engine: PredictionEngine,
    clock: Arc<dyn Clock>,
}

impl InferenceService {
    pub fn new(
        coordinator: DataAcquisitionCoordinator,
        builder: FeatureBuilder,
        engine: PredictionEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            builder,
            engine,
            clock,
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let kraken = KrakenClient::from_settings(settings, clock.clone())?;
        let coingecko = CoinGeckoClient::from_settings(settings, clock.clone())?;

        let coordinator = DataAcquisitionCoordinator::new(
            Arc::new(kraken),
            Arc::new(coingecko),
            UpstreamPolicy::from_settings(settings),
            EstimationConfig::from_settings(settings),
        );
        let builder = FeatureBuilder::default();
        let engine = PredictionEngine::new(
            Some(PathBuf::from(settings.model_path())),
            builder.clone(),
        );

        Ok(Self::new(coordinator, builder, engine, clock))
    }

    /// Loads the model artifact ahead of the first request.
    pub async fn warm_up(&self) {
        self.engine.ensure_loaded().await;
    }

    pub fn model_active(&self) -> bool {
        self.engine.model_active()
    }

    /// Predicts the high of the day after `input_date` (default: the caller's today).
    pub async fn predict_next_day_high(
        &self,
        input_date: Option<&str>,
        overrides: MarketOverrides,
    ) -> Result<PredictionResult, PipelineError> {
        let date = resolve_input_date(input_date, self.clock.as_ref())?;
        let target_date = next_day(date)?;
        overrides.validate()?;

        let acquisition = self.coordinator.acquire_with_history(date, &overrides).await;
        let vector = self.builder.build(&acquisition.record, &acquisition.history)?;
        let (predicted_high, source) = self.engine.predict(&vector).await?;

        tracing::info!(
            input_date = %date,
            predicted_high,
            ?source,
            history_len = acquisition.history.len(),
            "prediction served"
        );

        Ok(PredictionResult {
            input_date: date,
            target_date,
            predicted_high,
            source,
            provenance: acquisition.record.provenance(),
        })
    }

    pub async fn current_snapshot(&self) -> Result<MarketSnapshot, PipelineError> {
        self.coordinator
            .current_snapshot(self.clock.now_utc())
            .await
    }
}
