use thiserror::Error;

/// Failure talking to a market data provider.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("{provider} request failed: {detail}")]
    Transport {
        provider: &'static str,
        detail: String,
    },
    #[error("{provider} did not answer within {timeout_ms}ms")]
    Timeout {
        provider: &'static str,
        timeout_ms: u128,
    },
    #[error("{provider} HTTP {status}")]
    Server { provider: &'static str, status: u16 },
    #[error("{provider} rate limited the request")]
    RateLimited { provider: &'static str },
    #[error("{provider} returned an unexpected payload: {detail}")]
    Decode {
        provider: &'static str,
        detail: String,
    },
}

impl UpstreamError {
    /// Transient failures are worth one more attempt; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Server { .. }
        )
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::Transport { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Server { provider, .. }
            | Self::RateLimited { provider }
            | Self::Decode { provider, .. } => provider,
        }
    }
}

/// Failures of the trained-model tier.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("model artifact not found at {path}")]
    Missing { path: String },

    #[error("failed to read model artifact {path}: {detail}")]
    Io { path: String, detail: String },

    #[error("model artifact is corrupt: {0}")]
    Corrupt(String),

    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("model produced a non-finite or non-positive prediction ({0})")]
    InvalidOutput(f64),

    #[error("model disabled after a permanent failure")]
    Disabled,
}

impl ModelError {
    /// Permanent failures take the model out of service for the rest of the process.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Disabled)
    }
}

/// Request-level failures of the inference pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid date '{value}': expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("invalid override for {field}: {reason}")]
    InvalidOverride { field: &'static str, reason: String },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] UpstreamError),

    #[error("feature '{name}' missing after transform")]
    FeatureMissing { name: &'static str },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("prediction failed: {0}")]
    PredictionFailure(String),
}

impl PipelineError {
    /// True when the caller sent something malformed.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidDate { .. } | Self::InvalidOverride { .. })
    }
}
