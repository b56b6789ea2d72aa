pub mod artifact;
pub mod engine;

pub use artifact::{ModelArtifact, TargetTransform};
pub use engine::{FallbackStrategy, ModelStrategy, PredictionEngine, Strategy};
