use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use btcast_core::domain::contract::{PredictQuery, PredictResponse};
use btcast_core::domain::market::MarketSnapshot;
use btcast_core::error::PipelineError;
use btcast_core::service::InferenceService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = btcast_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let service = InferenceService::from_settings(&settings)?;
    service.warm_up().await;
    if !service.model_active() {
        tracing::warn!(
            model_path = settings.model_path(),
            "model not loaded; starting API with fallback estimates"
        );
    }

    let state = AppState {
        service: Arc::new(service),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/health/", get(health))
        .route("/healthz", get(healthz))
        .route("/predict/Bitcoin", get(predict_bitcoin))
        .route("/current/Bitcoin", get(current_bitcoin))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    service: Arc<InferenceService>,
}

const PROJECT: &str = "Bitcoin Price Prediction API";

async fn root() -> Json<Value> {
    let optional_number = |description: &str| {
        json!({"description": description, "format": "number", "required": false})
    };

    Json(json!({
        "project": PROJECT,
        "description": "Predicts Bitcoin's next day HIGH price from daily market data.",
        "objectives": [
            "Predict Bitcoin's next day high price",
            "Provide RESTful API endpoints for predictions",
            "Serve machine learning models in production"
        ],
        "endpoints": {
            "/": "Project information and documentation",
            "/health/": "Health check endpoint",
            "/healthz": "Liveness probe",
            "/predict/Bitcoin": "Bitcoin price prediction endpoint",
            "/current/Bitcoin": "Latest daily market data"
        },
        "predict_endpoint_details": {
            "method": "GET",
            "url": "/predict/Bitcoin",
            "parameters": {
                "date": {
                    "description": "Date from which the model predicts the next day's high \
                                    (defaults to today)",
                    "format": "YYYY-MM-DD",
                    "example": "2023-01-01",
                    "required": false
                },
                "open_price": optional_number("Opening price in USD"),
                "high_price": optional_number("Daily high in USD"),
                "low_price": optional_number("Daily low in USD"),
                "close_price": optional_number("Closing price in USD"),
                "volume": optional_number("Traded volume in BTC"),
                "market_cap": optional_number("Market capitalization in USD")
            },
            "output_format": {
                "input_date": "YYYY-MM-DD",
                "prediction": {
                    "prediction_day_date": "YYYY-MM-DD",
                    "Predicted_high": "string (price value)"
                },
                "source": "model | fallback",
                "provenance": "per-field fetched | estimated | user-supplied"
            }
        },
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    message: &'static str,
    timestamp: chrono::DateTime<Utc>,
    model_loaded: bool,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "healthy",
        message: "Welcome to the Bitcoin Price Prediction API! The service is running smoothly.",
        timestamp: Utc::now(),
        model_loaded: state.service.model_active(),
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn predict_bitcoin(
    State(state): State<AppState>,
    Query(query): Query<PredictQuery>,
) -> Result<Json<PredictResponse>, StatusCode> {
    let overrides = query.validate_and_into_overrides().map_err(into_status)?;

    let result = state
        .service
        .predict_next_day_high(query.date(), overrides)
        .await
        .map_err(into_status)?;

    Ok(Json(result.into()))
}

async fn current_bitcoin(
    State(state): State<AppState>,
) -> Result<Json<MarketSnapshot>, StatusCode> {
    let snapshot = state
        .service
        .current_snapshot()
        .await
        .map_err(into_status)?;
    Ok(Json(snapshot))
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        PipelineError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_status(err: PipelineError) -> StatusCode {
    let status = status_for(&err);
    if status.is_server_error() {
        let err = anyhow::Error::new(err);
        sentry_anyhow::capture_anyhow(&err);
        tracing::error!(error = %err, %status, "request failed");
    } else {
        tracing::debug!(error = %err, %status, "rejected request");
    }
    status
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &btcast_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
