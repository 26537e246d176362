//! HTTP status server
//!
//! Read-only view of the running engine: liveness, budget level, the
//! scheduler's current phase and the report from the last completed cycle.

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::budget::RateBudget;
use crate::config::ApiConfig;
use crate::database::{Database, PoolStats};
use crate::error::Result;
use crate::model::CategorySpec;
use crate::scheduler::{CycleReport, CycleState, ScanScheduler};

const MAX_IN_FLIGHT_REQUESTS: usize = 64;

/// Shared application state
pub struct AppState {
    pub scheduler: Arc<ScanScheduler>,
    pub budget: Arc<RateBudget>,
    pub database: Option<Database>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PoolStats>,
}

#[derive(Debug, Serialize)]
pub struct BudgetStatus {
    pub remaining: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: CycleState,
    pub budget: BudgetStatus,
    pub categories: usize,
    pub tiers: Vec<String>,
    pub score_fn: &'static str,
    pub publisher: &'static str,
    pub cycle_interval_secs: u64,
    pub cooldown_window_secs: i64,
    pub max_items_per_cycle: usize,
}

pub fn router(state: Arc<AppState>, config: &ApiConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/categories", get(get_categories))
        .route("/api/v1/last-cycle", get(get_last_cycle))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .layer(TraceLayer::new_for_http());

    let router = if config.cors_enabled {
        router.layer(cors_layer(&config.cors_origins))
    } else {
        router
    };

    router.with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(allowed))
}

/// Serve until `shutdown` fires
pub async fn start_server(
    state: Arc<AppState>,
    config: ApiConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(state, &config);

    let addr = format!("{}:{}", config.host, config.port);
    info!("🚀 Starting status API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("Status API server stopped");
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let database = match &state.database {
        Some(db) => {
            db.health_check().await?;
            Some(db.stats())
        }
        None => None,
    };

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    }))
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let scheduler = &state.scheduler;
    let config = scheduler.config();

    Json(StatusResponse {
        state: scheduler.state(),
        budget: BudgetStatus {
            remaining: state.budget.remaining(),
            capacity: state.budget.capacity(),
            refill_per_sec: state.budget.refill_per_sec(),
        },
        categories: scheduler.dispatch_order().len(),
        tiers: scheduler
            .cascade()
            .tiers()
            .iter()
            .map(|t| t.name.clone())
            .collect(),
        score_fn: scheduler.scoring().score_fn_name(),
        publisher: scheduler.publisher_name(),
        cycle_interval_secs: config.cycle_interval.as_secs(),
        cooldown_window_secs: scheduler.cooldown_window().num_seconds(),
        max_items_per_cycle: config.max_items_per_cycle,
    })
}

/// Categories in dispatch order
async fn get_categories(State(state): State<Arc<AppState>>) -> Json<Vec<CategorySpec>> {
    Json(state.scheduler.dispatch_order().to_vec())
}

async fn get_last_cycle(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<CycleReport>, StatusCode> {
    state
        .scheduler
        .last_report()
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
