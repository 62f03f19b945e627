pub mod error;
pub mod power;
pub mod prompts;
pub mod status;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::domain::{PowerMonitor, SimulatedPowerMonitor};
use crate::scheduler::PowerAwareScheduler;

/// Shared handler state. The simulator handle is present only when the
/// simulated monitor backs the system; the charge/discharge diagnostics
/// refuse to run against hardware.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<PowerAwareScheduler>,
    pub monitor: Arc<dyn PowerMonitor>,
    pub simulator: Option<Arc<SimulatedPowerMonitor>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/prompts", post(prompts::submit))
        .route("/api/requests/:id", get(prompts::request_info))
        .route("/api/status", get(status::system_status))
        .route("/api/power/readings", get(power::readings))
        .route("/api/simulate/charge", post(power::simulate_charge))
        .route("/api/simulate/discharge", post(power::simulate_discharge))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
