use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{error::ApiError, ApiState};
use crate::domain::{PowerMonitor, PowerReading};

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    #[serde(flatten)]
    pub reading: PowerReading,
    pub battery_level: f64,
    pub monitor_type: &'static str,
}

/// GET /api/power/readings
pub async fn readings(State(state): State<ApiState>) -> Json<ReadingsResponse> {
    let reading = state.monitor.current_reading().await;
    let battery_level = state.monitor.battery_level().await;
    Json(ReadingsResponse {
        reading,
        battery_level,
        monitor_type: state.monitor.kind(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    #[serde(default = "default_amount")]
    pub amount: f64,
}

fn default_amount() -> f64 {
    10.0
}

#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    pub status: &'static str,
    pub battery_level: f64,
    pub monitor_type: &'static str,
}

/// POST /api/simulate/charge
pub async fn simulate_charge(
    State(state): State<ApiState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulateResponse>, ApiError> {
    let simulator = state.simulator.as_ref().ok_or_else(|| {
        ApiError::Conflict("cannot simulate charging with a hardware power monitor".to_string())
    })?;
    simulator.charge(request.amount).await;
    Ok(Json(SimulateResponse {
        status: "ok",
        battery_level: simulator.battery_level().await,
        monitor_type: state.monitor.kind(),
    }))
}

/// POST /api/simulate/discharge
pub async fn simulate_discharge(
    State(state): State<ApiState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulateResponse>, ApiError> {
    let simulator = state.simulator.as_ref().ok_or_else(|| {
        ApiError::Conflict("cannot simulate discharging with a hardware power monitor".to_string())
    })?;
    simulator.discharge(request.amount).await;
    Ok(Json(SimulateResponse {
        status: "ok",
        battery_level: simulator.battery_level().await,
        monitor_type: state.monitor.kind(),
    }))
}
