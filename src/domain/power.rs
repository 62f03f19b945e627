//! Power-side domain model: readings, forecasts, the monitor capability set
//! and the simulated monitor used for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Battery threshold below which the worker refuses to start jobs (strict).
pub const MIN_PROCESSING_BATTERY_PERCENT: f64 = 30.0;

/// A point-in-time sample from the power subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerReading {
    pub timestamp: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    /// Instantaneous harvested solar watts.
    pub power: f64,
    /// Estimated system draw in watts.
    pub consumption: f64,
    pub temperature: f64,
}

/// Prediction for one future wall-clock hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastEntry {
    /// Wall-clock hour 0-23.
    pub hour: u32,
    pub solar_output: f64,
    pub battery_level: f64,
    pub processing_capable: bool,
}

/// Aggregate snapshot handed to the worker loop and the status API.
#[derive(Debug, Clone, Serialize)]
pub struct PowerStatus {
    pub battery_level: f64,
    pub solar_output: f64,
    pub consumption: f64,
    pub temperature: f64,
    pub timestamp: DateTime<Utc>,
}

/// Capability set the scheduler consumes. Implementations must never fail a
/// read outwardly; transient hardware trouble degrades to cached or modeled
/// values instead.
#[async_trait]
pub trait PowerMonitor: Send + Sync {
    async fn current_reading(&self) -> PowerReading;

    /// Battery level as a percentage in [0, 100].
    async fn battery_level(&self) -> f64;

    async fn solar_output(&self) -> f64 {
        self.current_reading().await.power
    }

    /// One entry per upcoming hour, up to the horizon.
    async fn predict(&self, hours_ahead: usize) -> Vec<ForecastEntry>;

    async fn status(&self) -> PowerStatus;

    /// Advisory: raises the consumption estimate while a job runs.
    async fn set_processing(&self, processing: bool);

    /// Account energy drawn during a generation. Model-only monitors decrement
    /// their battery estimate; voltage-backed monitors may ignore this.
    async fn note_energy_used(&self, duration: Duration, watts: f64);

    fn kind(&self) -> &'static str;
}

/// Deterministic time-of-day approximation of solar output: zero outside
/// 06:00-18:00, linear ramp peaking at noon.
pub fn daylight_output(hour: u32, max_solar_output_w: f64) -> f64 {
    if (6..=18).contains(&hour) {
        let hour_factor = 1.0 - ((hour as f64 - 12.0) / 6.0).abs();
        max_solar_output_w * hour_factor
    } else {
        0.0
    }
}

/// Project battery and availability hour by hour from the current level.
///
/// Charging tapers as the battery fills (`0.85 - 0.2 * level / 100`);
/// discharge is taken at face value. The capability flag reflects the level
/// after the hour's flow has been applied.
pub fn project_availability<F>(
    start_hour: u32,
    hours_ahead: usize,
    initial_battery_percent: f64,
    base_consumption_w: f64,
    capacity_wh: f64,
    solar_for_hour: F,
) -> Vec<ForecastEntry>
where
    F: Fn(u32) -> f64,
{
    let capacity_wh = capacity_wh.max(0.1);
    let mut battery = initial_battery_percent.clamp(0.0, 100.0);
    let mut entries = Vec::with_capacity(hours_ahead);

    for offset in 0..hours_ahead {
        let hour = (start_hour + offset as u32) % 24;
        let solar = solar_for_hour(hour);
        let net = solar - base_consumption_w;

        let delta_percent = if net > 0.0 {
            let charge_efficiency = 0.85 - 0.2 * battery / 100.0;
            net * charge_efficiency / capacity_wh * 100.0
        } else {
            net / capacity_wh * 100.0
        };
        battery = (battery + delta_percent).clamp(0.0, 100.0);

        entries.push(ForecastEntry {
            hour,
            solar_output: solar,
            battery_level: battery,
            processing_capable: battery > MIN_PROCESSING_BATTERY_PERCENT
                && solar > base_consumption_w,
        });
    }

    entries
}

struct SimState {
    battery_level: f64,
    is_processing: bool,
}

/// Simulated monitor backed by the time-of-day model, with explicit
/// charge/discharge hooks so tests can drive power conditions.
pub struct SimulatedPowerMonitor {
    state: RwLock<SimState>,
    max_solar_output_w: f64,
    base_consumption_w: f64,
    processing_consumption_w: f64,
    capacity_wh: f64,
    /// When set, readings and forecasts report this flat solar output instead
    /// of the time-of-day curve.
    fixed_solar_output_w: Option<f64>,
}

impl SimulatedPowerMonitor {
    pub fn new(
        initial_battery_percent: f64,
        max_solar_output_w: f64,
        base_consumption_w: f64,
    ) -> Self {
        Self {
            state: RwLock::new(SimState {
                battery_level: initial_battery_percent.clamp(0.0, 100.0),
                is_processing: false,
            }),
            max_solar_output_w,
            base_consumption_w,
            processing_consumption_w: 5.0,
            capacity_wh: 37.0,
            fixed_solar_output_w: None,
        }
    }

    pub fn with_fixed_solar(mut self, watts: f64) -> Self {
        self.fixed_solar_output_w = Some(watts);
        self
    }

    pub fn with_capacity_wh(mut self, capacity_wh: f64) -> Self {
        self.capacity_wh = capacity_wh;
        self
    }

    pub fn with_processing_consumption(mut self, watts: f64) -> Self {
        self.processing_consumption_w = watts;
        self
    }

    pub async fn charge(&self, amount_percent: f64) {
        let mut state = self.state.write().await;
        state.battery_level = (state.battery_level + amount_percent).clamp(0.0, 100.0);
    }

    pub async fn discharge(&self, amount_percent: f64) {
        let mut state = self.state.write().await;
        state.battery_level = (state.battery_level - amount_percent).clamp(0.0, 100.0);
    }

    fn solar_now(&self) -> f64 {
        if let Some(fixed) = self.fixed_solar_output_w {
            return fixed;
        }
        let hour = Local::now().hour();
        let clear_sky = daylight_output(hour, self.max_solar_output_w);
        if clear_sky <= 0.0 {
            return 0.0;
        }
        let cloud_factor = rand::thread_rng().gen_range(0.7..=1.0);
        clear_sky * cloud_factor
    }
}

#[async_trait]
impl PowerMonitor for SimulatedPowerMonitor {
    async fn current_reading(&self) -> PowerReading {
        let state = self.state.read().await;
        let consumption = if state.is_processing {
            self.processing_consumption_w
        } else {
            self.base_consumption_w
        };
        PowerReading {
            timestamp: Utc::now(),
            voltage: 3.7 + state.battery_level / 100.0 * 0.8,
            current: if state.is_processing { 1.0 } else { 0.4 },
            power: self.solar_now(),
            consumption,
            temperature: 25.0 + rand::thread_rng().gen_range(-2.0..=2.0),
        }
    }

    async fn battery_level(&self) -> f64 {
        self.state.read().await.battery_level
    }

    async fn predict(&self, hours_ahead: usize) -> Vec<ForecastEntry> {
        let battery = self.battery_level().await;
        let start_hour = Local::now().hour();
        project_availability(
            start_hour,
            hours_ahead,
            battery,
            self.base_consumption_w,
            self.capacity_wh,
            |hour| {
                self.fixed_solar_output_w
                    .unwrap_or_else(|| daylight_output(hour, self.max_solar_output_w))
            },
        )
    }

    async fn status(&self) -> PowerStatus {
        let reading = self.current_reading().await;
        PowerStatus {
            battery_level: self.battery_level().await,
            solar_output: reading.power,
            consumption: reading.consumption,
            temperature: reading.temperature,
            timestamp: reading.timestamp,
        }
    }

    async fn set_processing(&self, processing: bool) {
        self.state.write().await.is_processing = processing;
    }

    async fn note_energy_used(&self, duration: Duration, watts: f64) {
        let energy_wh = watts * duration.as_secs_f64() / 3600.0;
        let percent_used = energy_wh / self.capacity_wh.max(0.1) * 100.0;
        self.discharge(percent_used).await;
    }

    fn kind(&self) -> &'static str {
        "simulated"
    }
}
