//! Power monitor backends and the factory that selects one from config.

pub mod tc66;

use std::sync::Arc;
use tracing::warn;

use crate::config::{PowerConfig, PowerMode};
use crate::domain::{PowerMonitor, SimulatedPowerMonitor};

/// The monitor behind its capability trait, plus the concrete simulator when
/// one backs it (the diagnostic charge/discharge hooks need the real type).
pub struct MonitorHandle {
    pub monitor: Arc<dyn PowerMonitor>,
    pub simulator: Option<Arc<SimulatedPowerMonitor>>,
}

/// Build the configured monitor. A TC66 that cannot be reached at startup
/// logs the failure and falls back to the simulator rather than aborting.
pub async fn build_monitor(cfg: &PowerConfig) -> MonitorHandle {
    match cfg.mode {
        PowerMode::Simulated => simulated_handle(cfg),
        PowerMode::Tc66 => {
            #[cfg(feature = "serial")]
            {
                match tc66::Tc66PowerMonitor::connect(cfg).await {
                    Ok(monitor) => {
                        return MonitorHandle {
                            monitor: Arc::new(monitor),
                            simulator: None,
                        };
                    }
                    Err(e) => {
                        warn!(
                            port = %cfg.serial_port,
                            error = %e,
                            "failed to initialize TC66 monitor, falling back to simulated"
                        );
                    }
                }
            }
            #[cfg(not(feature = "serial"))]
            warn!("tc66 mode requires the 'serial' feature, falling back to simulated");

            simulated_handle(cfg)
        }
    }
}

fn simulated_handle(cfg: &PowerConfig) -> MonitorHandle {
    let simulator = Arc::new(
        SimulatedPowerMonitor::new(
            cfg.initial_battery_percent,
            cfg.max_solar_output_w,
            cfg.base_consumption_w,
        )
        .with_capacity_wh(cfg.battery_capacity_wh())
        .with_processing_consumption(cfg.processing_consumption_w),
    );
    MonitorHandle {
        monitor: simulator.clone(),
        simulator: Some(simulator),
    }
}
