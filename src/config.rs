use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub queue: QueueConfig,

    #[validate(nested)]
    pub power: PowerConfig,

    #[validate(nested)]
    pub inference: InferenceConfig,

    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// Request store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct QueueConfig {
    /// SQLite database file; ":memory:" is accepted for tests.
    #[validate(length(min = 1))]
    pub db_path: String,
}

/// Which power monitor backend to use
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerMode {
    Simulated,
    Tc66,
}

/// Power monitor configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PowerConfig {
    #[serde(default = "default_power_mode")]
    pub mode: PowerMode,

    #[serde(default = "default_serial_port")]
    pub serial_port: String,

    #[serde(default = "default_base_consumption_w")]
    #[validate(range(min = 0.1, max = 100.0))]
    pub base_consumption_w: f64,

    #[serde(default = "default_processing_consumption_w")]
    #[validate(range(min = 0.1, max = 200.0))]
    pub processing_consumption_w: f64,

    #[serde(default = "default_max_solar_output_w")]
    #[validate(range(min = 1.0, max = 1000.0))]
    pub max_solar_output_w: f64,

    #[serde(default = "default_battery_capacity_mah")]
    #[validate(range(min = 100.0, max = 1000000.0))]
    pub battery_capacity_mah: f64,

    #[serde(default = "default_battery_voltage_v")]
    #[validate(range(min = 1.0, max = 60.0))]
    pub battery_voltage_v: f64,

    #[serde(default = "default_initial_battery_percent")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub initial_battery_percent: f64,

    #[serde(default = "default_reading_cache_ttl_secs")]
    pub reading_cache_ttl_secs: u64,

    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
}

impl PowerConfig {
    /// Usable pack capacity in watt-hours (mAh at nominal cell voltage).
    pub fn battery_capacity_wh(&self) -> f64 {
        self.battery_capacity_mah / 1000.0 * self.battery_voltage_v
    }
}

/// Which inference backend to use
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    Mock,
    Llama,
}

/// Inference engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_mode")]
    pub mode: InferenceMode,

    /// Path to the llama.cpp-style inference binary.
    #[serde(default)]
    pub binary_path: Option<PathBuf>,

    /// Path to the GGUF model file.
    #[serde(default)]
    pub model_path: Option<PathBuf>,

    #[serde(default = "default_context_size")]
    #[validate(range(min = 128, max = 32768))]
    pub context_size: u32,

    #[serde(default = "default_temperature")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f64,

    /// Simulated generation speed for the mock engine.
    #[serde(default = "default_processing_speed_tps")]
    #[validate(range(min = 0.1, max = 10000.0))]
    pub processing_speed_tps: f64,
}

/// Scheduler loop configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    /// Skip forecast-based deferral and run jobs as soon as battery permits.
    #[serde(default)]
    pub immediate_mode: bool,

    #[serde(default = "default_idle_sleep_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub idle_sleep_secs: u64,

    #[serde(default = "default_low_battery_sleep_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub low_battery_sleep_secs: u64,

    #[serde(default = "default_calibration_path")]
    pub calibration_path: PathBuf,
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

// Default value functions
fn default_power_mode() -> PowerMode { PowerMode::Simulated }
fn default_serial_port() -> String { "/dev/ttyACM0".to_string() }
fn default_base_consumption_w() -> f64 { 2.0 }
fn default_processing_consumption_w() -> f64 { 5.0 }
fn default_max_solar_output_w() -> f64 { 30.0 }
fn default_battery_capacity_mah() -> f64 { 10000.0 }
fn default_battery_voltage_v() -> f64 { 3.7 }
fn default_initial_battery_percent() -> f64 { 75.0 }
fn default_reading_cache_ttl_secs() -> u64 { 5 }
fn default_history_path() -> PathBuf { PathBuf::from("power_history.json") }
fn default_inference_mode() -> InferenceMode { InferenceMode::Mock }
fn default_context_size() -> u32 { 2048 }
fn default_temperature() -> f64 { 0.7 }
fn default_processing_speed_tps() -> f64 { 10.0 }
fn default_idle_sleep_secs() -> u64 { 10 }
fn default_low_battery_sleep_secs() -> u64 { 30 }
fn default_calibration_path() -> PathBuf { PathBuf::from("power_calibration_data.json") }
fn default_log_level() -> String { "info".to_string() }

impl AppConfig {
    /// Load configuration from TOML files and environment variables
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml (base configuration)
    /// 2. config/<environment>.toml when an environment name is given
    /// 3. Environment variables with SLB__ prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    /// Load configuration with a specific environment override
    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            let env_file = format!("config/{}.toml", env);
            figment = figment.merge(Toml::file(env_file));
        }

        // Override with environment variables (SLB__POWER__MODE -> power.mode)
        figment = figment.merge(Env::prefixed("SLB__").split("__"));

        let config: AppConfig = figment
            .extract()
            .context("Failed to parse configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            queue: QueueConfig {
                db_path: ":memory:".to_string(),
            },
            power: PowerConfig {
                mode: PowerMode::Simulated,
                serial_port: default_serial_port(),
                base_consumption_w: 2.0,
                processing_consumption_w: 5.0,
                max_solar_output_w: 30.0,
                battery_capacity_mah: 10000.0,
                battery_voltage_v: 3.7,
                initial_battery_percent: 75.0,
                reading_cache_ttl_secs: 5,
                history_path: default_history_path(),
            },
            inference: InferenceConfig {
                mode: InferenceMode::Mock,
                binary_path: None,
                model_path: None,
                context_size: 2048,
                temperature: 0.7,
                processing_speed_tps: 10.0,
            },
            scheduler: SchedulerConfig {
                immediate_mode: false,
                idle_sleep_secs: 10,
                low_battery_sleep_secs: 30,
                calibration_path: default_calibration_path(),
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_json: false,
            },
        }
    }

    #[test]
    fn server_config_socket_addr() {
        let config = base_config();
        let addr = config.server.socket_addr().unwrap();
        assert_eq!(addr.port(), 5000);
    }

    #[test]
    fn battery_capacity_derives_watt_hours() {
        let config = base_config();
        assert!((config.power.battery_capacity_wh() - 37.0).abs() < f64::EPSILON);
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn out_of_range_battery_percent_fails_validation() {
        let mut config = base_config();
        config.power.initial_battery_percent = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn power_mode_deserializes_lowercase() {
        let mode: PowerMode = serde_json::from_str(r#""tc66""#).unwrap();
        assert_eq!(mode, PowerMode::Tc66);
        let mode: PowerMode = serde_json::from_str(r#""simulated""#).unwrap();
        assert_eq!(mode, PowerMode::Simulated);
    }
}
