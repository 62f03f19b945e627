//! Power monitor backed by a serial-attached TC66 USB-C meter.

use async_trait::async_trait;
use chrono::{Local, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::frame::{decode_frame, MeterFrame, FRAME_LEN, READ_COMMAND};
use super::history::SolarHistory;
use crate::config::PowerConfig;
use crate::domain::{
    project_availability, ForecastEntry, PowerMonitor, PowerReading, PowerStatus,
};

const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Li-ion cell voltage window used for the linear battery estimate.
const EMPTY_CELL_V: f64 = 3.3;
const FULL_CELL_V: f64 = 4.2;

struct ReadingCache {
    reading: PowerReading,
    taken_at: Instant,
}

pub struct Tc66PowerMonitor {
    transport: Mutex<SerialStream>,
    cache: Mutex<Option<ReadingCache>>,
    history: SolarHistory,
    is_processing: AtomicBool,
    cache_ttl: Duration,
    base_consumption_w: f64,
    processing_consumption_w: f64,
    max_solar_output_w: f64,
    capacity_wh: f64,
    /// Baseline for synthetic readings before the first successful poll.
    initial_battery_percent: f64,
}

impl Tc66PowerMonitor {
    /// Open the serial port and verify the meter responds.
    pub async fn connect(cfg: &PowerConfig) -> anyhow::Result<Self> {
        let stream = tokio_serial::new(&cfg.serial_port, BAUD_RATE).open_native_async()?;
        let monitor = Self {
            transport: Mutex::new(stream),
            cache: Mutex::new(None),
            history: SolarHistory::load(&cfg.history_path),
            is_processing: AtomicBool::new(false),
            cache_ttl: Duration::from_secs(cfg.reading_cache_ttl_secs),
            base_consumption_w: cfg.base_consumption_w,
            processing_consumption_w: cfg.processing_consumption_w,
            max_solar_output_w: cfg.max_solar_output_w,
            capacity_wh: cfg.battery_capacity_wh(),
            initial_battery_percent: cfg.initial_battery_percent,
        };

        let probe = monitor.read_meter().await?;
        info!(
            port = %cfg.serial_port,
            voltage = probe.voltage,
            power = probe.power,
            "TC66 meter responding"
        );
        Ok(monitor)
    }

    async fn read_meter(&self) -> anyhow::Result<MeterFrame> {
        let mut port = self.transport.lock().await;
        port.write_all(READ_COMMAND).await?;
        let mut raw = [0u8; FRAME_LEN];
        timeout(READ_TIMEOUT, port.read_exact(&mut raw)).await??;
        Ok(decode_frame(&raw)?)
    }

    fn consumption_estimate(&self) -> f64 {
        if self.is_processing.load(Ordering::Relaxed) {
            self.processing_consumption_w
        } else {
            self.base_consumption_w
        }
    }

    /// Synthetic reading when the meter has never answered: battery from the
    /// configured starting point, solar from the learned pattern.
    fn fallback_reading(&self) -> PowerReading {
        let hour = Local::now().hour();
        PowerReading {
            timestamp: Utc::now(),
            voltage: 3.7 + self.initial_battery_percent / 100.0 * 0.8,
            current: if self.is_processing.load(Ordering::Relaxed) { 1.0 } else { 0.4 },
            power: self.history.estimate(hour, self.max_solar_output_w),
            consumption: self.consumption_estimate(),
            temperature: 25.0,
        }
    }

    fn battery_from_voltage(voltage: f64) -> f64 {
        let clamped = voltage.clamp(EMPTY_CELL_V, FULL_CELL_V);
        let percent = (clamped - EMPTY_CELL_V) / (FULL_CELL_V - EMPTY_CELL_V) * 100.0;
        (percent * 10.0).round() / 10.0
    }
}

#[async_trait]
impl PowerMonitor for Tc66PowerMonitor {
    async fn current_reading(&self) -> PowerReading {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.taken_at.elapsed() < self.cache_ttl {
                return cached.reading.clone();
            }
        }

        match self.read_meter().await {
            Ok(frame) => {
                let reading = PowerReading {
                    timestamp: Utc::now(),
                    voltage: frame.voltage,
                    current: frame.current,
                    power: frame.power,
                    consumption: self.consumption_estimate(),
                    temperature: frame.temperature,
                };
                *cache = Some(ReadingCache {
                    reading: reading.clone(),
                    taken_at: Instant::now(),
                });
                drop(cache);

                if let Some(payload) = self.history.observe(Local::now().hour(), frame.power) {
                    let path = self.history.path().to_path_buf();
                    tokio::spawn(async move {
                        if let Err(e) = tokio::fs::write(&path, payload).await {
                            warn!(path = %path.display(), error = %e, "failed to persist power history");
                        }
                    });
                }
                reading
            }
            Err(e) => {
                warn!(error = %e, "TC66 read failed, using fallback values");
                match cache.as_ref() {
                    // Last good reading with a refreshed timestamp.
                    Some(cached) => PowerReading {
                        timestamp: Utc::now(),
                        consumption: self.consumption_estimate(),
                        ..cached.reading.clone()
                    },
                    None => self.fallback_reading(),
                }
            }
        }
    }

    async fn battery_level(&self) -> f64 {
        Self::battery_from_voltage(self.current_reading().await.voltage)
    }

    async fn predict(&self, hours_ahead: usize) -> Vec<ForecastEntry> {
        let battery = self.battery_level().await;
        project_availability(
            Local::now().hour(),
            hours_ahead,
            battery,
            self.base_consumption_w,
            self.capacity_wh,
            |hour| self.history.estimate(hour, self.max_solar_output_w),
        )
    }

    async fn status(&self) -> PowerStatus {
        let reading = self.current_reading().await;
        PowerStatus {
            battery_level: Self::battery_from_voltage(reading.voltage),
            solar_output: reading.power,
            consumption: reading.consumption,
            temperature: reading.temperature,
            timestamp: reading.timestamp,
        }
    }

    async fn set_processing(&self, processing: bool) {
        self.is_processing.store(processing, Ordering::Relaxed);
    }

    async fn note_energy_used(&self, duration: Duration, watts: f64) {
        // The battery estimate comes from measured cell voltage; modeled
        // draw-down would only fight it.
        debug!(
            seconds = duration.as_secs_f64(),
            watts, "energy accounting ignored by voltage-backed monitor"
        );
    }

    fn kind(&self) -> &'static str {
        "tc66"
    }
}
