//! Self-calibrating per-hour solar pattern.
//!
//! Each fresh meter reading feeds an exponentially weighted moving average of
//! harvested watts for its wall-clock hour. The pattern is persisted every
//! tenth update so forecasts survive restarts.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::domain::daylight_output;

/// EWMA weights: 95% history, 5% fresh observation.
const KEEP_WEIGHT: f64 = 0.95;
const OBSERVE_WEIGHT: f64 = 0.05;

const SAVE_EVERY: u32 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    daily_solar_patterns: BTreeMap<String, f64>,
    last_updated: f64,
}

struct HistoryState {
    /// Observed watts per wall-clock hour; unobserved hours stay absent so
    /// forecasts fall back to the daylight approximation.
    patterns: [Option<f64>; 24],
    updates_since_save: u32,
}

pub struct SolarHistory {
    state: Mutex<HistoryState>,
    path: PathBuf,
}

impl SolarHistory {
    /// Load the persisted pattern, or start empty on a missing or unreadable
    /// file.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut patterns = [None; 24];

        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HistoryFile>(&raw) {
                Ok(file) => {
                    for (key, watts) in file.daily_solar_patterns {
                        if let Ok(hour) = key.parse::<usize>() {
                            if hour < 24 {
                                patterns[hour] = Some(watts);
                            }
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "corrupt power history, starting fresh"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not read power history"),
        }

        Self {
            state: Mutex::new(HistoryState {
                patterns,
                updates_since_save: 0,
            }),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fold a fresh observation into the pattern for `hour`. Returns the
    /// serialized file when a save is due, so the caller can persist it off
    /// the lock.
    pub fn observe(&self, hour: u32, watts: f64) -> Option<String> {
        let mut state = self.state.lock();
        let slot = &mut state.patterns[(hour % 24) as usize];
        *slot = Some(match *slot {
            Some(old) => old * KEEP_WEIGHT + watts * OBSERVE_WEIGHT,
            None => watts,
        });

        state.updates_since_save += 1;
        if state.updates_since_save >= SAVE_EVERY {
            state.updates_since_save = 0;
            Some(Self::serialize(&state.patterns))
        } else {
            None
        }
    }

    /// Expected watts for a wall-clock hour: the learned pattern when
    /// present, the deterministic daylight curve otherwise.
    pub fn estimate(&self, hour: u32, max_solar_output_w: f64) -> f64 {
        let state = self.state.lock();
        state.patterns[(hour % 24) as usize]
            .unwrap_or_else(|| daylight_output(hour % 24, max_solar_output_w))
    }

    fn serialize(patterns: &[Option<f64>; 24]) -> String {
        let daily_solar_patterns = patterns
            .iter()
            .enumerate()
            .filter_map(|(hour, watts)| watts.map(|w| (hour.to_string(), w)))
            .collect();
        let file = HistoryFile {
            daily_solar_patterns,
            last_updated: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };
        // BTreeMap of string keys and floats cannot fail to serialize.
        serde_json::to_string(&file).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_seeds_the_slot() {
        let history = SolarHistory::load("/nonexistent/power_history.json");
        history.observe(10, 14.0);
        assert_eq!(history.estimate(10, 30.0), 14.0);
    }

    #[test]
    fn observations_decay_exponentially() {
        let history = SolarHistory::load("/nonexistent/power_history.json");
        history.observe(12, 20.0);
        history.observe(12, 10.0);
        assert!((history.estimate(12, 30.0) - (20.0 * 0.95 + 10.0 * 0.05)).abs() < 1e-9);
    }

    #[test]
    fn unobserved_hours_use_daylight_fallback() {
        let history = SolarHistory::load("/nonexistent/power_history.json");
        assert_eq!(history.estimate(12, 30.0), 30.0);
        assert_eq!(history.estimate(3, 30.0), 0.0);
    }

    #[test]
    fn save_is_due_every_tenth_update() {
        let history = SolarHistory::load("/nonexistent/power_history.json");
        for i in 1..=25 {
            let due = history.observe(8, 12.0).is_some();
            assert_eq!(due, i % 10 == 0, "update {}", i);
        }
    }

    #[test]
    fn pattern_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power_history.json");

        let history = SolarHistory::load(&path);
        let mut payload = None;
        for _ in 0..10 {
            payload = history.observe(9, 18.0).or(payload);
        }
        std::fs::write(&path, payload.expect("save due")).unwrap();

        let reloaded = SolarHistory::load(&path);
        assert!((reloaded.estimate(9, 30.0) - history.estimate(9, 30.0)).abs() < 1e-9);
        // Hours that were never observed still fall back after a reload.
        assert_eq!(reloaded.estimate(12, 30.0), 30.0);
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("power_history.json");
        std::fs::write(&path, "{ not json").unwrap();

        let history = SolarHistory::load(&path);
        assert_eq!(history.estimate(12, 30.0), 30.0);
    }
}
