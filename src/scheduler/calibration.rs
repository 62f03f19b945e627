//! Cost-calibration model: translates prompt size into expected watts and
//! seconds, and learns from every completed generation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// EWMA weights for calibration updates: 90% history, 10% observation.
const KEEP_WEIGHT: f64 = 0.9;
const OBSERVE_WEIGHT: f64 = 0.1;

/// Fallback processing estimate when the speed parameter is degenerate.
const FALLBACK_PROCESSING_SECS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    /// Idle draw in watts.
    pub base_power: f64,
    /// Additional watts per token.
    pub token_processing_power: f64,
    pub tokens_per_second: f64,
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self {
            base_power: 2.0,
            token_processing_power: 0.05,
            tokens_per_second: 10.0,
        }
    }
}

impl CalibrationModel {
    /// Read the persisted model, falling back to defaults on a missing or
    /// unreadable file.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(model) => model,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt calibration data, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read calibration data, using defaults");
                Self::default()
            }
        }
    }

    /// Predicted average draw for a job of `tokens` tokens.
    pub fn estimate_power(&self, tokens: u32) -> f64 {
        self.base_power + tokens as f64 * self.token_processing_power
    }

    /// Predicted wall-clock seconds to process `tokens` tokens.
    pub fn estimate_processing_secs(&self, tokens: u32) -> f64 {
        if self.tokens_per_second > 0.0 {
            tokens as f64 / self.tokens_per_second
        } else {
            FALLBACK_PROCESSING_SECS
        }
    }

    /// Fold one observed generation into the model. Returns false (and leaves
    /// the model untouched) when the observation carries no information.
    pub fn absorb(&mut self, elapsed_secs: f64, avg_power_w: f64, total_tokens: u32) -> bool {
        if elapsed_secs <= 0.0 || total_tokens == 0 {
            return false;
        }
        let observed_tps = total_tokens as f64 / elapsed_secs;
        let observed_tpp = (avg_power_w - self.base_power) / total_tokens as f64;

        self.tokens_per_second =
            self.tokens_per_second * KEEP_WEIGHT + observed_tps * OBSERVE_WEIGHT;
        self.token_processing_power =
            self.token_processing_power * KEEP_WEIGHT + observed_tpp * OBSERVE_WEIGHT;
        true
    }
}
