//! Inference backends: the contract the scheduler drives, a mock for
//! development and tests, and a llama.cpp subprocess wrapper.

pub mod llama;
pub mod mock;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{InferenceConfig, InferenceMode};
use crate::domain::PowerMonitor;

pub use llama::LlamaInferenceEngine;
pub use mock::MockInferenceEngine;

/// Marker appended when a generation was cut short by low battery.
pub const TRUNCATION_MARKER: &str =
    "\n[Note: Response may have been truncated due to low power]";

/// Battery percentage at which a running generation is terminated.
pub const GENERATION_CUTOFF_PERCENT: f64 = 20.0;

/// Estimated draw while generating, in watts.
pub(crate) const PROCESSING_DRAW_W: f64 = 5.0;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inference process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("inference process exited with {status}: {stderr}")]
    Exited { status: std::process::ExitStatus, stderr: String },
}

/// Opaque "prompt in, text out" worker. Generation may block for a long
/// time; a power watchdog may cut it short, in which case the returned text
/// is partial and carries [`TRUNCATION_MARKER`].
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: Option<u32>)
        -> Result<String, EngineError>;
}

/// Response budget for the current battery level. Monotonically
/// non-decreasing in battery.
pub fn max_tokens_for(battery_percent: f64) -> u32 {
    if battery_percent > 80.0 {
        2048
    } else if battery_percent > 50.0 {
        1024
    } else if battery_percent > 30.0 {
        512
    } else {
        256
    }
}

/// Rough token estimate: about four characters per token, at least one for
/// non-empty text.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    ((text.len() / 4) as u32).max(1)
}

/// Build the configured engine. A llama backend that cannot be constructed
/// (missing binary or model) logs the problem and falls back to the mock so
/// the broker stays serviceable.
pub fn build_engine(
    cfg: &InferenceConfig,
    monitor: Option<Arc<dyn PowerMonitor>>,
) -> Arc<dyn InferenceEngine> {
    match cfg.mode {
        InferenceMode::Mock => {
            info!("using mock inference engine");
            Arc::new(MockInferenceEngine::new(monitor, cfg.processing_speed_tps))
        }
        InferenceMode::Llama => match (&cfg.binary_path, &cfg.model_path) {
            (Some(binary), Some(model)) => {
                match LlamaInferenceEngine::new(
                    binary.clone(),
                    model.clone(),
                    cfg.context_size,
                    cfg.temperature,
                    monitor.clone(),
                ) {
                    Ok(engine) => {
                        info!(binary = %binary.display(), model = %model.display(), "using llama inference engine");
                        Arc::new(engine)
                    }
                    Err(e) => {
                        warn!(error = %e, "llama engine unavailable, falling back to mock");
                        Arc::new(MockInferenceEngine::new(monitor, cfg.processing_speed_tps))
                    }
                }
            }
            _ => {
                warn!("llama mode needs binary_path and model_path, falling back to mock");
                Arc::new(MockInferenceEngine::new(monitor, cfg.processing_speed_tps))
            }
        },
    }
}
