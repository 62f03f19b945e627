//! Mock engine: canned or pseudo-random output with a synthetic duration, so
//! the full scheduling pipeline can run without a model.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use super::{max_tokens_for, EngineError, InferenceEngine, PROCESSING_DRAW_W};
use crate::domain::PowerMonitor;

const CANNED_RESPONSES: &[(&str, &str)] = &[
    ("hello", "Hello! How can I assist you today?"),
    ("time", "I'm sorry, I don't have access to the current time."),
    ("weather", "I don't have access to weather information."),
    (
        "help",
        "I'm a simulated model for exercising the solar-powered inference pipeline.",
    ),
];

pub struct MockInferenceEngine {
    monitor: Option<Arc<dyn PowerMonitor>>,
    /// Simulated generation speed in tokens per second.
    processing_speed_tps: f64,
}

impl MockInferenceEngine {
    pub fn new(monitor: Option<Arc<dyn PowerMonitor>>, processing_speed_tps: f64) -> Self {
        Self {
            monitor,
            processing_speed_tps: processing_speed_tps.max(0.1),
        }
    }

    fn compose_response(&self, prompt: &str, budget: u32) -> String {
        let lowered = prompt.to_lowercase();
        for (trigger, response) in CANNED_RESPONSES {
            if lowered.contains(trigger) {
                return truncate_words(response, budget as usize);
            }
        }

        let mut rng = rand::thread_rng();
        let word_count = rng.gen_range(20..=50).min(budget as usize).max(1);
        let words: Vec<String> = (0..word_count)
            .map(|_| {
                let len = rng.gen_range(3..=10);
                (0..len)
                    .map(|_| rng.gen_range(b'a'..=b'z') as char)
                    .collect()
            })
            .collect();
        let preview: String = prompt.chars().take(30).collect();
        format!("Mock response to: {}...\n\n{}", preview, words.join(" "))
    }
}

fn truncate_words(text: &str, budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= budget {
        return text.to_string();
    }
    format!("{}...", words[..budget].join(" "))
}

#[async_trait]
impl InferenceEngine for MockInferenceEngine {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
    ) -> Result<String, EngineError> {
        let budget = match max_tokens {
            Some(n) => n,
            None => match &self.monitor {
                Some(monitor) => max_tokens_for(monitor.battery_level().await),
                None => 1024,
            },
        };

        let response = self.compose_response(prompt, budget);
        let tokens = response.split_whitespace().count();
        let duration = Duration::from_secs_f64(tokens as f64 / self.processing_speed_tps);

        let started = Instant::now();
        if let Some(monitor) = &self.monitor {
            monitor.set_processing(true).await;
        }
        tokio::time::sleep(duration).await;
        if let Some(monitor) = &self.monitor {
            monitor
                .note_energy_used(started.elapsed(), PROCESSING_DRAW_W)
                .await;
            monitor.set_processing(false).await;
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SimulatedPowerMonitor;

    fn fast_engine(monitor: Option<Arc<dyn PowerMonitor>>) -> MockInferenceEngine {
        MockInferenceEngine::new(monitor, 10_000.0)
    }

    #[tokio::test]
    async fn canned_response_matches_trigger() {
        let engine = fast_engine(None);
        let response = engine.generate("hello there", None).await.unwrap();
        assert!(response.contains("Hello"));

        let response = engine.generate("what is the WEATHER", None).await.unwrap();
        assert!(response.contains("weather information"));
    }

    #[tokio::test]
    async fn unmatched_prompt_gets_generated_text() {
        let engine = fast_engine(None);
        let response = engine.generate("explain entropy", None).await.unwrap();
        assert!(response.starts_with("Mock response to: explain entropy"));
    }

    #[tokio::test]
    async fn budget_truncates_canned_output() {
        let engine = fast_engine(None);
        let response = engine.generate("hello", Some(3)).await.unwrap();
        assert_eq!(response, "Hello! How can...");
    }

    #[tokio::test]
    async fn generation_discharges_simulated_battery() {
        let monitor = Arc::new(SimulatedPowerMonitor::new(50.0, 30.0, 2.0));
        let engine = MockInferenceEngine::new(Some(monitor.clone()), 100.0);
        engine.generate("hello", None).await.unwrap();
        assert!(monitor.battery_level().await < 50.0);
        // Processing flag is reset once generation ends.
        assert_eq!(monitor.current_reading().await.consumption, 2.0);
    }
}
