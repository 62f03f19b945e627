//! Inference backend that drives a llama.cpp-style binary as a child
//! process, with a battery watchdog that cuts long generations short.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, warn};

use super::{
    max_tokens_for, EngineError, InferenceEngine, GENERATION_CUTOFF_PERCENT,
    PROCESSING_DRAW_W, TRUNCATION_MARKER,
};
use crate::domain::PowerMonitor;

/// Grace period between the kill signal and a forced shutdown.
const KILL_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_WATCHDOG_POLL: Duration = Duration::from_secs(5);

pub struct LlamaInferenceEngine {
    binary_path: PathBuf,
    model_path: PathBuf,
    context_size: u32,
    temperature: f64,
    monitor: Option<Arc<dyn PowerMonitor>>,
    watchdog_poll: Duration,
}

impl std::fmt::Debug for LlamaInferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaInferenceEngine")
            .field("binary_path", &self.binary_path)
            .field("model_path", &self.model_path)
            .field("context_size", &self.context_size)
            .field("temperature", &self.temperature)
            .field("monitor", &self.monitor.as_ref().map(|_| "<dyn PowerMonitor>"))
            .field("watchdog_poll", &self.watchdog_poll)
            .finish()
    }
}

impl LlamaInferenceEngine {
    pub fn new(
        binary_path: PathBuf,
        model_path: PathBuf,
        context_size: u32,
        temperature: f64,
        monitor: Option<Arc<dyn PowerMonitor>>,
    ) -> anyhow::Result<Self> {
        if !model_path.is_file() {
            anyhow::bail!("model file not found: {}", model_path.display());
        }
        if !binary_path.is_file() {
            anyhow::bail!("inference binary not found: {}", binary_path.display());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&binary_path)?.permissions().mode();
            if mode & 0o111 == 0 {
                anyhow::bail!(
                    "inference binary is not executable: {}",
                    binary_path.display()
                );
            }
        }

        Ok(Self {
            binary_path,
            model_path,
            context_size,
            temperature,
            monitor,
            watchdog_poll: DEFAULT_WATCHDOG_POLL,
        })
    }

    fn command(&self, prompt: &str, max_tokens: u32) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(prompt)
            .arg("--ctx_size")
            .arg(self.context_size.to_string())
            .arg("--temp")
            .arg(self.temperature.to_string())
            .arg("--n_predict")
            .arg(max_tokens.to_string())
            // Disable memory mapping for predictable power usage.
            .arg("--no-mmap");
        cmd
    }
}

#[async_trait]
impl InferenceEngine for LlamaInferenceEngine {
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

        debug!(budget, "starting llama generation");
        let started = Instant::now();
        if let Some(monitor) = &self.monitor {
            monitor.set_processing(true).await;
        }

        let result = run_supervised(
            self.command(prompt, budget),
            self.monitor.clone(),
            self.watchdog_poll,
        )
        .await;

        if let Some(monitor) = &self.monitor {
            monitor
                .note_energy_used(started.elapsed(), PROCESSING_DRAW_W)
                .await;
            monitor.set_processing(false).await;
        }

        let outcome = result?;
        if outcome.power_truncated {
            warn!("generation terminated by low battery");
            let mut response = clean_response(&outcome.stdout, prompt);
            response.push_str(TRUNCATION_MARKER);
            return Ok(response);
        }
        if !outcome.status.success() {
            return Err(EngineError::Exited {
                status: outcome.status,
                stderr: outcome.stderr.trim().to_string(),
            });
        }
        Ok(clean_response(&outcome.stdout, prompt))
    }
}

pub(crate) struct ChildOutcome {
    pub stdout: String,
    pub stderr: String,
    /// True when the watchdog terminated the child on low battery.
    pub power_truncated: bool,
    pub status: ExitStatus,
}

/// Run the child to completion while a watchdog observes battery level.
///
/// The watchdog only signals; this function is the sole reaper of the child.
/// On a low-power signal the child is killed, waited on for at most
/// [`KILL_GRACE`], and whatever output it produced is kept.
pub(crate) async fn run_supervised(
    mut cmd: Command,
    monitor: Option<Arc<dyn PowerMonitor>>,
    watchdog_poll: Duration,
) -> Result<ChildOutcome, EngineError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        EngineError::Io(std::io::Error::other("child stdout was not captured"))
    })?;
    let stderr = child.stderr.take();

    let low_power = Arc::new(Notify::new());
    let watchdog = monitor.map(|monitor| {
        let low_power = Arc::clone(&low_power);
        tokio::spawn(async move {
            loop {
                if monitor.battery_level().await < GENERATION_CUTOFF_PERCENT {
                    low_power.notify_one();
                    break;
                }
                tokio::time::sleep(watchdog_poll).await;
            }
        })
    });

    let mut output = Vec::new();
    let mut chunk = [0u8; 4096];
    let (power_truncated, status) = loop {
        tokio::select! {
            read = stdout.read(&mut chunk) => {
                match read? {
                    0 => break (false, child.wait().await?),
                    n => output.extend_from_slice(&chunk[..n]),
                }
            }
            _ = low_power.notified() => {
                let _ = child.start_kill();
                let status = match timeout(KILL_GRACE, child.wait()).await {
                    Ok(waited) => waited?,
                    Err(_) => {
                        child.kill().await?;
                        child.wait().await?
                    }
                };
                // Keep whatever made it into the pipe before the kill.
                let _ = timeout(Duration::from_secs(1), async {
                    let mut rest = Vec::new();
                    let _ = stdout.read_to_end(&mut rest).await;
                    output.extend_from_slice(&rest);
                })
                .await;
                break (true, status);
            }
        }
    };

    if let Some(handle) = watchdog {
        handle.abort();
    }

    let mut stderr_buf = String::new();
    if let Some(mut stderr) = stderr {
        let _ = timeout(Duration::from_secs(1), stderr.read_to_string(&mut stderr_buf)).await;
    }

    Ok(ChildOutcome {
        stdout: String::from_utf8_lossy(&output).into_owned(),
        stderr: stderr_buf,
        power_truncated,
        status,
    })
}

/// Strip the echoed prompt and end-of-sequence tokens from raw output.
fn clean_response(output: &str, prompt: &str) -> String {
    let tail = if prompt.is_empty() {
        output
    } else {
        match output.split_once(prompt) {
            Some((_, rest)) => rest,
            None => output,
        }
    };
    tail.replace("<end>", "").replace("<eos>", "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SimulatedPowerMonitor;

    #[test]
    fn clean_response_strips_prompt_echo_and_tokens() {
        let raw = "what is the sun? The sun is a star.<eos>";
        assert_eq!(
            clean_response(raw, "what is the sun?"),
            "The sun is a star."
        );
        assert_eq!(clean_response("plain output<end>", "missing"), "plain output");
        assert_eq!(clean_response("  spaced  ", ""), "spaced");
    }

    #[test]
    fn constructor_rejects_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"stub").unwrap();

        let err = LlamaInferenceEngine::new(
            dir.path().join("missing-binary"),
            model.clone(),
            2048,
            0.7,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("binary"));

        let err = LlamaInferenceEngine::new(
            model.clone(),
            dir.path().join("missing-model.gguf"),
            2048,
            0.7,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("model"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_runs_to_completion_without_monitor() {
        let mut cmd = Command::new("echo");
        cmd.arg("forty-two");
        let outcome = run_supervised(cmd, None, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(outcome.status.success());
        assert!(!outcome.power_truncated);
        assert!(outcome.stdout.contains("forty-two"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn watchdog_kills_child_when_battery_is_low() {
        // Battery already below the cutoff: termination should be prompt.
        let monitor: Arc<dyn crate::domain::PowerMonitor> =
            Arc::new(SimulatedPowerMonitor::new(10.0, 30.0, 2.0));
        let mut cmd = Command::new("sleep");
        cmd.arg("30");

        let started = std::time::Instant::now();
        let outcome = run_supervised(cmd, Some(monitor), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(outcome.power_truncated);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "kill took {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn healthy_battery_leaves_child_alone() {
        let monitor: Arc<dyn crate::domain::PowerMonitor> =
            Arc::new(SimulatedPowerMonitor::new(90.0, 30.0, 2.0));
        let mut cmd = Command::new("echo");
        cmd.arg("ok");
        let outcome = run_supervised(cmd, Some(monitor), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!outcome.power_truncated);
        assert!(outcome.status.success());
    }
}
