//! The power-aware control core: couples the power monitor's forecast to the
//! durable request queue and drives the inference engine from a single
//! background worker.

pub mod calibration;

pub use calibration::CalibrationModel;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::domain::{
    Job, JobStatus, PowerMonitor, PowerReading, PowerStatus, MIN_PROCESSING_BATTERY_PERCENT,
};
use crate::inference::{estimate_tokens, InferenceEngine};
use crate::repo::{RequestStore, SelectionMode, StoreError};

/// Assumed extra delay per job already waiting in the queue.
const QUEUE_DELAY_PER_JOB_SECS: i64 = 60;

const FORECAST_HORIZON_HOURS: usize = 24;

/// Once a runnable hour is found this close ahead, stop scanning for better.
const NEAR_TERM_HOURS: usize = 6;

const TRANSITION_RETRIES: u32 = 3;
const TRANSITION_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Fire-and-forget rendering trigger, called with the conversation id after
/// a job completes.
pub type CompletionHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("conversation id must not be empty")]
    MissingConversation,

    #[error("request not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Job plus its 1-based queue position while still waiting.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: i64,
    pub power_status: PowerStatus,
    pub processing_active: bool,
}

pub struct PowerAwareScheduler {
    store: RequestStore,
    monitor: Arc<dyn PowerMonitor>,
    engine: Arc<dyn InferenceEngine>,
    calibration: Mutex<CalibrationModel>,
    calibration_path: PathBuf,
    on_complete: Mutex<Option<CompletionHook>>,
    worker_running: AtomicBool,
    stop_requested: AtomicBool,
    immediate_mode: bool,
    idle_sleep: Duration,
    low_battery_sleep: Duration,
}

impl PowerAwareScheduler {
    pub fn new(
        store: RequestStore,
        monitor: Arc<dyn PowerMonitor>,
        engine: Arc<dyn InferenceEngine>,
        cfg: &SchedulerConfig,
    ) -> Self {
        let calibration = CalibrationModel::load_or_default(&cfg.calibration_path);
        Self {
            store,
            monitor,
            engine,
            calibration: Mutex::new(calibration),
            calibration_path: cfg.calibration_path.clone(),
            on_complete: Mutex::new(None),
            worker_running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            immediate_mode: cfg.immediate_mode,
            idle_sleep: Duration::from_secs(cfg.idle_sleep_secs),
            low_battery_sleep: Duration::from_secs(cfg.low_battery_sleep_secs),
        }
    }

    /// Register the single completion hook. Called at most once per job, only
    /// for the `completed` transition.
    pub fn set_on_complete(&self, hook: CompletionHook) {
        *self.on_complete.lock() = Some(hook);
    }

    pub fn processing_active(&self) -> bool {
        self.worker_running.load(Ordering::SeqCst)
    }

    /// Snapshot of the current calibration parameters.
    pub fn calibration(&self) -> CalibrationModel {
        self.calibration.lock().clone()
    }

    /// Ends the worker loop after the in-flight generation, if any.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Accept a prompt: estimate its cost, pick an expected completion time
    /// from the forecast, persist it, and make sure the worker is running.
    pub async fn enqueue_prompt(
        self: &Arc<Self>,
        conversation_id: &str,
        prompt: &str,
    ) -> Result<(String, DateTime<Utc>), SchedulerError> {
        if conversation_id.trim().is_empty() {
            return Err(SchedulerError::MissingConversation);
        }
        if prompt.trim().is_empty() {
            return Err(SchedulerError::EmptyPrompt);
        }

        let tokens = estimate_tokens(prompt);
        let (power_needed, processing_secs) = {
            let calibration = self.calibration.lock();
            (
                calibration.estimate_power(tokens),
                calibration.estimate_processing_secs(tokens),
            )
        };

        let now = Utc::now();
        let queue_delay =
            ChronoDuration::seconds(QUEUE_DELAY_PER_JOB_SECS * self.store.queue_length().await?);
        let processing = ChronoDuration::milliseconds((processing_secs * 1000.0) as i64);

        let estimated_completion = if self.immediate_mode {
            now + processing + queue_delay
        } else {
            self.schedule_completion(now, power_needed, processing, queue_delay)
                .await
        };

        let job_id = self
            .store
            .enqueue(Some(conversation_id), prompt, power_needed, estimated_completion)
            .await?;

        info!(
            job_id = %job_id,
            conversation_id = %conversation_id,
            tokens,
            power_needed_w = power_needed,
            estimated_completion = %estimated_completion,
            "prompt enqueued"
        );

        self.ensure_worker();
        Ok((job_id, estimated_completion))
    }

    /// Scan the 24h forecast for the earliest hour able to carry the job.
    /// Falls back to a conservative `now + 24h` when nothing qualifies.
    async fn schedule_completion(
        &self,
        now: DateTime<Utc>,
        power_needed: f64,
        processing: ChronoDuration,
        queue_delay: ChronoDuration,
    ) -> DateTime<Utc> {
        let forecast = self.monitor.predict(FORECAST_HORIZON_HOURS).await;
        let mut earliest: Option<DateTime<Utc>> = None;

        for (offset, entry) in forecast.iter().enumerate() {
            if entry.processing_capable && power_needed <= entry.solar_output {
                let candidate =
                    now + ChronoDuration::hours(offset as i64) + processing + queue_delay;
                if earliest.map_or(true, |best| candidate < best) {
                    earliest = Some(candidate);
                }
                // A near-term slot will not be beaten by a later hour.
                if offset < NEAR_TERM_HOURS {
                    break;
                }
            }
        }

        earliest.unwrap_or_else(|| now + ChronoDuration::hours(24))
    }

    /// Arm the worker if it is not already running. The compare-exchange
    /// guarantees bursts of submissions spawn at most one loop.
    pub fn ensure_worker(self: &Arc<Self>) {
        if self
            .worker_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.worker_loop().await;
            });
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        info!(immediate_mode = self.immediate_mode, "worker loop started");

        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            let status = self.monitor.status().await;
            if status.battery_level <= MIN_PROCESSING_BATTERY_PERCENT {
                debug!(battery = status.battery_level, "battery too low for processing");
                sleep(self.low_battery_sleep).await;
                continue;
            }

            let mode = if self.immediate_mode {
                SelectionMode::Immediate
            } else {
                SelectionMode::Scheduled
            };

            match self
                .store
                .select_next(status.solar_output, Utc::now(), mode)
                .await
            {
                Ok(Some(job)) => {
                    if self.process_job(job).await.is_err() {
                        // The store refused repeatedly; leave the job as-is
                        // for operator recovery rather than spin.
                        error!("persistent store failure, stopping worker");
                        break;
                    }
                }
                Ok(None) => {
                    sleep(self.idle_sleep).await;
                    match self.store.queue_length().await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "queue length check failed"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "job selection failed");
                    sleep(self.idle_sleep).await;
                }
            }
        }

        self.worker_running.store(false, Ordering::SeqCst);
        info!("worker loop stopped");

        // A submission may have raced the shutdown; re-arm for it.
        if !self.stop_requested.load(Ordering::SeqCst) {
            if let Ok(pending) = self.store.queue_length().await {
                if pending > 0 {
                    self.ensure_worker();
                }
            }
        }
    }

    async fn process_job(&self, job: Job) -> Result<(), StoreError> {
        self.transition_with_retry(&job.id, JobStatus::Processing, None)
            .await?;
        info!(job_id = %job.id, "job processing");

        let reading_before = self.monitor.current_reading().await;
        let started = Instant::now();
        let result = self.engine.generate(&job.prompt, None).await;
        let elapsed = started.elapsed();
        let reading_after = self.monitor.current_reading().await;

        match result {
            Ok(response) => {
                self.update_calibration(&job.prompt, &response, elapsed, &reading_before, &reading_after)
                    .await;
                self.transition_with_retry(&job.id, JobStatus::Completed, Some(&response))
                    .await?;
                info!(job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                if let Some(conversation_id) = job.conversation_id.as_deref() {
                    self.fire_completion_hook(conversation_id);
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "generation failed");
                let diagnostic = format!("Error generating response: {}", e);
                self.transition_with_retry(&job.id, JobStatus::Failed, Some(&diagnostic))
                    .await?;
            }
        }
        Ok(())
    }

    async fn transition_with_retry(
        &self,
        job_id: &str,
        status: JobStatus,
        response: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.transition(job_id, status, response).await {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::Database(_)) => {
                    attempt += 1;
                    if attempt >= TRANSITION_RETRIES {
                        error!(job_id = %job_id, error = %e, "transition failed after retries");
                        return Err(e);
                    }
                    warn!(job_id = %job_id, attempt, error = %e, "transition failed, retrying");
                    sleep(TRANSITION_RETRY_DELAY).await;
                }
                // Lifecycle violations do not heal with retries.
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "transition rejected");
                    return Err(e);
                }
            }
        }
    }

    async fn update_calibration(
        &self,
        prompt: &str,
        response: &str,
        elapsed: Duration,
        reading_before: &PowerReading,
        reading_after: &PowerReading,
    ) {
        let total_tokens = estimate_tokens(prompt) + estimate_tokens(response);
        let avg_power = (reading_before.power + reading_after.power) / 2.0;

        let payload = {
            let mut calibration = self.calibration.lock();
            if !calibration.absorb(elapsed.as_secs_f64(), avg_power, total_tokens) {
                return;
            }
            debug!(
                tokens_per_second = calibration.tokens_per_second,
                token_processing_power = calibration.token_processing_power,
                "calibration updated"
            );
            serde_json::to_string(&*calibration).ok()
        };

        if let Some(json) = payload {
            if let Err(e) = tokio::fs::write(&self.calibration_path, json).await {
                warn!(path = %self.calibration_path.display(), error = %e, "failed to persist calibration data");
            }
        }
    }

    fn fire_completion_hook(&self, conversation_id: &str) {
        let hook = self.on_complete.lock().clone();
        if let Some(hook) = hook {
            // The hook is a rendering trigger only; a broken one must never
            // take the worker down.
            if catch_unwind(AssertUnwindSafe(|| hook(conversation_id))).is_err() {
                warn!(conversation_id = %conversation_id, "completion hook panicked");
            }
        }
    }

    /// Look up a job, enriched with its queue position while it waits.
    pub async fn job_info(&self, job_id: &str) -> Result<JobInfo, SchedulerError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;
        let queue_position = if job.status == JobStatus::Queued {
            self.store.queue_position(job_id).await?
        } else {
            None
        };
        Ok(JobInfo {
            job,
            queue_position,
        })
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, SchedulerError> {
        Ok(QueueStatus {
            queue_length: self.store.queue_length().await?,
            power_status: self.monitor.status().await,
            processing_active: self.processing_active(),
        })
    }
}
