//! End-to-end scheduling scenarios driven through the public scheduler API
//! with the simulated monitor and the mock engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use solar_llm_broker::config::SchedulerConfig;
use solar_llm_broker::domain::{JobStatus, SimulatedPowerMonitor};
use solar_llm_broker::inference::MockInferenceEngine;
use solar_llm_broker::repo::RequestStore;
use solar_llm_broker::scheduler::PowerAwareScheduler;

struct Harness {
    scheduler: Arc<PowerAwareScheduler>,
    monitor: Arc<SimulatedPowerMonitor>,
    completions: Arc<Mutex<Vec<String>>>,
    _dir: TempDir,
}

/// Scheduler with 1-second worker sleeps, an in-memory store, and a fast
/// mock engine, so scenarios finish in wall-clock seconds.
async fn harness(initial_battery: f64, fixed_solar_w: f64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(
        SimulatedPowerMonitor::new(initial_battery, 30.0, 2.0).with_fixed_solar(fixed_solar_w),
    );
    let store = RequestStore::connect(":memory:").await.unwrap();
    let engine = Arc::new(MockInferenceEngine::new(Some(monitor.clone()), 10_000.0));
    let config = SchedulerConfig {
        immediate_mode: false,
        idle_sleep_secs: 1,
        low_battery_sleep_secs: 1,
        calibration_path: dir.path().join("calibration.json"),
    };
    let scheduler = Arc::new(PowerAwareScheduler::new(
        store,
        monitor.clone(),
        engine,
        &config,
    ));

    let completions = Arc::new(Mutex::new(Vec::new()));
    let sink = completions.clone();
    scheduler.set_on_complete(Arc::new(move |conversation_id: &str| {
        sink.lock().unwrap().push(conversation_id.to_string());
    }));

    Harness {
        scheduler,
        monitor,
        completions,
        _dir: dir,
    }
}

async fn wait_for_status(
    harness: &Harness,
    job_id: &str,
    want: JobStatus,
    budget: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        let info = harness.scheduler.job_info(job_id).await.unwrap();
        if info.job.status == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn happy_path_completes_and_notifies_once() {
    let harness = harness(80.0, 20.0).await;

    let (job_id, _) = harness
        .scheduler
        .enqueue_prompt("conv-happy", "hello")
        .await
        .unwrap();

    assert!(
        wait_for_status(&harness, &job_id, JobStatus::Completed, Duration::from_secs(5)).await,
        "job did not complete in time"
    );

    let info = harness.scheduler.job_info(&job_id).await.unwrap();
    let response = info.job.response.unwrap();
    assert!(response.contains("Hello"), "unexpected response: {}", response);
    assert_eq!(info.queue_position, None);

    // Give the hook a moment, then require exactly one invocation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let completions = harness.completions.lock().unwrap();
    assert_eq!(completions.as_slice(), ["conv-happy"]);
}

#[tokio::test]
async fn low_battery_blocks_until_recharged() {
    let harness = harness(20.0, 20.0).await;

    let (job_id, _) = harness
        .scheduler
        .enqueue_prompt("conv-low", "hello")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let info = harness.scheduler.job_info(&job_id).await.unwrap();
    assert_eq!(info.job.status, JobStatus::Queued, "job ran on low battery");

    harness.monitor.charge(60.0).await;
    assert!(
        wait_for_status(&harness, &job_id, JobStatus::Completed, Duration::from_secs(5)).await,
        "job did not complete after recharge"
    );
}

#[tokio::test]
async fn battery_exactly_at_threshold_still_blocks() {
    // The worker gate is strictly greater-than 30%.
    let harness = harness(30.0, 20.0).await;

    let (job_id, _) = harness
        .scheduler
        .enqueue_prompt("conv-edge", "hello")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let info = harness.scheduler.job_info(&job_id).await.unwrap();
    assert_eq!(info.job.status, JobStatus::Queued);

    harness.monitor.charge(1.0).await;
    assert!(
        wait_for_status(&harness, &job_id, JobStatus::Completed, Duration::from_secs(5)).await
    );
}

#[tokio::test]
async fn conversation_jobs_complete_in_submission_order() {
    let harness = harness(80.0, 20.0).await;

    let mut ids = Vec::new();
    for prompt in ["first question", "second question", "third question"] {
        let (id, _) = harness
            .scheduler
            .enqueue_prompt("conv-fifo", prompt)
            .await
            .unwrap();
        ids.push(id);
        // Distinct submission timestamps at millisecond precision.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // While the worker drains the queue, the set of finished jobs must always
    // be a prefix of the submission order.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut done = Vec::new();
        for id in &ids {
            let info = harness.scheduler.job_info(id).await.unwrap();
            done.push(info.job.status == JobStatus::Completed);
        }
        for window in done.windows(2) {
            assert!(
                window[0] || !window[1],
                "a later job finished before an earlier one: {:?}",
                done
            );
        }
        if done.iter().all(|&d| d) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not drain: {:?}",
            done
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

#[tokio::test]
async fn hopeless_forecast_defers_a_full_day() {
    // Solar pinned to zero: no forecast hour is processing capable, and the
    // scheduled-mode selection gate never opens.
    let harness = harness(80.0, 0.0).await;

    let before = Utc::now();
    let (job_id, estimated) = harness
        .scheduler
        .enqueue_prompt("conv-night", "hello")
        .await
        .unwrap();

    let offset = estimated - before;
    assert!(offset >= ChronoDuration::hours(24));
    assert!(offset <= ChronoDuration::hours(24) + ChronoDuration::minutes(1));

    tokio::time::sleep(Duration::from_secs(3)).await;
    let info = harness.scheduler.job_info(&job_id).await.unwrap();
    assert_eq!(
        info.job.status,
        JobStatus::Queued,
        "job must wait for its scheduled slot"
    );
}

#[tokio::test]
async fn queue_positions_shrink_as_jobs_finish() {
    let harness = harness(20.0, 20.0).await;

    let (first, _) = harness
        .scheduler
        .enqueue_prompt("conv-pos", "p1")
        .await
        .unwrap();
    let (second, _) = harness
        .scheduler
        .enqueue_prompt("conv-pos", "p2")
        .await
        .unwrap();

    let info = harness.scheduler.job_info(&second).await.unwrap();
    assert_eq!(info.queue_position, Some(2));

    harness.monitor.charge(60.0).await;
    assert!(
        wait_for_status(&harness, &first, JobStatus::Completed, Duration::from_secs(5)).await
    );
    assert!(
        wait_for_status(&harness, &second, JobStatus::Completed, Duration::from_secs(5)).await
    );

    let status = harness.scheduler.queue_status().await.unwrap();
    assert_eq!(status.queue_length, 0);
}

#[tokio::test]
async fn failed_jobs_surface_like_completed_ones() {
    struct FailingEngine;

    #[async_trait::async_trait]
    impl solar_llm_broker::inference::InferenceEngine for FailingEngine {
        async fn generate(
            &self,
            _prompt: &str,
            _max_tokens: Option<u32>,
        ) -> Result<String, solar_llm_broker::inference::EngineError> {
            Err(solar_llm_broker::inference::EngineError::Io(
                std::io::Error::other("model blew up"),
            ))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let monitor = Arc::new(SimulatedPowerMonitor::new(80.0, 30.0, 2.0).with_fixed_solar(20.0));
    let store = RequestStore::connect(":memory:").await.unwrap();
    let config = SchedulerConfig {
        immediate_mode: false,
        idle_sleep_secs: 1,
        low_battery_sleep_secs: 1,
        calibration_path: dir.path().join("calibration.json"),
    };
    let scheduler = Arc::new(PowerAwareScheduler::new(
        store,
        monitor,
        Arc::new(FailingEngine),
        &config,
    ));

    let hook_fired = Arc::new(Mutex::new(0u32));
    let sink = hook_fired.clone();
    scheduler.set_on_complete(Arc::new(move |_: &str| {
        *sink.lock().unwrap() += 1;
    }));

    let (job_id, _) = scheduler.enqueue_prompt("conv-fail", "hello").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = scheduler.job_info(&job_id).await.unwrap();
        if info.job.status == JobStatus::Failed {
            // The diagnostic rides in the response field, like a completion.
            let response = info.job.response.unwrap();
            assert!(response.contains("model blew up"), "diagnostic: {}", response);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The hook fires for completions only, never for failures.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*hook_fired.lock().unwrap(), 0);
}
