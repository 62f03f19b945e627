use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use solar_llm_broker::api::{self, ApiState};
use solar_llm_broker::config::AppConfig;
use solar_llm_broker::domain::PowerMonitor;
use solar_llm_broker::hardware;
use solar_llm_broker::inference;
use solar_llm_broker::repo::RequestStore;
use solar_llm_broker::scheduler::PowerAwareScheduler;
use solar_llm_broker::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    telemetry::init_tracing(&cfg.telemetry);

    let store = RequestStore::connect(&cfg.queue.db_path).await?;
    let swept = store.sweep_interrupted().await?;
    if swept > 0 {
        warn!(count = swept, "failed jobs interrupted by the previous run");
    }

    let handle = hardware::build_monitor(&cfg.power).await;
    info!(monitor = handle.monitor.kind(), "power monitor ready");

    let engine = inference::build_engine(&cfg.inference, Some(handle.monitor.clone()));

    let scheduler = Arc::new(PowerAwareScheduler::new(
        store,
        handle.monitor.clone(),
        engine,
        &cfg.scheduler,
    ));
    scheduler.set_on_complete(Arc::new(|conversation_id: &str| {
        // Rendering trigger for the external conversation-page renderer.
        info!(conversation_id = %conversation_id, "conversation updated");
    }));

    // Jobs left queued by a previous run become eligible again on the next
    // worker pass.
    scheduler.ensure_worker();

    let app = api::router(ApiState {
        scheduler: scheduler.clone(),
        monitor: handle.monitor.clone(),
        simulator: handle.simulator.clone(),
    });

    let addr = cfg.server.socket_addr()?;
    info!(%addr, immediate_mode = cfg.scheduler.immediate_mode, "starting solar LLM broker");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    scheduler.stop();
    warn!("shutdown complete");
    Ok(())
}
