//! Background scheduler and dispatch workers
//!
//! The scheduler wakes on a fixed interval and runs a dispatch pass per
//! tenant; workers drain the synthesis/governance queue. Both are plain
//! tokio tasks with no shared state beyond the pipeline service.

use crate::config::PipelineConfig;
use crate::pipeline::service::PipelineService;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the scheduler loop and the worker pool. Handles are returned so
/// the binary can abort them on shutdown.
pub fn spawn_background(
    service: Arc<PipelineService>,
    config: &PipelineConfig,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let interval = Duration::from_secs(config.scheduler_interval_secs.max(1));
    let scheduler_service = Arc::clone(&service);
    handles.push(tokio::spawn(async move {
        // Start offset so redeployed replicas don't tick in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let dispatched = scheduler_service.run_scheduler_tick().await;
            if dispatched > 0 {
                info!("⏰ Scheduler dispatched {} pattern(s) for synthesis", dispatched);
            } else {
                debug!("Scheduler tick: nothing to dispatch");
            }
        }
    }));

    for worker in 0..config.worker_count.max(1) {
        let worker_service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            debug!("Dispatch worker {} started", worker);
            loop {
                let delivery = worker_service.queue().pop().await;
                worker_service.run_delivery(delivery).await;
            }
        }));
    }

    handles
}
