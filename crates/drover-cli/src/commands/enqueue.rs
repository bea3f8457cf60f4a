//! Job enqueue command.

use anyhow::Result;
use drover_config::SystemConfig;
use drover_scheduler::JobEnqueuer;
use tracing::warn;

use super::Backend;

/// Run one enqueue pass, or keep running until Ctrl-C with `watch`.
pub async fn run(backend: &Backend, config: &SystemConfig, watch: bool) -> Result<()> {
    let mut enqueuer = JobEnqueuer::new(backend.store.clone(), config.enqueue.clone());
    if let Some(dispatcher) = &backend.dispatcher {
        enqueuer = enqueuer.with_dispatcher(dispatcher.clone());
    }

    if watch {
        enqueuer
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
            })
            .await;
        return Ok(());
    }

    let report = enqueuer.enqueue().await?;
    println!("Enqueued {} jobs", report.enqueued.len());
    for id in &report.enqueued {
        println!("  {}", id);
    }
    println!("  skipped (at capacity): {}", report.skipped_capacity);

    Ok(())
}
