//! Worker event command.

use anyhow::{Context, Result};
use drover_core::event::{EventKind, WorkerPayload};
use drover_scheduler::{ApplyOutcome, JobStateUpdater};
use std::path::Path;

use super::Backend;

/// Apply one worker event read from a JSON payload file.
pub async fn run(backend: &Backend, kind: &str, path: &Path) -> Result<()> {
    let kind: EventKind = kind.parse()?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload: {}", path.display()))?;
    let payload: WorkerPayload = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse payload: {}", path.display()))?;

    let updater = JobStateUpdater::new(backend.store.clone());
    match updater.apply(kind, &payload).await? {
        ApplyOutcome::Applied(transition) => {
            println!("Job is now {}", transition.job_state);
            println!("Build is now {}", transition.build_state);
            if !transition.canceled_jobs.is_empty() {
                println!("Canceled {} jobs of later stages", transition.canceled_jobs.len());
            }
        }
        ApplyOutcome::Stale { reason } => {
            println!("Ignored stale event: {}", reason);
        }
    }

    Ok(())
}
