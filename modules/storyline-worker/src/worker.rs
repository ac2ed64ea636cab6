//! Job worker: N claim loops plus a maintenance scheduler, all stopped by one
//! shutdown signal.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use storyline_common::{JobKind, JobPayload};
use storyline_queue::{Job, JobOutcome, JobQueue};
use storyline_store::jobs;

use crate::handlers::{handle, outcome_for, HandlerContext};

/// Job types this worker claims. Enrichment belongs to another service.
pub fn claimable_kinds() -> Vec<&'static str> {
    JobKind::ALL
        .iter()
        .filter(|k| **k != JobKind::EnrichStory)
        .map(|k| k.as_str())
        .collect()
}

pub struct Worker {
    queue: JobQueue,
    ctx: HandlerContext,
}

impl Worker {
    pub fn new(queue: JobQueue, ctx: HandlerContext) -> Self {
        Self { queue, ctx }
    }

    /// Run until `shutdown` flips to true. In-flight jobs finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let concurrency = self.ctx.config.worker.concurrency.max(1);
        info!(concurrency, kinds = ?claimable_kinds(), "Worker started");

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for slot in 0..concurrency {
            let queue = self.queue.clone();
            let ctx = self.ctx.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { claim_loop(slot, queue, ctx, shutdown).await }));
        }
        let queue = self.queue.clone();
        let ctx = self.ctx.clone();
        handles.push(tokio::spawn(async move { schedule_maintenance(queue, ctx, shutdown).await }));

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker stopped");
    }
}

async fn claim_loop(slot: usize, queue: JobQueue, ctx: HandlerContext, mut shutdown: watch::Receiver<bool>) {
    let kinds = claimable_kinds();
    let poll = Duration::from_millis(ctx.config.worker.poll_interval_ms);

    while !*shutdown.borrow() {
        match queue.claim_next(Some(kinds.as_slice())).await {
            Ok(Some(job)) => process(&queue, &ctx, job).await,
            Ok(None) => {
                tokio::select! {
                    _ = sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                warn!(slot, error = %e, "Claim failed");
                tokio::select! {
                    _ = sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    debug!(slot, "Claim loop exiting");
}

async fn process(queue: &JobQueue, ctx: &HandlerContext, job: Job) {
    let Some(token) = job.claim_token else {
        warn!(job_id = job.id, "Claimed job has no claim token");
        return;
    };
    let started = std::time::Instant::now();

    let outcome = match JobPayload::from_parts(&job.job_type, &job.payload) {
        Err(e) => JobOutcome::Fatal(e.to_string()),
        Ok(payload) => {
            let limit = Duration::from_secs(job.timeout_secs.max(1) as u64);
            match timeout(limit, handle(payload, ctx)).await {
                Ok(Ok(())) => JobOutcome::Success,
                Ok(Err(e)) => outcome_for(&e),
                Err(_) => JobOutcome::Retry(format!("timed out after {}s", limit.as_secs())),
            }
        }
    };

    match &outcome {
        JobOutcome::Success => debug!(job_id = job.id, job_type = %job.job_type, attempt = job.attempts, "Job succeeded"),
        JobOutcome::Retry(reason) => {
            warn!(job_id = job.id, job_type = %job.job_type, attempt = job.attempts, reason = %reason, "Job will retry")
        }
        JobOutcome::Fatal(reason) => {
            error!(job_id = job.id, job_type = %job.job_type, attempt = job.attempts, reason = %reason, "Job failed")
        }
    }

    match queue.finish(job.id, token, outcome).await {
        Ok(Some(finished)) => debug!(
            job_id = finished.id,
            status = %finished.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        ),
        Ok(None) => warn!(job_id = job.id, "Claim superseded before finish; result discarded"),
        Err(e) => warn!(job_id = job.id, error = %e, "Failed to record job result"),
    }
}

/// Enqueue the periodic maintenance jobs and fail abandoned claims. Queue
/// uniqueness keeps at most one live job of each kind, so several workers can
/// run this scheduler side by side.
async fn schedule_maintenance(queue: JobQueue, ctx: HandlerContext, mut shutdown: watch::Receiver<bool>) {
    let w = &ctx.config.worker;
    let mut centroids = interval(Duration::from_secs(w.centroid_interval_secs.max(1)));
    let mut merges = interval(Duration::from_secs(w.merge_interval_secs.max(1)));
    let mut lifecycle = interval(Duration::from_secs(w.lifecycle_interval_secs.max(1)));
    for ticker in [&mut centroids, &mut merges, &mut lifecycle] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    loop {
        let payload = tokio::select! {
            _ = centroids.tick() => JobPayload::RecomputeCentroids {},
            _ = merges.tick() => JobPayload::MergeStories {},
            _ = lifecycle.tick() => {
                match queue.fail_abandoned(Utc::now()).await {
                    Ok(ids) if !ids.is_empty() => warn!(count = ids.len(), ids = ?ids, "Abandoned jobs failed"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Abandoned-job check failed"),
                }
                JobPayload::LifecycleSweep {}
            }
            _ = shutdown.changed() => break,
        };
        let kind = payload.kind();
        match jobs::enqueue(queue.pool(), payload).await {
            Ok(Some(id)) => debug!(job_id = id, job_type = %kind, "Maintenance job scheduled"),
            Ok(None) => debug!(job_type = %kind, "Maintenance job already pending"),
            Err(e) => warn!(job_type = %kind, error = %e, "Failed to schedule maintenance job"),
        }
    }
    debug!("Maintenance scheduler exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_never_claims_enrichment() {
        let kinds = claimable_kinds();
        assert_eq!(kinds.len(), JobKind::ALL.len() - 1);
        assert!(!kinds.contains(&"enrich-story"));
        assert!(kinds.contains(&"cluster-article"));
        assert!(kinds.contains(&"lifecycle-sweep"));
    }
}
