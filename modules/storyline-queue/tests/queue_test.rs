//! Integration tests for JobQueue.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use storyline_queue::{JobOutcome, JobQueue, JobStatus, NewJob};
use tokio::sync::{Mutex, MutexGuard};

/// Tests share one table; hold this for the duration of a test.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

/// Get a queue on a clean test table, or skip if no test DB is available.
async fn test_queue() -> Option<(MutexGuard<'static, ()>, JobQueue)> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let guard = DB_LOCK.lock().await;
    let pool = PgPoolOptions::new().max_connections(16).connect(&url).await.ok()?;

    for ddl in [
        r#"
        CREATE TABLE IF NOT EXISTS job_queue (
            id            BIGSERIAL    PRIMARY KEY,
            job_type      TEXT         NOT NULL,
            payload       JSONB        NOT NULL DEFAULT '{}'::jsonb,
            payload_hash  TEXT         NOT NULL,
            status        TEXT         NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending', 'processing', 'done', 'failed')),
            run_at        TIMESTAMPTZ  NOT NULL DEFAULT now(),
            attempts      INT          NOT NULL DEFAULT 0,
            max_attempts  INT          NOT NULL DEFAULT 3,
            timeout_secs  INT          NOT NULL DEFAULT 300,
            claim_token   UUID,
            created_at    TIMESTAMPTZ  NOT NULL DEFAULT now(),
            started_at    TIMESTAMPTZ,
            completed_at  TIMESTAMPTZ,
            last_error    TEXT
        )
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS job_queue_live_dedup
            ON job_queue (job_type, payload_hash)
            WHERE status IN ('pending', 'processing')
        "#,
    ] {
        sqlx::query(ddl).execute(&pool).await.ok()?;
    }

    // Clean slate for each test
    sqlx::query("TRUNCATE job_queue RESTART IDENTITY")
        .execute(&pool)
        .await
        .ok()?;

    Some((guard, JobQueue::new(pool)))
}

fn cluster_job(n: u32) -> NewJob {
    NewJob::new("cluster-article", json!({ "article_id": format!("article-{n}") }))
}

// =========================================================================
// Enqueue dedup
// =========================================================================

#[tokio::test]
async fn duplicate_enqueue_returns_none_while_live() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };

    let first = queue.enqueue(&cluster_job(1)).await.unwrap();
    let second = queue.enqueue(&cluster_job(1)).await.unwrap();
    assert!(first.is_some());
    assert!(second.is_none(), "equivalent pending job must not be inserted");

    let other = queue.enqueue(&cluster_job(2)).await.unwrap();
    assert!(other.is_some());
    assert_ne!(other, first);

    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.pending, 2);
}

#[tokio::test]
async fn same_payload_can_be_enqueued_after_completion() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };

    let id = queue.enqueue(&cluster_job(1)).await.unwrap().unwrap();
    let job = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(job.id, id);

    // Still live while processing
    assert!(queue.enqueue(&cluster_job(1)).await.unwrap().is_none());

    queue
        .finish(job.id, job.claim_token.unwrap(), JobOutcome::Success)
        .await
        .unwrap()
        .unwrap();
    assert!(queue.enqueue(&cluster_job(1)).await.unwrap().is_some());
}

// =========================================================================
// Claiming
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimants_receive_distinct_jobs() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };

    const JOBS: u32 = 40;
    const CLAIMANTS: usize = 8;
    for n in 0..JOBS {
        queue.enqueue(&cluster_job(n)).await.unwrap().unwrap();
    }

    let tasks = (0..CLAIMANTS).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_next(Some(&["cluster-article"][..])).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        })
    });

    let results = futures::future::join_all(tasks).await;
    let mut seen = HashSet::new();
    let mut total = 0;
    for claimed in results {
        for id in claimed.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }
    assert_eq!(total, JOBS as usize);
    assert_eq!(queue.depth().await.unwrap().processing, JOBS as i64);
}

#[tokio::test]
async fn claim_respects_type_filter_and_run_at_order() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    let now = Utc::now();

    let later = queue
        .enqueue(&cluster_job(1).with_run_at(now - Duration::minutes(1)))
        .await
        .unwrap()
        .unwrap();
    let earlier = queue
        .enqueue(&cluster_job(2).with_run_at(now - Duration::minutes(5)))
        .await
        .unwrap()
        .unwrap();
    let future = queue
        .enqueue(&cluster_job(3).with_run_at(now + Duration::hours(1)))
        .await
        .unwrap()
        .unwrap();
    queue
        .enqueue(&NewJob::new("merge-stories", json!({})))
        .await
        .unwrap()
        .unwrap();

    let filter = Some(&["cluster-article"][..]);
    let first = queue.claim_next_at(filter, now).await.unwrap().unwrap();
    assert_eq!(first.id, earlier);
    let second = queue.claim_next_at(filter, now).await.unwrap().unwrap();
    assert_eq!(second.id, later);
    assert!(queue.claim_next_at(filter, now).await.unwrap().is_none(), "future job is not yet due");

    // Settle both claims so they are not reclaimed as stale once the clock moves on
    for job in [first, second] {
        queue
            .finish(job.id, job.claim_token.unwrap(), JobOutcome::Success)
            .await
            .unwrap()
            .unwrap();
    }

    let due = queue
        .claim_next_at(filter, now + Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(due.id, future);

    let merge = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(merge.job_type, "merge-stories");
}

// =========================================================================
// Staleness and superseded claims
// =========================================================================

#[tokio::test]
async fn stale_claim_is_reclaimed_with_attempt_incremented() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    let t0 = Utc::now();
    let id = queue
        .enqueue(&cluster_job(1).with_timeout_secs(60).with_run_at(t0 - Duration::minutes(1)))
        .await
        .unwrap()
        .unwrap();

    let first = queue.claim_next_at(None, t0).await.unwrap().unwrap();
    assert_eq!(first.id, id);
    assert_eq!(first.attempts, 1);

    assert!(
        queue.claim_next_at(None, t0 + Duration::seconds(30)).await.unwrap().is_none(),
        "claim within its timeout is not re-offered"
    );

    let second = queue
        .claim_next_at(None, t0 + Duration::seconds(61))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 2);
    assert_ne!(second.claim_token, first.claim_token);

    // The first worker's late completion is a no-op
    let late = queue
        .finish(id, first.claim_token.unwrap(), JobOutcome::Success)
        .await
        .unwrap();
    assert!(late.is_none());
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Processing);

    let done = queue
        .finish(id, second.claim_token.unwrap(), JobOutcome::Success)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn abandoned_jobs_with_no_attempts_left_are_failed() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    let t0 = Utc::now();
    let id = queue
        .enqueue(
            &cluster_job(1)
                .with_timeout_secs(10)
                .with_max_attempts(1)
                .with_run_at(t0 - Duration::minutes(1)),
        )
        .await
        .unwrap()
        .unwrap();
    queue.claim_next_at(None, t0).await.unwrap().unwrap();

    // Exhausted: not reclaimable
    assert!(queue.claim_next_at(None, t0 + Duration::seconds(20)).await.unwrap().is_none());

    let failed = queue.fail_abandoned(t0 + Duration::seconds(20)).await.unwrap();
    assert_eq!(failed, vec![id]);
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().starts_with("abandoned"));
}

// =========================================================================
// Retry and failure
// =========================================================================

#[tokio::test]
async fn retry_backs_off_then_fails_at_max_attempts() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    let t0 = Utc::now();
    let id = queue
        .enqueue(&cluster_job(1).with_max_attempts(2).with_run_at(t0 - Duration::minutes(1)))
        .await
        .unwrap()
        .unwrap();

    let job = queue.claim_next_at(None, t0).await.unwrap().unwrap();
    let retried = queue
        .finish_at(id, job.claim_token.unwrap(), JobOutcome::Retry("store unavailable".into()), t0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert!(retried.run_at > t0);
    assert_eq!(retried.last_error.as_deref(), Some("store unavailable"));

    assert!(queue.claim_next_at(None, t0).await.unwrap().is_none(), "backoff delays the retry");

    let t1 = t0 + Duration::hours(1);
    let job = queue.claim_next_at(None, t1).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    let failed = queue
        .finish_at(id, job.claim_token.unwrap(), JobOutcome::Retry("still unavailable".into()), t1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("still unavailable"));

    let listed = queue.list_failed(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test]
async fn fatal_outcome_fails_without_retry() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    queue.enqueue(&cluster_job(1)).await.unwrap().unwrap();
    let job = queue.claim_next(None).await.unwrap().unwrap();
    let failed = queue
        .finish(job.id, job.claim_token.unwrap(), JobOutcome::Fatal("invalid payload".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

// =========================================================================
// Operator actions
// =========================================================================

#[tokio::test]
async fn cancel_only_affects_pending_jobs() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    let pending = queue.enqueue(&cluster_job(1)).await.unwrap().unwrap();
    let cancelled = queue.cancel(pending).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
    assert!(queue.claim_next(None).await.unwrap().is_none());

    queue.enqueue(&cluster_job(2)).await.unwrap().unwrap();
    let running = queue.claim_next(None).await.unwrap().unwrap();
    assert!(queue.cancel(running.id).await.unwrap().is_none(), "in-flight jobs are not preemptible");
}

#[tokio::test]
async fn requeue_resets_attempts_unless_equivalent_job_is_live() {
    let Some((_guard, queue)) = test_queue().await else {
        return;
    };
    let id = queue.enqueue(&cluster_job(1)).await.unwrap().unwrap();
    let job = queue.claim_next(None).await.unwrap().unwrap();
    queue
        .finish(id, job.claim_token.unwrap(), JobOutcome::Fatal("boom".into()))
        .await
        .unwrap();

    // An equivalent job is enqueued and live: requeue must not collide with it
    let live = queue.enqueue(&cluster_job(1)).await.unwrap().unwrap();
    assert!(queue.requeue(id).await.unwrap().is_none());

    queue.cancel(live).await.unwrap().unwrap();
    let requeued = queue.requeue(id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.attempts, 0);

    let job = queue.claim_next(None).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
}
