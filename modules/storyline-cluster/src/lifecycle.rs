//! Story lifecycle: idle stories go dormant, then closed. Operators can close
//! or reopen a story by hand.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use storyline_common::{LifecycleConfig, Result, StoryStatus, StorylineError};
use storyline_store::Story;

#[derive(Debug, Default, Clone, Serialize)]
pub struct LifecycleStats {
    pub dormant: u64,
    pub closed: u64,
}

impl fmt::Display for LifecycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lifecycle sweep: {} dormant, {} closed", self.dormant, self.closed)
    }
}

/// Stories last updated before these instants become dormant / closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    pub dormant_before: DateTime<Utc>,
    pub close_before: DateTime<Utc>,
}

pub fn cutoffs(now: DateTime<Utc>, cfg: &LifecycleConfig) -> Cutoffs {
    Cutoffs {
        dormant_before: now - Duration::hours(cfg.dormant_after_hours),
        close_before: now - Duration::hours(cfg.close_after_hours),
    }
}

/// The status an open story should have at `now`. Closed and merged stories
/// are left alone.
pub fn status_at(story_status: StoryStatus, last_updated_at: DateTime<Utc>, cutoffs: &Cutoffs) -> StoryStatus {
    if !story_status.is_open() {
        return story_status;
    }
    if last_updated_at < cutoffs.close_before {
        StoryStatus::Closed
    } else if last_updated_at < cutoffs.dormant_before {
        StoryStatus::Dormant
    } else {
        story_status
    }
}

/// Apply both idle transitions as set-based updates in one transaction.
pub async fn sweep(now: DateTime<Utc>, cfg: &LifecycleConfig, pool: &PgPool) -> Result<LifecycleStats> {
    let c = cutoffs(now, cfg);
    let mut tx = pool.begin().await?;

    let closed = sqlx::query(
        r#"
        UPDATE stories
        SET status = 'closed', closed_at = $2
        WHERE status IN ('active', 'dormant') AND last_updated_at < $1
        "#,
    )
    .bind(c.close_before)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let dormant = sqlx::query(
        r#"
        UPDATE stories
        SET status = 'dormant'
        WHERE status = 'active' AND last_updated_at < $1
        "#,
    )
    .bind(c.dormant_before)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    let stats = LifecycleStats { dormant, closed };
    info!(dormant = stats.dormant, closed = stats.closed, "Lifecycle sweep finished");
    Ok(stats)
}

/// Close a story by hand. Closing a closed story is a no-op.
pub async fn close_story(id: Uuid, pool: &PgPool) -> Result<Story> {
    transition(id, StoryStatus::Closed, pool).await
}

/// Reopen a closed or dormant story as active.
pub async fn reopen_story(id: Uuid, pool: &PgPool) -> Result<Story> {
    transition(id, StoryStatus::Active, pool).await
}

async fn transition(id: Uuid, to: StoryStatus, pool: &PgPool) -> Result<Story> {
    let mut tx = pool.begin().await?;
    let story = Story::lock(id, &mut *tx)
        .await?
        .ok_or_else(|| StorylineError::NotFound(format!("story {id}")))?;

    if story.status == StoryStatus::Merged {
        return Err(StorylineError::Policy(format!(
            "story {id} was merged into {}",
            story.merged_into_story_id.map(|s| s.to_string()).unwrap_or_default()
        )));
    }
    if story.status == to {
        tx.commit().await?;
        return Ok(story);
    }

    let updated = Story::set_status(id, to, &mut *tx).await?;
    tx.commit().await?;
    info!(story_id = %id, from = %story.status, to = %to, "Story status changed");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_stories_step_through_dormant_to_closed() {
        let now = Utc::now();
        let c = cutoffs(now, &LifecycleConfig::default());
        let at = |hours: i64| now - Duration::hours(hours);

        assert_eq!(status_at(StoryStatus::Active, at(10), &c), StoryStatus::Active);
        assert_eq!(status_at(StoryStatus::Active, at(73), &c), StoryStatus::Dormant);
        assert_eq!(status_at(StoryStatus::Dormant, at(100), &c), StoryStatus::Dormant);
        assert_eq!(status_at(StoryStatus::Active, at(337), &c), StoryStatus::Closed);
        assert_eq!(status_at(StoryStatus::Dormant, at(337), &c), StoryStatus::Closed);
    }

    #[test]
    fn terminal_statuses_are_untouched() {
        let now = Utc::now();
        let c = cutoffs(now, &LifecycleConfig::default());
        let ancient = now - Duration::days(365);
        assert_eq!(status_at(StoryStatus::Merged, ancient, &c), StoryStatus::Merged);
        assert_eq!(status_at(StoryStatus::Closed, ancient, &c), StoryStatus::Closed);
    }

    #[test]
    fn cutoff_boundary_is_exclusive() {
        let now = Utc::now();
        let c = cutoffs(now, &LifecycleConfig::default());
        assert_eq!(status_at(StoryStatus::Active, c.dormant_before, &c), StoryStatus::Active);
    }
}
