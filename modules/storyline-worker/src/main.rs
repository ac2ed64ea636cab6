use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use storyline_common::{AppConfig, JobPayload, NewArticle};
use storyline_queue::{JobQueue, RetryPolicy};
use storyline_store::jobs;

mod handlers;
mod worker;

use handlers::HandlerContext;
use worker::Worker;

#[derive(Parser)]
#[command(name = "storyline", about = "News story clustering worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim and run jobs until interrupted
    Work,
    /// Apply database migrations
    Migrate,
    /// Enqueue a maintenance job now
    Trigger {
        #[command(subcommand)]
        job: TriggerCommand,
    },
    /// Enqueue ingestion for articles in a JSON file (one article or an array)
    Ingest { path: PathBuf },
    /// Inspect and repair the job queue
    Jobs {
        #[command(subcommand)]
        action: JobsCommand,
    },
    /// Manual story status overrides
    Story {
        #[command(subcommand)]
        action: StoryCommand,
    },
}

#[derive(Subcommand)]
enum TriggerCommand {
    Centroids,
    Merge,
    Lifecycle,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Job counts by status
    Depth,
    /// Most recent failed jobs
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Put a failed job back in the queue with a fresh attempt budget
    Requeue { id: i64 },
    /// Cancel a pending job
    Cancel { id: i64 },
}

#[derive(Subcommand)]
enum StoryCommand {
    Close { id: Uuid },
    Reopen { id: Uuid },
}

fn init_tracing() -> Result<()> {
    // "storyline" prefixes the binary and every library crate target
    let filter = EnvFilter::from_default_env().add_directive("storyline=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.worker.concurrency as u32 + 4)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}

fn job_queue(pool: PgPool, config: &AppConfig) -> JobQueue {
    JobQueue::new(pool).with_retry_policy(RetryPolicy {
        base_delay: Duration::from_secs(config.queue.retry_base_delay_secs.max(1) as u64),
        max_delay: Duration::from_secs(config.queue.retry_max_delay_secs.max(1) as u64),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    config.log_redacted();
    let pool = connect(&config).await?;

    match cli.command {
        Command::Work => {
            storyline_store::migrate(&pool).await?;
            let queue = job_queue(pool.clone(), &config);
            let ctx = HandlerContext {
                pool,
                config: Arc::new(config),
            };
            let (tx, rx) = watch::channel(false);
            let worker = tokio::spawn(Worker::new(queue, ctx).run(rx));

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested, waiting for in-flight jobs");
            tx.send(true)?;
            worker.await?;
        }
        Command::Migrate => {
            storyline_store::migrate(&pool).await?;
            info!("Migrations complete");
        }
        Command::Trigger { job } => {
            let payload = match job {
                TriggerCommand::Centroids => JobPayload::RecomputeCentroids {},
                TriggerCommand::Merge => JobPayload::MergeStories {},
                TriggerCommand::Lifecycle => JobPayload::LifecycleSweep {},
            };
            let kind = payload.kind();
            match jobs::enqueue(&pool, payload).await? {
                Some(id) => println!("Enqueued {kind} as job {id}"),
                None => println!("A {kind} job is already pending or running"),
            }
        }
        Command::Ingest { path } => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let articles = parse_articles(&raw).with_context(|| format!("Invalid article JSON in {}", path.display()))?;
            let (mut enqueued, mut skipped) = (0usize, 0usize);
            for article in articles {
                match jobs::enqueue(&pool, JobPayload::IngestArticle { article }).await? {
                    Some(_) => enqueued += 1,
                    None => skipped += 1,
                }
            }
            println!("Enqueued {enqueued} ingest jobs ({skipped} already queued)");
        }
        Command::Jobs { action } => {
            let queue = job_queue(pool, &config);
            match action {
                JobsCommand::Depth => println!("{}", queue.depth().await?),
                JobsCommand::Failed { limit } => {
                    for job in queue.list_failed(limit).await? {
                        println!(
                            "{:>8}  {:<20} attempts={}/{}  {}",
                            job.id,
                            job.job_type,
                            job.attempts,
                            job.max_attempts,
                            job.last_error.as_deref().unwrap_or("-")
                        );
                    }
                }
                JobsCommand::Requeue { id } => match queue.requeue(id).await? {
                    Some(job) => println!("Job {} requeued as {}", job.id, job.status),
                    None => println!("Job {id} is not failed, or an equivalent job is already live"),
                },
                JobsCommand::Cancel { id } => match queue.cancel(id).await? {
                    Some(job) => println!("Job {} cancelled", job.id),
                    None => println!("Job {id} is not pending"),
                },
            }
        }
        Command::Story { action } => {
            let story = match action {
                StoryCommand::Close { id } => storyline_cluster::close_story(id, &pool).await?,
                StoryCommand::Reopen { id } => storyline_cluster::reopen_story(id, &pool).await?,
            };
            println!("Story {} is {}", story.id, story.status);
        }
    }

    Ok(())
}

/// Accept either a single article object or an array of them.
fn parse_articles(raw: &str) -> Result<Vec<NewArticle>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let articles = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(articles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_article_and_arrays() {
        let one = r#"{"url":"https://a.example.com/x","title":"Quake","published_at":"2025-03-01T10:00:00Z","source_name":"Wire"}"#;
        assert_eq!(parse_articles(one).unwrap().len(), 1);

        let many = format!("[{one},{one}]");
        let parsed = parse_articles(&many).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].title, "Quake");
        assert!(parsed[0].excerpt.is_none());
    }

    #[test]
    fn rejects_malformed_article() {
        assert!(parse_articles(r#"{"title":"no url"}"#).is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["storyline", "jobs", "requeue", "42"]).unwrap();
        assert!(matches!(cli.command, Command::Jobs { action: JobsCommand::Requeue { id: 42 } }));

        let cli = Cli::try_parse_from(["storyline", "trigger", "merge"]).unwrap();
        assert!(matches!(cli.command, Command::Trigger { job: TriggerCommand::Merge }));
    }
}
