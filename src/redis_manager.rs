//! Redis Manager - Centralized Redis connection and operations
//!
//! Covers the worker's side of the queue protocol:
//! - Worker ID allocation with an expiring lease
//! - Job intake from the grading queue (BLPOP)
//! - Report storage and publishing

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::grader::SubmissionReport;
use crate::worker::GradeJob;

/// Redis key constants
pub mod keys {
    /// Worker lease key prefix for distributed worker ID allocation
    pub const WORKER_LEASE_PREFIX: &str = "grader:worker:lease:";

    /// Grading job queue key
    pub const GRADE_QUEUE: &str = "grader:queue";

    /// Report key prefix (for polling)
    pub const RESULT_PREFIX: &str = "grader:result:";

    /// Report channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "grader:results";
}

/// Configuration constants
const MAX_WORKERS: u32 = 10;
const WORKER_LEASE_TTL_SECS: u64 = 120;
const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

pub fn worker_lease_key(worker_id: u32) -> String {
    format!("{}{}", keys::WORKER_LEASE_PREFIX, worker_id)
}

pub fn result_key(submission_id: i64) -> String {
    format!("{}{}", keys::RESULT_PREFIX, submission_id)
}

/// Centralized Redis manager for all Redis operations
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
    lease: WorkerLease,
}

impl RedisManager {
    /// Connect to Redis and lease a worker ID (0 to MAX_WORKERS-1).
    /// The lease is kept alive in the background until the manager is dropped.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = connect_with_retry(&client).await;
        info!("Connected to Redis at {}", redis_url);

        let lease = WorkerLease::acquire(&client).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            lease.worker_id, WORKER_LEASE_TTL_SECS
        );

        Ok(Self {
            client,
            conn,
            lease,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.lease.worker_id
    }

    /// Block until the next job is queued.
    ///
    /// Reconnects when the connection drops; malformed jobs are logged and skipped.
    pub async fn pop_job(&mut self) -> Result<GradeJob> {
        loop {
            let popped: Option<(String, String)> = match self.conn.blpop(keys::GRADE_QUEUE, 0.0).await {
                Ok(popped) => popped,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.conn = connect_with_retry(&self.client).await;
                    continue;
                }
            };
            let Some((_, payload)) = popped else {
                continue;
            };

            match serde_json::from_str::<GradeJob>(&payload) {
                Ok(job) => return Ok(job),
                Err(e) => warn!("Dropping malformed grading job: {}. Data: {}", e, payload),
            }
        }
    }

    /// A handle for storing reports from spawned grading tasks
    pub fn publisher(&self) -> ReportPublisher {
        ReportPublisher {
            client: self.client.clone(),
            conn: self.conn.clone(),
        }
    }
}

/// Stores submission reports for polling and publishes them to subscribers
#[derive(Clone)]
pub struct ReportPublisher {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ReportPublisher {
    /// Store a report under `grader:result:<id>` for an hour and announce it
    /// on the results channel.
    pub async fn store_report(&mut self, report: &SubmissionReport) -> Result<()> {
        let key = result_key(report.submission.id);
        let json = serde_json::to_string(report)?;

        if let Err(e) = self.conn.set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS).await {
            warn!("Failed to store report: {}. Reconnecting...", e);
            self.conn = connect_with_retry(&self.client).await;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await
                .with_context(|| format!("Failed to store report at {}", key))?;
        }

        // Nobody may be subscribed
        if let Err(e) = self.conn.publish::<_, _, ()>(keys::RESULT_CHANNEL, &json).await {
            debug!("Failed to publish report {}: {}", key, e);
        }
        Ok(())
    }
}

/// Exclusive claim on a worker id, refreshed until dropped
struct WorkerLease {
    worker_id: u32,
    heartbeat: JoinHandle<()>,
}

impl WorkerLease {
    /// Claim the first free worker id, waiting while all are taken
    async fn acquire(client: &redis::Client) -> Result<Self> {
        loop {
            let mut conn = connect_with_retry(client).await;
            for worker_id in 0..MAX_WORKERS {
                let claimed: Option<String> = conn
                    .set_options(worker_lease_key(worker_id), "claimed", lease_options())
                    .await
                    .context("Failed to claim worker lease")?;
                if claimed.is_some() {
                    let heartbeat = tokio::spawn(refresh_lease(client.clone(), worker_id));
                    return Ok(Self {
                        worker_id,
                        heartbeat,
                    });
                }
            }

            warn!("No free worker_id (0-{}). Retrying in 1 second...", MAX_WORKERS - 1);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// SET NX EX: only one worker holds an id, and a dead worker's id frees up
fn lease_options() -> SetOptions {
    SetOptions::default()
        .conditional_set(ExistenceCheck::NX)
        .with_expiration(SetExpiry::EX(WORKER_LEASE_TTL_SECS))
}

/// Push the lease expiry forward at half the TTL
async fn refresh_lease(client: redis::Client, worker_id: u32) {
    let key = worker_lease_key(worker_id);
    let mut ticks = tokio::time::interval(Duration::from_secs(WORKER_LEASE_TTL_SECS / 2));
    // The first tick completes immediately and the lease was just set
    ticks.tick().await;

    let mut conn = connect_with_retry(&client).await;
    loop {
        ticks.tick().await;
        if let Err(e) = conn.expire::<_, ()>(&key, WORKER_LEASE_TTL_SECS as i64).await {
            warn!("Failed to refresh worker lease {}: {}", worker_id, e);
            conn = connect_with_retry(&client).await;
        }
    }
}

/// Open a multiplexed connection, retrying every few seconds until Redis answers
async fn connect_with_retry(client: &redis::Client) -> MultiplexedConnection {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!("Failed to connect to Redis: {}. Retrying in 3 seconds...", e);
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_options() {
        use redis::ToRedisArgs;

        let args: Vec<String> = lease_options()
            .to_redis_args()
            .into_iter()
            .map(|arg| String::from_utf8(arg).unwrap())
            .collect();
        assert!(args.contains(&"NX".to_string()));
        assert!(args.contains(&"EX".to_string()));
        assert!(args.contains(&WORKER_LEASE_TTL_SECS.to_string()));
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(worker_lease_key(3), "grader:worker:lease:3");
        assert_eq!(result_key(42), "grader:result:42");
        assert_eq!(keys::GRADE_QUEUE, "grader:queue");
    }
}
