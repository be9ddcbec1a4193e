use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_ROLLOUTS: &str = "rollouts";
pub const QUEUE_MAINTENANCE: &str = "maintenance";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
}

/// One unit of background work. `kind` is a stable label used for logging and
/// for the `enqueue_unique` dedupe digest; it is not the job's identity on its
/// own (that's `kind` + the caller-supplied dedupe key).
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn run(&self) -> Result<(), String>;

    /// Re-delivery budget for a failing job. Most recurring jobs (tick,
    /// schedule sweep, drift scan) are naturally retried by their next
    /// scheduled invocation and so return 1; only genuinely one-shot jobs
    /// need more.
    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Per-queue concurrency ceilings (spec §4.8, §9 defaults).
#[derive(Debug, Clone, Copy)]
pub struct JobRunnerConfig {
    pub default_concurrency: usize,
    pub rollouts_concurrency: usize,
    pub maintenance_concurrency: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 10,
            rollouts_concurrency: 5,
            maintenance_concurrency: 2,
        }
    }
}

/// Background job runner with named queues, per-queue concurrency limits via
/// `tokio::sync::Semaphore`, `blake3`-digest uniqueness windows, and bounded
/// retry. The durable (`sentinel_jobs` table, `FOR UPDATE SKIP LOCKED` poller)
/// backend described for a production Postgres deployment is not built here —
/// see DESIGN.md; every recurring job this service schedules (tick, schedule
/// sweep, drift scan) is idempotent and re-runs on its own interval, so an
/// in-process scheduler that simply restarts with the process is sufficient
/// for this crate's scope.
pub struct JobRunner {
    queues: HashMap<&'static str, Arc<Semaphore>>,
    recent: Arc<Mutex<HashMap<blake3::Hash, Instant>>>,
    inline: bool,
}

impl JobRunner {
    pub fn new(config: JobRunnerConfig) -> Self {
        let mut queues = HashMap::new();
        queues.insert(QUEUE_DEFAULT, Arc::new(Semaphore::new(config.default_concurrency)));
        queues.insert(QUEUE_ROLLOUTS, Arc::new(Semaphore::new(config.rollouts_concurrency)));
        queues.insert(
            QUEUE_MAINTENANCE,
            Arc::new(Semaphore::new(config.maintenance_concurrency)),
        );
        Self {
            queues,
            recent: Arc::new(Mutex::new(HashMap::new())),
            inline: false,
        }
    }

    /// Every job runs synchronously inside the call that enqueues it — no
    /// background concurrency to reason about, for deterministic tests.
    pub fn inline() -> Self {
        Self {
            queues: HashMap::new(),
            recent: Arc::new(Mutex::new(HashMap::new())),
            inline: true,
        }
    }

    pub async fn enqueue(&self, queue: &str, job: Arc<dyn Job>) -> Result<(), QueueError> {
        self.enqueue_delayed(queue, job, None).await
    }

    pub async fn enqueue_delayed(
        &self,
        queue: &str,
        job: Arc<dyn Job>,
        schedule_in: Option<Duration>,
    ) -> Result<(), QueueError> {
        if self.inline {
            if let Some(delay) = schedule_in {
                tokio::time::sleep(delay).await;
            }
            run_with_retry(job).await;
            return Ok(());
        }

        let semaphore = self
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        tokio::spawn(async move {
            if let Some(delay) = schedule_in {
                tokio::time::sleep(delay).await;
            }
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("job queue semaphore should never be closed");
            run_with_retry(job).await;
        });
        Ok(())
    }

    /// Skips the enqueue if a job with the same `(kind, dedupe_key)` digest was
    /// accepted within `window`. The mechanism behind the drift reconciler's
    /// "only one concurrent scan" rule (spec §4.7/§4.8, 30s window).
    pub async fn enqueue_unique(
        &self,
        queue: &str,
        job: Arc<dyn Job>,
        dedupe_key: &str,
        window: Duration,
    ) -> Result<bool, QueueError> {
        let digest = blake3::hash(format!("{}:{}", job.kind(), dedupe_key).as_bytes());
        {
            let mut recent = self.recent.lock().await;
            recent.retain(|_, seen_at| seen_at.elapsed() < window);
            if recent.contains_key(&digest) {
                return Ok(false);
            }
            recent.insert(digest, Instant::now());
        }
        self.enqueue(queue, job).await?;
        Ok(true)
    }
}

async fn run_with_retry(job: Arc<dyn Job>) {
    let max_attempts = job.max_attempts().max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match job.run().await {
            Ok(()) => {
                info!(kind = job.kind(), attempt, "job completed");
                return;
            }
            Err(message) if attempt < max_attempts => {
                warn!(kind = job.kind(), attempt, max_attempts, error = %message, "job failed, retrying");
            }
            Err(message) => {
                error!(kind = job.kind(), attempt, max_attempts, error = %message, "job failed, giving up");
                return;
            }
        }
    }
}
