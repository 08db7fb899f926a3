use super::job::{Job, JobOutput, JobStatus};
use super::queue::JobQueue;
use crate::server::cache::{CacheError, ChunkCache};
use crate::server::gateway::{GatewayError, UpstreamGateway};
use crate::server::notify::Notifier;
use crate::server::storage::StorageGuard;
use crate::server::telemetry::{
    increment_cache_hits, increment_upstream_fetches, record_job_dequeued, record_job_finished,
    record_upstream_wait,
};
use core::time::Duration;
use extractq_core::{ChunkProgress, ChunkSpec, ServerMessage};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Error text for jobs the worker will never get to.
pub const SHUTTING_DOWN: &str = "Server shutting down";

/// Everything a job needs besides its own request.
#[derive(Clone)]
pub struct WorkerContext {
    pub gateway: Arc<dyn UpstreamGateway>,
    pub cache: ChunkCache,
    pub notifier: Arc<dyn Notifier>,
    pub storage: Arc<dyn StorageGuard>,
    /// Upper bound on a single rate-limit sleep before capacity is checked
    /// again.
    pub max_wait: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The capacity check failed; the chunk was never fetched.
    #[error("Upstream status check failed: {0}")]
    Upstream(#[source] GatewayError),

    #[error("Upstream fetch failed: {0}")]
    Fetch(#[source] GatewayError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Job panicked: {reason}")]
    Panicked { reason: String },
}

impl JobError {
    /// Text of the `error` message sent to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream(_) => "Can't access overpass API".to_string(),
            Self::Fetch(e) => format!("Overpass query failed: {e}"),
            Self::Cache(e) => e.to_string(),
            Self::Panicked { .. } => "Internal error while processing request".to_string(),
        }
    }

    /// Operator alert for failures someone should look at. Cache key
    /// problems are the client's doing and only get logged.
    pub fn alert(&self) -> Option<(String, String)> {
        match self {
            Self::Upstream(e) | Self::Fetch(e) => Some(e.alert()),
            Self::Cache(CacheError::InvalidKey { .. }) => None,
            Self::Cache(e @ CacheError::Io { .. }) => {
                Some(("Chunk cache write failed".to_string(), e.to_string()))
            }
            Self::Panicked { reason } => Some(("Relay job panicked".to_string(), reason.clone())),
        }
    }
}

/// Runs jobs one at a time until `shutdown` fires. The job in progress is
/// allowed to finish; jobs still queued at that point are failed.
pub async fn worker_loop(queue: Arc<JobQueue>, ctx: WorkerContext, shutdown: CancellationToken) {
    tracing::info!("Scheduler worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = queue.pop() => job,
        };
        record_job_dequeued();
        run_isolated(job, &ctx).await;
    }

    let remaining = queue.close();
    let rejected = remaining.len();
    for job in remaining {
        record_job_dequeued();
        job.reject(SHUTTING_DOWN);
    }

    tracing::info!(rejected, "Scheduler worker stopped");
}

/// Processes `job` on its own task so a panic fails only this job.
async fn run_isolated(mut job: Job, ctx: &WorkerContext) {
    let span = tracing::info_span!(
        "job",
        job_id = job.id,
        client = %job.client,
        priority = job.priority,
        chunks = job.chunks.len(),
    );
    job.status = JobStatus::Running;
    tracing::info!(parent: &span, status = %job.status, "Job started");

    let started = Instant::now();
    let output = job.output.clone();
    let task = tokio::spawn(
        process_job(ctx.clone(), job.place, job.chunks, job.output).instrument(span.clone()),
    );

    let result = match task.await {
        Ok(res) => res,
        Err(e) if e.is_panic() => Err(JobError::Panicked {
            reason: panic_reason(e.into_panic()),
        }),
        Err(e) => Err(JobError::Panicked {
            reason: e.to_string(),
        }),
    };

    let elapsed = started.elapsed();
    match result {
        Ok(()) => {
            output.finish();
            job.status = JobStatus::Completed;
            tracing::info!(parent: &span, status = %job.status, ?elapsed, "Job finished");
            if output.is_abandoned() {
                tracing::debug!(parent: &span, "Client left before the job finished; chunks stay cached");
            }
        }
        Err(e) => {
            output.send(ServerMessage::error(e.client_message()));
            output.finish();
            job.status = JobStatus::Failed;
            tracing::error!(parent: &span, status = %job.status, error = %e, ?elapsed, "Job failed");
            if let Some((subject, body)) = e.alert() {
                ctx.notifier.notify(&subject, &body).await;
            }
        }
    }
    record_job_finished(elapsed.as_secs_f64(), job.status == JobStatus::Failed);
}

fn panic_reason(payload: Box<dyn core::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn process_job(
    ctx: WorkerContext,
    place: Value,
    chunks: Vec<ChunkSpec>,
    output: JobOutput,
) -> Result<(), JobError> {
    for (num, chunk) in chunks.into_iter().enumerate() {
        let progress = ChunkProgress {
            num,
            filename: chunk.filename.clone(),
            place: place.clone(),
        };

        if let Some(query) = chunk.query() {
            if ctx.cache.exists(&chunk.filename).await? {
                increment_cache_hits();
                tracing::debug!(num, filename = %chunk.filename, "Cache hit");
            } else {
                ctx.storage.check_free_space().await;
                wait_for_slot(&ctx, &output).await?;

                output.send(ServerMessage::RunQuery(progress.clone()));
                tracing::debug!(num, filename = %chunk.filename, "Fetching chunk");
                increment_upstream_fetches();
                let bytes = ctx.gateway.fetch(query).await.map_err(JobError::Fetch)?;
                ctx.cache.write(&chunk.filename, bytes).await?;
                ctx.storage.check_free_space().await;
            }
        }

        output.send(ServerMessage::Chunk(progress));
    }
    Ok(())
}

/// Sleeps until the upstream reports a usable slot, telling the client how
/// long each sleep is.
async fn wait_for_slot(ctx: &WorkerContext, output: &JobOutput) -> Result<(), JobError> {
    loop {
        let status = ctx.gateway.status().await.map_err(JobError::Upstream)?;
        let Some(secs) = status.wait_secs() else {
            return Ok(());
        };

        let wait = Duration::from_secs(secs).min(ctx.max_wait);
        output.send(ServerMessage::Status {
            wait: wait.as_secs(),
        });
        tracing::info!(wait_secs = wait.as_secs(), "Waiting for upstream slot");
        record_upstream_wait(wait.as_secs_f64());
        tokio::time::sleep(wait).await;
    }
}
