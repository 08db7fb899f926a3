//! Global priority queue plus the single worker that drains it.
//!
//! Sessions submit [`Job`]s through a cloned [`Scheduler`] handle. One
//! worker task pops the job with the smallest priority, processes its chunks
//! in order and reports progress on the job's output channel. A job runs to
//! completion before the next is dequeued, so the upstream only ever sees
//! one request at a time from this relay and each cache key has at most one
//! writer.

mod job;
mod queue;
mod worker;

pub use job::{Job, JobEvent, JobId, JobOutput, JobStatus, output_channel};
pub use queue::JobQueue;
pub use worker::{JobError, SHUTTING_DOWN, WorkerContext, worker_loop};

use crate::server::telemetry::record_job_enqueued;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Scheduler {
    queue: Arc<JobQueue>,
}

impl Scheduler {
    /// Starts the worker. It stops once `shutdown` is cancelled and the job
    /// in progress, if any, has finished.
    pub fn spawn(ctx: WorkerContext, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let queue = Arc::new(JobQueue::new());
        let handle = tokio::spawn(worker_loop(queue.clone(), ctx, shutdown));
        (Self { queue }, handle)
    }

    /// Queues `job`. Once the worker has stopped the job is failed on the
    /// spot, so its session still sees a terminal event.
    pub fn submit(&self, job: Job) -> JobId {
        match self.queue.push(job) {
            Ok(id) => {
                record_job_enqueued();
                tracing::debug!(job_id = id, queued = self.queue.pending(), "Job queued");
                id
            }
            Err(job) => {
                let id = job.id;
                tracing::warn!(job_id = id, client = %job.client, "Worker stopped, rejecting job");
                job.reject(SHUTTING_DOWN);
                id
            }
        }
    }

    /// Jobs waiting for the worker, excluding the one in progress.
    pub fn queued(&self) -> usize {
        self.queue.pending()
    }
}

#[cfg(test)]
mod tests;
