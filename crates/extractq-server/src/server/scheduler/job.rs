use extractq_core::{ChunkSpec, PlaceRequest, ServerMessage};
use serde_json::Value;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub type JobId = u64;

/// What the worker hands back to the session relaying a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Message(ServerMessage),
    /// No further messages follow. Sent exactly once per job, after the last
    /// message, whether the job succeeded or failed.
    Finished,
}

/// Worker side of a job's output channel.
///
/// Sends never block and never fail from the worker's point of view: a
/// session that went away simply stops reading, and the job runs to
/// completion regardless so its chunks still land in the cache.
#[derive(Debug, Clone)]
pub struct JobOutput {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobOutput {
    pub fn send(&self, message: ServerMessage) {
        let _ = self.tx.send(JobEvent::Message(message));
    }

    pub fn finish(&self) {
        let _ = self.tx.send(JobEvent::Finished);
    }

    /// Whether the receiving session is gone.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn output_channel() -> (JobOutput, mpsc::UnboundedReceiver<JobEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (JobOutput { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug)]
pub struct Job {
    /// Assigned by the queue on submission.
    pub id: JobId,
    pub priority: f64,
    pub place: Value,
    pub chunks: Vec<ChunkSpec>,
    pub output: JobOutput,
    pub client: SocketAddr,
    pub status: JobStatus,
}

impl Job {
    pub fn new(request: PlaceRequest, output: JobOutput, client: SocketAddr) -> Self {
        let priority = request.priority();
        Self {
            id: 0,
            priority,
            place: request.place,
            chunks: request.chunks,
            output,
            client,
            status: JobStatus::Queued,
        }
    }

    /// Ends a job that will never run with an error and the sentinel.
    pub fn reject(self, reason: &str) {
        self.output.send(ServerMessage::error(reason));
        self.output.finish();
    }
}
