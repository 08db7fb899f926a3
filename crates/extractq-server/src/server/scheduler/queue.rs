use super::job::{Job, JobId};
use core::cmp::Ordering;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use tokio::sync::Notify;

/// Pending jobs, smallest priority first. Jobs with equal priority come out
/// in submission order.
///
/// Once [`close`](Self::close)d the queue accepts nothing more, so a job can
/// never be left behind after the worker is gone.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    ready: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
struct Entry {
    priority: f64,
    seq: u64,
    job: Job,
}

// `BinaryHeap` is a max-heap, so both keys compare reversed.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `job`, assigning and returning its id. A closed queue hands
    /// the job back instead.
    pub fn push(&self, mut job: Job) -> Result<JobId, Job> {
        let id = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            job.id = seq;
            if inner.closed {
                return Err(job);
            }
            inner.heap.push(Entry {
                priority: job.priority,
                seq,
                job,
            });
            seq
        };
        self.ready.notify_one();
        Ok(id)
    }

    pub fn try_pop(&self) -> Option<Job> {
        self.inner.lock().heap.pop().map(|entry| entry.job)
    }

    /// Waits until a job is available and takes it.
    pub async fn pop(&self) -> Job {
        loop {
            if let Some(job) = self.try_pop() {
                return job;
            }
            self.ready.notified().await;
        }
    }

    /// Refuses further pushes and returns whatever was still queued, in
    /// priority order.
    pub fn close(&self) -> Vec<Job> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut remaining = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            remaining.push(entry.job);
        }
        remaining
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().heap.len()
    }
}
