use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of work carried on the farm's job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job<P> {
    Work { seq: u64, payload: P },
    Shutdown,
}

impl<P> Job<P> {
    pub fn work(seq: u64, payload: P) -> Self {
        Job::Work { seq, payload }
    }
}

/// What a worker produced for one `Work` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobResult<R> {
    Success(R),
    Failure(WorkerFault),
}

impl<R> JobResult<R> {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobResult::Failure(_))
    }

    pub fn into_result(self) -> Result<R, WorkerFault> {
        match self {
            JobResult::Success(r) => Ok(r),
            JobResult::Failure(fault) => Err(fault),
        }
    }
}

/// A worker function returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFault {
    pub worker: usize,
    pub seq: u64,
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    Error,
    Panic,
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FaultKind::Error => "failed",
            FaultKind::Panic => "panicked",
        };
        write!(f, "job {} on worker {} {}: {}", self.seq, self.worker, kind, self.message)
    }
}

impl std::error::Error for WorkerFault {}
