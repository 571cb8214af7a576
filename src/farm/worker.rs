use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::error::BoxError;
use crate::jobs::{FaultKind, Job, JobResult, WorkerFault};

/// Function applied by every worker to each `Work` payload.
pub type WorkerFn<P, R> = Arc<dyn Fn(P) -> Result<R, BoxError> + Send + Sync>;

/// Shared ends of the queue pair plus the acknowledgment counter.
pub(crate) struct WorkerQueues<P, R> {
    pub(crate) jobs: Arc<Mutex<Receiver<Job<P>>>>,
    pub(crate) results: UnboundedSender<JobResult<R>>,
    pub(crate) acks: Arc<watch::Sender<usize>>,
}

/// How a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: usize,
    pub jobs_completed: usize,
    pub consumed_sentinel: bool,
}

/// Receives jobs until a `Shutdown` sentinel arrives. Every received job is
/// acknowledged exactly once, sentinel included.
pub(crate) async fn run<P, R>(worker: usize, queues: WorkerQueues<P, R>, func: WorkerFn<P, R>) -> WorkerExit
where
    P: Send + 'static,
    R: Send + 'static,
{
    let WorkerQueues { jobs, results, acks } = queues;
    let mut jobs_completed = 0;

    loop {
        // Hold the lock only while waiting for the next job
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };

        match job {
            Some(Job::Shutdown) => {
                acknowledge(&acks);
                debug!(worker, jobs_completed, "Exiting on shutdown sentinel");
                return WorkerExit {
                    worker,
                    jobs_completed,
                    consumed_sentinel: true,
                };
            }
            Some(Job::Work { seq, payload }) => {
                trace!(worker, seq, "Processing job");
                let outcome = execute(worker, seq, payload, func.clone()).await;
                jobs_completed += 1;
                acknowledge(&acks);
                if results.send(outcome).is_err() {
                    warn!(worker, seq, "Result queue closed; dropping result");
                }
            }
            None => {
                warn!(worker, jobs_completed, "Job queue closed without a shutdown sentinel");
                return WorkerExit {
                    worker,
                    jobs_completed,
                    consumed_sentinel: false,
                };
            }
        }
    }
}

async fn execute<P, R>(worker: usize, seq: u64, payload: P, func: WorkerFn<P, R>) -> JobResult<R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let fault = |kind, message| {
        JobResult::Failure(WorkerFault {
            worker,
            seq,
            kind,
            message,
        })
    };

    match tokio::task::spawn_blocking(move || func(payload)).await {
        Ok(Ok(result)) => JobResult::Success(result),
        Ok(Err(e)) => {
            warn!(worker, seq, error = %e, "Worker function failed");
            fault(FaultKind::Error, e.to_string())
        }
        Err(join_err) if join_err.is_panic() => {
            let message = panic_message(join_err.into_panic());
            warn!(worker, seq, %message, "Worker function panicked");
            fault(FaultKind::Panic, message)
        }
        Err(join_err) => fault(FaultKind::Error, join_err.to_string()),
    }
}

fn acknowledge(acks: &watch::Sender<usize>) {
    acks.send_modify(|count| *count += 1);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
