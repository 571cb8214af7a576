use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::worker::{self, WorkerExit, WorkerFn, WorkerQueues};
use crate::error::{BoxError, FarmError};
use crate::jobs::{Job, JobResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmOptions {
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub wait_timeout: Option<Duration>,
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            queue_capacity: 256,
            wait_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl FarmOptions {
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FarmState {
    Accepting,
    ShutDown,
}

/// One running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: usize,
    handle: JoinHandle<WorkerExit>,
}

/// Counts gathered while tearing a farm down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub jobs_submitted: usize,
    pub sentinels_consumed: usize,
    pub workers_joined: usize,
}

/// A fixed pool of workers fed from one job queue and reporting into one
/// result queue.
///
/// Lifecycle is `create` → `submit`* → `shutdown` → `drain`, or any number of
/// `submit`/`drain` cycles before a final `shutdown` when the farm is reused.
/// Results come back in no particular order.
pub struct TaskFarm<P, R> {
    id: Uuid,
    job_tx: Option<Sender<Job<P>>>,
    result_rx: UnboundedReceiver<JobResult<R>>,
    acks: watch::Receiver<usize>,
    workers: Vec<WorkerHandle>,
    num_workers: usize,
    total_jobs_submitted: usize,
    results_received: usize,
    wait_timeout: Option<Duration>,
    state: FarmState,
}

impl<P, R> TaskFarm<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn create<F>(worker_fn: F, opts: FarmOptions) -> Result<Self, FarmError>
    where
        F: Fn(P) -> Result<R, BoxError> + Send + Sync + 'static,
    {
        Self::create_shared(Arc::new(worker_fn), opts)
    }

    /// Like `create`, for callers that keep the worker function around to
    /// build further farms.
    pub fn create_shared(worker_fn: WorkerFn<P, R>, opts: FarmOptions) -> Result<Self, FarmError> {
        if opts.num_workers == 0 {
            return Err(FarmError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if opts.queue_capacity == 0 {
            return Err(FarmError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        let runtime = Handle::try_current().map_err(|e| FarmError::Spawn {
            worker: 0,
            reason: e.to_string(),
        })?;

        let id = Uuid::new_v4();
        let (job_tx, job_rx) = mpsc::channel::<Job<P>>(opts.queue_capacity);
        let (result_tx, result_rx) = mpsc::unbounded_channel::<JobResult<R>>();
        let (ack_tx, ack_rx) = watch::channel(0usize);

        let jobs = Arc::new(Mutex::new(job_rx));
        let acks = Arc::new(ack_tx);

        let workers = (0..opts.num_workers)
            .map(|worker_id| {
                let queues = WorkerQueues {
                    jobs: jobs.clone(),
                    results: result_tx.clone(),
                    acks: acks.clone(),
                };
                let handle = runtime.spawn(worker::run(worker_id, queues, worker_fn.clone()));
                WorkerHandle {
                    id: worker_id,
                    handle,
                }
            })
            .collect();

        debug!(farm = %id, workers = opts.num_workers, "Task farm started");

        Ok(TaskFarm {
            id,
            job_tx: Some(job_tx),
            result_rx,
            acks: ack_rx,
            workers,
            num_workers: opts.num_workers,
            total_jobs_submitted: 0,
            results_received: 0,
            wait_timeout: opts.wait_timeout,
            state: FarmState::Accepting,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn total_jobs_submitted(&self) -> usize {
        self.total_jobs_submitted
    }

    pub fn outstanding(&self) -> usize {
        self.total_jobs_submitted - self.results_received
    }

    pub fn is_shut_down(&self) -> bool {
        self.state == FarmState::ShutDown
    }

    pub async fn submit(&mut self, payload: P) -> Result<(), FarmError> {
        let job_tx = match (&self.job_tx, self.state) {
            (Some(tx), FarmState::Accepting) => tx,
            _ => {
                return Err(FarmError::AccountingViolation(
                    "work submitted after shutdown began",
                ))
            }
        };

        let seq = self.total_jobs_submitted as u64;
        if job_tx.send(Job::work(seq, payload)).await.is_err() {
            return Err(FarmError::WorkersLost {
                expected: self.total_jobs_submitted + 1,
                received: self.results_received,
            });
        }
        self.total_jobs_submitted += 1;
        Ok(())
    }

    /// Waits for every outstanding result.
    pub async fn drain(&mut self) -> Result<Vec<JobResult<R>>, FarmError> {
        let expected = self.outstanding();
        let mut results = Vec::with_capacity(expected);
        let timeout = self.wait_timeout;

        let collect = async {
            while results.len() < expected {
                match self.result_rx.recv().await {
                    Some(result) => results.push(result),
                    None => break,
                }
            }
        };

        let completed = bounded("drain", timeout, collect).await.is_some();
        self.results_received += results.len();

        if !completed {
            return Err(FarmError::Timeout {
                stage: "drain",
                waited: timeout.unwrap_or_default(),
                expected,
                observed: results.len(),
            });
        }
        if results.len() < expected {
            return Err(FarmError::WorkersLost {
                expected: self.total_jobs_submitted,
                received: self.results_received,
            });
        }

        debug!(farm = %self.id, received = results.len(), "Drained results");
        Ok(results)
    }

    /// Drains and unwraps every result, failing on the first worker fault.
    pub async fn drain_ok(&mut self) -> Result<Vec<R>, FarmError> {
        self.drain()
            .await?
            .into_iter()
            .map(|r| r.into_result().map_err(FarmError::WorkerFault))
            .collect()
    }

    pub async fn shutdown(&mut self) -> Result<ShutdownReport, FarmError> {
        if self.state == FarmState::ShutDown {
            return Err(FarmError::AccountingViolation("farm shut down twice"));
        }
        self.state = FarmState::ShutDown;

        let job_tx = self
            .job_tx
            .take()
            .ok_or(FarmError::AccountingViolation("job queue already closed"))?;

        // Every work job and every sentinel must be acknowledged. Sentinels
        // can wait on a full queue, so sending them counts against the limit.
        let expected = self.total_jobs_submitted + self.num_workers;
        let timeout = self.wait_timeout;
        let (farm_id, num_workers) = (self.id, self.num_workers);
        let mut acks = self.acks.clone();
        let waited = bounded("shutdown", timeout, async move {
            for _ in 0..num_workers {
                if job_tx.send(Job::Shutdown).await.is_err() {
                    warn!(farm = %farm_id, "Job queue closed before all sentinels were sent");
                    break;
                }
            }
            drop(job_tx);
            let _ = acks.wait_for(|count| *count >= expected).await;
        })
        .await;
        if waited.is_none() {
            let observed = *self.acks.borrow();
            self.abort_workers();
            return Err(FarmError::Timeout {
                stage: "shutdown",
                waited: timeout.unwrap_or_default(),
                expected,
                observed,
            });
        }

        // Buffered results stay readable
        self.result_rx.close();

        let handles: Vec<_> = self.workers.drain(..).map(|w| w.handle).collect();
        let exits = join_all(handles).await;

        let mut report = ShutdownReport {
            jobs_submitted: self.total_jobs_submitted,
            sentinels_consumed: 0,
            workers_joined: 0,
        };
        for exit in exits {
            match exit {
                Ok(exit) => {
                    report.workers_joined += 1;
                    if exit.consumed_sentinel {
                        report.sentinels_consumed += 1;
                    }
                }
                Err(e) => warn!(farm = %self.id, error = %e, "Worker task did not exit cleanly"),
            }
        }

        info!(
            farm = %self.id,
            jobs = report.jobs_submitted,
            workers = report.workers_joined,
            "Task farm shut down"
        );
        Ok(report)
    }

    fn abort_workers(&mut self) {
        for worker in self.workers.drain(..) {
            worker.handle.abort();
        }
    }
}

impl<P, R> Drop for TaskFarm<P, R> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            debug!(farm = %self.id, "Task farm dropped without shutdown; aborting workers");
            for worker in self.workers.drain(..) {
                worker.handle.abort();
            }
        }
    }
}

async fn bounded<T>(stage: &'static str, timeout: Option<Duration>, fut: impl Future<Output = T>) -> Option<T> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(stage, ?limit, "Wait exceeded its limit");
                None
            }
        },
        None => Some(fut.await),
    }
}
