use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{BoxError, FarmError};
use crate::farm::{FarmOptions, TaskFarm, WorkerFn};

/// Whether each unit of work gets a fresh farm or shares one long-lived farm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolMode {
    #[default]
    PerUnit,
    Reused,
}

impl FromStr for PoolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per-unit" | "per_unit" | "perunit" => Ok(Self::PerUnit),
            "reused" | "reuse" => Ok(Self::Reused),
            _ => Err(format!(
                "Unknown pool mode: '{}'. Valid options: per-unit, reused",
                s
            )),
        }
    }
}

/// Splits `[0, n)` into contiguous ranges of `ceil(n / workers)` indices; the
/// last range may be shorter.
pub fn chunk_ranges(n: usize, workers: usize) -> Result<Vec<Range<usize>>, FarmError> {
    if workers == 0 {
        return Err(FarmError::InvalidConfig(
            "cannot chunk work for 0 workers".to_string(),
        ));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let size = n.div_ceil(workers);
    Ok((0..n)
        .step_by(size)
        .map(|start| start..(start + size).min(n))
        .collect())
}

/// Submits one batch of payloads per unit of work and collects every result.
pub struct Dispatcher<P, R> {
    worker_fn: WorkerFn<P, R>,
    opts: FarmOptions,
    mode: PoolMode,
    farm: Option<TaskFarm<P, R>>,
    units: usize,
}

impl<P, R> Dispatcher<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new<F>(worker_fn: F, opts: FarmOptions, mode: PoolMode) -> Self
    where
        F: Fn(P) -> Result<R, BoxError> + Send + Sync + 'static,
    {
        Self::with_shared(Arc::new(worker_fn), opts, mode)
    }

    pub fn with_shared(worker_fn: WorkerFn<P, R>, opts: FarmOptions, mode: PoolMode) -> Self {
        Dispatcher {
            worker_fn,
            opts,
            mode,
            farm: None,
            units: 0,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.opts.num_workers
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn units_dispatched(&self) -> usize {
        self.units
    }

    /// Runs one unit of work. Either every result comes back, or the unit
    /// fails as a whole.
    pub async fn dispatch<I>(&mut self, payloads: I) -> Result<Vec<R>, FarmError>
    where
        I: IntoIterator<Item = P>,
    {
        self.units += 1;
        match self.mode {
            PoolMode::PerUnit => {
                let mut farm = TaskFarm::create_shared(self.worker_fn.clone(), self.opts.clone())?;
                let submitted = submit_all(&mut farm, payloads).await;
                let shutdown = farm.shutdown().await;
                submitted?;
                shutdown?;
                farm.drain_ok().await
            }
            PoolMode::Reused => {
                if self.farm.is_none() {
                    self.farm = Some(TaskFarm::create_shared(self.worker_fn.clone(), self.opts.clone())?);
                }
                let outcome = match self.farm.as_mut() {
                    Some(farm) => match submit_all(farm, payloads).await {
                        Ok(()) => farm.drain_ok().await,
                        Err(e) => Err(e),
                    },
                    None => unreachable!("farm created above"),
                };
                if outcome.is_err() {
                    // A farm that lost a unit cannot be trusted for the next one
                    if let Err(e) = self.finish().await {
                        warn!(error = %e, "Failed to release farm after a failed unit");
                    }
                }
                outcome
            }
        }
    }

    /// Shuts down the long-lived farm, if one is running.
    pub async fn finish(&mut self) -> Result<(), FarmError> {
        if let Some(mut farm) = self.farm.take() {
            let report = farm.shutdown().await?;
            debug!(
                farm = %farm.id(),
                units = self.units,
                jobs = report.jobs_submitted,
                "Dispatcher released its farm"
            );
        }
        Ok(())
    }
}

async fn submit_all<P, R, I>(farm: &mut TaskFarm<P, R>, payloads: I) -> Result<(), FarmError>
where
    P: Send + 'static,
    R: Send + 'static,
    I: IntoIterator<Item = P>,
{
    for payload in payloads {
        farm.submit(payload).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sizes(n: usize, w: usize) -> Vec<usize> {
        chunk_ranges(n, w).unwrap().iter().map(|r| r.len()).collect()
    }

    #[test]
    fn ten_over_three_workers() {
        assert_eq!(sizes(10, 3), vec![4, 4, 2]);
    }

    #[test]
    fn chunks_cover_domain_exactly() {
        for n in 0..40 {
            for w in 1..9 {
                let ranges = chunk_ranges(n, w).unwrap();
                let size = if n == 0 { 0 } else { n.div_ceil(w) };
                let mut next = 0;
                for (i, r) in ranges.iter().enumerate() {
                    assert_eq!(r.start, next, "n={n} w={w}");
                    if i + 1 < ranges.len() {
                        assert_eq!(r.len(), size, "n={n} w={w}");
                    } else {
                        assert!(r.len() >= 1 && r.len() <= size, "n={n} w={w}");
                    }
                    next = r.end;
                }
                assert_eq!(next, n);
                assert!(ranges.len() <= w);
            }
        }
    }

    #[test]
    fn empty_domain_and_zero_workers() {
        assert!(chunk_ranges(0, 4).unwrap().is_empty());
        assert!(chunk_ranges(5, 0).is_err());
        assert_eq!(sizes(2, 8), vec![1, 1]);
    }

    #[test]
    fn pool_mode_parses() {
        assert_eq!("per-unit".parse::<PoolMode>().unwrap(), PoolMode::PerUnit);
        assert_eq!("Reused".parse::<PoolMode>().unwrap(), PoolMode::Reused);
        assert!("sometimes".parse::<PoolMode>().is_err());
    }

    fn opts() -> FarmOptions {
        FarmOptions {
            num_workers: 3,
            queue_capacity: 8,
            wait_timeout: Some(Duration::from_secs(10)),
        }
    }

    #[tokio::test]
    async fn both_modes_return_every_result() {
        for mode in [PoolMode::PerUnit, PoolMode::Reused] {
            let mut dispatcher = Dispatcher::new(|r: Range<usize>| Ok(r.sum::<usize>()), opts(), mode);
            for _ in 0..3 {
                let results = dispatcher.dispatch(chunk_ranges(10, 3).unwrap()).await.unwrap();
                assert_eq!(results.len(), 3);
                assert_eq!(results.iter().sum::<usize>(), 45);
            }
            dispatcher.finish().await.unwrap();
            assert_eq!(dispatcher.units_dispatched(), 3);
        }
    }

    #[tokio::test]
    async fn failing_unit_is_fatal_in_both_modes() {
        for mode in [PoolMode::PerUnit, PoolMode::Reused] {
            let mut dispatcher = Dispatcher::new(
                |x: i32| {
                    if x < 0 {
                        Err(format!("negative input {x}").into())
                    } else {
                        Ok(x)
                    }
                },
                opts(),
                mode,
            );
            let err = dispatcher.dispatch(vec![1, -2, 3]).await.unwrap_err();
            assert!(matches!(err, FarmError::WorkerFault(_)));
            dispatcher.finish().await.unwrap();
        }
    }

    #[tokio::test]
    async fn reused_unit_keeps_its_own_error_when_release_also_fails() {
        let mut dispatcher = Dispatcher::new(
            |_: ()| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            },
            FarmOptions {
                num_workers: 1,
                queue_capacity: 4,
                wait_timeout: Some(Duration::from_millis(50)),
            },
            PoolMode::Reused,
        );

        // Drain gives up first; shutting the farm down then times out too
        let err = dispatcher.dispatch(vec![()]).await.unwrap_err();
        match err {
            FarmError::Timeout { stage, .. } => assert_eq!(stage, "drain"),
            other => panic!("unexpected error: {other}"),
        }
        dispatcher.finish().await.unwrap();
    }
}
