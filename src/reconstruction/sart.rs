//! Iterative reconstruction loop.
//!
//! For every slice the estimate starts at zero. Each iteration dispatches one
//! unit of work per projection angle, folding every partial update into the
//! update accumulator. The accumulator is read once, when the iteration ends,
//! as `estimate += relax * update / (weight + epsilon)`.
//!
//! The weight accumulator is filled only during the first iteration of a
//! slice and reused by every later one.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Instrument};

use super::grid::Grid;
use super::ray::{ray_update, RayPayload, RayResult};
use super::volume::Projections;
use crate::dispatcher::{chunk_ranges, Dispatcher, PoolMode};
use crate::error::{FarmError, ReconstructionError};
use crate::farm::{FarmOptions, WorkerFn};
use crate::interface::{ReporterTraits, SliceReport};

/// Progress is logged every this many projections.
const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SartOptions {
    pub iterations: usize,
    pub relaxation: f64,
    pub weight_epsilon: f64,
    pub slice: Option<usize>,
    pub farm: FarmOptions,
    pub pool_mode: PoolMode,
}

impl Default for SartOptions {
    fn default() -> Self {
        Self {
            iterations: 50,
            relaxation: 1.0,
            weight_epsilon: 0.1,
            slice: None,
            farm: FarmOptions::default(),
            pool_mode: PoolMode::PerUnit,
        }
    }
}

impl SartOptions {
    /// Reads options from a JSON file. Missing fields keep their defaults.
    pub async fn load(path: &Path) -> Result<Self, ReconstructionError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ReconstructionError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            ReconstructionError::InvalidInput(format!("bad options in {}: {}", path.display(), e))
        })
    }
}

/// Running sums shared by all units of work in one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulators {
    update: Grid,
    weight: Grid,
    folded: usize,
}

impl Accumulators {
    pub fn new(n: usize) -> Self {
        Accumulators {
            update: Grid::square(n),
            weight: Grid::square(n),
            folded: 0,
        }
    }

    /// Start of an iteration.
    pub fn reset_update(&mut self) {
        self.update.fill(0.0);
        self.folded = 0;
    }

    /// Start of a slice.
    pub fn reset_weight(&mut self) {
        self.weight.fill(0.0);
    }

    pub fn update(&self) -> &Grid {
        &self.update
    }

    pub fn weight(&self) -> &Grid {
        &self.weight
    }

    pub fn folded(&self) -> usize {
        self.folded
    }

    pub fn fold(&mut self, result: &RayResult) {
        self.update.add_assign(&result.update);
        if let Some(weight) = &result.weight {
            self.weight.add_assign(weight);
        }
        self.folded += 1;
    }

    pub fn fold_all<'a>(&mut self, results: impl IntoIterator<Item = &'a RayResult>) {
        for result in results {
            self.fold(result);
        }
    }

    /// End of an iteration: applies the accumulated update to `estimate`.
    pub fn apply(&self, estimate: &mut Grid, relax: f64, epsilon: f64) {
        for r in 0..estimate.rows() {
            for c in 0..estimate.cols() {
                estimate[(r, c)] += relax * self.update[(r, c)] / (self.weight[(r, c)] + epsilon);
            }
        }
    }
}

/// Runs one unit of work and folds it. Nothing is folded unless every chunk
/// succeeded.
pub async fn reduce_unit<I>(
    dispatcher: &mut Dispatcher<RayPayload, RayResult>,
    acc: &mut Accumulators,
    payloads: I,
) -> Result<usize, FarmError>
where
    I: IntoIterator<Item = RayPayload>,
{
    let results = dispatcher.dispatch(payloads).await?;
    acc.fold_all(&results);
    Ok(results.len())
}

/// Reconstruction of one slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceReconstruction {
    pub slice: usize,
    pub estimate: Grid,
}

pub struct Sart {
    projections: Projections,
    opts: SartOptions,
    reporter: Arc<dyn ReporterTraits>,
    ray_fn: WorkerFn<RayPayload, RayResult>,
}

impl Sart {
    pub fn new(
        projections: Projections,
        opts: SartOptions,
        reporter: Arc<dyn ReporterTraits>,
    ) -> Result<Self, ReconstructionError> {
        projections.validate()?;
        if let Some(slice) = opts.slice {
            if slice >= projections.nx() {
                return Err(ReconstructionError::InvalidInput(format!(
                    "slice {} out of range for {} slices",
                    slice,
                    projections.nx()
                )));
            }
        }
        if opts.farm.num_workers == 0 {
            return Err(ReconstructionError::InvalidInput(
                "at least one worker is required".to_string(),
            ));
        }

        Ok(Sart {
            projections,
            opts,
            reporter,
            ray_fn: Arc::new(ray_update),
        })
    }

    /// Replaces the per-chunk worker function.
    pub fn with_ray_fn(mut self, ray_fn: WorkerFn<RayPayload, RayResult>) -> Self {
        self.ray_fn = ray_fn;
        self
    }

    pub fn options(&self) -> &SartOptions {
        &self.opts
    }

    pub async fn run(&self) -> Result<Vec<SliceReconstruction>, ReconstructionError> {
        let mut dispatcher =
            Dispatcher::with_shared(self.ray_fn.clone(), self.opts.farm.clone(), self.opts.pool_mode);

        let slices: Vec<usize> = match self.opts.slice {
            Some(slice) => vec![slice],
            None => (0..self.projections.nx()).collect(),
        };

        let mut reconstructions = Vec::with_capacity(slices.len());
        let mut outcome = Ok(());
        for slice in slices {
            let span = info_span!("slice", slice);
            match self.reconstruct_slice(&mut dispatcher, slice).instrument(span).await {
                Ok(estimate) => reconstructions.push(SliceReconstruction { slice, estimate }),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let finished = dispatcher.finish().await;
        outcome?;
        finished?;
        Ok(reconstructions)
    }

    async fn reconstruct_slice(
        &self,
        dispatcher: &mut Dispatcher<RayPayload, RayResult>,
        slice: usize,
    ) -> Result<Grid, ReconstructionError> {
        let ny = self.projections.ny();
        let sinogram = self.projections.sinogram(slice);
        let mut estimate = Grid::square(ny);
        let mut acc = Accumulators::new(ny);
        let chunks = chunk_ranges(ny, dispatcher.num_workers())?;

        acc.reset_weight();
        self.publish(slice, None, &estimate, &sinogram).await?;

        for iteration in 0..self.opts.iterations {
            acc.reset_update();
            let snapshot = Arc::new(estimate.clone());
            let compute_weight = iteration == 0;

            for (projection, &angle) in self.projections.angles.iter().enumerate() {
                let started = Instant::now();
                let row = sinogram.row(projection);
                let payloads = chunks.iter().map(|chunk| RayPayload {
                    angle,
                    row: row.to_vec(),
                    estimate: snapshot.clone(),
                    chunk: chunk.clone(),
                    compute_weight,
                });

                reduce_unit(dispatcher, &mut acc, payloads)
                    .await
                    .map_err(|source| ReconstructionError::Farm {
                        slice,
                        iteration,
                        projection,
                        source,
                    })?;

                if projection % PROGRESS_EVERY == 0 {
                    info!(
                        iteration,
                        projection,
                        duration_secs = started.elapsed().as_secs_f64(),
                        "Projection processed"
                    );
                }
            }

            let relax = if iteration == 0 { 1.0 } else { self.opts.relaxation };
            acc.apply(&mut estimate, relax, self.opts.weight_epsilon);
            self.publish(slice, Some(iteration), &estimate, &sinogram).await?;
        }

        Ok(estimate)
    }

    async fn publish(
        &self,
        slice: usize,
        iteration: Option<usize>,
        estimate: &Grid,
        sinogram: &Grid,
    ) -> Result<(), ReconstructionError> {
        let report = SliceReport {
            slice,
            iteration,
            estimate,
            sinogram,
        };
        self.reporter
            .publish(&report)
            .await
            .map_err(|source| ReconstructionError::Report { slice, source })
    }
}
