//! End-to-end reconstruction tests: accumulation cadence, fault handling,
//! pool-mode parity and artifact output.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tomofarm::error::{FarmError, ReconstructionError, ReportError};
use tomofarm::reconstruction::{forward_project, ray_update, RayPayload, RayResult};
use tomofarm::report::{FileReporter, Options as ReportOptions, ReconstructionRecord};
use tomofarm::{
    FarmOptions, Grid, NullReporter, PoolMode, Projections, ReporterTraits, Sart, SartOptions,
    SliceReport,
};

#[derive(Default)]
struct RecordingReporter {
    seen: Mutex<Vec<(usize, Option<usize>, Grid)>>,
}

#[async_trait]
impl ReporterTraits for RecordingReporter {
    async fn publish(&self, report: &SliceReport<'_>) -> Result<(), ReportError> {
        self.seen
            .lock()
            .unwrap()
            .push((report.slice, report.iteration, report.estimate.clone()));
        Ok(())
    }
}

fn disc(n: usize) -> Grid {
    let mut image = Grid::square(n);
    let c = (n as f64 - 1.0) / 2.0;
    for r in 0..n {
        for col in 0..n {
            let (y, x) = (r as f64 - c, col as f64 - c);
            if x * x + y * y < (0.3 * n as f64).powi(2) {
                image[(r, col)] = 1.0;
            }
        }
    }
    image
}

fn angles(count: usize) -> Vec<f64> {
    (0..count).map(|i| i as f64 * 180.0 / count as f64).collect()
}

fn options(iterations: usize, workers: usize, pool_mode: PoolMode) -> SartOptions {
    SartOptions {
        iterations,
        farm: FarmOptions {
            num_workers: workers,
            queue_capacity: 8,
            wait_timeout: Some(Duration::from_secs(30)),
        },
        pool_mode,
        ..Default::default()
    }
}

fn disc_projections(n: usize, angle_count: usize) -> (Grid, Projections) {
    let truth = disc(n);
    let a = angles(angle_count);
    let sinogram = forward_project(&truth, &a);
    (truth, Projections::from_sinogram(a, &sinogram).unwrap())
}

fn distance(a: &Grid, b: &Grid) -> f64 {
    a.as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[tokio::test]
async fn weights_only_computed_in_first_iteration() {
    let (_, projections) = disc_projections(8, 4);
    let jobs = Arc::new(AtomicUsize::new(0));
    let weighted = Arc::new(AtomicUsize::new(0));

    let (j, w) = (jobs.clone(), weighted.clone());
    let ray_fn = Arc::new(move |payload: RayPayload| {
        j.fetch_add(1, Ordering::SeqCst);
        if payload.compute_weight {
            w.fetch_add(1, Ordering::SeqCst);
        }
        ray_update(payload)
    });

    let sart = Sart::new(projections, options(3, 2, PoolMode::PerUnit), Arc::new(NullReporter))
        .unwrap()
        .with_ray_fn(ray_fn);
    sart.run().await.unwrap();

    // 3 iterations x 4 angles x 2 chunks, weights only in iteration 0
    assert_eq!(jobs.load(Ordering::SeqCst), 24);
    assert_eq!(weighted.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn estimate_updated_once_per_iteration() {
    let (truth, projections) = disc_projections(12, 12);
    let reporter = Arc::new(RecordingReporter::default());

    let sart = Sart::new(projections, options(3, 3, PoolMode::PerUnit), reporter.clone()).unwrap();
    let slices = sart.run().await.unwrap();

    let seen = reporter.seen.lock().unwrap();
    let iterations: Vec<_> = seen.iter().map(|(_, it, _)| *it).collect();
    assert_eq!(iterations, vec![None, Some(0), Some(1), Some(2)]);
    assert!(seen[0].2.is_zero());
    assert_eq!(seen[3].2, slices[0].estimate);

    assert!(distance(&slices[0].estimate, &truth) < distance(&Grid::square(12), &truth));
}

#[tokio::test]
async fn faulting_chunk_aborts_without_touching_estimate() {
    let (_, projections) = disc_projections(8, 4);
    let reporter = Arc::new(RecordingReporter::default());

    let ray_fn = Arc::new(|payload: RayPayload| -> Result<RayResult, tomofarm::BoxError> {
        if payload.angle == 45.0 && payload.chunk.start > 0 {
            return Err("rotation diverged".into());
        }
        ray_update(payload)
    });

    for mode in [PoolMode::PerUnit, PoolMode::Reused] {
        let sart = Sart::new(projections.clone(), options(2, 2, mode), reporter.clone())
            .unwrap()
            .with_ray_fn(ray_fn.clone());

        let err = sart.run().await.unwrap_err();
        match err {
            ReconstructionError::Farm {
                slice,
                iteration,
                projection,
                source: FarmError::WorkerFault(fault),
            } => {
                assert_eq!((slice, iteration, projection), (0, 0, 1));
                assert_eq!(fault.message, "rotation diverged");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // Only the slice-start reports, with a zero estimate, were ever published
    let seen = reporter.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(_, it, est)| it.is_none() && est.is_zero()));
}

#[tokio::test]
async fn pool_modes_agree() {
    let (_, projections) = disc_projections(10, 6);

    let per_unit = Sart::new(projections.clone(), options(2, 3, PoolMode::PerUnit), Arc::new(NullReporter))
        .unwrap()
        .run()
        .await
        .unwrap();
    let reused = Sart::new(projections, options(2, 3, PoolMode::Reused), Arc::new(NullReporter))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(distance(&per_unit[0].estimate, &reused[0].estimate) < 1e-9);
}

#[tokio::test]
async fn reconstructs_every_slice_unless_one_is_selected() {
    // Two identical slices
    let a = angles(4);
    let sinogram = forward_project(&disc(6), &a);
    let mut data = Vec::new();
    for p in 0..a.len() {
        for _ in 0..2 {
            data.extend_from_slice(sinogram.row(p));
        }
    }
    let projections = Projections::new(a, [4, 2, 6], data).unwrap();

    let all = Sart::new(projections.clone(), options(1, 2, PoolMode::Reused), Arc::new(NullReporter))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(all.iter().map(|s| s.slice).collect::<Vec<_>>(), vec![0, 1]);
    assert!(distance(&all[0].estimate, &all[1].estimate) < 1e-9);

    let mut one = options(1, 2, PoolMode::Reused);
    one.slice = Some(1);
    let selected = Sart::new(projections.clone(), one, Arc::new(NullReporter))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].slice, 1);

    let mut bad = options(1, 2, PoolMode::Reused);
    bad.slice = Some(2);
    assert!(matches!(
        Sart::new(projections, bad, Arc::new(NullReporter)),
        Err(ReconstructionError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn file_reporter_writes_named_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("artifacts");
    let (_, projections) = disc_projections(8, 4);

    let reporter = Arc::new(FileReporter::new(ReportOptions {
        output_dir: out.clone(),
        ..Default::default()
    }));
    let slices = Sart::new(projections, options(2, 2, PoolMode::PerUnit), reporter)
        .unwrap()
        .run()
        .await
        .unwrap();

    for name in ["sart_0.png", "sinogram_0.png", "reco_0.msgpack"] {
        assert!(out.join(name).is_file(), "missing {name}");
    }

    let bytes = std::fs::read(out.join("reco_0.msgpack")).unwrap();
    let record: ReconstructionRecord = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(record.iteration, Some(1));
    assert_eq!((record.rows, record.cols), (8, 8));
    assert_eq!(record.data, slices[0].estimate.as_slice());

    let sinogram = image::open(out.join("sinogram_0.png")).unwrap();
    assert_eq!((sinogram.width(), sinogram.height()), (8, 4));
}
