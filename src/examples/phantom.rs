use tomofarm::logging::{self, LogConfig};
use tomofarm::reconstruction::forward_project;
use tomofarm::report::{FileReporter, Options as ReportOptions};
use tomofarm::{FarmOptions, Grid, PoolMode, Projections, Sart, SartOptions};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

const SIZE: usize = 48;
const ANGLES: usize = 60;

// Two overlapping discs of different density
fn phantom(n: usize) -> Grid {
    let mut image = Grid::square(n);
    let c = (n as f64 - 1.0) / 2.0;
    for r in 0..n {
        for col in 0..n {
            let (y, x) = (r as f64 - c, col as f64 - c);
            if x * x + y * y < (0.35 * n as f64).powi(2) {
                image[(r, col)] += 1.0;
            }
            if (x - 0.1 * n as f64).powi(2) + (y + 0.05 * n as f64).powi(2) < (0.12 * n as f64).powi(2) {
                image[(r, col)] += 2.0;
            }
        }
    }
    image
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init(&LogConfig::default());

    // Simulate the measurement
    let truth = phantom(SIZE);
    let angles: Vec<f64> = (0..ANGLES).map(|i| i as f64 * 180.0 / ANGLES as f64).collect();
    let sinogram = forward_project(&truth, &angles);
    let projections = Projections::from_sinogram(angles, &sinogram)?;

    let output_dir = PathBuf::from("phantom-out");
    let reporter = Arc::new(FileReporter::new(ReportOptions {
        output_dir: output_dir.clone(),
        ..Default::default()
    }));

    let opts = SartOptions {
        iterations: 10,
        farm: FarmOptions::default(),
        pool_mode: PoolMode::Reused,
        ..Default::default()
    };

    let started = Instant::now();
    let sart = Sart::new(projections, opts, reporter)?;
    let slices = sart.run().await?;

    // Root-mean-square error against the phantom
    let estimate = &slices.first().ok_or("no slice reconstructed")?.estimate;
    let sq_err: f64 = estimate
        .as_slice()
        .iter()
        .zip(truth.as_slice())
        .map(|(a, b)| (a - b).powi(2))
        .sum();
    let rmse = (sq_err / (SIZE * SIZE) as f64).sqrt();

    info!(
        rmse,
        elapsed_secs = started.elapsed().as_secs_f64(),
        output = %output_dir.display(),
        "Phantom reconstructed"
    );

    Ok(())
}
