use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use tomofarm::logging::{self, LogConfig, LogFormat};
use tomofarm::report::{FileReporter, Options as ReportOptions};
use tomofarm::{FarmOptions, PoolMode, Projections, Sart, SartOptions};

/// Parallel SART reconstruction of a projection volume.
#[derive(Parser, Debug)]
#[command(name = "tomofarm", version, about)]
struct Cli {
    /// Projection volume (.json or .msgpack) with angles, shape [angle, x, y] and data
    #[arg(short, long)]
    input: PathBuf,

    /// JSON file with base reconstruction options; flags given here override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reconstruct only this slice
    #[arg(short, long)]
    slice: Option<usize>,

    /// Iterations per slice [default: 50]
    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    /// Worker count (defaults to the number of CPUs)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Relaxation factor applied after the first iteration [default: 1.0]
    #[arg(long)]
    relaxation: Option<f64>,

    /// Fresh farm per projection (per-unit) or one farm for the whole run (reused) [default: per-unit]
    #[arg(long)]
    pool_mode: Option<PoolMode>,

    /// Directory for sart_<slice>.png, sinogram_<slice>.png and reco_<slice>.msgpack
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Give up on a stalled farm after this many seconds, 0 waits forever [default: 300]
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

impl Cli {
    /// Applies the flags that were given on top of `base`.
    fn sart_options(&self, base: SartOptions) -> SartOptions {
        SartOptions {
            iterations: self.iterations.unwrap_or(base.iterations),
            relaxation: self.relaxation.unwrap_or(base.relaxation),
            slice: self.slice.or(base.slice),
            farm: FarmOptions {
                num_workers: self.workers.unwrap_or(base.farm.num_workers),
                wait_timeout: match self.timeout_secs {
                    Some(0) => None,
                    Some(secs) => Some(Duration::from_secs(secs)),
                    None => base.farm.wait_timeout,
                },
                ..base.farm.clone()
            },
            pool_mode: self.pool_mode.unwrap_or(base.pool_mode),
            ..base
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
    });

    if let Err(e) = run(&cli).await {
        error!("Reconstruction failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let projections = Projections::load(&cli.input)
        .await
        .with_context(|| format!("Failed to load {}", cli.input.display()))?;
    let base = match &cli.config {
        Some(path) => SartOptions::load(path)
            .await
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => SartOptions::default(),
    };
    let opts = cli.sart_options(base);

    info!(
        shape = ?projections.shape,
        workers = opts.farm.num_workers,
        iterations = opts.iterations,
        pool_mode = ?opts.pool_mode,
        "Starting reconstruction"
    );

    let reporter = Arc::new(FileReporter::new(ReportOptions {
        output_dir: cli.output_dir.clone(),
        ..Default::default()
    }));
    let sart = Sart::new(projections, opts, reporter)?;
    let slices = sart.run().await?;

    info!(slices = slices.len(), output = %cli.output_dir.display(), "Reconstruction complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_options() {
        let base = SartOptions {
            iterations: 7,
            relaxation: 0.5,
            pool_mode: PoolMode::Reused,
            farm: FarmOptions::with_workers(3),
            ..Default::default()
        };

        let cli = Cli::parse_from(["tomofarm", "-i", "v.json"]);
        let opts = cli.sart_options(base.clone());
        assert_eq!(opts.iterations, 7);
        assert_eq!(opts.pool_mode, PoolMode::Reused);
        assert_eq!(opts.farm.num_workers, 3);

        let cli = Cli::parse_from([
            "tomofarm", "-i", "v.json", "-n", "2", "--pool-mode", "per-unit", "--timeout-secs", "0",
        ]);
        let opts = cli.sart_options(base);
        assert_eq!(opts.iterations, 2);
        assert_eq!(opts.relaxation, 0.5);
        assert_eq!(opts.pool_mode, PoolMode::PerUnit);
        assert_eq!(opts.farm.wait_timeout, None);
    }
}
