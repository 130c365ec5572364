use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::PathBuf;

use tilebake::{BatchConfig, BatchDriver, BatchReport, ProgressSnapshot, Stage, ZlibCompressor};

#[derive(Parser, Debug)]
#[command(name = "tilebake", version, about = "Spike removal and grid splitting for TBMS tiles")]
struct Args {
    /// JSON config file; missing fields keep their defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug). RUST_LOG still wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Correct elevation spikes in a tile file, or in every new tile of a directory.
    Despike {
        path: PathBuf,

        /// Write a zlib artifact next to every corrected tile.
        #[arg(long, default_value_t = false)]
        compress: bool,

        /// Tiles processed concurrently.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Cut objects crossing grid lines into cell-sized pieces.
    Split {
        input: PathBuf,
        output_dir: PathBuf,

        /// Grid cell edge in world units.
        #[arg(long)]
        cell_size: Option<f64>,

        /// Tiles processed concurrently.
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp_secs()
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<BatchConfig> {
    match path {
        Some(path) => {
            let config = BatchConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(BatchConfig::default()),
    }
}

/// Progress bar fed from worker threads.
fn progress_bar() -> Result<ProgressBar> {
    let template = "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(template)
            .context("progress bar template")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

fn observer(bar: ProgressBar) -> impl Fn(ProgressSnapshot) + Send + Sync + 'static {
    move |s: ProgressSnapshot| {
        bar.set_length(s.total as u64);
        bar.set_position(s.done as u64);
        bar.set_message(format!("| {}: {} | failed: {}", s.stage, s.active, s.failed));
    }
}

fn summarize<T>(report: &BatchReport<T>) {
    for (path, err) in report.failures() {
        warn!("{} failed ({}): {}", path.display(), err.kind(), err);
    }

    let verb = match report.stage {
        Stage::Despike => "despiked",
        Stage::Split => "split",
    };

    info!(
        "{} {} of {} tiles in {:.1?} ({} failed)",
        verb,
        report.succeeded(),
        report.total(),
        report.elapsed,
        report.failed()
    );
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = load_config(args.config.as_ref())?;
    let bar = progress_bar()?;

    match args.command {
        Command::Despike {
            path,
            compress,
            workers,
        } => {
            if let Some(workers) = workers {
                config.despike_workers = workers;
            }
            config.validate().context("invalid settings")?;

            let mut driver = BatchDriver::new(config.clone()).with_observer(observer(bar.clone()));
            if compress {
                driver = driver.with_compressor(ZlibCompressor {
                    extension: config.compressed_extension.clone(),
                    level: config.compression_level,
                });
            }

            let report = driver
                .despike(&path)
                .with_context(|| format!("despiking {}", path.display()))?;
            bar.finish_and_clear();

            let spikes: usize = report
                .outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().ok())
                .map(|s| s.spikes)
                .sum();
            info!("{} spikes corrected", spikes);

            summarize(&report);
            if report.failed() > 0 {
                anyhow::bail!("{} of {} tiles failed", report.failed(), report.total());
            }
        }

        Command::Split {
            input,
            output_dir,
            cell_size,
            workers,
        } => {
            if let Some(cell_size) = cell_size {
                config.cell_size = cell_size;
            }
            if let Some(workers) = workers {
                config.split_workers = workers;
            }
            config.validate().context("invalid settings")?;

            let driver = BatchDriver::new(config).with_observer(observer(bar.clone()));

            let report = driver.split(&input, &output_dir).with_context(|| {
                format!("splitting {} into {}", input.display(), output_dir.display())
            })?;
            bar.finish_and_clear();

            let pieces: usize = report
                .outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().ok())
                .map(|s| s.pieces)
                .sum();
            info!("{} pieces written", pieces);

            summarize(&report);
            if report.failed() > 0 {
                anyhow::bail!("{} of {} tiles failed", report.failed(), report.total());
            }
        }
    }

    Ok(())
}
