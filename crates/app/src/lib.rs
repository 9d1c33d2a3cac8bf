use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use volseg_core::aabb::{parse_point, parse_shape, Aabb, Shape3};
use volseg_core::config::{config_path, data_dir, AppConfig};
use volseg_core::job::{JobSummary, SegmentationJob};
use volseg_core::logging::{self, CrashHook, LogSettings, LogSink, DEFAULT_LOG_FILTER};
use volseg_core::model::{DeviceOptions, OnnxModel};
use volseg_core::n5::N5Dataset;
use volseg_core::runner::ProgressCallback;
use volseg_core::runtime::{log_runtime_lib_status, setup_runtime_libs};

#[derive(Parser, Debug)]
#[command(
    name = "volseg",
    about = "Block-wise segmentation of large N5 volumes with a 3D network"
)]
struct Cli {
    #[arg(short = 'i', long = "input", help = "Input N5 root")]
    input: PathBuf,

    #[arg(
        long = "input_data_set",
        visible_alias = "id",
        default_value = "/s0",
        help = "Dataset inside the input N5 root"
    )]
    input_data_set: String,

    #[arg(
        long = "output_data_set",
        visible_alias = "od",
        default_value = "/s0",
        help = "Dataset inside the output N5 root"
    )]
    output_data_set: String,

    #[arg(short = 'm', long = "model_path", help = "ONNX model file")]
    model_path: PathBuf,

    #[arg(
        short = 's',
        long = "scaling",
        help = "Intensity scaling factor (estimated from the input block if omitted)"
    )]
    scaling: Option<f32>,

    #[arg(short = 'o', long = "output", help = "Existing output N5 root")]
    output: PathBuf,

    #[arg(long = "start", value_name = "X,Y,Z", help = "Start of the block to segment")]
    start: String,

    #[arg(long = "end", value_name = "X,Y,Z", help = "End (exclusive) of the block to segment")]
    end: String,

    #[arg(
        long = "whole_vol_shape",
        value_name = "DX,DY,DZ",
        help = "Shape of the whole volume"
    )]
    whole_vol_shape: String,

    #[arg(long = "set_gpu_mem_growth", help = "Grow device memory on demand")]
    set_gpu_mem_growth: bool,

    #[arg(long = "with_post_processing", help = "Close and clean the predicted mask")]
    with_post_processing: bool,

    #[arg(long = "high_threshold", visible_alias = "ht")]
    high_threshold: Option<f32>,

    #[arg(long = "low_threshold", visible_alias = "lt")]
    low_threshold: Option<f32>,

    #[arg(long = "small_region_probability_threshold")]
    small_region_probability_threshold: Option<f32>,

    #[arg(long = "small_region_size_threshold")]
    small_region_size_threshold: Option<usize>,

    #[arg(long = "model_input_shape", value_name = "DX,DY,DZ")]
    model_input_shape: Option<String>,

    #[arg(long = "model_output_shape", value_name = "DX,DY,DZ")]
    model_output_shape: Option<String>,

    #[arg(long = "batch_size")]
    batch_size: Option<usize>,

    #[arg(long = "prefetch", help = "Number of input tiles queued ahead of the model")]
    prefetch: Option<usize>,

    #[arg(long = "config", value_name = "FILE", help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,

    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

/// Single-dash multi-letter spellings accepted by earlier releases.
const LEGACY_FLAGS: &[(&str, &str)] = &[
    ("-id", "--input_data_set"),
    ("-od", "--output_data_set"),
    ("-ht", "--high_threshold"),
    ("-lt", "--low_threshold"),
];

/// Rewrite legacy flag tokens to their long form. clap would otherwise read
/// `-ht` as `-h` and print help, or `-id` as `-i d`.
fn normalize_legacy_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            LEGACY_FLAGS
                .iter()
                .find(|(legacy, _)| arg == *legacy)
                .map(|(_, long)| OsString::from(*long))
                .unwrap_or(arg)
        })
        .collect()
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse_from(normalize_legacy_flags(std::env::args_os()));
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_runtime_lib_status(&runtime_libs);

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    log_startup_metadata(&resolved_data_dir, &cfg_path);

    let config = if cli.config.is_some() {
        AppConfig::load_from_path(&cfg_path)?
    } else {
        match AppConfig::load_from_path(&cfg_path) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "Failed to load config file, using defaults");
                AppConfig::default()
            }
        }
    };

    let config = merge_cli_overrides(config, &cli);
    let job = build_job(&cli, &config)?;
    job.plan()?;

    run_segmentation(&cli, &config, job).await
}

fn merge_cli_overrides(mut config: AppConfig, cli: &Cli) -> AppConfig {
    config.model.gpu_memory_growth |= cli.set_gpu_mem_growth;
    if let Some(batch_size) = cli.batch_size {
        config.model.batch_size = batch_size;
    }
    if let Some(prefetch) = cli.prefetch {
        config.pipeline.prefetch = prefetch;
    }

    let post = &mut config.post_processing;
    post.enabled |= cli.with_post_processing;
    if let Some(value) = cli.high_threshold {
        post.high_threshold = value;
    }
    if let Some(value) = cli.low_threshold {
        post.low_threshold = value;
    }
    if let Some(value) = cli.small_region_probability_threshold {
        post.small_region_probability_threshold = value;
    }
    if let Some(value) = cli.small_region_size_threshold {
        post.small_region_size_threshold = value;
    }
    config
}

fn parse_shape_arg(flag: &str, value: Option<&str>, fallback: Shape3) -> Result<Shape3> {
    match value {
        Some(text) => parse_shape(text).with_context(|| format!("invalid --{flag}")),
        None => Ok(fallback),
    }
}

fn build_job(cli: &Cli, config: &AppConfig) -> Result<SegmentationJob> {
    let start = parse_point(&cli.start).context("invalid --start")?;
    let end = parse_point(&cli.end).context("invalid --end")?;
    let whole_volume_shape =
        parse_shape(&cli.whole_vol_shape).context("invalid --whole_vol_shape")?;
    let subvolume = Aabb::new(start, end).context("invalid --start/--end")?;

    let mut job = SegmentationJob::new(whole_volume_shape, subvolume);
    job.model_input_shape = parse_shape_arg(
        "model_input_shape",
        cli.model_input_shape.as_deref(),
        config.model.input_shape,
    )?;
    job.model_output_shape = parse_shape_arg(
        "model_output_shape",
        cli.model_output_shape.as_deref(),
        config.model.output_shape,
    )?;
    job.scaling = cli.scaling;
    job.batch_size = config.model.batch_size;
    job.prefetch = config.pipeline.prefetch;
    job.post_processing = config
        .post_processing
        .enabled
        .then(|| config.post_processing.params());
    Ok(job)
}

async fn run_segmentation(cli: &Cli, config: &AppConfig, job: SegmentationJob) -> Result<()> {
    let input = N5Dataset::open(&cli.input, &cli.input_data_set)?;
    let output = N5Dataset::open(&cli.output, &cli.output_data_set)?;

    info!(
        input = %cli.input.display(),
        shape = ?input.shape(),
        block_shape = ?input.block_shape(),
        data_type = ?input.data_type(),
        output_data_type = ?output.data_type(),
        "Opened N5 datasets"
    );

    if input.shape() != job.whole_volume_shape {
        warn!(
            dataset_shape = ?input.shape(),
            whole_vol_shape = ?job.whole_volume_shape,
            "Input dataset shape differs from --whole_vol_shape"
        );
    }

    let device = DeviceOptions {
        memory_growth: config.model.gpu_memory_growth,
    };
    info!(model = %cli.model_path.display(), ?device, "Loading model");
    let model = OnnxModel::load(&cli.model_path, &device)?;

    let started = Instant::now();
    let summary = job
        .run(&input, &output, model, Some(make_progress_callback()))
        .await
        .context("Segmentation failed")?;

    eprintln!();
    log_summary(&summary, started.elapsed().as_secs_f64());
    Ok(())
}

fn log_summary(summary: &JobSummary, elapsed: f64) {
    info!(
        output = %summary.output,
        input = %summary.input,
        tiles = summary.tiles,
        scaling_factor = summary.scaling_factor,
        elapsed = %format_duration(elapsed),
        "Segmentation completed successfully"
    );
    if let (Some(flood), Some(small)) = (&summary.flood_fill, &summary.small_objects) {
        info!(
            filled = flood.filled,
            removed_components = small.removed_components,
            removed_voxels = small.removed_voxels,
            "Post-processing summary"
        );
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    let filter = LogSettings::from_env(verbose, cli_log_filter).filter();
    let sink = logging::open_log_sink(data_dir);

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filter, "console"));

    let (file, console_only) = match sink {
        LogSink::File { appender, .. } => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filter, "file")),
            ),
            None,
        ),
        LogSink::ConsoleOnly {
            attempted_dir,
            reason,
        } => (None, Some((attempted_dir, reason))),
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some((attempted_dir, reason)) = console_only {
        warn!(
            attempted_dir = ?attempted_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let CrashHook::Unavailable { crash_dir, reason } = crash_hook {
        warn!(
            crash_dir = ?crash_dir,
            reason = %reason,
            "Crash reports disabled; panics will only reach stderr"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path, cfg_path: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
// The first tile pays for session warmup and would skew the rate.
const RATE_WARMUP_TILES: usize = 1;

fn print_progress(written: usize, total: usize, total_elapsed: f64, rate_elapsed: f64) {
    let rate = compute_tile_rate(written, rate_elapsed);
    let fraction = progress_fraction(written, total);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if rate > 0.0 {
        let remaining = total.saturating_sub(written) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    eprint!(
        "\r[{}] {:5.1}% | Tile {}/{} | {:.2} tiles/s | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        written,
        total,
        rate,
        format_duration(total_elapsed),
        eta,
    );
}

fn progress_fraction(written: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (written as f64 / total as f64).clamp(0.0, 1.0)
}

fn compute_tile_rate(written: usize, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || written <= RATE_WARMUP_TILES {
        return 0.0;
    }

    (written - RATE_WARMUP_TILES) as f64 / elapsed
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let rate_start = Mutex::new(None::<Instant>);
    Box::new(move |written, total| {
        let total_elapsed = start.elapsed().as_secs_f64();
        let rate_elapsed = {
            let mut start_opt = rate_start
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if start_opt.is_none() && written >= RATE_WARMUP_TILES {
                *start_opt = Some(Instant::now());
            }
            start_opt
                .as_ref()
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        };

        print_progress(written, total, total_elapsed, rate_elapsed);
    })
}
