mod alert;
mod capture;
mod clock;
mod config;
mod error;
mod estimate;
mod output;
mod routine;
mod scheduler;
mod service;

use alert::{AlertSink, FanoutSink, FileSink, LogSink, Severity};
use anyhow::{bail, Context, Result};
use capture::{create_source, CameraAddress};
use clap::{Parser, Subcommand};
use clock::{Clock, SystemClock};
use config::{Config, LoggingConfig, DEFAULT_CONFIG_PATH};
use output::FfmpegBackend;
use service::{build_scheduler, CaptureDeps, CaptureJob};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Scheduled still/video capture from a network camera", long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the output base directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the camera (device index or stream URL)
    #[arg(long)]
    camera: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture schedule until interrupted (default)
    Run,

    /// Run a single capture routine immediately
    Capture,

    /// Validate the config and print the schedule
    Check,

    /// Estimate raw data usage for continuous recording
    Estimate {
        /// Frame width in pixels
        #[arg(long, default_value_t = 704)]
        width: u32,

        /// Frame height in pixels
        #[arg(long, default_value_t = 576)]
        height: u32,

        /// Frame rates to estimate for
        #[arg(long, value_delimiter = ',', default_values_t = [25, 15, 10])]
        fps: Vec<u32>,

        /// Live blocks per day (defaults to the number of schedule entries)
        #[arg(long)]
        intervals: Option<u32>,

        /// Minutes per live block (defaults to the routine duration)
        #[arg(long)]
        minutes: Option<f64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;
    let _log_guard = init_logging(args.debug, &config.logging)?;
    let alerts = build_alerts(&config);

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => serve(&config, alerts.clone()),
        Command::Capture => capture_now(&config, alerts.as_ref()),
        Command::Check => check(&config),
        Command::Estimate {
            width,
            height,
            fps,
            intervals,
            minutes,
        } => {
            let intervals = intervals.unwrap_or(config.schedule.len() as u32);
            let minutes = minutes
                .unwrap_or_else(|| config.routine.duration.as_duration().as_secs_f64() / 60.0);
            for fps in fps {
                println!("{}", estimate::estimate(width, height, fps, intervals, minutes));
            }
            Ok(())
        }
    };

    if let Err(e) = &result {
        alerts.alert(
            &format!("Capture service exiting on fatal error: {:#}", e),
            Severity::Critical,
        );
    }
    result
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(Path::new(DEFAULT_CONFIG_PATH))?,
        None => Config::default(),
    };

    if let Some(data_dir) = &args.data_dir {
        config.set_data_dir(data_dir.clone());
    }
    if let Some(camera) = &args.camera {
        if camera.trim().is_empty() {
            bail!("--camera must not be empty");
        }
        config.camera = camera.clone();
    }
    Ok(config)
}

fn init_logging(debug: bool, logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let log_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let console_layer = logging.verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
    });

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let file_name = path
                .file_name()
                .with_context(|| format!("Log path {} has no file name", path.display()))?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn build_alerts(config: &Config) -> Arc<dyn AlertSink> {
    let mut sink = FanoutSink::new().with(LogSink);
    if let Some(path) = &config.alerts.file {
        sink = sink.with(FileSink::new(path, config.alerts.min_severity));
    }
    Arc::new(sink)
}

fn serve(config: &Config, alerts: Arc<dyn AlertSink>) -> Result<()> {
    let address = config.camera_address();
    let read_interval = config.routine.frame_interval.as_duration();
    let connect = |address: &CameraAddress| create_source(address, read_interval);
    let clock = SystemClock;
    let deps = CaptureDeps {
        clock: &clock,
        alerts: alerts.as_ref(),
        video: &FfmpegBackend,
        connect: &connect,
    };

    let mut ctx = build_scheduler(config, &address, alerts.clone(), deps)?;
    if ctx.is_empty() {
        bail!("No [[schedule]] entries configured, nothing to run");
    }

    tracing::info!("Starting capture service");
    tracing::info!("{}", config.summary(ctx.len()));

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupt received, stopping once the current routine concludes");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install interrupt handler")?;
    tracing::info!("Press Ctrl+C to stop");

    scheduler::run(&mut ctx, &clock, &shutdown);

    alerts.alert("Capture service stopped by operator", Severity::Warning);
    Ok(())
}

fn capture_now(config: &Config, alerts: &dyn AlertSink) -> Result<()> {
    let address = config.camera_address();
    let read_interval = config.routine.frame_interval.as_duration();
    let connect = |address: &CameraAddress| create_source(address, read_interval);
    let clock = SystemClock;
    let deps = CaptureDeps {
        clock: &clock,
        alerts,
        video: &FfmpegBackend,
        connect: &connect,
    };

    tracing::info!("{}", config.summary(0));
    let summary = CaptureJob::new(&config.routine, &address, deps).run_once();

    println!("{}", summary);
    println!("ran {} -> {}", summary.started, summary.finished);
    if let Some(dir) = &summary.directory {
        println!("output: {}", dir.display());
    }
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let triggers = config.triggers()?;
    println!("{}", config.summary(triggers.len()));

    let now = SystemClock.now();
    for trigger in &triggers {
        match trigger.next_after(now) {
            Some(next) => println!("{}  next: {}", trigger, next.format("%a %Y-%m-%d %H:%M")),
            None => println!("{}", trigger),
        }
    }
    Ok(())
}
