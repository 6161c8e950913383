//! livecore - headless pipeline runner
//!
//! Runs a configured pipeline, logs a status line every second and persists
//! the quality factor and stage flags on exit.

use anyhow::Context;
use clap::{Parser, Subcommand};
use livecore::config::{self, CoreConfig, PersistedState};
use livecore::PipelineBuilder;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "livecore", version, about = "Real-time frame pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline
    Run {
        /// Pipeline configuration (TOML); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop after this many seconds; runs until Ctrl+C when omitted
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Disable the capture stage after this many seconds to exercise fallback
        #[arg(long)]
        stall_after: Option<u64>,

        /// How long the simulated stall lasts
        #[arg(long, default_value_t = 5)]
        stall_for: u64,

        /// Persisted state file; the app data directory is used when omitted
        #[arg(long)]
        state: Option<PathBuf>,

        /// Also write daily-rolling logs into this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Write the default configuration as TOML
    DefaultConfig {
        /// Destination file
        path: PathBuf,
    },
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,livecore=debug"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "livecore.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::DefaultConfig { path } => {
            CoreConfig::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
        Command::Run {
            config,
            seconds,
            stall_after,
            stall_for,
            state,
            log_dir,
        } => {
            let _guard = init_logging(log_dir.as_deref());
            run(config, seconds, stall_after, stall_for, state)
        }
    }
}

fn run(
    config_path: Option<PathBuf>,
    seconds: Option<u64>,
    stall_after: Option<u64>,
    stall_for: u64,
    state_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    tracing::info!("Starting livecore {}", env!("CARGO_PKG_VERSION"));

    let config = match &config_path {
        Some(path) => CoreConfig::load(path).context("loading pipeline configuration")?,
        None => CoreConfig::default(),
    };

    let state_path = match state_path {
        Some(path) => path,
        None => config::ensure_app_data_dir()
            .context("resolving app data directory")?
            .join(config::STATE_FILE),
    };
    let persisted = PersistedState::load_from(&state_path).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable state {:?}: {}", state_path, e);
        PersistedState::default()
    });
    if let Some(saved_at) = persisted.saved_at {
        tracing::info!("Restoring state saved at {}", saved_at);
    }

    let source_stage = config
        .stages
        .first()
        .map(|s| s.name.clone())
        .context("configuration has no stages")?;

    let handle = PipelineBuilder::new(config)
        .with_persisted_state(persisted)
        .persist_to(&state_path)
        .build()
        .context("assembling pipeline")?
        .spawn()
        .context("starting pipeline")?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Ctrl+C received, stopping pipeline");
        flag.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;

    let started = Instant::now();
    let deadline = seconds.map(|s| started + Duration::from_secs(s));
    let stall_start = stall_after.map(|s| started + Duration::from_secs(s));
    let stall_end = stall_start.map(|at| at + Duration::from_secs(stall_for));
    let mut stalled = false;
    let mut last_report = started;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }

        if let (Some(begin), Some(end)) = (stall_start, stall_end) {
            if !stalled && now >= begin && now < end {
                tracing::info!("Simulating a stall: disabling '{}'", source_stage);
                handle.set_stage_enabled(&source_stage, false)?;
                stalled = true;
            } else if stalled && now >= end {
                tracing::info!("Stall over: enabling '{}'", source_stage);
                handle.set_stage_enabled(&source_stage, true)?;
                stalled = false;
            }
        }

        // Stand-in for the output sink
        let frame = handle.get_current_output_frame()?;

        if now.duration_since(last_report) >= Duration::from_secs(1) {
            tracing::info!("{} | out {}", handle.get_pipeline_status(), frame.origin);
            last_report = now;
        }
        std::thread::sleep(Duration::from_millis(33));
    }

    // Leave the persisted flags as configured rather than mid-stall
    if stalled {
        handle.set_stage_enabled(&source_stage, true)?;
    }

    let state = handle.shutdown()?;
    tracing::info!(
        "Stopped; persisted quality {:.2} (skip {}) to {:?}",
        state.quality_scale,
        state.frame_skip,
        state_path
    );
    Ok(())
}
