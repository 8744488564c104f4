//! CLI entry point for stream_ocr.
//!
//! ```bash
//! stream_ocr                 # base directory ./
//! stream_ocr /srv/ocr        # settings, dpConfig and tessdata under /srv/ocr
//! stream_ocr --no-watchdog   # run the worker in the foreground
//! ```
//!
//! Without `--no-watchdog` the process becomes a supervisor that re-executes itself as
//! the worker and restarts it after crashes. Readings go to stdout, logs to stderr (or
//! `<base>/logs/stream_ocr.log`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use stream_ocr::app::{engines_for, source_for, App};
use stream_ocr::config::{Paths, Settings};
use stream_ocr::datapoints::{load_datapoints, DataPointConfig};
use stream_ocr::logging::{self, TracingConfig};
use stream_ocr::sink::JsonLinesSink;
use stream_ocr::watchdog::{self, SupervisionEnd, Watchdog, WatchdogPolicy};

#[derive(Parser)]
#[command(name = "stream_ocr", version)]
#[command(about = "Recognise text in regions of a live video stream", long_about = None)]
struct Cli {
    /// Base directory holding stream_ocr.toml, dpConfig and tessdata
    base_dir: Option<PathBuf>,

    /// Run without crash supervision
    #[arg(long)]
    no_watchdog: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = Paths::new(cli.base_dir.clone());

    let settings = match load_settings(&paths) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("stream_ocr: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let tracing_config = match TracingConfig::from_settings(&settings.logging, &paths) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stream_ocr: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(tracing_config) {
        eprintln!("stream_ocr: failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let datapoints = match load_datapoints(&paths.datapoints_file()) {
        Ok(datapoints) => datapoints,
        Err(e) => {
            error!(path = %paths.datapoints_file().display(), error = %e, "cannot load data point list");
            return ExitCode::FAILURE;
        }
    };

    let supervise = !cli.no_watchdog && !watchdog::is_worker() && watchdog::available();
    let outcome = if supervise {
        run_supervisor()
    } else {
        run_worker(&settings, &paths, datapoints).map(|()| ExitCode::SUCCESS)
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "stream_ocr failed");
            ExitCode::FAILURE
        }
    }
}

fn load_settings(paths: &Paths) -> Result<Settings> {
    let settings = Settings::load(paths)
        .with_context(|| format!("loading {}", paths.settings_file().display()))?;
    settings.validate()?;
    Ok(settings)
}

fn exit_code(end: &SupervisionEnd) -> ExitCode {
    ExitCode::from(u8::try_from(end.exit_code()).unwrap_or(1))
}

#[cfg(unix)]
fn run_supervisor() -> Result<ExitCode> {
    use stream_ocr::watchdog::unix::{ChildProcessControl, UnixSignalFeed};

    let control = ChildProcessControl::current_exe().context("locating own executable")?;
    info!(pid = std::process::id(), "supervisor started");
    let mut watchdog = Watchdog::new(control, UnixSignalFeed::install(), WatchdogPolicy::default());
    let end = watchdog.supervise();
    info!(?end, "supervision ended");
    Ok(exit_code(&end))
}

#[cfg(not(unix))]
fn run_supervisor() -> Result<ExitCode> {
    use stream_ocr::watchdog::{NoSignals, NoopProcessControl};

    let mut watchdog = Watchdog::new(NoopProcessControl, NoSignals, WatchdogPolicy::default());
    Ok(exit_code(&watchdog.supervise()))
}

fn run_worker(settings: &Settings, paths: &Paths, datapoints: Vec<DataPointConfig>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing shutdown handler")?;

    let app = App::new(
        settings,
        paths,
        datapoints,
        source_for(settings),
        engines_for(settings),
        Arc::new(JsonLinesSink::new()),
    );

    #[cfg(unix)]
    let app = {
        use stream_ocr::watchdog::unix;

        unix::install_wake_handlers();
        if watchdog::is_worker() && !unix::bind_to_supervisor() {
            warn!("supervisor already gone, exiting");
            return Ok(());
        }
        app.with_reload_trigger(unix::take_wake_request)
    };

    info!(
        pid = std::process::id(),
        url = %settings.stream_url,
        datapoints = app.datapoints().len(),
        "worker starting"
    );
    app.run(shutdown_rx)?;
    info!("worker exiting");
    Ok(())
}
