//! Process-level supervision.
//!
//! The supervisor process launches the worker (the same binary, re-executed with
//! [`WORKER_ENV`] set), restarts it whenever it dies, and relays signals to it:
//!
//! - wake signals (`SIGUSR1`, `SIGUSR2`) are forwarded verbatim; the worker reacts by
//!   reloading the data point list,
//! - a shutdown signal (`SIGINT`, `SIGTERM`, `SIGHUP`) terminates the worker and ends
//!   supervision.
//!
//! A worker that dies within the grace period counts as a fast exit; after
//! [`WatchdogPolicy::max_fast_exits`] consecutive fast exits supervision gives up, since
//! something is persistently wrong. A worker exiting with status 0 has shut down in an
//! orderly way and also ends supervision.
//!
//! The operating-system side sits behind [`ProcessControl`] and [`SignalFeed`] so the
//! restart policy can be exercised without spawning processes.

#[cfg(unix)]
pub mod unix;

use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::error::AppResult;

/// Environment variable marking a process as the supervised worker.
pub const WORKER_ENV: &str = "STREAM_OCR_WORKER";

/// Environment variable carrying the supervisor's pid to the worker.
pub const SUPERVISOR_PID_ENV: &str = "STREAM_OCR_SUPERVISOR_PID";

/// True when this platform supports supervision.
pub fn available() -> bool {
    cfg!(unix)
}

/// True when this process was launched by a supervisor.
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Process id of the worker
    pub pid: u32,
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it was killed
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// True for an orderly exit with status 0.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "pid {} exited with status {code}", self.pid),
            (None, Some(signal)) => write!(f, "pid {} killed by signal {signal}", self.pid),
            (None, None) => write!(f, "pid {} ended", self.pid),
        }
    }
}

/// Operating-system operations the supervisor needs.
pub trait ProcessControl {
    /// Launch a new worker and return its pid.
    fn spawn_worker(&mut self) -> AppResult<u32>;

    /// Non-blocking check; `Some` once the current worker has exited.
    fn try_wait(&mut self) -> AppResult<Option<WorkerExit>>;

    /// True while the current worker runs.
    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Deliver `signal` to the current worker.
    fn forward_signal(&mut self, signal: i32) -> AppResult<()>;

    /// Ask the current worker to shut down and wait for it.
    fn terminate(&mut self) -> AppResult<Option<WorkerExit>>;
}

/// A signal received by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    /// Relay this signal number to the worker
    Wake(i32),
    /// Stop the worker and end supervision
    Shutdown,
}

/// Source of signals received by the supervisor.
pub trait SignalFeed {
    /// Next pending signal, without blocking.
    fn next_signal(&mut self) -> Option<SupervisorSignal>;
}

/// Restart policy.
#[derive(Debug, Clone)]
pub struct WatchdogPolicy {
    /// A worker dying sooner than this after launch is a fast exit
    pub grace: Duration,
    /// Poll period while waiting on the worker
    pub poll: Duration,
    /// Consecutive fast exits that end supervision
    pub max_fast_exits: u32,
    /// Crash dump file renamed to `<name>.<pid>` after a crash
    pub crash_dump: Option<PathBuf>,
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            poll: Duration::from_millis(100),
            max_fast_exits: 3,
            crash_dump: Some(PathBuf::from("core")),
        }
    }
}

/// Why supervision ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionEnd {
    /// The worker shut down cleanly
    CleanExit(WorkerExit),
    /// Too many consecutive fast exits
    CrashLoop {
        /// Number of consecutive fast exits seen
        fast_exits: u32,
    },
    /// A shutdown signal arrived
    Shutdown,
    /// A worker could not be launched
    SpawnFailed(String),
}

impl SupervisionEnd {
    /// Process exit code for the supervisor.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisionEnd::CleanExit(_) | SupervisionEnd::Shutdown => 0,
            SupervisionEnd::CrashLoop { .. } | SupervisionEnd::SpawnFailed(_) => 1,
        }
    }
}

enum Watch {
    Running,
    Exited(WorkerExit),
    Shutdown,
}

/// Supervises one worker at a time.
pub struct Watchdog<P, S> {
    control: P,
    signals: S,
    policy: WatchdogPolicy,
}

impl<P: ProcessControl, S: SignalFeed> Watchdog<P, S> {
    /// Supervisor driving `control`, listening on `signals`.
    pub fn new(control: P, signals: S, policy: WatchdogPolicy) -> Self {
        Self {
            control,
            signals,
            policy,
        }
    }

    /// The process control, e.g. for inspection in tests.
    pub fn control(&self) -> &P {
        &self.control
    }

    /// Launch and restart workers until supervision ends.
    pub fn supervise(&mut self) -> SupervisionEnd {
        let mut fast_exits = 0u32;

        for launch in 1u64.. {
            let pid = match self.control.spawn_worker() {
                Ok(pid) => pid,
                Err(e) => {
                    error!(error = %e, "failed to launch worker");
                    return SupervisionEnd::SpawnFailed(e.to_string());
                }
            };
            info!(pid, launch, "worker launched");

            match self.watch(Some(Instant::now() + self.policy.grace)) {
                Watch::Shutdown => return SupervisionEnd::Shutdown,
                Watch::Exited(exit) if exit.is_clean() => {
                    info!(%exit, "worker shut down");
                    return SupervisionEnd::CleanExit(exit);
                }
                Watch::Exited(exit) => {
                    fast_exits += 1;
                    warn!(%exit, fast_exits, "worker exited during grace period");
                    if fast_exits >= self.policy.max_fast_exits {
                        error!(fast_exits, "worker keeps failing, giving up");
                        return SupervisionEnd::CrashLoop { fast_exits };
                    }
                    continue;
                }
                Watch::Running => fast_exits = 0,
            }

            match self.watch(None) {
                Watch::Shutdown => return SupervisionEnd::Shutdown,
                Watch::Exited(exit) if exit.is_clean() => {
                    info!(%exit, "worker shut down");
                    return SupervisionEnd::CleanExit(exit);
                }
                Watch::Exited(exit) => {
                    warn!(%exit, "worker died, restarting");
                    self.archive_crash_dump(exit.pid);
                }
                Watch::Running => {}
            }
        }

        SupervisionEnd::Shutdown
    }

    /// Relay signals and wait for the worker to exit or for `deadline`.
    fn watch(&mut self, deadline: Option<Instant>) -> Watch {
        loop {
            while let Some(signal) = self.signals.next_signal() {
                match signal {
                    SupervisorSignal::Wake(number) => {
                        if let Err(e) = self.control.forward_signal(number) {
                            warn!(signal = number, error = %e, "failed to relay signal");
                        }
                    }
                    SupervisorSignal::Shutdown => {
                        info!("shutdown requested, stopping worker");
                        match self.control.terminate() {
                            Ok(Some(exit)) => info!(%exit, "worker stopped"),
                            Ok(None) => {}
                            Err(e) => error!(error = %e, "failed to stop worker"),
                        }
                        return Watch::Shutdown;
                    }
                }
            }

            match self.control.try_wait() {
                Ok(Some(exit)) => return Watch::Exited(exit),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to query worker"),
            }

            let mut pause = self.policy.poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Watch::Running;
                }
                pause = pause.min(deadline - now);
            }
            thread::sleep(pause);
        }
    }

    fn archive_crash_dump(&self, pid: u32) {
        let Some(dump) = self.policy.crash_dump.as_ref() else {
            return;
        };
        if !dump.exists() {
            return;
        }
        let mut archived = dump.clone().into_os_string();
        archived.push(format!(".{pid}"));
        match std::fs::rename(dump, &archived) {
            Ok(()) => info!(from = %dump.display(), to = ?archived, "crash dump archived"),
            Err(e) => warn!(path = %dump.display(), error = %e, "failed to archive crash dump"),
        }
    }
}

/// Process control for platforms without supervision support.
#[derive(Debug, Default)]
pub struct NoopProcessControl;

impl ProcessControl for NoopProcessControl {
    fn spawn_worker(&mut self) -> AppResult<u32> {
        Err(crate::error::OcrError::StartFailed(
            "process supervision is not supported on this platform".into(),
        ))
    }

    fn try_wait(&mut self) -> AppResult<Option<WorkerExit>> {
        Ok(None)
    }

    fn forward_signal(&mut self, _signal: i32) -> AppResult<()> {
        Ok(())
    }

    fn terminate(&mut self) -> AppResult<Option<WorkerExit>> {
        Ok(None)
    }
}

/// Signal feed that never yields a signal.
#[derive(Debug, Default)]
pub struct NoSignals;

impl SignalFeed for NoSignals {
    fn next_signal(&mut self) -> Option<SupervisorSignal> {
        None
    }
}
