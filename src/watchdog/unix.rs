//! Unix process control and signal plumbing.
//!
//! Signal handlers only flip atomics; everything else happens on ordinary threads that
//! poll those flags. The flags are process-wide by nature, but they are only armed
//! between [`UnixSignalFeed::install`] (or [`install_wake_handlers`]) and the matching
//! teardown, and nothing outside this module touches them.
#![allow(unsafe_code)]

use std::ffi::OsString;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libc::c_int;
use tracing::{debug, warn};

use crate::error::{AppResult, OcrError};
use crate::watchdog::{
    ProcessControl, SignalFeed, SupervisorSignal, WorkerExit, SUPERVISOR_PID_ENV, WORKER_ENV,
};

static WAKE_USR1: AtomicBool = AtomicBool::new(false);
static WAKE_USR2: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// How long [`ChildProcessControl::terminate`] waits before killing the worker.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

extern "C" fn on_signal(signal: c_int) {
    match signal {
        libc::SIGUSR1 => WAKE_USR1.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => WAKE_USR2.store(true, Ordering::SeqCst),
        _ => SHUTDOWN.store(true, Ordering::SeqCst),
    }
}

fn set_handler(signal: c_int, handler: libc::sighandler_t) {
    // SAFETY: `on_signal` only performs atomic stores, which are async-signal-safe.
    let previous = unsafe { libc::signal(signal, handler) };
    if previous == libc::SIG_ERR {
        warn!(signal, "failed to install signal handler");
    }
}

fn handler() -> libc::sighandler_t {
    on_signal as extern "C" fn(c_int) as libc::sighandler_t
}

const WAKE_SIGNALS: [c_int; 2] = [libc::SIGUSR1, libc::SIGUSR2];
const SHUTDOWN_SIGNALS: [c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

/// Signals received by the supervisor process.
///
/// Installing the feed routes wake and shutdown signals into it; dropping it restores
/// the default dispositions.
#[derive(Debug)]
pub struct UnixSignalFeed {
    _private: (),
}

impl UnixSignalFeed {
    /// Route `SIGUSR1`/`SIGUSR2` and `SIGINT`/`SIGTERM`/`SIGHUP` into the feed.
    pub fn install() -> Self {
        WAKE_USR1.store(false, Ordering::SeqCst);
        WAKE_USR2.store(false, Ordering::SeqCst);
        SHUTDOWN.store(false, Ordering::SeqCst);
        for signal in WAKE_SIGNALS.into_iter().chain(SHUTDOWN_SIGNALS) {
            set_handler(signal, handler());
        }
        Self { _private: () }
    }
}

impl SignalFeed for UnixSignalFeed {
    fn next_signal(&mut self) -> Option<SupervisorSignal> {
        if SHUTDOWN.swap(false, Ordering::SeqCst) {
            return Some(SupervisorSignal::Shutdown);
        }
        if WAKE_USR1.swap(false, Ordering::SeqCst) {
            return Some(SupervisorSignal::Wake(libc::SIGUSR1));
        }
        if WAKE_USR2.swap(false, Ordering::SeqCst) {
            return Some(SupervisorSignal::Wake(libc::SIGUSR2));
        }
        None
    }
}

impl Drop for UnixSignalFeed {
    fn drop(&mut self) {
        for signal in WAKE_SIGNALS.into_iter().chain(SHUTDOWN_SIGNALS) {
            set_handler(signal, libc::SIG_DFL);
        }
    }
}

/// Route `SIGUSR1`/`SIGUSR2` in the worker to [`take_wake_request`].
pub fn install_wake_handlers() {
    WAKE_USR1.store(false, Ordering::SeqCst);
    WAKE_USR2.store(false, Ordering::SeqCst);
    for signal in WAKE_SIGNALS {
        set_handler(signal, handler());
    }
}

/// True once per received wake signal batch.
pub fn take_wake_request() -> bool {
    let usr1 = WAKE_USR1.swap(false, Ordering::SeqCst);
    let usr2 = WAKE_USR2.swap(false, Ordering::SeqCst);
    usr1 || usr2
}

/// Make the kernel send `SIGTERM` to this worker when its supervisor dies.
///
/// Returns `false` when the supervisor is already gone.
pub fn bind_to_supervisor() -> bool {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: plain prctl call with integer arguments.
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
        if rc != 0 {
            warn!(error = %std::io::Error::last_os_error(), "PR_SET_PDEATHSIG failed");
        }
    }

    let expected = std::env::var(SUPERVISOR_PID_ENV)
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok());
    match expected {
        Some(expected) => std::os::unix::process::parent_id() == expected,
        None => true,
    }
}

/// Launches the current executable as the worker.
#[derive(Debug)]
pub struct ChildProcessControl {
    program: std::path::PathBuf,
    args: Vec<OsString>,
    child: Option<Child>,
}

impl ChildProcessControl {
    /// Re-execute the running binary with its original arguments.
    pub fn current_exe() -> AppResult<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
            child: None,
        })
    }

    /// Run `program` with `args` as the worker.
    pub fn new(program: impl Into<std::path::PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

fn to_exit(pid: u32, status: std::process::ExitStatus) -> WorkerExit {
    use std::os::unix::process::ExitStatusExt;
    WorkerExit {
        pid,
        code: status.code(),
        signal: status.signal(),
    }
}

impl ProcessControl for ChildProcessControl {
    fn spawn_worker(&mut self) -> AppResult<u32> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, "1")
            .env(SUPERVISOR_PID_ENV, std::process::id().to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                OcrError::StartFailed(format!("worker {}: {e}", self.program.display()))
            })?;
        let pid = child.id();
        self.child = Some(child);
        Ok(pid)
    }

    fn try_wait(&mut self) -> AppResult<Option<WorkerExit>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let pid = child.id();
        match child.try_wait()? {
            Some(status) => {
                self.child = None;
                Ok(Some(to_exit(pid, status)))
            }
            None => Ok(None),
        }
    }

    fn forward_signal(&mut self, signal: i32) -> AppResult<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| OcrError::Configuration(format!("pid {pid} out of range")))?;
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, signal) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        debug!(pid, signal, "signal relayed to worker");
        Ok(())
    }

    fn terminate(&mut self) -> AppResult<Option<WorkerExit>> {
        if self.child.is_none() {
            return Ok(None);
        }
        self.forward_signal(libc::SIGINT)?;

        let deadline = Instant::now() + TERMINATE_TIMEOUT;
        while Instant::now() < deadline {
            if let Some(exit) = self.try_wait()? {
                return Ok(Some(exit));
            }
            thread::sleep(Duration::from_millis(50));
        }

        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        warn!(pid = child.id(), "worker ignored SIGINT, killing it");
        let pid = child.id();
        child.kill()?;
        let status = child.wait()?;
        Ok(Some(to_exit(pid, status)))
    }
}

impl Drop for ChildProcessControl {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
