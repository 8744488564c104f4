//! Restart policy of the process watchdog, driven through scripted fakes.

mod common;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use common::wait_for;
use stream_ocr::error::{AppResult, OcrError};
use stream_ocr::watchdog::{
    ProcessControl, SignalFeed, SupervisionEnd, SupervisorSignal, Watchdog, WatchdogPolicy,
    WorkerExit,
};

const GRACE: Duration = Duration::from_millis(40);
const AFTER_GRACE: Duration = Duration::from_millis(80);

/// What the next spawned worker does.
#[derive(Debug, Clone, Copy)]
enum Plan {
    Exit { after: Duration, code: Option<i32>, signal: Option<i32> },
    RunForever,
}

fn crash(after: Duration) -> Plan {
    Plan::Exit { after, code: None, signal: Some(11) }
}

fn fail(after: Duration) -> Plan {
    Plan::Exit { after, code: Some(1), signal: None }
}

fn clean(after: Duration) -> Plan {
    Plan::Exit { after, code: Some(0), signal: None }
}

#[derive(Debug, Default)]
struct Journal {
    spawned: Vec<u32>,
    forwarded: Vec<(u32, i32)>,
    terminated: Vec<u32>,
}

struct ScriptedControl {
    plans: VecDeque<Plan>,
    current: Option<(u32, Instant, Plan)>,
    next_pid: u32,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedControl {
    fn new(plans: impl IntoIterator<Item = Plan>) -> (Self, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let control = Self {
            plans: plans.into_iter().collect(),
            current: None,
            next_pid: 100,
            journal: Arc::clone(&journal),
        };
        (control, journal)
    }
}

impl ProcessControl for ScriptedControl {
    fn spawn_worker(&mut self) -> AppResult<u32> {
        let plan = self
            .plans
            .pop_front()
            .ok_or_else(|| OcrError::StartFailed("script exhausted".into()))?;
        let pid = self.next_pid;
        self.next_pid += 1;
        self.current = Some((pid, Instant::now(), plan));
        self.journal.lock().spawned.push(pid);
        Ok(pid)
    }

    fn try_wait(&mut self) -> AppResult<Option<WorkerExit>> {
        let Some((pid, spawned, plan)) = self.current else {
            return Ok(None);
        };
        match plan {
            Plan::Exit { after, code, signal } if spawned.elapsed() >= after => {
                self.current = None;
                Ok(Some(WorkerExit { pid, code, signal }))
            }
            _ => Ok(None),
        }
    }

    fn forward_signal(&mut self, signal: i32) -> AppResult<()> {
        if let Some((pid, ..)) = self.current {
            self.journal.lock().forwarded.push((pid, signal));
        }
        Ok(())
    }

    fn terminate(&mut self) -> AppResult<Option<WorkerExit>> {
        let Some((pid, ..)) = self.current.take() else {
            return Ok(None);
        };
        self.journal.lock().terminated.push(pid);
        Ok(Some(WorkerExit { pid, code: None, signal: Some(2) }))
    }
}

/// Signals pushed by the test through a channel.
struct ChannelFeed(Receiver<SupervisorSignal>);

impl SignalFeed for ChannelFeed {
    fn next_signal(&mut self) -> Option<SupervisorSignal> {
        self.0.try_recv().ok()
    }
}

fn quiet() -> (Sender<SupervisorSignal>, ChannelFeed) {
    let (tx, rx) = unbounded();
    (tx, ChannelFeed(rx))
}

fn policy(crash_dump: Option<PathBuf>) -> WatchdogPolicy {
    WatchdogPolicy {
        grace: GRACE,
        poll: Duration::from_millis(2),
        max_fast_exits: 3,
        crash_dump,
    }
}

#[test]
fn three_fast_exits_end_supervision() {
    let (control, journal) = ScriptedControl::new([fail(Duration::ZERO); 5]);
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(None)).supervise();

    assert_eq!(end, SupervisionEnd::CrashLoop { fast_exits: 3 });
    assert_eq!(end.exit_code(), 1);
    assert_eq!(journal.lock().spawned.len(), 3);
}

#[test]
fn clean_exit_is_not_restarted() {
    let (control, journal) = ScriptedControl::new([clean(Duration::ZERO), crash(Duration::ZERO)]);
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(None)).supervise();

    assert!(matches!(end, SupervisionEnd::CleanExit(exit) if exit.pid == 100));
    assert_eq!(end.exit_code(), 0);
    assert_eq!(journal.lock().spawned, [100]);
}

#[test]
fn clean_exit_after_grace_also_ends_supervision() {
    let (control, journal) = ScriptedControl::new([crash(AFTER_GRACE), clean(AFTER_GRACE)]);
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(None)).supervise();

    assert!(matches!(end, SupervisionEnd::CleanExit(exit) if exit.pid == 101));
    assert_eq!(journal.lock().spawned, [100, 101]);
}

#[test]
fn surviving_the_grace_period_resets_the_fast_exit_count() {
    let (control, journal) = ScriptedControl::new([
        fail(Duration::ZERO),
        fail(Duration::ZERO),
        crash(AFTER_GRACE),
        fail(Duration::ZERO),
        fail(Duration::ZERO),
        fail(Duration::ZERO),
        clean(Duration::ZERO),
    ]);
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(None)).supervise();

    assert_eq!(end, SupervisionEnd::CrashLoop { fast_exits: 3 });
    assert_eq!(journal.lock().spawned.len(), 6);
}

#[test]
fn spawn_failure_ends_supervision() {
    let (control, _journal) = ScriptedControl::new(Vec::<Plan>::new());
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(None)).supervise();
    assert!(matches!(end, SupervisionEnd::SpawnFailed(_)));
}

#[test]
fn crash_dump_is_archived_after_a_slow_crash_only() {
    let dir = tempfile::tempdir().unwrap();
    let core = dir.path().join("core");
    std::fs::write(&core, b"dump").unwrap();

    let (control, _journal) = ScriptedControl::new([
        fail(Duration::ZERO),
        crash(AFTER_GRACE),
        clean(Duration::ZERO),
    ]);
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(Some(core.clone()))).supervise();

    assert!(matches!(end, SupervisionEnd::CleanExit(_)));
    assert!(!core.exists());
    assert!(!dir.path().join("core.100").exists());
    assert_eq!(std::fs::read(dir.path().join("core.101")).unwrap(), b"dump");
}

#[test]
fn missing_crash_dump_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let (control, _journal) = ScriptedControl::new([crash(AFTER_GRACE), clean(Duration::ZERO)]);
    let (_tx, feed) = quiet();

    let end = Watchdog::new(control, feed, policy(Some(dir.path().join("core")))).supervise();
    assert!(matches!(end, SupervisionEnd::CleanExit(_)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn wake_signals_are_relayed_and_shutdown_terminates() {
    let (control, journal) = ScriptedControl::new([Plan::RunForever]);
    let (tx, feed) = quiet();

    let supervisor = thread::spawn(move || {
        let mut watchdog = Watchdog::new(control, feed, policy(None));
        watchdog.supervise()
    });

    assert!(wait_for(Duration::from_secs(5), || !journal.lock().spawned.is_empty()));
    tx.send(SupervisorSignal::Wake(10)).unwrap();
    tx.send(SupervisorSignal::Wake(12)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || journal.lock().forwarded.len() == 2));

    // Still running past the grace period: relaying continues.
    thread::sleep(AFTER_GRACE);
    tx.send(SupervisorSignal::Wake(10)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || journal.lock().forwarded.len() == 3));

    tx.send(SupervisorSignal::Shutdown).unwrap();
    let end = supervisor.join().unwrap();

    assert_eq!(end, SupervisionEnd::Shutdown);
    assert_eq!(end.exit_code(), 0);
    let journal = journal.lock();
    assert_eq!(journal.forwarded, [(100, 10), (100, 12), (100, 10)]);
    assert_eq!(journal.terminated, [100]);
    assert_eq!(journal.spawned, [100]);
}
