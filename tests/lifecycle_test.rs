//! Start/stop ordering across a component tree.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stream_ocr::lifecycle::{Lifecycle, LifecycleNode};
use stream_ocr::scheduler::PeriodicScheduler;

type EventLog = Arc<Mutex<Vec<String>>>;

/// Component that records when it starts and when its stop completes.
struct Recorder {
    node: Arc<LifecycleNode>,
    name: String,
    log: EventLog,
    teardown: Duration,
    timer: Option<PeriodicScheduler>,
}

impl Recorder {
    fn new(name: &str, log: &EventLog) -> Arc<Self> {
        Self::build(name, log, Duration::from_millis(5), None)
    }

    fn with_timer(name: &str, log: &EventLog, interval: Duration) -> Arc<Self> {
        let timer = PeriodicScheduler::new(format!("{name}-timer"));
        timer.set_interval(interval);
        Self::build(name, log, Duration::ZERO, Some(timer))
    }

    fn build(
        name: &str,
        log: &EventLog,
        teardown: Duration,
        timer: Option<PeriodicScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: LifecycleNode::new(name),
            name: name.to_string(),
            log: Arc::clone(log),
            teardown,
            timer,
        })
    }
}

impl Lifecycle for Recorder {
    fn node(&self) -> &Arc<LifecycleNode> {
        &self.node
    }

    fn start(&self) -> bool {
        if !self.node.start() {
            return false;
        }
        self.log.lock().push(format!("start:{}", self.name));
        if let Some(timer) = &self.timer {
            timer.schedule(timer.interval(), false, |_| Ok(()));
        }
        self.node.cascade_start()
    }

    fn stop(&self) {
        if !self.node.request_stop() {
            self.node.wait_stopped();
            return;
        }
        self.node.cascade_stop();
        if let Some(timer) = &self.timer {
            timer.stop();
        }
        thread::sleep(self.teardown);
        self.log.lock().push(format!("stopped:{}", self.name));
        self.node.signal_stopped();
    }
}

fn position(log: &[String], event: &str) -> usize {
    log.iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing event {event} in {log:?}"))
}

struct Tree {
    log: EventLog,
    root: Arc<Recorder>,
    mid: Arc<Recorder>,
    leaves: Vec<Arc<Recorder>>,
}

fn tree() -> Tree {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let root = Recorder::new("root", &log);
    let mid = Recorder::new("mid", &log);
    let leaves = vec![Recorder::new("leaf1", &log), Recorder::new("leaf2", &log)];

    root.node().adopt(&mid);
    for leaf in &leaves {
        mid.node().adopt(leaf);
    }
    Tree {
        log,
        root,
        mid,
        leaves,
    }
}

#[test]
fn stop_completes_bottom_up() {
    let t = tree();
    assert!(t.root.start());
    assert!(t.leaves.iter().all(|leaf| leaf.node().is_running()));

    t.root.stop();

    let log = t.log.lock().clone();
    let root = position(&log, "stopped:root");
    let mid = position(&log, "stopped:mid");
    assert!(mid < root);
    for leaf in ["leaf1", "leaf2"] {
        assert!(position(&log, &format!("stopped:{leaf}")) < mid);
    }
    assert!(!t.mid.node().is_running());
}

#[test]
fn start_cascades_top_down() {
    let t = tree();
    assert!(t.root.start());

    let log = t.log.lock().clone();
    assert!(position(&log, "start:root") < position(&log, "start:mid"));
    assert!(position(&log, "start:mid") < position(&log, "start:leaf1"));
    t.root.stop();
}

#[test]
fn second_start_is_rejected_and_restart_works() {
    let t = tree();
    assert!(t.root.start());
    assert!(!t.root.start());

    let starts = t
        .log
        .lock()
        .iter()
        .filter(|e| *e == "start:root")
        .count();
    assert_eq!(starts, 1);

    t.root.stop();
    assert!(t.root.start());
    t.root.stop();
}

#[test]
fn concurrent_stops_both_wait_for_the_whole_subtree() {
    let t = tree();
    assert!(t.root.start());

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let root = Arc::clone(&t.root);
            let log = Arc::clone(&t.log);
            thread::spawn(move || {
                root.stop();
                log.lock().iter().filter(|e| e.starts_with("stopped:")).count()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 4);
    }
}

#[test]
fn stopping_the_root_cancels_a_long_wait_below_it() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let root = Recorder::new("root", &log);
    let sleeper = Recorder::with_timer("sleeper", &log, Duration::from_secs(30));
    root.node().adopt(&sleeper);

    assert!(root.start());
    let started = Instant::now();
    root.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!sleeper.node().is_running());
}

#[test]
fn dropped_child_leaves_the_tree() {
    let t = tree();
    assert_eq!(t.mid.node().child_count(), 2);

    let Tree {
        root, mid, leaves, ..
    } = t;
    drop(leaves);
    assert_eq!(mid.node().child_count(), 0);

    assert!(root.start());
    root.stop();
}
