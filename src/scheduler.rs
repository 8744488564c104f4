//! Dedicated-thread task scheduler with cancellable sleeps.
//!
//! A [`PeriodicScheduler`] owns one worker thread while it runs. Two modes exist:
//!
//! - **Interval mode** ([`PeriodicScheduler::schedule`]): the task runs once per interval.
//!   The interval is re-read before every wait, so [`PeriodicScheduler::set_interval`]
//!   changes the cadence from the next wait on.
//! - **Tight mode** ([`PeriodicScheduler::run_continuously`]): the task runs back-to-back.
//!   Use it when the task paces itself by blocking, e.g. on a frame grab.
//!
//! Task failures never end the loop. `Err` results are logged at `warn`, panics are caught
//! and logged at `error`, and the next iteration proceeds normally.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::lifecycle::{LifecycleNode, WaitOutcome};

struct Worker {
    thread_id: ThreadId,
    handle: JoinHandle<()>,
}

/// Runs a task on its own thread, either periodically or continuously.
pub struct PeriodicScheduler {
    name: String,
    node: Arc<LifecycleNode>,
    interval: Arc<RwLock<Duration>>,
    worker: Mutex<Option<Worker>>,
}

impl PeriodicScheduler {
    /// Create an idle scheduler. `name` labels the worker thread and log lines.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            node: LifecycleNode::new(name.clone()),
            name,
            interval: Arc::new(RwLock::new(Duration::from_secs(1))),
            worker: Mutex::new(None),
        }
    }

    /// Lifecycle node of the scheduler.
    pub fn node(&self) -> &Arc<LifecycleNode> {
        &self.node
    }

    /// True while a worker thread is active.
    pub fn is_running(&self) -> bool {
        self.node.is_running()
    }

    /// Current interval used by interval mode.
    pub fn interval(&self) -> Duration {
        *self.interval.read()
    }

    /// Change the interval. A running loop picks it up at its next wait.
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.write() = interval;
    }

    /// Run `task` every `interval` until stopped.
    ///
    /// With `run_immediately` the first invocation happens right away, otherwise after one
    /// interval. The task receives the wall-clock time of the invocation. Returns `false`
    /// if the scheduler is already running.
    pub fn schedule<F>(&self, interval: Duration, run_immediately: bool, mut task: F) -> bool
    where
        F: FnMut(SystemTime) -> anyhow::Result<()> + Send + 'static,
    {
        if !self.node.start() {
            return false;
        }
        self.set_interval(interval);

        let node = Arc::clone(&self.node);
        let interval = Arc::clone(&self.interval);
        let name = self.name.clone();

        self.spawn(move || {
            let now = Instant::now();
            let mut deadline = if run_immediately {
                now
            } else {
                now + *interval.read()
            };

            loop {
                if node.cancellable_wait_until(deadline) == WaitOutcome::StopRequested {
                    break;
                }
                invoke(&name, || task(SystemTime::now()));
                deadline = Instant::now() + *interval.read();
            }

            debug!(scheduler = %name, "interval loop exiting");
            node.signal_stopped();
        })
    }

    /// Run `task` back-to-back until stopped. Returns `false` if already running.
    pub fn run_continuously<F>(&self, mut task: F) -> bool
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        if !self.node.start() {
            return false;
        }

        let node = Arc::clone(&self.node);
        let name = self.name.clone();

        self.spawn(move || {
            while !node.is_stopping() {
                invoke(&name, &mut task);
            }

            debug!(scheduler = %name, "continuous loop exiting");
            node.signal_stopped();
        })
    }

    /// Ask the loop to exit without waiting for it.
    pub fn request_stop(&self) {
        self.node.request_stop();
    }

    /// Stop the loop and join its thread.
    ///
    /// Called from inside the scheduler's own task, this only requests the stop; the loop
    /// exits once the task returns.
    pub fn stop(&self) {
        if self.on_worker_thread() {
            self.node.request_stop();
            return;
        }

        self.node.stop();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.handle.join().is_err() {
                error!(scheduler = %self.name, "worker thread panicked");
            }
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.thread_id == thread::current().id())
    }

    fn spawn<F>(&self, body: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        // Held across the spawn so a task calling `stop` right away can recognise its own thread.
        let mut slot = self.worker.lock();
        let spawned = thread::Builder::new().name(self.name.clone()).spawn(body);
        match spawned {
            Ok(handle) => {
                // A previous worker that stopped itself from inside its task is detached here.
                *slot = Some(Worker {
                    thread_id: handle.thread().id(),
                    handle,
                });
                true
            }
            Err(e) => {
                error!(scheduler = %self.name, error = %e, "failed to spawn worker thread");
                self.node.abort_start();
                false
            }
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn invoke<F>(name: &str, task: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(scheduler = %name, error = %e, "task failed"),
        Err(_) => error!(scheduler = %name, "task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn run_immediately_fires_before_first_interval() {
        let scheduler = PeriodicScheduler::new("immediate");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        assert!(scheduler.schedule(Duration::from_secs(60), true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn stop_interrupts_a_long_wait() {
        let scheduler = PeriodicScheduler::new("sleepy");
        assert!(scheduler.schedule(Duration::from_secs(3600), false, |_| Ok(())));

        let started = Instant::now();
        scheduler.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn schedule_twice_is_rejected() {
        let scheduler = PeriodicScheduler::new("twice");
        assert!(scheduler.schedule(Duration::from_millis(10), false, |_| Ok(())));
        assert!(!scheduler.schedule(Duration::from_millis(10), false, |_| Ok(())));
        scheduler.stop();
    }

    #[test]
    fn failing_and_panicking_tasks_keep_the_loop_alive() {
        let scheduler = PeriodicScheduler::new("faulty");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        scheduler.schedule(Duration::from_millis(1), true, move |_| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            match n % 3 {
                0 => anyhow::bail!("transient failure"),
                1 => panic!("task blew up"),
                _ => Ok(()),
            }
        });

        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 6));
        scheduler.stop();
    }

    #[test]
    fn interval_change_applies_to_next_wait() {
        let scheduler = PeriodicScheduler::new("retimed");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        scheduler.schedule(Duration::from_secs(3600), true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));

        // The loop is parked on the old hour-long deadline; the new interval only
        // applies once that wait ends, so restart the cycle to observe it.
        scheduler.set_interval(Duration::from_millis(2));
        assert_eq!(scheduler.interval(), Duration::from_millis(2));
        scheduler.stop();

        let seen = Arc::clone(&count);
        scheduler.schedule(scheduler.interval(), false, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 4));
        scheduler.stop();
    }

    #[test]
    fn continuous_mode_runs_until_stopped() {
        let scheduler = PeriodicScheduler::new("tight");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        assert!(scheduler.run_continuously(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }));

        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 10));
        scheduler.stop();
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn stop_from_inside_the_task_ends_the_loop() {
        let scheduler = Arc::new(PeriodicScheduler::new("self-stopping"));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let weak = Arc::downgrade(&scheduler);

        scheduler.schedule(Duration::from_millis(1), true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(scheduler) = weak.upgrade() {
                scheduler.stop();
            }
            Ok(())
        });

        assert!(wait_for(|| !scheduler.is_running()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduler_restarts_after_full_stop() {
        let scheduler = PeriodicScheduler::new("restart");
        assert!(scheduler.schedule(Duration::from_millis(5), false, |_| Ok(())));
        scheduler.stop();
        assert!(scheduler.run_continuously(|| {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }));
        scheduler.stop();
    }
}
