//! The application root.
//!
//! [`App`] is the root of the lifecycle tree:
//!
//! ```text
//! App
//!  └─ FrameHub
//!      ├─ SampledConsumer "dp1"
//!      └─ SampledConsumer "dp2" ...
//! ```
//!
//! Starting the app starts the hub (which blocks until the stream is up), the hub starts
//! its consumers, and then the reload timer begins checking the data point list. Stopping
//! unwinds the same tree bottom-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::{Paths, Settings};
use crate::consumer::ConsumerFactory;
use crate::datapoints::DataPointConfig;
use crate::error::{AppResult, OcrError};
use crate::hub::{FrameHub, HubSettings};
use crate::lifecycle::{Lifecycle, LifecycleNode};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::recognition::{EngineFactory, TesseractFactory};
use crate::scheduler::PeriodicScheduler;
use crate::sink::ResultSink;
use crate::source::{FfmpegSource, FrameSource, MockFrameSource};

/// Frame source for the configured stream URL.
pub fn source_for(settings: &Settings) -> Box<dyn FrameSource> {
    if settings.uses_mock_source() {
        Box::new(MockFrameSource::new(
            settings.source.width,
            settings.source.height,
            settings.source.nominal_fps,
        ))
    } else {
        Box::new(FfmpegSource::new(&settings.source))
    }
}

/// Recognition engine factory for the configured recognition program.
pub fn engines_for(settings: &Settings) -> Arc<dyn EngineFactory> {
    Arc::new(TesseractFactory::new(&settings.recognition))
}

/// Extra source of reload requests polled on every reload tick, e.g. a signal flag.
pub type ReloadTrigger = fn() -> bool;

/// Root component: the hub, its consumers and the reload timer.
pub struct App {
    node: Arc<LifecycleNode>,
    hub: Arc<FrameHub>,
    reconciler: Arc<Mutex<Reconciler>>,
    reload_timer: PeriodicScheduler,
    reload_check_interval: Duration,
    reload_requested: Arc<AtomicBool>,
    reload_trigger: Option<ReloadTrigger>,
    shutdown_requested: AtomicBool,
    /// Serialises start against a concurrent stop.
    start_guard: Mutex<()>,
}

impl App {
    /// Build the stopped component tree for `datapoints`.
    pub fn new(
        settings: &Settings,
        paths: &Paths,
        datapoints: Vec<DataPointConfig>,
        source: Box<dyn FrameSource>,
        engines: Arc<dyn EngineFactory>,
        sink: Arc<dyn ResultSink>,
    ) -> Arc<Self> {
        let hub = FrameHub::new(
            HubSettings {
                url: settings.stream_url.clone(),
                reconnect_interval: settings.reconnect_interval(),
                rate_refresh_interval: settings.rate_refresh_interval(),
                snapshot_dump: settings.save_first_frame.then(|| paths.snapshot_file()),
            },
            source,
        );

        let factory = ConsumerFactory::new(
            paths.recognition_data(),
            settings.language.clone(),
            engines,
            hub.snapshot_slot(),
            sink,
        );
        for record in &datapoints {
            hub.register_consumer(factory.build(record));
        }

        let reconciler = Reconciler::new(
            paths.datapoints_file(),
            datapoints,
            Arc::clone(&hub),
            factory,
        );

        let node = LifecycleNode::new("app");
        node.adopt(&hub);

        Arc::new(Self {
            node,
            hub,
            reconciler: Arc::new(Mutex::new(reconciler)),
            reload_timer: PeriodicScheduler::new("dp-reload"),
            reload_check_interval: settings.reload_check_interval(),
            reload_requested: Arc::new(AtomicBool::new(false)),
            reload_trigger: None,
            shutdown_requested: AtomicBool::new(false),
            start_guard: Mutex::new(()),
        })
    }

    /// Poll `trigger` on every reload tick; `true` forces a reload.
    ///
    /// Must be called before the app is shared.
    pub fn with_reload_trigger(mut self: Arc<Self>, trigger: ReloadTrigger) -> Arc<Self> {
        if let Some(app) = Arc::get_mut(&mut self) {
            app.reload_trigger = Some(trigger);
        } else {
            warn!("app already shared, reload trigger ignored");
        }
        self
    }

    /// The frame hub.
    pub fn hub(&self) -> &Arc<FrameHub> {
        &self.hub
    }

    /// Force the next reload tick to re-read the data point list.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    /// Check the data point list now, outside the timer.
    pub fn reload_now(&self, forced: bool) -> ReconcileOutcome {
        self.reconciler.lock().check(forced)
    }

    /// Records the app currently runs with.
    pub fn datapoints(&self) -> Vec<DataPointConfig> {
        self.reconciler.lock().current().to_vec()
    }

    /// Stop for good. A start racing with this call gives up instead of connecting.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.stop();
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Start, then block until `shutdown` fires (or its sender goes away) and stop.
    ///
    /// A start cut short by the shutdown is not an error.
    pub fn run(self: &Arc<Self>, shutdown: Receiver<()>) -> AppResult<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let app = Arc::clone(self);
        let watcher = thread::Builder::new()
            .name("app-shutdown".into())
            .spawn(move || {
                select! {
                    recv(shutdown) -> _ => {
                        info!("shutdown requested");
                        app.shutdown();
                    }
                    recv(done_rx) -> _ => {}
                }
            })?;

        let started = self.start();
        if !started {
            let _ = done_tx.send(());
        }
        if watcher.join().is_err() {
            error!("shutdown watcher panicked");
            self.stop();
        }

        if started || self.is_shut_down() {
            Ok(())
        } else {
            Err(OcrError::StartFailed("frame hub".into()))
        }
    }

    fn start_reload_timer(&self) -> bool {
        let reconciler = Arc::clone(&self.reconciler);
        let requested = Arc::clone(&self.reload_requested);
        let trigger = self.reload_trigger;
        self.reload_timer.schedule(self.reload_check_interval, false, move |_| {
            let signalled = trigger.is_some_and(|take| take());
            let forced = requested.swap(false, Ordering::SeqCst) || signalled;
            reconciler.lock().check(forced);
            Ok(())
        })
    }

    /// `None` means the stop path owns cleanup.
    fn start_locked(&self) -> Option<bool> {
        let _guard = self.start_guard.lock();
        if !self.node.start() {
            warn!("app already started");
            return Some(false);
        }
        if self.is_shut_down() {
            self.node.abort_start();
            return Some(false);
        }
        info!(url = %self.hub.url(), "app starting");

        if !self.node.cascade_start() {
            return None;
        }
        if self.node.is_stopping() {
            return Some(false);
        }
        if !self.start_reload_timer() {
            error!("reload timer already running");
            return None;
        }
        info!(
            url = %self.hub.url(),
            interval_ms = self.reload_check_interval.as_millis() as u64,
            "app started, watching data point list"
        );
        Some(true)
    }
}

impl Lifecycle for App {
    fn node(&self) -> &Arc<LifecycleNode> {
        &self.node
    }

    fn start(&self) -> bool {
        match self.start_locked() {
            Some(started) => started,
            None => {
                if !self.node.is_stopping() {
                    error!(url = %self.hub.url(), "frame hub failed to start");
                }
                self.stop();
                false
            }
        }
    }

    fn stop(&self) {
        if !self.node.request_stop() {
            self.node.wait_stopped();
            return;
        }
        info!("app stopping");

        self.reload_timer.request_stop();
        let _guard = self.start_guard.lock();
        self.reload_timer.stop();
        self.node.cascade_stop();
        self.node.signal_stopped();
        info!("app stopped");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.stop();
    }
}
