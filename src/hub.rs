//! The frame hub: one stream connection shared by every consumer.
//!
//! # Architecture
//!
//! ```text
//!   reconnect timer ──open──▶ ┌──────────────┐
//!                             │ FrameSource  │
//!   sampler (tight loop) ─grab┴──────────────┘
//!        │ every `stride`-th frame: retrieve
//!        ▼
//!   ┌──────────────┐   read (deep copy)   ┌──────────────────┐
//!   │ SnapshotSlot │ ◀──────────────────── │ SampledConsumer* │
//!   └──────────────┘                       └──────────────────┘
//!        ▲
//!   rate refresher: measured source rate ─▶ stride
//! ```
//!
//! The sampler grabs every frame the source produces so the source never builds a
//! backlog, but only decodes and publishes one in `stride`. The stride follows the
//! aggregate demand: the fastest registered consumer sets the target rate and the
//! stride is the ratio between the measured source rate and that target.
//!
//! Connection handling is a small state machine, Disconnected → Connecting → Connected,
//! re-entered on any grab failure. The slot is emptied before the state leaves
//! Connected, so consumers never see a frame from a previous connection.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::consumer::SampledConsumer;
use crate::datapoints::DataPointConfig;
use crate::frame::Frame;
use crate::lifecycle::{Lifecycle, LifecycleNode};
use crate::scheduler::PeriodicScheduler;
use crate::source::FrameSource;

/// Upper bound on how long the connection gate sleeps between stop checks of the
/// enclosing tree. The hub's own stop wakes it immediately.
const GATE_RECHECK: Duration = Duration::from_millis(50);

/// Connection state of the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and no attempt in progress
    Disconnected,
    /// The reconnect timer is trying to open the source
    Connecting,
    /// Frames are flowing
    Connected,
}

/// Source frames consumed per published snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stride {
    /// Publish every n-th grabbed frame (n ≥ 1)
    Every(u64),
    /// Nobody is listening; publish nothing
    Never,
}

impl Stride {
    /// Whether the frame with zero-based grab index `index` is published.
    pub fn publishes(self, index: u64) -> bool {
        match self {
            Stride::Every(n) => index % n.max(1) == 0,
            Stride::Never => false,
        }
    }
}

/// Target publish rate in frames per second for the given consumer intervals.
///
/// The fastest consumer wins: `1 / min(interval)`. No consumers (or only zero
/// intervals) gives 0.
pub fn target_rate<I>(intervals: I) -> f64
where
    I: IntoIterator<Item = Duration>,
{
    intervals
        .into_iter()
        .filter(|i| !i.is_zero())
        .min()
        .map_or(0.0, |fastest| 1.0 / fastest.as_secs_f64())
}

/// Stride for a source delivering `source_rate` fps when `target_rate` fps are wanted.
pub fn compute_stride(source_rate: f64, target_rate: f64) -> Stride {
    if target_rate.is_nan() || target_rate <= 0.0 {
        return Stride::Never;
    }
    let ratio = (source_rate / target_rate).round();
    if ratio.is_finite() && ratio >= 1.0 {
        Stride::Every(ratio as u64)
    } else {
        Stride::Every(1)
    }
}

/// Latest published frame, shared between the sampler and every consumer.
///
/// Readers get a deep copy and never block each other; the single writer replaces the
/// frame wholesale.
#[derive(Debug, Default)]
pub struct SnapshotSlot {
    frame: RwLock<Option<Frame>>,
}

impl SnapshotSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published frame.
    pub fn publish(&self, frame: Frame) {
        *self.frame.write() = Some(frame);
    }

    /// Forget the published frame.
    pub fn clear(&self) {
        *self.frame.write() = None;
    }

    /// Copy of the published frame, if any.
    pub fn read(&self) -> Option<Frame> {
        self.frame.read().clone()
    }

    /// True when a frame is published.
    pub fn has_data(&self) -> bool {
        self.frame.read().is_some()
    }
}

/// Hub construction parameters.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Stream endpoint handed to [`FrameSource::open`]
    pub url: String,
    /// Delay between connection attempts
    pub reconnect_interval: Duration,
    /// How often the measured source rate is re-read
    pub rate_refresh_interval: Duration,
    /// Where to dump the first frame after each connect, if anywhere
    pub snapshot_dump: Option<PathBuf>,
}

impl HubSettings {
    /// Settings with one-second reconnects and five-second rate refreshes.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: Duration::from_millis(1000),
            rate_refresh_interval: Duration::from_millis(5000),
            snapshot_dump: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rates {
    source: f64,
    target: f64,
    stride: Stride,
}

struct HubCore {
    node: Arc<LifecycleNode>,
    url: String,
    source: Mutex<Box<dyn FrameSource>>,
    slot: Arc<SnapshotSlot>,
    link: Mutex<LinkState>,
    link_changed: Condvar,
    rates: Mutex<Rates>,
    grabbed: AtomicU64,
    reconnect: PeriodicScheduler,
    reconnect_interval: Duration,
    snapshot_dump: Option<PathBuf>,
    dump_pending: AtomicBool,
    /// Serialises starting things against a concurrent stop.
    start_guard: Mutex<()>,
}

impl HubCore {
    fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    fn set_link(&self, state: LinkState) {
        let mut link = self.link.lock();
        *link = state;
        self.link_changed.notify_all();
    }

    /// Wake the connection gate. Called after a stop request.
    fn wake_gate(&self) {
        let _link = self.link.lock();
        self.link_changed.notify_all();
    }

    /// Block until connected or stopped, running the reconnect timer meanwhile.
    fn wait_connected(self: &Arc<Self>) -> bool {
        self.set_link(LinkState::Connecting);
        info!(url = %self.url, interval_ms = self.reconnect_interval.as_millis() as u64, "connecting");

        if !self.schedule_reconnect() {
            warn!(url = %self.url, "stale reconnect timer, restarting it");
            self.reconnect.stop();
            if !self.schedule_reconnect() {
                error!(url = %self.url, "reconnect timer could not be started");
                return false;
            }
        }

        let connected = self.gate();
        self.reconnect.stop();
        connected
    }

    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        let core = Arc::downgrade(self);
        self.reconnect.schedule(self.reconnect_interval, true, move |_| {
            if let Some(core) = core.upgrade() {
                core.try_connect();
            }
            Ok(())
        })
    }

    fn gate(&self) -> bool {
        let mut link = self.link.lock();
        loop {
            if *link == LinkState::Connected {
                return true;
            }
            if self.node.lineage_stopping() {
                return false;
            }
            self.link_changed.wait_for(&mut link, GATE_RECHECK);
        }
    }

    fn try_connect(&self) {
        if self.link_state() == LinkState::Connected {
            return;
        }

        let opened = {
            let mut source = self.source.lock();
            source.open(&self.url).map(|()| source.measured_rate())
        };
        match opened {
            Ok(rate) => {
                self.update_source_rate(rate);
                self.dump_pending.store(true, Ordering::SeqCst);
                self.set_link(LinkState::Connected);
                info!(url = %self.url, source_fps = rate, "stream connected");
            }
            Err(e) => warn!(url = %self.url, error = %e, "unable to open stream"),
        }
    }

    fn sample(self: &Arc<Self>) -> anyhow::Result<()> {
        let outcome = {
            let mut source = self.source.lock();
            source.grab().and_then(|()| {
                let index = self.grabbed.fetch_add(1, Ordering::SeqCst);
                let stride = self.rates.lock().stride;
                if stride.publishes(index) {
                    source.retrieve().map(Some)
                } else {
                    Ok(None)
                }
            })
        };

        match outcome {
            Ok(Some(frame)) => self.publish(frame),
            Ok(None) => {}
            Err(e) if e.is_recoverable() => {
                if self.node.lineage_stopping() {
                    // Idle until the hub's own stop arrives.
                    self.node.cancellable_wait_until(Instant::now() + GATE_RECHECK);
                    return Ok(());
                }
                warn!(url = %self.url, error = %e, "frame grab failed, reconnecting");
                self.disconnect();
                if self.wait_connected() {
                    self.start_pending_consumers();
                }
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn publish(&self, frame: Frame) {
        let dump = self.dump_pending.swap(false, Ordering::SeqCst);
        if let (true, Some(path)) = (dump, self.snapshot_dump.as_ref()) {
            match frame.write_pnm(path) {
                Ok(()) => info!(path = %path.display(), "first frame saved"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to save first frame"),
            }
        }
        self.slot.publish(frame);
    }

    /// Drop the connection. The slot is emptied before the state changes.
    fn disconnect(&self) {
        self.slot.clear();
        self.source.lock().release();
        self.set_link(LinkState::Disconnected);
    }

    /// Start consumers registered while the stream was down.
    ///
    /// Waits out a concurrent registration holding the start guard, but gives up once a
    /// stop is requested: the stop path takes the guard while joining this thread.
    fn start_pending_consumers(&self) {
        let _guard = loop {
            if self.node.lineage_stopping() {
                return;
            }
            if let Some(guard) = self.start_guard.try_lock_for(GATE_RECHECK) {
                break guard;
            }
        };
        if !self.node.is_stopping() && !self.node.cascade_start() {
            warn!(url = %self.url, "some consumers failed to start after reconnect");
        }
    }

    fn update_source_rate(&self, source: f64) {
        let mut rates = self.rates.lock();
        rates.source = source;
        self.restride(&mut rates);
    }

    fn update_target_rate(&self, target: f64) {
        let mut rates = self.rates.lock();
        rates.target = target;
        self.restride(&mut rates);
    }

    fn restride(&self, rates: &mut Rates) {
        let stride = compute_stride(rates.source, rates.target);
        if stride != rates.stride {
            debug!(
                url = %self.url,
                source_fps = rates.source,
                target_fps = rates.target,
                ?stride,
                "publish stride changed"
            );
        }
        rates.stride = stride;
    }

    fn refresh_source_rate(&self) {
        if self.link_state() != LinkState::Connected {
            return;
        }
        let rate = self.source.lock().measured_rate();
        self.update_source_rate(rate);
    }
}

type Registry = HashMap<String, Arc<SampledConsumer>>;

/// Owns the stream connection and publishes snapshots for the registered consumers.
pub struct FrameHub {
    core: Arc<HubCore>,
    registry: ReentrantMutex<RefCell<Registry>>,
    sampler: PeriodicScheduler,
    refresher: PeriodicScheduler,
    rate_refresh_interval: Duration,
}

impl FrameHub {
    /// Create a stopped hub reading from `source`.
    pub fn new(settings: HubSettings, source: Box<dyn FrameSource>) -> Arc<Self> {
        let initial_rate = source.measured_rate();
        Arc::new(Self {
            core: Arc::new(HubCore {
                node: LifecycleNode::new("frame-hub"),
                url: settings.url,
                source: Mutex::new(source),
                slot: Arc::new(SnapshotSlot::new()),
                link: Mutex::new(LinkState::Disconnected),
                link_changed: Condvar::new(),
                rates: Mutex::new(Rates {
                    source: initial_rate,
                    target: 0.0,
                    stride: Stride::Never,
                }),
                grabbed: AtomicU64::new(0),
                reconnect: PeriodicScheduler::new("hub-reconnect"),
                reconnect_interval: settings.reconnect_interval,
                snapshot_dump: settings.snapshot_dump,
                dump_pending: AtomicBool::new(false),
                start_guard: Mutex::new(()),
            }),
            registry: ReentrantMutex::new(RefCell::new(HashMap::new())),
            sampler: PeriodicScheduler::new("hub-sampler"),
            refresher: PeriodicScheduler::new("hub-rate"),
            rate_refresh_interval: settings.rate_refresh_interval,
        })
    }

    /// Stream endpoint.
    pub fn url(&self) -> &str {
        &self.core.url
    }

    /// Slot consumers read from.
    pub fn snapshot_slot(&self) -> Arc<SnapshotSlot> {
        Arc::clone(&self.core.slot)
    }

    /// Copy of the latest snapshot, or `None` when nothing is published or the stream is down.
    pub fn read_snapshot(&self) -> Option<Frame> {
        self.core.slot.read()
    }

    /// Current connection state.
    pub fn link_state(&self) -> LinkState {
        self.core.link_state()
    }

    /// True while frames are flowing.
    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    /// Current publish stride.
    pub fn stride(&self) -> Stride {
        self.core.rates.lock().stride
    }

    /// Target publish rate derived from the registered consumers.
    pub fn target_rate(&self) -> f64 {
        self.core.rates.lock().target
    }

    /// Last measured source rate.
    pub fn source_rate(&self) -> f64 {
        self.core.rates.lock().source
    }

    /// Registered consumer by id.
    pub fn consumer(&self, id: &str) -> Option<Arc<SampledConsumer>> {
        self.registry.lock().borrow().get(id).cloned()
    }

    /// Ids of all registered consumers, sorted.
    pub fn consumer_ids(&self) -> Vec<String> {
        let registry = self.registry.lock();
        let mut ids: Vec<String> = registry.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Add a consumer. Fails if one with the same id is registered.
    ///
    /// When the hub is running and connected the consumer is started right away;
    /// otherwise it starts with the hub or after the next reconnect.
    pub fn register_consumer(&self, consumer: Arc<SampledConsumer>) -> bool {
        {
            let registry = self.registry.lock();
            {
                let mut map = registry.borrow_mut();
                if map.contains_key(consumer.id()) {
                    warn!(dp_id = %consumer.id(), "consumer already registered");
                    return false;
                }
                map.insert(consumer.id().to_string(), Arc::clone(&consumer));
            }
            self.core.node.adopt(&consumer);
            self.recompute_rates();
        }

        info!(
            dp_id = %consumer.id(),
            interval_ms = consumer.polling_interval().as_millis() as u64,
            region = %consumer.region(),
            "consumer registered"
        );
        self.start_if_serving(&consumer);
        true
    }

    /// Remove and stop a consumer. Fails if the id is unknown.
    pub fn unregister_consumer(&self, id: &str) -> bool {
        let removed = {
            let registry = self.registry.lock();
            let removed = registry.borrow_mut().remove(id);
            if removed.is_some() {
                self.recompute_rates();
            }
            removed
        };

        let Some(consumer) = removed else {
            warn!(dp_id = %id, "unregister: consumer not found");
            return false;
        };
        consumer.stop();
        consumer.node().detach();
        info!(dp_id = %id, "consumer unregistered");
        true
    }

    /// Apply a record's interval and region to the live consumer with the same id.
    ///
    /// The consumer keeps running. Fails if the id is unknown.
    pub fn modify_consumer(&self, record: &DataPointConfig) -> bool {
        let registry = self.registry.lock();
        let consumer = registry.borrow().get(&record.dp_id).cloned();
        let Some(consumer) = consumer else {
            warn!(dp_id = %record.dp_id, "modify: consumer not found");
            return false;
        };

        let before = consumer.settings();
        consumer.apply(record);
        let after = consumer.settings();
        if before.interval != after.interval {
            info!(
                dp_id = %record.dp_id,
                interval_ms = after.interval.as_millis() as u64,
                "consumer polling interval changed"
            );
            self.recompute_rates();
        }
        if before.region != after.region {
            info!(dp_id = %record.dp_id, region = %after.region, "consumer region changed");
        }
        true
    }

    /// Recompute target rate and stride from the registry.
    fn recompute_rates(&self) {
        let registry = self.registry.lock();
        let target = target_rate(registry.borrow().values().map(|c| c.polling_interval()));
        drop(registry);
        self.core.update_target_rate(target);
        debug!(url = %self.core.url, target_fps = target, "target rate recomputed");
    }

    fn start_if_serving(&self, consumer: &Arc<SampledConsumer>) {
        let _guard = self.core.start_guard.lock();
        let node = &self.core.node;
        if node.is_running()
            && !node.is_stopping()
            && self.is_connected()
            && !consumer.node().is_running()
            && !consumer.start()
        {
            warn!(dp_id = %consumer.id(), "failed to start consumer");
        }
    }

    fn start_workers(&self) {
        let core: Weak<HubCore> = Arc::downgrade(&self.core);
        let sampling = self.sampler.run_continuously(move || match core.upgrade() {
            Some(core) => core.sample(),
            None => Ok(()),
        });
        if !sampling {
            warn!(url = %self.core.url, "sampler already running");
        }

        let core: Weak<HubCore> = Arc::downgrade(&self.core);
        let scheduled = self.refresher.schedule(self.rate_refresh_interval, false, move |_| {
            if let Some(core) = core.upgrade() {
                core.refresh_source_rate();
            }
            Ok(())
        });
        if !scheduled {
            warn!(url = %self.core.url, "rate refresher already running");
        }
    }

    /// Start as far as the gate allows. `None` means the stop path owns cleanup.
    fn start_locked(&self) -> Option<bool> {
        let core = &self.core;
        let _guard = core.start_guard.lock();
        if !core.node.start() {
            warn!(url = %core.url, "frame hub already started");
            return Some(false);
        }
        info!(url = %core.url, "frame hub starting");

        self.recompute_rates();
        if !core.wait_connected() {
            // Stopped before the stream came up.
            if core.node.request_stop() {
                core.disconnect();
                core.node.signal_stopped();
            }
            info!(url = %core.url, "frame hub start cancelled");
            return Some(false);
        }
        if core.node.is_stopping() {
            return Some(false);
        }

        self.start_workers();
        if !core.node.cascade_start() {
            return None;
        }
        info!(url = %core.url, consumers = self.consumer_ids().len(), "frame hub started");
        Some(true)
    }
}

impl Lifecycle for FrameHub {
    fn node(&self) -> &Arc<LifecycleNode> {
        &self.core.node
    }

    /// Connects (blocking until the stream is up or a stop is requested), then starts the
    /// sampler, the rate refresher and every registered consumer.
    fn start(&self) -> bool {
        match self.start_locked() {
            Some(started) => started,
            None => {
                warn!(url = %self.core.url, "a consumer failed to start, stopping frame hub");
                self.stop();
                false
            }
        }
    }

    fn stop(&self) {
        let core = &self.core;
        if !core.node.request_stop() {
            core.node.wait_stopped();
            return;
        }
        info!(url = %core.url, "frame hub stopping");

        self.sampler.request_stop();
        core.wake_gate();

        let _guard = core.start_guard.lock();
        core.node.cascade_stop();
        self.refresher.stop();
        self.sampler.stop();
        core.reconnect.stop();
        core.disconnect();
        core.node.signal_stopped();
        info!(url = %core.url, "frame hub stopped");
    }
}

impl Drop for FrameHub {
    fn drop(&mut self) {
        self.stop();
    }
}
