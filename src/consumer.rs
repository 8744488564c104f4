//! Sampled consumers: one per data point.
//!
//! A [`SampledConsumer`] ticks on its own [`PeriodicScheduler`]. Each tick copies the
//! hub's latest snapshot, crops it to the consumer's region, runs the consumer's private
//! recognition engine over it and emits a [`Reading`]. Every per-tick failure is logged
//! and the tick is skipped; the schedule itself never stops because of one.
//!
//! Interval and region live together behind one lock, so a reconfiguration replaces both
//! at once and a tick never observes half of an update.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::datapoints::DataPointConfig;
use crate::error::{AppResult, OcrError};
use crate::frame::Region;
use crate::hub::SnapshotSlot;
use crate::lifecycle::{Lifecycle, LifecycleNode};
use crate::recognition::{EngineFactory, RecognitionEngine};
use crate::scheduler::PeriodicScheduler;
use crate::sink::{emit_logged, Reading, ResultSink};

/// Interval used until a valid one is configured.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);

/// Settings a consumer applies on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Time between ticks
    pub interval: Duration,
    /// Region of interest
    pub region: Region,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLLING_INTERVAL,
            region: Region::full_frame(),
        }
    }
}

struct ConsumerCore {
    id: String,
    data_path: PathBuf,
    language: String,
    settings: RwLock<ConsumerSettings>,
    engines: Arc<dyn EngineFactory>,
    engine: Mutex<Option<Box<dyn RecognitionEngine>>>,
    slot: Arc<SnapshotSlot>,
    sink: Arc<dyn ResultSink>,
}

impl ConsumerCore {
    fn poll_once(&self, at: SystemTime) -> AppResult<Option<Reading>> {
        let Some(frame) = self.slot.read() else {
            debug!(dp_id = %self.id, "no snapshot available, skipping tick");
            return Ok(None);
        };

        let settings = *self.settings.read();
        let image = frame.crop(&settings.region)?;

        let text = {
            let mut engine = self.engine.lock();
            let engine = engine
                .as_mut()
                .ok_or_else(|| OcrError::Recognition("engine not initialised".into()))?;
            engine.recognize(&image)?
        };

        let reading = Reading {
            dp_id: self.id.clone(),
            time: DateTime::<Utc>::from(at).timestamp_millis(),
            value: text.trim_end_matches(['\n', '\r']).to_string(),
        };
        emit_logged(self.sink.as_ref(), &reading);
        Ok(Some(reading))
    }

    fn tick(&self, at: SystemTime) {
        if let Err(e) = self.poll_once(at) {
            warn!(dp_id = %self.id, error = %e, "recognition tick failed");
        }
    }
}

/// One registered data point with its own schedule and recognition engine.
pub struct SampledConsumer {
    node: Arc<LifecycleNode>,
    core: Arc<ConsumerCore>,
    ticker: PeriodicScheduler,
}

impl SampledConsumer {
    /// Create a stopped consumer with the default interval and a full-frame region.
    pub fn new(
        id: impl Into<String>,
        data_path: impl Into<PathBuf>,
        language: impl Into<String>,
        engines: Arc<dyn EngineFactory>,
        slot: Arc<SnapshotSlot>,
        sink: Arc<dyn ResultSink>,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            node: LifecycleNode::new(format!("consumer:{id}")),
            ticker: PeriodicScheduler::new(format!("dp-{id}")),
            core: Arc::new(ConsumerCore {
                id,
                data_path: data_path.into(),
                language: language.into(),
                settings: RwLock::new(ConsumerSettings::default()),
                engines,
                engine: Mutex::new(None),
                slot,
                sink,
            }),
        })
    }

    /// Data point id.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Current interval and region.
    pub fn settings(&self) -> ConsumerSettings {
        *self.core.settings.read()
    }

    /// Current polling interval.
    pub fn polling_interval(&self) -> Duration {
        self.core.settings.read().interval
    }

    /// Current region of interest.
    pub fn region(&self) -> Region {
        self.core.settings.read().region
    }

    /// Change the polling interval. Zero is rejected with a warning and
    /// [`OcrError::InvalidInterval`]; the previous interval stays.
    ///
    /// A running schedule uses the new interval from its next wait on.
    pub fn set_polling_interval(&self, interval: Duration) -> AppResult<()> {
        if interval.is_zero() {
            warn!(dp_id = %self.core.id, "rejecting zero polling interval");
            return Err(OcrError::InvalidInterval);
        }
        self.core.settings.write().interval = interval;
        self.ticker.set_interval(interval);
        Ok(())
    }

    /// Change the region of interest; the next tick crops to it.
    pub fn set_region(&self, region: Region) {
        self.core.settings.write().region = region;
    }

    /// Apply interval and region from `record` in one step.
    ///
    /// A zero interval is rejected (the previous interval stays) while the region is still
    /// applied. Returns whether the interval was accepted.
    pub fn apply(&self, record: &DataPointConfig) -> bool {
        let interval = Duration::from_millis(record.polling_interval_ms);
        let accepted = !interval.is_zero();
        {
            let mut settings = self.core.settings.write();
            if accepted {
                settings.interval = interval;
            }
            settings.region = record.coordinate_detail;
            if accepted {
                self.ticker.set_interval(interval);
            }
        }
        if !accepted {
            warn!(dp_id = %self.core.id, "rejecting zero polling interval");
        }
        accepted
    }

    /// Run one tick now: read, crop, recognise, emit.
    ///
    /// Returns `Ok(None)` when no snapshot is available. The engine only exists while the
    /// consumer is running.
    pub fn poll_once(&self, at: SystemTime) -> AppResult<Option<Reading>> {
        self.core.poll_once(at)
    }
}

impl Lifecycle for SampledConsumer {
    fn node(&self) -> &Arc<LifecycleNode> {
        &self.node
    }

    fn start(&self) -> bool {
        if !self.node.start() {
            warn!(dp_id = %self.core.id, "consumer already started");
            return false;
        }

        match self
            .core
            .engines
            .create(&self.core.data_path, &self.core.language)
        {
            Ok(engine) => *self.core.engine.lock() = Some(engine),
            Err(e) => {
                error!(dp_id = %self.core.id, error = %e, "recognition engine init failed");
                self.node.abort_start();
                return false;
            }
        }

        let core = Arc::downgrade(&self.core);
        let scheduled = self
            .ticker
            .schedule(self.polling_interval(), true, move |at| {
                if let Some(core) = core.upgrade() {
                    core.tick(at);
                }
                Ok(())
            });
        if !scheduled {
            *self.core.engine.lock() = None;
            self.node.abort_start();
            return false;
        }

        info!(
            dp_id = %self.core.id,
            interval_ms = self.polling_interval().as_millis() as u64,
            region = %self.region(),
            "consumer started"
        );
        true
    }

    fn stop(&self) {
        if !self.node.request_stop() {
            self.node.wait_stopped();
            return;
        }

        self.node.cascade_stop();
        self.ticker.stop();
        *self.core.engine.lock() = None;
        self.node.signal_stopped();
        info!(dp_id = %self.core.id, "consumer stopped");
    }
}

impl Drop for SampledConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds consumers that share one snapshot slot, engine factory and sink.
#[derive(Clone)]
pub struct ConsumerFactory {
    data_path: PathBuf,
    language: String,
    engines: Arc<dyn EngineFactory>,
    slot: Arc<SnapshotSlot>,
    sink: Arc<dyn ResultSink>,
}

impl ConsumerFactory {
    /// Factory for consumers reading `slot`.
    pub fn new(
        data_path: impl Into<PathBuf>,
        language: impl Into<String>,
        engines: Arc<dyn EngineFactory>,
        slot: Arc<SnapshotSlot>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            language: language.into(),
            engines,
            slot,
            sink,
        }
    }

    /// Build a stopped consumer configured from `record`.
    pub fn build(&self, record: &DataPointConfig) -> Arc<SampledConsumer> {
        let consumer = SampledConsumer::new(
            record.dp_id.clone(),
            self.data_path.clone(),
            self.language.clone(),
            Arc::clone(&self.engines),
            Arc::clone(&self.slot),
            Arc::clone(&self.sink),
        );
        consumer.apply(record);
        consumer
    }
}
