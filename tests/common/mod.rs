//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stream_ocr::consumer::ConsumerFactory;
use stream_ocr::datapoints::DataPointConfig;
use stream_ocr::frame::Region;
use stream_ocr::hub::{FrameHub, HubSettings};
use stream_ocr::recognition::MockEngineFactory;
use stream_ocr::sink::CollectingSink;
use stream_ocr::source::{MockFrameSource, MockSourceControl};

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// A hub over a fast mock source, plus everything needed to build consumers for it.
pub struct MockRig {
    pub hub: Arc<FrameHub>,
    pub source: Arc<MockSourceControl>,
    pub engines: MockEngineFactory,
    pub sink: Arc<CollectingSink>,
    pub factory: ConsumerFactory,
}

impl MockRig {
    pub fn new(fps: f64) -> Self {
        Self::with_settings(fps, |_| {})
    }

    pub fn with_settings(fps: f64, adjust: impl FnOnce(&mut HubSettings)) -> Self {
        let source = MockFrameSource::new(64, 48, fps);
        let control = source.control();
        let mut settings = HubSettings::new("mock://rig");
        settings.reconnect_interval = Duration::from_millis(10);
        settings.rate_refresh_interval = Duration::from_millis(50);
        adjust(&mut settings);

        let hub = FrameHub::new(settings, Box::new(source));
        let engines = MockEngineFactory::new("17\n");
        let sink = Arc::new(CollectingSink::new());
        let factory = ConsumerFactory::new(
            "tessdata",
            "eng",
            Arc::new(engines.clone()),
            hub.snapshot_slot(),
            sink.clone(),
        );
        Self {
            hub,
            source: control,
            engines,
            sink,
            factory,
        }
    }

    pub fn add(&self, id: &str, interval_ms: u64, region: Region) -> bool {
        self.hub
            .register_consumer(self.factory.build(&DataPointConfig::new(id, interval_ms, region)))
    }
}

/// Write a data point list in the on-disk table format.
pub fn write_datapoints(path: &Path, records: &[DataPointConfig]) {
    let mut rows = vec![serde_json::json!(["dpId", "pollingInterval", "coordinateDetail"])];
    for record in records {
        let region = record.coordinate_detail;
        rows.push(serde_json::json!([
            record.dp_id,
            record.polling_interval_ms.to_string(),
            {
                "x": region.x,
                "y": region.y,
                "width": region.width,
                "height": region.height,
            },
        ]));
    }
    let text = serde_json::to_string_pretty(&rows).unwrap();
    std::fs::write(path, text).unwrap();
}
