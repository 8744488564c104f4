//! Live reconfiguration from the data point list.
//!
//! The [`Reconciler`] watches the list's modification time and size. When either changes
//! it reloads the list, diffs it against the previously loaded one by `dpId` and replays
//! the difference against the hub:
//!
//! | old | new | action |
//! |-----|-----|--------|
//! | present | present, same settings | none |
//! | present | present, different settings | modify the live consumer in place |
//! | present | absent | unregister and stop |
//! | absent | present | build, register (and start if connected) |
//!
//! A list that fails to load or parse is skipped whole; the live set stays as it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, info};

use crate::consumer::ConsumerFactory;
use crate::datapoints::{load_datapoints, DataPointConfig};
use crate::hub::FrameHub;

/// Modification time and size of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    /// Last modification time
    pub modified: SystemTime,
    /// Size in bytes
    pub size: u64,
}

impl FileFingerprint {
    /// Baseline used at start-up: "now", empty. Any later write counts as a change.
    pub fn initial() -> Self {
        Self {
            modified: SystemTime::now(),
            size: 0,
        }
    }

    /// Fingerprint of the file at `path`.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            modified: meta.modified()?,
            size: meta.len(),
        })
    }

    /// True when `self` is newer than `previous` or has a different size.
    pub fn differs_from(&self, previous: &Self) -> bool {
        self.modified > previous.modified || self.size != previous.size
    }
}

/// One step of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Apply new settings to an existing consumer
    Modify(DataPointConfig),
    /// Unregister the consumer with this id
    Remove(String),
    /// Register a new consumer
    Add(DataPointConfig),
}

/// Changes turning `old` into `new`.
///
/// Modifications and removals come first in `old` order, then additions in `new` order.
pub fn diff_datapoints(old: &[DataPointConfig], new: &[DataPointConfig]) -> Vec<Change> {
    let mut changes = Vec::new();

    for before in old {
        match new.iter().find(|after| after.dp_id == before.dp_id) {
            Some(after) if after.same_settings(before) => {}
            Some(after) => changes.push(Change::Modify(after.clone())),
            None => changes.push(Change::Remove(before.dp_id.clone())),
        }
    }

    for after in new {
        if !old.iter().any(|before| before.dp_id == after.dp_id) {
            changes.push(Change::Add(after.clone()));
        }
    }

    changes
}

/// Result of one [`Reconciler::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The file did not change
    Unchanged,
    /// The file changed but could not be loaded; nothing was applied
    Rejected,
    /// The file was reloaded and these changes were applied
    Applied(Vec<Change>),
}

/// Keeps the hub's consumer set in line with the data point list on disk.
pub struct Reconciler {
    path: PathBuf,
    last_seen: FileFingerprint,
    current: Vec<DataPointConfig>,
    hub: Arc<FrameHub>,
    factory: ConsumerFactory,
}

impl Reconciler {
    /// Reconciler for the list at `path`, which was last loaded as `current`.
    pub fn new(
        path: impl Into<PathBuf>,
        current: Vec<DataPointConfig>,
        hub: Arc<FrameHub>,
        factory: ConsumerFactory,
    ) -> Self {
        Self {
            path: path.into(),
            last_seen: FileFingerprint::initial(),
            current,
            hub,
            factory,
        }
    }

    /// Records as last loaded.
    pub fn current(&self) -> &[DataPointConfig] {
        &self.current
    }

    fn file_changed(&mut self) -> bool {
        match FileFingerprint::of(&self.path) {
            Ok(seen) if seen.differs_from(&self.last_seen) => {
                self.last_seen = seen;
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "cannot stat data point list");
                false
            }
        }
    }

    /// Reload and apply the list if it changed on disk, or unconditionally when `forced`.
    pub fn check(&mut self, forced: bool) -> ReconcileOutcome {
        let changed = self.file_changed();
        if !changed && !forced {
            return ReconcileOutcome::Unchanged;
        }
        info!(path = %self.path.display(), forced, "data point list changed, reloading");

        let records = match load_datapoints(&self.path) {
            Ok(records) => records,
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "data point list rejected, keeping current configuration"
                );
                return ReconcileOutcome::Rejected;
            }
        };

        let changes = diff_datapoints(&self.current, &records);
        if changes.is_empty() {
            debug!("data point list reloaded without changes");
        }
        for change in &changes {
            self.apply(change);
        }
        self.current = records;
        ReconcileOutcome::Applied(changes)
    }

    fn apply(&self, change: &Change) {
        match change {
            Change::Modify(record) => {
                self.hub.modify_consumer(record);
            }
            Change::Remove(id) => {
                self.hub.unregister_consumer(id);
            }
            Change::Add(record) => {
                self.hub.register_consumer(self.factory.build(record));
            }
        }
    }
}
