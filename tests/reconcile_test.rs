//! Live reconfiguration from the on-disk data point list.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, write_datapoints, MockRig};
use stream_ocr::datapoints::DataPointConfig;
use stream_ocr::frame::Region;
use stream_ocr::lifecycle::Lifecycle;
use stream_ocr::reconcile::{Change, ReconcileOutcome, Reconciler};

const PATIENCE: Duration = Duration::from_secs(5);

fn dp(id: &str, interval_ms: u64, region: Region) -> DataPointConfig {
    DataPointConfig::new(id, interval_ms, region)
}

struct Scene {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
    rig: MockRig,
    reconciler: Reconciler,
}

/// A running hub serving `initial`, with the list on disk matching it.
fn scene(initial: &[DataPointConfig]) -> Scene {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dpConfig");
    write_datapoints(&path, initial);

    let rig = MockRig::new(100.0);
    for record in initial {
        assert!(rig.hub.register_consumer(rig.factory.build(record)));
    }
    assert!(rig.hub.start());

    let mut reconciler = Reconciler::new(
        path.clone(),
        initial.to_vec(),
        Arc::clone(&rig.hub),
        rig.factory.clone(),
    );
    // The start-up baseline sees the freshly written file as changed.
    assert_eq!(reconciler.check(false), ReconcileOutcome::Applied(vec![]));

    Scene {
        _dir: dir,
        path,
        rig,
        reconciler,
    }
}

#[test]
fn modified_record_updates_in_place_and_new_record_starts() {
    let mut s = scene(&[dp("a", 1000, Region::full_frame())]);
    let a_before = s.rig.hub.consumer("a").unwrap();

    write_datapoints(
        &s.path,
        &[
            dp("a", 500, Region::full_frame()),
            dp("b", 2000, Region::new(10, 10, 50, 30)),
        ],
    );
    let outcome = s.reconciler.check(false);

    assert_eq!(
        outcome,
        ReconcileOutcome::Applied(vec![
            Change::Modify(dp("a", 500, Region::full_frame())),
            Change::Add(dp("b", 2000, Region::new(10, 10, 50, 30))),
        ])
    );
    let a_after = s.rig.hub.consumer("a").unwrap();
    assert!(Arc::ptr_eq(&a_before, &a_after));
    assert!(a_after.node().is_running());
    assert_eq!(a_after.polling_interval(), Duration::from_millis(500));

    let b = s.rig.hub.consumer("b").unwrap();
    assert!(wait_for(PATIENCE, || b.node().is_running()));
    assert_eq!(b.region(), Region::new(10, 10, 50, 30));
    assert_eq!(s.rig.hub.target_rate(), 2.0);

    s.rig.hub.stop();
}

#[test]
fn missing_record_is_stopped_and_others_untouched() {
    let a = dp("a", 1000, Region::new(0, 0, 8, 8));
    let mut s = scene(&[a.clone(), dp("b", 1000, Region::full_frame())]);
    let a_before = s.rig.hub.consumer("a").unwrap();
    let b_before = s.rig.hub.consumer("b").unwrap();

    write_datapoints(&s.path, &[a.clone()]);
    assert_eq!(
        s.reconciler.check(false),
        ReconcileOutcome::Applied(vec![Change::Remove("b".into())])
    );

    assert_eq!(s.rig.hub.consumer_ids(), ["a"]);
    assert!(!b_before.node().is_running());
    assert!(Arc::ptr_eq(&a_before, &s.rig.hub.consumer("a").unwrap()));
    assert!(a_before.node().is_running());
    assert_eq!(s.reconciler.current(), [a]);

    s.rig.hub.stop();
}

#[test]
fn unparsable_list_keeps_everything_as_is() {
    let mut s = scene(&[dp("a", 1000, Region::full_frame())]);

    std::fs::write(&s.path, "[[\"dpId\", \"pollingInterval\"], [\"a\", \"10\"]]").unwrap();
    assert_eq!(s.reconciler.check(false), ReconcileOutcome::Rejected);
    assert_eq!(s.rig.hub.consumer_ids(), ["a"]);
    assert_eq!(
        s.rig.hub.consumer("a").unwrap().polling_interval(),
        Duration::from_millis(1000)
    );
    assert_eq!(s.reconciler.current().len(), 1);

    // Not retried until the file changes again.
    assert_eq!(s.reconciler.check(false), ReconcileOutcome::Unchanged);

    write_datapoints(&s.path, &[dp("a", 250, Region::full_frame())]);
    assert!(matches!(
        s.reconciler.check(false),
        ReconcileOutcome::Applied(changes) if changes.len() == 1
    ));
    s.rig.hub.stop();
}

#[test]
fn duplicate_ids_reject_the_reload() {
    let mut s = scene(&[dp("a", 1000, Region::full_frame())]);

    write_datapoints(
        &s.path,
        &[dp("a", 100, Region::full_frame()), dp("a", 200, Region::full_frame())],
    );
    assert_eq!(s.reconciler.check(false), ReconcileOutcome::Rejected);
    assert_eq!(
        s.rig.hub.consumer("a").unwrap().polling_interval(),
        Duration::from_millis(1000)
    );
    s.rig.hub.stop();
}

#[test]
fn forced_check_reloads_unchanged_file() {
    let mut s = scene(&[dp("a", 1000, Region::full_frame())]);

    assert_eq!(s.reconciler.check(false), ReconcileOutcome::Unchanged);
    assert_eq!(s.reconciler.check(true), ReconcileOutcome::Applied(vec![]));
    s.rig.hub.stop();
}

#[test]
fn vanished_file_is_treated_as_unchanged() {
    let mut s = scene(&[dp("a", 1000, Region::full_frame())]);

    std::fs::remove_file(&s.path).unwrap();
    assert_eq!(s.reconciler.check(false), ReconcileOutcome::Unchanged);
    assert_eq!(s.rig.hub.consumer_ids(), ["a"]);

    // Forcing a reload of a missing file is a failed load, not an empty list.
    assert_eq!(s.reconciler.check(true), ReconcileOutcome::Rejected);
    assert_eq!(s.rig.hub.consumer_ids(), ["a"]);
    s.rig.hub.stop();
}

#[test]
fn reconciling_against_a_stopped_hub_registers_without_starting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dpConfig");
    write_datapoints(&path, &[dp("x", 100, Region::full_frame())]);

    let rig = MockRig::new(100.0);
    let mut reconciler = Reconciler::new(path, vec![], Arc::clone(&rig.hub), rig.factory.clone());

    assert_eq!(
        reconciler.check(false),
        ReconcileOutcome::Applied(vec![Change::Add(dp("x", 100, Region::full_frame()))])
    );
    let x = rig.hub.consumer("x").unwrap();
    assert!(!x.node().is_running());

    assert!(rig.hub.start());
    assert!(x.node().is_running());
    rig.hub.stop();
}
