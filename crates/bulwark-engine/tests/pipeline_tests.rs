//! Snapshot pipeline behaviour: stages, slicing, linking, failure.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bulwark_engine::{
    BackupConfig, ChangeAction, Clock, EngineError, RecordState, SnapshotPipeline, Stage,
};
use bulwark_model::{ObjectKind, UserId, Vec3};
use common::Fixture;
use parking_lot::Mutex;

#[test]
fn captures_a_single_structure() {
    let mut fx = Fixture::new();
    let base = fx.base(Vec3::ZERO, 4);

    let mut pipeline = SnapshotPipeline::new(vec![base]);
    assert!(fx.run(&mut pipeline));

    assert_eq!(pipeline.stage(), Stage::Completed);
    let meta = pipeline.metadata().cloned().unwrap();
    assert_eq!(meta.object_count, 5);
    assert_eq!(meta.structures.len(), 1);
    assert_eq!(pipeline.stats().objects, 5);
    assert_eq!(fx.store.len(), 1);

    let record = fx.records.get(base).unwrap();
    assert_eq!(record.state(), RecordState::SaveSuccess);
    assert_eq!(record.attempts().len(), 1);
    assert!(record.last_saved_at().is_some());
    assert_eq!(fx.pools.outstanding(), 0);
}

#[test]
fn start_twice_is_rejected() {
    let mut fx = Fixture::new();
    let base = fx.base(Vec3::ZERO, 1);
    let mut pipeline = SnapshotPipeline::new(vec![base]);
    pipeline.start(&mut fx.ctx()).unwrap();
    assert!(matches!(
        pipeline.start(&mut fx.ctx()),
        Err(EngineError::AlreadyStarted)
    ));
}

#[test]
fn invalid_roots_leave_records_untouched() {
    let mut fx = Fixture::new();
    let base = fx.base(Vec3::ZERO, 1);
    let other = fx.base(Vec3::new(500.0, 0.0, 0.0), 1);
    fx.world.get_mut(other).unwrap().destroyed = true;

    let mut pipeline = SnapshotPipeline::new(vec![base, other]);
    assert!(matches!(
        pipeline.start(&mut fx.ctx()),
        Err(EngineError::InvalidRoot { .. })
    ));
    assert_eq!(fx.records.get(base).unwrap().state(), RecordState::Idle);
    assert_eq!(pipeline.stage(), Stage::Pending);

    let mut untracked = SnapshotPipeline::new(vec![bulwark_model::EntityId(9_999)]);
    assert!(matches!(
        untracked.start(&mut fx.ctx()),
        Err(EngineError::UnknownController(_))
    ));
    assert!(matches!(
        SnapshotPipeline::new(Vec::new()).start(&mut fx.ctx()),
        Err(EngineError::NoRoots)
    ));
}

#[test]
fn slow_steps_yield_without_changing_the_result() {
    let config = BackupConfig {
        max_step_duration_ms: 20,
        ..BackupConfig::default()
    };

    let mut fast = Fixture::with_config(config.clone());
    let fast_base = fast.base(Vec3::ZERO, 30);
    let mut fast_run = SnapshotPipeline::new(vec![fast_base]);
    assert!(fast.run(&mut fast_run));
    assert_eq!(fast_run.stats().yields, 0);

    let mut slow = Fixture::with_config(config);
    let slow_base = slow.base(Vec3::ZERO, 30);
    let clock = slow.clock.clone();
    slow.world.set_query_cost(clock, Duration::from_millis(15));
    let mut slow_run = SnapshotPipeline::new(vec![slow_base]);
    assert!(slow.run(&mut slow_run));

    let stats = slow_run.stats();
    assert!(stats.yields >= 1, "expected at least one yield, got {stats:?}");
    assert!(stats.longest_step >= Duration::from_millis(15));
    assert!(stats.busy >= stats.longest_step);

    let fast_ids = fast.captured_ids(fast_run.metadata().unwrap().id);
    let slow_ids = slow.captured_ids(slow_run.metadata().unwrap().id);
    assert_eq!(fast_ids, slow_ids);
}

#[test]
fn failure_marks_every_linked_record_and_fires_callback_once() {
    let mut fx = Fixture::new();
    let a = fx.base(Vec3::ZERO, 3);
    let b = fx.base(Vec3::new(25.0, 0.0, 0.0), 3);

    let calls: Arc<Mutex<Vec<bool>>> = Arc::default();
    let seen = calls.clone();
    let mut pipeline = SnapshotPipeline::new(vec![a, b]);
    pipeline.on_complete(Box::new(move |success, _| seen.lock().push(success)));
    pipeline.start(&mut fx.ctx()).unwrap();

    fx.world.fail_queries(true);
    assert!(!fx.finish(&mut pipeline));

    assert_eq!(*calls.lock(), vec![false]);
    assert_eq!(pipeline.stage(), Stage::Failed);
    assert!(pipeline.error().is_some());
    assert!(pipeline.metadata().is_none());
    assert!(fx.store.is_empty());
    for id in [a, b] {
        let record = fx.records.get(id).unwrap();
        assert_eq!(record.state(), RecordState::SaveFailure);
        assert_eq!(record.last_error(), Some("sphere query failed"));
        assert_eq!(record.attempts().len(), 1);
    }
    assert_eq!(fx.pools.outstanding(), 0);

    // Finished pipelines keep reporting the same outcome.
    assert!(!fx.finish(&mut pipeline));
    assert_eq!(calls.lock().len(), 1);
}

#[test]
fn neighbouring_structures_are_linked() {
    let mut fx = Fixture::new();
    let a = fx.base(Vec3::ZERO, 3);
    let b = fx.base(Vec3::new(30.0, 0.0, 0.0), 3);
    let far = fx.base(Vec3::new(2_000.0, 0.0, 0.0), 3);

    let mut pipeline = SnapshotPipeline::new(vec![a]);
    assert!(fx.run(&mut pipeline));

    let mut linked = pipeline.linked();
    linked.sort();
    assert_eq!(linked, vec![a, b]);
    let meta = pipeline.metadata().unwrap();
    assert_eq!(meta.structures.len(), 2);
    assert_eq!(meta.object_count, 8);
    assert_eq!(fx.records.get(b).unwrap().state(), RecordState::SaveSuccess);
    assert_eq!(fx.records.get(far).unwrap().state(), RecordState::Idle);
}

#[test]
fn linking_can_be_disabled() {
    let mut fx = Fixture::with_config(BackupConfig {
        link_structures: false,
        ..BackupConfig::default()
    });
    let a = fx.base(Vec3::ZERO, 3);
    let b = fx.base(Vec3::new(30.0, 0.0, 0.0), 3);

    let mut pipeline = SnapshotPipeline::new(vec![a]);
    assert!(fx.run(&mut pipeline));
    assert_eq!(pipeline.linked(), vec![a]);
    assert_eq!(pipeline.metadata().unwrap().structures.len(), 1);
    assert_eq!(fx.records.get(b).unwrap().state(), RecordState::Idle);
}

#[test]
fn parked_neighbours_are_not_linked() {
    let mut fx = Fixture::new();
    let a = fx.base(Vec3::ZERO, 3);
    let b = fx.base(Vec3::new(30.0, 0.0, 0.0), 3);
    fx.records.update(b, RecordState::RetryLimitExceeded).unwrap();

    let mut pipeline = SnapshotPipeline::new(vec![a]);
    assert!(fx.run(&mut pipeline));
    assert_eq!(pipeline.linked(), vec![a]);
    assert_eq!(pipeline.metadata().unwrap().structures.len(), 1);

    let parked = fx.records.get(b).unwrap();
    assert_eq!(parked.state(), RecordState::RetryLimitExceeded);
    assert!(parked.attempts().is_empty());
}

#[test]
fn failed_capture_leaves_parked_neighbours_alone() {
    let mut fx = Fixture::new();
    let a = fx.base(Vec3::ZERO, 3);
    let b = fx.base(Vec3::new(30.0, 0.0, 0.0), 3);
    fx.records.update(b, RecordState::RetryLimitExceeded).unwrap();

    let mut pipeline = SnapshotPipeline::new(vec![a]);
    pipeline.start(&mut fx.ctx()).unwrap();
    // Let linking finish, then fail the entity search.
    while pipeline.stage() == Stage::BuildNetwork {
        pipeline.step(&mut fx.ctx()).unwrap();
    }
    fx.world.fail_queries(true);
    assert!(!fx.finish(&mut pipeline));

    assert_eq!(fx.records.get(a).unwrap().state(), RecordState::SaveFailure);
    let parked = fx.records.get(b).unwrap();
    assert_eq!(parked.state(), RecordState::RetryLimitExceeded);
    assert!(parked.attempts().is_empty());
}

#[test]
fn parked_roots_are_rejected() {
    let mut fx = Fixture::new();
    let a = fx.base(Vec3::ZERO, 1);
    let parked = fx.base(Vec3::new(500.0, 0.0, 0.0), 1);
    fx.records
        .update(parked, RecordState::RetryLimitExceeded)
        .unwrap();

    let mut pipeline = SnapshotPipeline::new(vec![a, parked]);
    assert!(matches!(
        pipeline.start(&mut fx.ctx()),
        Err(EngineError::InvalidState {
            state: RecordState::RetryLimitExceeded,
            ..
        })
    ));
    assert_eq!(pipeline.stage(), Stage::Pending);
    assert_eq!(fx.records.get(a).unwrap().state(), RecordState::Idle);
    assert_eq!(
        fx.records.get(parked).unwrap().state(),
        RecordState::RetryLimitExceeded
    );
}

#[test]
fn unowned_collectibles_are_skipped() {
    let mut fx = Fixture::new();
    let base = fx.base(Vec3::ZERO, 2);
    fx.world.add_object(
        ObjectKind::Collectible,
        "stones",
        Vec3::new(1.0, 0.0, 1.0),
        None,
        None,
    );
    fx.world.add_object(
        ObjectKind::Collectible,
        "dropped_rifle",
        Vec3::new(1.0, 0.0, 2.0),
        None,
        Some(UserId(3)),
    );

    let mut pipeline = SnapshotPipeline::new(vec![base]);
    assert!(fx.run(&mut pipeline));
    assert_eq!(pipeline.stats().objects, 4);
}

#[test]
fn authorized_owner_filter_drops_foreign_objects() {
    let mut fx = Fixture::with_config(BackupConfig {
        require_authorized_owner: true,
        ..BackupConfig::default()
    });
    let base = fx.base(Vec3::ZERO, 0);
    fx.world.set_authorized(base, vec![UserId(7)]);
    fx.world.add_object(
        ObjectKind::Deployable,
        "large_box",
        Vec3::new(2.0, 0.0, 0.0),
        Some(base),
        Some(UserId(7)),
    );
    fx.world.add_object(
        ObjectKind::Deployable,
        "sleeping_bag",
        Vec3::new(-2.0, 0.0, 0.0),
        Some(base),
        Some(UserId(9)),
    );

    let mut pipeline = SnapshotPipeline::new(vec![base]);
    assert!(fx.run(&mut pipeline));
    // The controller itself plus the authorized player's box.
    assert_eq!(pipeline.stats().objects, 2);
    assert_eq!(pipeline.metadata().unwrap().authorized_users, vec![UserId(7)]);
}

#[test]
fn changes_during_capture_are_logged_without_restarting() {
    let mut fx = Fixture::new();
    let base = fx.base(Vec3::ZERO, 2);
    let mut pipeline = SnapshotPipeline::new(vec![base]);
    pipeline.start(&mut fx.ctx()).unwrap();

    let block = fx.world.add_block(base, Vec3::new(0.0, 0.0, 3.0));
    let object = fx.world.get(block).unwrap().clone();
    let now = fx.clock.now();
    fx.records
        .handle_change(
            &fx.world,
            &fx.pools,
            &object,
            ChangeAction::Create,
            None,
            now,
        )
        .unwrap();
    assert_eq!(
        fx.records.get(base).unwrap().state(),
        RecordState::SaveBuildingNetwork
    );

    assert!(fx.finish(&mut pipeline));
    let record = fx.records.get(base).unwrap();
    assert_eq!(record.state(), RecordState::SaveSuccess);
    assert!(record.changed_since_capture());
}
