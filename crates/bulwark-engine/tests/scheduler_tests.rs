//! Tick-level scheduling through `BackupService`.

mod common;

use std::sync::Arc;

use bulwark_engine::{
    BackupConfig, BackupEvent, ChangeAction, EngineError, RecordState, TickOutcome,
};
use bulwark_model::{EntityId, UserId, Vec3};
use common::Harness;
use parking_lot::Mutex;

fn touch(h: &mut Harness, controller: EntityId) {
    let object = h.world.get(controller).unwrap().clone();
    h.service
        .on_world_change(&h.world, &object, ChangeAction::Update, Some(UserId(1)))
        .unwrap();
}

fn state(h: &Harness, controller: EntityId) -> RecordState {
    h.service.records().get(controller).unwrap().state()
}

fn record_events(h: &mut Harness) -> Arc<Mutex<Vec<BackupEvent>>> {
    let events: Arc<Mutex<Vec<BackupEvent>>> = Arc::default();
    let sink = events.clone();
    h.service
        .on_event(Box::new(move |event| sink.lock().push(event.clone())));
    events
}

#[test]
fn modified_record_is_saved_and_settles() {
    let mut h = Harness::new();
    let base = h.base(Vec3::ZERO, 3);
    assert_eq!(state(&h, base), RecordState::Idle);
    assert_eq!(h.tick().outcome, TickOutcome::Idle);

    touch(&mut h, base);
    assert_eq!(state(&h, base), RecordState::Modified);

    // Never saved, so no delay applies.
    assert_eq!(h.tick().outcome, TickOutcome::DispatchedBackup(base));
    let report = h.tick();
    assert_eq!(report.outcome, TickOutcome::Completed { success: true });
    assert_eq!(state(&h, base), RecordState::SaveSuccess);
    assert_eq!(h.service.store().len(), 1);

    h.tick();
    assert_eq!(state(&h, base), RecordState::Idle);
    assert_eq!(h.service.pools().outstanding(), 0);
}

#[test]
fn only_one_job_runs_and_completion_tick_does_not_dispatch() {
    let mut h = Harness::new();
    let a = h.base(Vec3::ZERO, 2);
    let b = h.base(Vec3::new(1_000.0, 0.0, 0.0), 2);
    touch(&mut h, a);
    touch(&mut h, b);

    let first = h.tick();
    assert_eq!(first.outcome, TickOutcome::DispatchedBackup(a.min(b)));
    assert!(h.service.scheduler().is_busy());
    assert_eq!(state(&h, a.max(b)), RecordState::Queued);

    let second = h.tick();
    assert_eq!(second.outcome, TickOutcome::Completed { success: true });
    assert!(!h.service.scheduler().is_busy());
    assert_eq!(state(&h, a.max(b)), RecordState::Queued);

    let third = h.tick();
    assert_eq!(third.outcome, TickOutcome::DispatchedBackup(a.max(b)));
}

#[test]
fn save_delay_holds_back_recently_saved_records() {
    let mut h = Harness::new();
    let base = h.base(Vec3::ZERO, 2);
    touch(&mut h, base);
    h.tick();
    h.tick();
    h.tick();
    assert_eq!(state(&h, base), RecordState::Idle);

    touch(&mut h, base);
    h.clock.advance_secs(10);
    assert_eq!(h.tick().outcome, TickOutcome::Idle);
    assert_eq!(state(&h, base), RecordState::Modified);

    h.clock.advance_secs(300);
    assert_eq!(h.tick().outcome, TickOutcome::DispatchedBackup(base));
}

#[test]
fn retry_limit_is_reached_exactly_once() {
    let mut h = Harness::with_config(BackupConfig {
        max_retries: 3,
        ..BackupConfig::default()
    });
    let base = h.base(Vec3::ZERO, 2);
    let events = record_events(&mut h);
    h.world.fail_queries(true);
    touch(&mut h, base);

    let mut exceeded = 0;
    for _ in 0..40 {
        let report = h.tick();
        exceeded += report
            .promotions
            .iter()
            .filter(|p| p.to == RecordState::RetryLimitExceeded)
            .count();
    }
    assert_eq!(exceeded, 1);

    let record = h.service.records().get(base).unwrap();
    assert_eq!(record.state(), RecordState::RetryLimitExceeded);
    assert_eq!(record.attempts().len(), 4);
    assert_eq!(record.retry_count(), 3);
    assert!(h.service.store().is_empty());

    let events = events.lock();
    let failures = events
        .iter()
        .filter(|e| matches!(e, BackupEvent::BackupFailed { .. }))
        .count();
    assert_eq!(failures, 4);
    assert!(events.iter().any(|e| matches!(
        e,
        BackupEvent::RetryLimitExceeded { controller, .. } if *controller == base
    )));
}

#[test]
fn reinitialize_recovers_a_terminal_record() {
    let mut h = Harness::with_config(BackupConfig {
        max_retries: 0,
        ..BackupConfig::default()
    });
    let base = h.base(Vec3::ZERO, 2);
    h.world.fail_queries(true);
    touch(&mut h, base);
    for _ in 0..5 {
        h.tick();
    }
    assert_eq!(state(&h, base), RecordState::RetryLimitExceeded);
    assert!(matches!(
        h.service.request_backup(base),
        Err(EngineError::InvalidState { .. })
    ));

    h.world.fail_queries(false);
    h.service.reinitialize(&h.world, base).unwrap();
    assert_eq!(state(&h, base), RecordState::Idle);
    h.service.request_backup(base).unwrap();
    assert_eq!(h.tick().outcome, TickOutcome::DispatchedBackup(base));
    assert_eq!(h.tick().outcome, TickOutcome::Completed { success: true });
}

#[test]
fn request_backup_skips_the_delay() {
    let mut h = Harness::new();
    let base = h.base(Vec3::ZERO, 1);
    h.service.request_backup(base).unwrap();
    assert_eq!(state(&h, base), RecordState::Queued);
    assert!(matches!(
        h.service.request_backup(EntityId(4_242)),
        Err(EngineError::UnknownController(_))
    ));
}

#[test]
fn vanished_controller_counts_as_failed_attempt() {
    let mut h = Harness::new();
    let base = h.base(Vec3::ZERO, 1);
    h.service.request_backup(base).unwrap();
    h.world.remove(base);

    let report = h.tick();
    assert_eq!(report.outcome, TickOutcome::Idle);
    assert!(report.finished.is_some());
    assert_eq!(state(&h, base), RecordState::SaveFailure);
    assert!(!h.service.scheduler().is_busy());
}

#[test]
fn lifecycle_events_are_emitted() {
    let mut h = Harness::new();
    let events = record_events(&mut h);
    let base = h.base(Vec3::ZERO, 2);
    touch(&mut h, base);
    h.tick();
    h.tick();

    let events = events.lock();
    assert!(matches!(events[0], BackupEvent::RecordingStarted { controller } if controller == base));
    assert!(events
        .iter()
        .any(|e| matches!(e, BackupEvent::BackupStarted { roots } if roots == &vec![base])));
    let completed = events
        .iter()
        .find(|e| matches!(e, BackupEvent::BackupCompleted { .. }))
        .unwrap();
    assert!(completed.to_string().contains("3 objects"));
}

#[test]
fn oversized_retention_window_does_not_stop_startup() {
    let mut config = BackupConfig::default();
    config.storage.retention_days = 200_000_000;
    config.validate().unwrap();

    let mut h = Harness::with_config(config);
    let base = h.base(Vec3::ZERO, 1);
    touch(&mut h, base);
    h.tick_until(|r| matches!(r.outcome, TickOutcome::Completed { success: true }));
    assert_eq!(h.service.store().len(), 1);
}
