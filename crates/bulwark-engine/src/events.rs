// ============================================================================
// Backup events for observability
// ============================================================================

use std::fmt;

use bulwark_model::{EntityId, UserId};
use uuid::Uuid;

use crate::rollback::{RollbackOutcome, RollbackReport};

/// Events emitted by `BackupService`.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupEvent {
    RecordingStarted {
        controller: EntityId,
    },
    RecordingStopped {
        controller: EntityId,
    },
    BackupStarted {
        roots: Vec<EntityId>,
    },
    BackupCompleted {
        snapshot: Uuid,
        controllers: Vec<EntityId>,
        objects: usize,
        yields: u32,
    },
    BackupFailed {
        controllers: Vec<EntityId>,
        error: String,
    },
    /// A record exhausted its retries and needs re-initialization.
    RetryLimitExceeded {
        controller: EntityId,
        error: Option<String>,
    },
    RollbackStarted {
        snapshot: Uuid,
        user: UserId,
    },
    RollbackFinished {
        report: RollbackReport,
    },
    LeaseExpired {
        snapshot: Uuid,
        owner: UserId,
    },
}

/// Callback for backup events
pub type BackupEventHandler = Box<dyn Fn(&BackupEvent) + Send + Sync>;

fn join_ids(ids: &[EntityId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for BackupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupEvent::RecordingStarted { controller } => {
                write!(f, "now tracking structure {controller}")
            }
            BackupEvent::RecordingStopped { controller } => {
                write!(f, "stopped tracking structure {controller}")
            }
            BackupEvent::BackupStarted { roots } => {
                write!(f, "backing up {}", join_ids(roots))
            }
            BackupEvent::BackupCompleted {
                snapshot,
                controllers,
                objects,
                yields,
            } => write!(
                f,
                "snapshot {snapshot} saved: {objects} objects across {} structure(s), {yields} yield(s)",
                controllers.len()
            ),
            BackupEvent::BackupFailed { controllers, error } => {
                write!(f, "backup of {} failed: {error}", join_ids(controllers))
            }
            BackupEvent::RetryLimitExceeded { controller, error } => write!(
                f,
                "structure {controller} gave up after repeated failures ({})",
                error.as_deref().unwrap_or("no error recorded")
            ),
            BackupEvent::RollbackStarted { snapshot, user } => {
                write!(f, "user {user} started rolling back snapshot {snapshot}")
            }
            BackupEvent::RollbackFinished { report } => match &report.outcome {
                RollbackOutcome::Applied => write!(
                    f,
                    "snapshot {} restored: {} removed, {} created, {} updated",
                    report.snapshot, report.killed, report.created, report.updated
                ),
                RollbackOutcome::PartiallyApplied { error } => write!(
                    f,
                    "snapshot {} partially restored ({} removed, {} created, {} updated): {error}",
                    report.snapshot, report.killed, report.created, report.updated
                ),
                RollbackOutcome::Aborted { reason } => {
                    write!(f, "rollback of snapshot {} aborted: {reason}", report.snapshot)
                }
                RollbackOutcome::Pending => {
                    write!(f, "rollback of snapshot {} pending", report.snapshot)
                }
            },
            BackupEvent::LeaseExpired { snapshot, owner } => {
                write!(f, "lease of user {owner} on snapshot {snapshot} expired")
            }
        }
    }
}
