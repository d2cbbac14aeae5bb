use bulwark_model::{EntityId, UserId};
use bulwark_storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

use crate::handle::HandleState;
use crate::tracker::RecordState;

/// Errors reported by a `WorldHost` implementation.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("object {0} does not exist")]
    MissingObject(EntityId),

    #[error("failed to spawn `{type_name}`: {reason}")]
    SpawnFailed { type_name: String, reason: String },

    #[error("host rejected change to {id}: {reason}")]
    Rejected { id: EntityId, reason: String },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    // Validation: nothing was mutated.
    #[error("controller {0} is not tracked")]
    UnknownController(EntityId),

    #[error("{id} cannot be captured: {reason}")]
    InvalidRoot { id: EntityId, reason: String },

    #[error("a pipeline needs at least one root controller")]
    NoRoots,

    #[error("pipeline already started")]
    AlreadyStarted,

    #[error("pipeline has not been started")]
    NotStarted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("controller {id} is {state:?}")]
    InvalidState { id: EntityId, state: RecordState },

    // Processing.
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),

    // Reconciliation.
    #[error("snapshot `{0}` not found")]
    SnapshotNotFound(String),

    #[error("safety backup failed: {0}")]
    SafetyBackupFailed(String),

    // Leases.
    #[error("snapshot {snapshot} is held by user {holder}")]
    LeaseHeld { snapshot: Uuid, holder: UserId },

    #[error("user {user} does not hold snapshot {snapshot}")]
    NotLeaseHolder { snapshot: Uuid, user: UserId },

    #[error("confirmation code does not match")]
    ConfirmationMismatch,

    #[error("lease on snapshot {0} has expired")]
    LeaseExpired(Uuid),

    #[error("snapshot {snapshot} handle is {state:?}, it must be locked first")]
    HandleNotLocked { snapshot: Uuid, state: HandleState },

    #[error("snapshot {0} is being rolled back")]
    HandleBusy(Uuid),

    #[error("snapshot {0} is already locked by you")]
    AlreadyLocked(Uuid),
}

pub type Result<T> = std::result::Result<T, EngineError>;
