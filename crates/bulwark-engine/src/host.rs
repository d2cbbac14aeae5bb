//! The surface the engine needs from the host simulation.

use bulwark_model::{EntityId, PersistedObject, UserId, Vec3, WorldObject, ZoneDescriptor};

use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Only structure controllers.
    Controllers,
    Any,
}

pub trait WorldHost {
    /// Append every live object of `kind` inside `zone` to `out`.
    fn objects_in_sphere(
        &self,
        zone: &ZoneDescriptor,
        kind: QueryKind,
        out: &mut Vec<WorldObject>,
    ) -> Result<(), HostError>;

    fn object(&self, id: EntityId) -> Option<WorldObject>;

    /// Append the positions zones are computed from: the controller's own
    /// position followed by every structural block it covers.
    fn structural_points(&self, controller: EntityId, out: &mut Vec<Vec3>)
        -> Result<(), HostError>;

    fn authorized_users(&self, controller: EntityId) -> Vec<UserId>;

    fn destroy(&mut self, id: EntityId) -> Result<(), HostError>;

    fn spawn(&mut self, record: &PersistedObject) -> Result<EntityId, HostError>;

    /// Overwrite a live object's captured properties with `record`'s.
    fn apply(&mut self, id: EntityId, record: &PersistedObject) -> Result<(), HostError>;
}
