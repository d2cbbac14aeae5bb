//! Bulwark structure model
//!
//! This crate defines the vocabulary shared by the snapshot store and the
//! backup engine:
//!
//! - geometry (`Vec3`, `Transform`, `ZoneDescriptor`),
//! - identities (`EntityId` for in-session ids, `PersistenceId` for ids that
//!   survive a restart, `UserId` for players),
//! - the host-facing `WorldObject` view and the captured `PersistedObject`,
//! - the declarative property schema used to capture objects, and
//! - the `ZonePartitioner` that covers a structure with bounded spheres.
//!
//! Nothing here talks to the host simulation or the filesystem; everything is
//! plain data plus pure functions.

pub mod geometry;
pub mod ids;
pub mod object;
pub mod schema;
pub mod zones;

pub use geometry::{Transform, Vec3, ZoneDescriptor};
pub use ids::{EntityId, PersistenceId, UserId};
pub use object::{
    BuildingGrade, Inventory, ItemStack, ObjectKind, PersistedObject, Property, PropertyValue,
    WorldObject,
};
pub use schema::{capture, fields_for, validate, FieldSpec, Inclusion, ModelError, ValueKind};
pub use zones::{ZoneConfigError, ZonePartitioner};
