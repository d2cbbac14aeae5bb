//! Identities.
//!
//! The host hands out `EntityId`s that are only valid for the current
//! session. Snapshots must be diffable against the live world after a
//! restart, so every object also gets a `PersistenceId` derived from what
//! survives a restart: its type name and its position.
//!
//! Derivation:
//! - algorithm: **FNV-1a 64-bit** (deterministic, non-cryptographic)
//! - input: `type=<type name>|pos=<x>,<y>,<z>` with each coordinate rounded
//!   to whole centimetres
//! - display: `"pid:<16 lowercase hex digits>"`
//!
//! Rounding to centimetres absorbs float noise from save/load cycles while
//! still telling apart two blocks placed next to each other.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geometry::Vec3;

/// Prefix used when displaying persistence ids.
pub const PERSISTENCE_ID_PREFIX: &str = "pid:";

/// In-session object id assigned by the host. Not stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A player identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Restart-stable object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersistenceId(pub u64);

impl PersistenceId {
    pub fn derive(type_name: &str, position: Vec3) -> Self {
        const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x00000100000001b3;

        fn add(hash: &mut u64, bytes: &[u8]) {
            for b in bytes {
                *hash ^= (*b) as u64;
                *hash = hash.wrapping_mul(FNV_PRIME);
            }
        }

        let mut hash = FNV_OFFSET_BASIS;
        add(&mut hash, b"type=");
        add(&mut hash, type_name.as_bytes());
        add(&mut hash, b"|pos=");
        for (i, coord) in [position.x, position.y, position.z].into_iter().enumerate() {
            if i > 0 {
                add(&mut hash, b",");
            }
            add(&mut hash, &quantize_cm(coord).to_le_bytes());
        }
        PersistenceId(hash)
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PERSISTENCE_ID_PREFIX}{:016x}", self.0)
    }
}

fn quantize_cm(coord: f32) -> i64 {
    // `-0.0` and `0.0` must hash the same.
    let cm = (coord as f64 * 100.0).round();
    if cm == 0.0 {
        0
    } else {
        cm as i64
    }
}
