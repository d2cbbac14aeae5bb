//! Bulwark snapshot storage.
//!
//! ```text
//! <root>/
//!   meta/<stem>.json   SnapshotMetadata (serde_json, written last)
//!   data/<stem>.bin    SnapshotPayload  (BWSP header + bincode body)
//!
//! stem = <YYYYmmddTHHMMSSZ>_<uuid>
//! ```
//!
//! The payload is written before its metadata, so a metadata file only ever
//! names a complete payload. A crash between the two leaves an orphan
//! payload, which the next `open` removes.
//!
//! `SnapshotStore` keeps every metadata record in an in-memory index; rollback
//! and the operator CLI query that index and only touch payload files when a
//! snapshot is actually read.

pub mod codec;


use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bulwark_model::{PersistedObject, PersistenceId, UserId, Vec3, ZoneDescriptor};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use codec::{decode_payload, encode_payload, CodecError, PayloadHeader, FORMAT_VERSION};

pub const METADATA_DIR: &str = "meta";
pub const PAYLOAD_DIR: &str = "data";
pub const METADATA_VERSION: &str = "bulwark_snapshot_v1";

// ============================================================================
// Core Types
// ============================================================================

/// Per-structure summary stored in the metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureSummary {
    pub controller: PersistenceId,
    pub position: Vec3,
    pub object_count: usize,
    pub zones: Vec<ZoneDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: String,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// File name of the payload, relative to `<root>/data`.
    pub payload_file: String,
    pub object_count: usize,
    pub structures: Vec<StructureSummary>,
    pub authorized_users: Vec<UserId>,
}

impl SnapshotMetadata {
    pub fn zones(&self) -> impl Iterator<Item = &ZoneDescriptor> + '_ {
        self.structures.iter().flat_map(|s| s.zones.iter())
    }

    pub fn covers(&self, point: Vec3) -> bool {
        self.zones().any(|z| z.contains(point))
    }

    pub fn includes_controller(&self, controller: PersistenceId) -> bool {
        self.structures.iter().any(|s| s.controller == controller)
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructurePayload {
    pub controller: PersistenceId,
    pub objects: Vec<PersistedObject>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub structures: Vec<StructurePayload>,
    /// Union of every structure's zones.
    pub zones: Vec<ZoneDescriptor>,
}

impl SnapshotPayload {
    pub fn object_count(&self) -> usize {
        self.structures.iter().map(|s| s.objects.len()).sum()
    }

    pub fn objects(&self) -> impl Iterator<Item = &PersistedObject> + '_ {
        self.structures.iter().flat_map(|s| s.objects.iter())
    }
}

/// One structure as captured by the pipeline, ready to be written.
#[derive(Debug, Clone)]
pub struct CapturedStructure {
    pub controller: PersistenceId,
    pub position: Vec3,
    pub zones: Vec<ZoneDescriptor>,
    pub objects: Vec<PersistedObject>,
}

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub created_at: DateTime<Utc>,
    pub structures: Vec<CapturedStructure>,
    pub authorized_users: Vec<UserId>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode metadata for snapshot {id}: {source}")]
    MetadataEncode {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode payload `{path}`: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("payload encode failed: {0}")]
    Encode(#[from] CodecError),

    #[error("unknown snapshot `{0}`")]
    NotFound(String),

    #[error("ambiguous snapshot `{query}` (matches {count}): {preview}")]
    Ambiguous {
        query: String,
        count: usize,
        preview: String,
    },

    #[error("snapshot {id} payload does not match its metadata: {reason}")]
    Mismatch { id: Uuid, reason: String },

    #[error("snapshot {id} names an invalid payload file `{file}`")]
    InvalidPayloadFile { id: Uuid, file: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store root; `meta/` and `data/` live below it.
    pub root: PathBuf,
    /// Snapshots older than this many days are swept. `0` keeps everything.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./bulwark"),
            retention_days: 7,
        }
    }
}

// ============================================================================
// Snapshot Store
// ============================================================================

pub struct SnapshotStore {
    config: StorageConfig,
    index: RwLock<BTreeMap<Uuid, SnapshotMetadata>>,
}

impl SnapshotStore {
    /// Open (or create) a store, load its metadata index and sweep expired
    /// snapshots relative to `now`.
    pub fn open(config: StorageConfig, now: DateTime<Utc>) -> Result<Self, StoreError> {
        ensure_layout(&config.root)?;
        let store = Self {
            config,
            index: RwLock::new(BTreeMap::new()),
        };
        store.load_index()?;
        store.remove_orphan_payloads()?;
        store.sweep(now)?;
        Ok(store)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn meta_dir(&self) -> PathBuf {
        self.config.root.join(METADATA_DIR)
    }

    fn data_dir(&self) -> PathBuf {
        self.config.root.join(PAYLOAD_DIR)
    }

    fn metadata_path(&self, meta: &SnapshotMetadata) -> PathBuf {
        self.meta_dir()
            .join(format!("{}.json", file_stem(meta.created_at, meta.id)))
    }

    fn payload_path(&self, meta: &SnapshotMetadata) -> Result<PathBuf, StoreError> {
        if !is_plain_file_name(&meta.payload_file) {
            return Err(StoreError::InvalidPayloadFile {
                id: meta.id,
                file: meta.payload_file.clone(),
            });
        }
        Ok(self.data_dir().join(&meta.payload_file))
    }

    fn load_index(&self) -> Result<(), StoreError> {
        let dir = self.meta_dir();
        let mut index = self.index.write();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            if path.extension().and_then(|x| x.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_json::from_str::<SnapshotMetadata>(&text).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(meta) => {
                    index.insert(meta.id, meta);
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable snapshot metadata"
                    );
                }
            }
        }
        tracing::debug!(
            root = %self.config.root.display(),
            snapshots = index.len(),
            "loaded snapshot index"
        );
        Ok(())
    }

    fn remove_orphan_payloads(&self) -> Result<(), StoreError> {
        let referenced: HashSet<String> = self
            .index
            .read()
            .values()
            .map(|m| m.payload_file.clone())
            .collect();
        let dir = self.data_dir();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let Ok(entry) = entry else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".bin") || referenced.contains(&name) {
                continue;
            }
            let path = entry.path();
            remove_if_exists(&path)?;
            tracing::info!(path = %path.display(), "removed orphan snapshot payload");
        }
        Ok(())
    }

    // ========================================================================
    // Write Operations
    // ========================================================================

    /// Persist a captured snapshot: payload first, metadata last.
    pub fn write(&self, snapshot: NewSnapshot) -> Result<SnapshotMetadata, StoreError> {
        let id = Uuid::new_v4();
        let stem = file_stem(snapshot.created_at, id);

        let mut payload = SnapshotPayload::default();
        let mut summaries = Vec::with_capacity(snapshot.structures.len());
        for mut structure in snapshot.structures {
            structure.objects.sort_by(|a, b| {
                a.type_name
                    .cmp(&b.type_name)
                    .then_with(|| a.template.cmp(&b.template))
            });
            for zone in &structure.zones {
                if !payload.zones.contains(zone) {
                    payload.zones.push(*zone);
                }
            }
            summaries.push(StructureSummary {
                controller: structure.controller,
                position: structure.position,
                object_count: structure.objects.len(),
                zones: structure.zones,
            });
            payload.structures.push(StructurePayload {
                controller: structure.controller,
                objects: structure.objects,
            });
        }

        let meta = SnapshotMetadata {
            version: METADATA_VERSION.to_string(),
            id,
            created_at: snapshot.created_at,
            payload_file: format!("{stem}.bin"),
            object_count: payload.object_count(),
            structures: summaries,
            authorized_users: snapshot.authorized_users,
        };

        let bytes = encode_payload(&payload)?;
        let payload_path = self.payload_path(&meta)?;
        fs::write(&payload_path, &bytes).map_err(io_err(&payload_path))?;

        let json = serde_json::to_string_pretty(&meta)
            .map_err(|source| StoreError::MetadataEncode { id, source })?;
        let meta_path = self.metadata_path(&meta);
        let tmp_path = meta_path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &meta_path).map_err(io_err(&meta_path))?;

        tracing::info!(
            snapshot = %id,
            objects = meta.object_count,
            structures = meta.structures.len(),
            bytes = bytes.len(),
            "snapshot written"
        );
        self.index.write().insert(id, meta.clone());
        Ok(meta)
    }

    pub fn delete(&self, id: Uuid) -> Result<SnapshotMetadata, StoreError> {
        let meta = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.remove_files(&meta)?;
        self.index.write().remove(&id);
        tracing::info!(snapshot = %id, "snapshot deleted");
        Ok(meta)
    }

    /// Delete every snapshot created before `now - retention_days`. Returns
    /// the number of snapshots removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        if self.config.retention_days == 0 {
            return Ok(0);
        }
        // A window reaching past the calendar's start keeps everything.
        let Some(cutoff) =
            now.checked_sub_signed(Duration::days(i64::from(self.config.retention_days)))
        else {
            return Ok(0);
        };
        let expired: Vec<SnapshotMetadata> = self
            .index
            .read()
            .values()
            .filter(|m| m.created_at < cutoff)
            .cloned()
            .collect();

        for meta in &expired {
            self.remove_files(meta)?;
            self.index.write().remove(&meta.id);
            tracing::info!(
                snapshot = %meta.id,
                created_at = %meta.created_at,
                "expired snapshot swept"
            );
        }
        Ok(expired.len())
    }

    fn remove_files(&self, meta: &SnapshotMetadata) -> Result<(), StoreError> {
        // Metadata goes first so an interrupted delete never leaves metadata
        // pointing at a missing payload.
        remove_if_exists(&self.metadata_path(meta))?;
        remove_if_exists(&self.payload_path(meta)?)
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    pub fn read_payload(&self, meta: &SnapshotMetadata) -> Result<SnapshotPayload, StoreError> {
        let path = self.payload_path(meta)?;
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        let payload =
            decode_payload(&bytes).map_err(|source| StoreError::Codec { path, source })?;

        if payload.object_count() != meta.object_count {
            return Err(StoreError::Mismatch {
                id: meta.id,
                reason: format!(
                    "metadata lists {} objects, payload holds {}",
                    meta.object_count,
                    payload.object_count()
                ),
            });
        }
        if payload.structures.len() != meta.structures.len() {
            return Err(StoreError::Mismatch {
                id: meta.id,
                reason: format!(
                    "metadata lists {} structures, payload holds {}",
                    meta.structures.len(),
                    payload.structures.len()
                ),
            });
        }
        Ok(payload)
    }

    pub fn get(&self, id: Uuid) -> Option<SnapshotMetadata> {
        self.index.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// All snapshots, oldest first.
    pub fn list(&self) -> Vec<SnapshotMetadata> {
        let mut all: Vec<SnapshotMetadata> = self.index.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn latest(&self) -> Option<SnapshotMetadata> {
        self.list().pop()
    }

    /// Resolve a full id, a unique id prefix, or `latest`/`head`.
    pub fn resolve(&self, query: &str) -> Result<SnapshotMetadata, StoreError> {
        let q = query.trim();
        if q.eq_ignore_ascii_case("latest") || q.eq_ignore_ascii_case("head") {
            return self
                .latest()
                .ok_or_else(|| StoreError::NotFound(q.to_string()));
        }
        if let Ok(id) = Uuid::parse_str(q) {
            return self.get(id).ok_or_else(|| StoreError::NotFound(q.to_string()));
        }

        let needle = q.to_ascii_lowercase();
        let mut matches: Vec<SnapshotMetadata> = self
            .list()
            .into_iter()
            .filter(|m| {
                !needle.is_empty()
                    && (m.id.hyphenated().to_string().starts_with(&needle)
                        || m.id.simple().to_string().starts_with(&needle))
            })
            .collect();

        match matches.len() {
            0 => Err(StoreError::NotFound(q.to_string())),
            1 => Ok(matches.remove(0)),
            count => {
                let preview = matches
                    .iter()
                    .take(8)
                    .map(|m| m.id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(StoreError::Ambiguous {
                    query: q.to_string(),
                    count,
                    preview,
                })
            }
        }
    }

    /// Snapshots whose recorded zones contain `point`, oldest first.
    pub fn covering(&self, point: Vec3) -> Vec<SnapshotMetadata> {
        self.list().into_iter().filter(|m| m.covers(point)).collect()
    }

    /// Most recent snapshot that captured the given controller.
    pub fn latest_for(&self, controller: PersistenceId) -> Option<SnapshotMetadata> {
        self.list()
            .into_iter()
            .rev()
            .find(|m| m.includes_controller(controller))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn ensure_layout(root: &Path) -> Result<(), StoreError> {
    for dir in [root.join(METADATA_DIR), root.join(PAYLOAD_DIR)] {
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
    }
    Ok(())
}

pub fn file_stem(created_at: DateTime<Utc>, id: Uuid) -> String {
    format!("{}_{}", created_at.format("%Y%m%dT%H%M%SZ"), id.hyphenated())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
