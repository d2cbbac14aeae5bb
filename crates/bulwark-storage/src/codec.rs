//! Snapshot payload codec.
//!
//! A payload file is a fixed header followed by a `bincode` body:
//!
//! ```text
//! ┌───────┬─────────┬────────────────┬─────────────────────┬──────────────┐
//! │ magic │ version │ content_length │ content_checksum    │ body ...     │
//! │ BWSP  │ u32     │ u64            │ SHA-256 (32 bytes)  │ bincode      │
//! └───────┴─────────┴────────────────┴─────────────────────┴──────────────┘
//! ```
//!
//! Every decoded object is checked against the capture schema before the
//! payload is handed back, so rollback never acts on a property the engine
//! could not have written.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use bulwark_model::{validate, ModelError};

use crate::SnapshotPayload;

/// Magic bytes for Bulwark snapshot payloads.
pub const MAGIC: [u8; 4] = *b"BWSP";

/// Current payload format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub content_length: u64,
    pub content_checksum: [u8; 32],
}

impl PayloadHeader {
    pub fn new(content: &[u8]) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            content_length: content.len() as u64,
            content_checksum: sha256(content),
        }
    }

    pub fn verify(&self) -> Result<(), CodecError> {
        if self.magic != MAGIC {
            return Err(CodecError::InvalidMagic(self.magic));
        }
        if self.version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: self.version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(())
    }

    pub fn verify_content(&self, content: &[u8]) -> Result<(), CodecError> {
        if content.len() as u64 != self.content_length {
            return Err(CodecError::LengthMismatch {
                expected: self.content_length,
                actual: content.len() as u64,
            });
        }
        if sha256(content) != self.content_checksum {
            return Err(CodecError::ChecksumMismatch);
        }
        Ok(())
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid magic bytes {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported payload version {found} (reader supports {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("content length mismatch: header says {expected}, found {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("content checksum mismatch")]
    ChecksumMismatch,

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("payload object {index} failed schema validation: {source}")]
    Schema {
        index: usize,
        #[source]
        source: ModelError,
    },
}

pub fn encode_payload(payload: &SnapshotPayload) -> Result<Vec<u8>, CodecError> {
    let content = bincode::serialize(payload)?;
    let header = PayloadHeader::new(&content);
    let mut out = bincode::serialize(&header)?;
    out.extend_from_slice(&content);
    Ok(out)
}

pub fn decode_payload(bytes: &[u8]) -> Result<SnapshotPayload, CodecError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let header: PayloadHeader = bincode::deserialize_from(&mut cursor)?;
    header.verify()?;

    let content = &bytes[cursor.position() as usize..];
    header.verify_content(content)?;

    let payload: SnapshotPayload = bincode::deserialize(content)?;
    for (index, object) in payload.objects().enumerate() {
        validate(object).map_err(|source| CodecError::Schema { index, source })?;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StructurePayload;
    use bulwark_model::{
        ObjectKind, PersistedObject, PersistenceId, Property, PropertyValue, Transform, Vec3,
        ZoneDescriptor,
    };

    fn payload() -> SnapshotPayload {
        let position = Vec3::new(4.0, 0.0, 4.0);
        SnapshotPayload {
            structures: vec![StructurePayload {
                controller: PersistenceId::derive("cupboard", position),
                objects: vec![PersistedObject {
                    id: PersistenceId::derive("box", position),
                    kind: ObjectKind::Deployable,
                    type_name: "box".into(),
                    template: "assets/box.prefab".into(),
                    owner: None,
                    transform: Transform::at(position),
                    radius: 1.0,
                    properties: vec![Property {
                        name: "skin".into(),
                        value: PropertyValue::UInt(42),
                    }],
                }],
            }],
            zones: vec![ZoneDescriptor::new(position, 40.0)],
        }
    }

    #[test]
    fn header_is_checked_before_body() {
        let mut bytes = encode_payload(&payload()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            decode_payload(&bytes),
            Err(CodecError::InvalidMagic(_))
        ));
    }

    #[test]
    fn flipped_body_byte_fails_checksum() {
        let mut bytes = encode_payload(&payload()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            decode_payload(&bytes),
            Err(CodecError::ChecksumMismatch)
        ));
    }

    #[test]
    fn truncated_body_fails_length_check() {
        let bytes = encode_payload(&payload()).unwrap();
        assert!(matches!(
            decode_payload(&bytes[..bytes.len() - 3]),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn undeclared_property_is_rejected_on_decode() {
        let mut p = payload();
        p.structures[0].objects[0].properties.push(Property {
            name: "grade".into(),
            value: PropertyValue::Text("stone".into()),
        });
        let bytes = encode_payload(&p).unwrap();
        assert!(matches!(
            decode_payload(&bytes),
            Err(CodecError::Schema { index: 0, .. })
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let p = payload();
        let content = bincode::serialize(&p).unwrap();
        let mut header = PayloadHeader::new(&content);
        header.version = FORMAT_VERSION + 1;
        let mut bytes = bincode::serialize(&header).unwrap();
        bytes.extend_from_slice(&content);
        assert!(matches!(
            decode_payload(&bytes),
            Err(CodecError::UnsupportedVersion { .. })
        ));
    }
}
