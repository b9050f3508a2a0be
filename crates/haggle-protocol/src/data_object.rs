//! Data objects: content plus the attributes that describe it.

use crate::attribute::Attribute;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataObjectIdError {
    #[error("invalid hex in data object id: {0}")]
    Hex(String),

    #[error("data object id must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Content-derived identifier of a data object (SHA-256, hex on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataObjectId([u8; 32]);

impl DataObjectId {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for DataObjectId {
    type Err = DataObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| DataObjectIdError::Hex(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| DataObjectIdError::Length {
                expected: Self::LEN,
                actual: raw.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for DataObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DataObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataObjectId({})", &self.to_hex()[..12])
    }
}

impl Serialize for DataObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DataObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where the content of a data object lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Attribute-only object.
    #[default]
    None,
    /// Content stored in a file the daemon can read.
    File { path: PathBuf },
    /// Content carried inline, base64 on the wire.
    Inline {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

impl Payload {
    /// Number of bytes carried inline in the message.
    pub fn inline_len(&self) -> usize {
        match self {
            Payload::Inline { bytes } => bytes.len(),
            _ => 0,
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// An application data object.
///
/// Built by the application before publishing. The identifier is derived
/// from the content unless the daemon has assigned one (see
/// [`DataObject::with_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DataObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<DataObjectId>,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    payload: Payload,
}

impl DataObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.payload = Payload::File { path: path.into() };
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Payload::Inline {
            bytes: bytes.into(),
        };
        self
    }

    /// Attach an identifier assigned by the daemon.
    pub fn with_id(mut self, id: DataObjectId) -> Self {
        self.id = Some(id);
        self
    }

    /// The daemon-assigned identifier if present, otherwise the content id.
    pub fn id(&self) -> DataObjectId {
        self.id.unwrap_or_else(|| self.content_id())
    }

    /// Identifier derived from the attribute set and payload.
    ///
    /// Attributes are hashed in sorted (name, value) order so that the id
    /// does not depend on insertion order. Weights are not part of the id.
    pub fn content_id(&self) -> DataObjectId {
        let mut attrs: Vec<(&str, &str)> = self
            .attributes
            .iter()
            .map(|a| (a.name(), a.value()))
            .collect();
        attrs.sort_unstable();

        let mut hasher = Sha256::new();
        for (name, value) in attrs {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        match &self.payload {
            Payload::None => hasher.update(b"none"),
            Payload::File { path } => {
                hasher.update(b"file:");
                hasher.update(path.to_string_lossy().as_bytes());
            }
            Payload::Inline { bytes } => {
                hasher.update(b"inline:");
                hasher.update(bytes);
            }
        }
        DataObjectId(hasher.finalize().into())
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.payload {
            Payload::File { path } => Some(path),
            _ => None,
        }
    }

    /// True when any attribute equals one of `interests`.
    pub fn matches(&self, interests: &[Attribute]) -> bool {
        self.attributes.iter().any(|a| interests.contains(a))
    }
}
