//! Artifact metadata records, fingerprints, and identifiers.
//!
//! A record is the canonical descriptor of one artifact. Its serialized form
//! is a key-ordered TOML document; the fingerprint is derived from the
//! serialization of the record's *identity* (everything except the fields the
//! uploader derives: `pubdate` and `remote_path`), so uploading the same
//! content with the same attributes always lands on the same fingerprint.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::Fault;

/// A slash-delimited path of lowercase segments, e.g. `tools/compiler`.
///
/// Types are pure namespaces: they carry no semantics beyond prefix listing.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct ArtifactType(String);

impl ArtifactType {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type's segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Whether this type equals `prefix` or descends from it.
    ///
    /// `foo` is within `foo` and `foo/bar` is within `foo`, but `foobar`
    /// is not: prefixes only match on segment boundaries.
    pub fn is_within(&self, prefix: &ArtifactType) -> bool {
        self.0 == prefix.0
            || (self.0.len() > prefix.0.len()
                && self.0.starts_with(&prefix.0)
                && self.0.as_bytes()[prefix.0.len()] == b'/')
    }
}

impl TryFrom<String> for ArtifactType {
    type Error = Fault;

    fn try_from(value: String) -> Result<Self, Fault> {
        value.parse()
    }
}

impl From<ArtifactType> for String {
    fn from(value: ArtifactType) -> Self {
        value.0
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Fault> {
        let valid_segment = |seg: &str| {
            !seg.is_empty()
                && seg != "."
                && seg != ".."
                && seg
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_-.".contains(c))
        };
        if !s.is_empty() && s.split('/').all(valid_segment) {
            Ok(Self(s.to_string()))
        } else {
            Err(Fault::FormatError(format!("invalid artifact type: {s:?}")))
        }
    }
}

/// 32 lowercase base32 characters: the first 160 bits of the SHA-256 of a
/// record's identity bytes.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{_0}")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The number of characters in a rendered fingerprint.
    pub const LEN: usize = 32;

    /// Fingerprint the provided serialized bytes.
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(bytes.as_ref());
        Self(base32::encode(
            base32::Alphabet::Rfc4648Lower { padding: false },
            &digest[..20],
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Fault> {
        if s.len() == Self::LEN
            && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            Ok(Self(s.to_string()))
        } else {
            Err(Fault::FormatError(format!("invalid fingerprint: {s:?}")))
        }
    }
}

/// `<type>:<fingerprint>`, the primary external handle for an artifact.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{artifact_type}:{fingerprint}")]
pub struct ArtifactId {
    pub artifact_type: ArtifactType,
    pub fingerprint: Fingerprint,
}

impl ArtifactId {
    pub fn new(artifact_type: ArtifactType, fingerprint: Fingerprint) -> Self {
        Self {
            artifact_type,
            fingerprint,
        }
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Fault> {
        let (ty, fp) = s
            .rsplit_once(':')
            .ok_or_else(|| Fault::FormatError(format!("invalid artifact identifier: {s:?}")))?;
        Ok(Self {
            artifact_type: ty.parse()?,
            fingerprint: fp.parse()?,
        })
    }
}

/// Whether the payload is a single file or a directory tree.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    #[display("file")]
    File,
    #[display("dir")]
    Dir,
}

/// How the payload is stored on the remote share.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize, Display,
)]
pub enum Compression {
    #[serde(rename = "none")]
    #[display("none")]
    None,
    #[serde(rename = "gzip")]
    #[display("gzip")]
    Gzip,
    #[serde(rename = "tar+gzip")]
    #[display("tar+gzip")]
    TarGzip,
}

impl Compression {
    /// The on-share file name for a payload packed with this compression.
    ///
    /// `None` directory payloads keep their name: they are stored as trees.
    pub fn packed_name(&self, name: &str) -> String {
        match self {
            Compression::None => name.to_string(),
            Compression::Gzip => format!("{name}.gz"),
            Compression::TarGzip => format!("{name}.tar.gz"),
        }
    }
}

/// The canonical descriptor of one artifact. Immutable after publication.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Record {
    pub artifact_type: ArtifactType,
    pub name: String,
    pub path_type: PathType,
    pub remote_path: String,
    pub compression: Compression,
    pub attributes: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub pubdate: Timestamp,
}

/// Serialized document shape. Tables appear in fixed order (`[artifact]`,
/// `[attributes]`, `[env]`); keys within each table are lexicographic, which
/// for `[artifact]` is encoded in field order and for the maps falls out of
/// `BTreeMap` iteration.
#[derive(Serialize, Deserialize)]
struct RecordDoc {
    artifact: ArtifactTable,
    attributes: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactTable {
    compression: Compression,
    name: String,
    path_type: PathType,
    pubdate: Timestamp,
    remote_path: String,
    #[serde(rename = "type")]
    artifact_type: ArtifactType,
}

/// The fingerprinted subset of a record: no `pubdate`, no `remote_path`.
///
/// Those two fields are derived by the uploader at publication time, so
/// hashing them would make re-uploading identical content mint a fresh
/// fingerprint on every invocation.
#[derive(Serialize)]
struct IdentityDoc<'a> {
    artifact: IdentityTable<'a>,
    attributes: &'a BTreeMap<String, String>,
    env: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct IdentityTable<'a> {
    compression: Compression,
    name: &'a str,
    path_type: PathType,
    #[serde(rename = "type")]
    artifact_type: &'a ArtifactType,
}

impl Record {
    /// Serialize to the canonical key-ordered form written to
    /// `metadata/<type>/<fingerprint>.toml`. Deterministic.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        let doc = RecordDoc {
            artifact: ArtifactTable {
                compression: self.compression,
                name: self.name.clone(),
                path_type: self.path_type,
                pubdate: self.pubdate,
                remote_path: self.remote_path.clone(),
                artifact_type: self.artifact_type.clone(),
            },
            attributes: self.attributes.clone(),
            env: self.env.clone(),
        };
        toml::to_string(&doc)
            .context("serialize record")
            .map(String::into_bytes)
    }

    /// Parse a record from its canonical serialized form.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| Fault::FormatError(format!("record is not UTF-8: {err}")))?;
        let doc: RecordDoc = toml::from_str(text)
            .map_err(|err| Fault::FormatError(format!("record does not parse: {err}")))?;
        Ok(Self {
            artifact_type: doc.artifact.artifact_type,
            name: doc.artifact.name,
            path_type: doc.artifact.path_type,
            remote_path: doc.artifact.remote_path,
            compression: doc.artifact.compression,
            attributes: doc.attributes,
            env: doc.env,
            pubdate: doc.artifact.pubdate,
        })
    }

    /// The deterministic identity serialization this record is
    /// fingerprinted over.
    pub fn identity_bytes(&self) -> Result<Vec<u8>> {
        let doc = IdentityDoc {
            artifact: IdentityTable {
                compression: self.compression,
                name: &self.name,
                path_type: self.path_type,
                artifact_type: &self.artifact_type,
            },
            attributes: &self.attributes,
            env: &self.env,
        };
        toml::to_string(&doc)
            .context("serialize record identity")
            .map(String::into_bytes)
    }

    /// Derive this record's fingerprint.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        self.identity_bytes().map(Fingerprint::of)
    }

    /// Derive this record's full identifier.
    pub fn id(&self) -> Result<ArtifactId> {
        Ok(ArtifactId::new(self.artifact_type.clone(), self.fingerprint()?))
    }
}
