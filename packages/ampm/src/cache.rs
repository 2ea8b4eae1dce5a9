//! The local artifact cache.
//!
//! Layout under the cache root:
//!
//! - `metadata/<type>/<fingerprint>.toml`: copy of the record.
//! - `metadata/<type>/<fingerprint>.target`: symlink whose *text* is the
//!   absolute path of the materialized payload. Published last, by rename:
//!   a reader that observes it never sees a partial payload.
//! - `metadata/<type>/<fingerprint>.env`: pre-rendered export script.
//! - `artifacts/<type>/<fingerprint>/<name>`: the payload itself.
//! - `locks/<type>/<fingerprint>.lock`: serializes fetches per fingerprint.
//!
//! Entries are write-once: a failed fetch never invalidates an existing
//! entry, and nothing is ever rewritten in place.

use std::{
    collections::BTreeMap,
    fmt::Debug as StdDebug,
    path::PathBuf,
};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use tracing::{debug, instrument, trace, warn};

use crate::{
    artifact::{ArtifactId, Record},
    error::Fault,
    fs,
    remote::{self, RemoteRepo},
};

/// Directory under the cache root holding fetch locks.
const LOCKS_DIR: &str = "locks";

/// A cache rooted at a local directory, shared by every process on the host.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{}", root.display())]
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    /// Open the cache at the provided root, which is created lazily.
    ///
    /// The root is made absolute up front: `.target` link text must be
    /// absolute to be meaningful to other processes.
    pub fn open(root: impl Into<PathBuf> + StdDebug) -> Result<Self> {
        let root = root.into();
        let root = std::path::absolute(&root)
            .with_context(|| format!("resolve cache root: {root:?}"))?;
        trace!(?root, "open cache");
        Ok(Self { root })
    }

    /// The cache's own metadata tree. Offline mode scans this instead of
    /// the remote share.
    pub fn metadata_root(&self) -> PathBuf {
        self.root.join(remote::METADATA_DIR)
    }

    fn record_path(&self, id: &ArtifactId) -> PathBuf {
        remote::record_path(&self.metadata_root(), &id.artifact_type, &id.fingerprint)
    }

    fn side_path(&self, id: &ArtifactId, ext: &str) -> PathBuf {
        self.metadata_root()
            .join(id.artifact_type.as_str())
            .join(format!("{}.{ext}", id.fingerprint))
    }

    fn payload_dir(&self, id: &ArtifactId) -> PathBuf {
        self.root
            .join(remote::ARTIFACTS_DIR)
            .join(id.artifact_type.as_str())
            .join(id.fingerprint.as_str())
    }

    fn staging_dir(&self, id: &ArtifactId) -> PathBuf {
        self.root
            .join(remote::ARTIFACTS_DIR)
            .join(id.artifact_type.as_str())
            .join(format!("{}.partial", id.fingerprint))
    }

    fn lock_path(&self, id: &ArtifactId) -> PathBuf {
        self.root
            .join(LOCKS_DIR)
            .join(id.artifact_type.as_str())
            .join(format!("{}.lock", id.fingerprint))
    }

    /// The lock-free fast check: if the `.target` side-file exists and its
    /// link text points at something that exists, the payload is complete
    /// (publication order guarantees it) and this is its path.
    #[instrument]
    pub async fn lookup(&self, id: &ArtifactId) -> Result<Option<PathBuf>> {
        let Some(text) = fs::read_link_text(self.side_path(id, "target")).await? else {
            return Ok(None);
        };
        if fs::symlink_metadata(&text).await?.is_some() {
            Ok(Some(text))
        } else {
            warn!(%id, ?text, "target link is stale; refetching");
            Ok(None)
        }
    }

    /// The cached copy of the record, if this fingerprint was ever resolved
    /// on this host. A copy that no longer parses or hashes to the expected
    /// fingerprint is treated as absent so callers fall back to the remote.
    #[instrument]
    pub async fn cached_record(&self, id: &ArtifactId) -> Result<Option<Record>> {
        let path = self.record_path(id);
        let Some(bytes) = fs::read_buffered(&path).await? else {
            return Ok(None);
        };
        let parsed = Record::parse(&bytes).and_then(|record| {
            let actual = record.fingerprint()?;
            if actual == id.fingerprint {
                Ok(record)
            } else {
                Err(Fault::IntegrityError {
                    expected: id.fingerprint.to_string(),
                    actual: actual.to_string(),
                }
                .into())
            }
        });
        match parsed {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(?path, ?err, "ignoring corrupt cached record");
                Ok(None)
            }
        }
    }

    /// The pre-rendered environment script, if present.
    #[instrument]
    pub async fn env_script(&self, id: &ArtifactId) -> Result<Option<String>> {
        fs::read_buffered_utf8(self.side_path(id, "env")).await
    }

    /// Materialize the record's payload exactly once per fingerprint per
    /// host, even under concurrent callers, and return its absolute path.
    ///
    /// Concurrent fetches of the same fingerprint serialize on an exclusive
    /// advisory lock; fetches of distinct fingerprints run in parallel. The
    /// payload is fetched into a `.partial` staging directory and published
    /// with two renames: staging to final payload directory, then the
    /// `.target` side-file last.
    #[instrument(skip(record, remote))]
    pub async fn ensure_local(&self, record: &Record, remote: &RemoteRepo) -> Result<PathBuf> {
        let id = record.id()?;
        if let Some(path) = self.lookup(&id).await? {
            trace!(%id, ?path, "cache hit");
            return Ok(path);
        }

        let lock = fs::LockFile::open(self.lock_path(&id))
            .await?
            .lock()
            .await
            .with_context(|| format!("lock fetch of {id}"))?;
        let result = self.fetch_under_lock(&id, record, remote).await;
        let unlocked = lock.unlock().await;
        let path = result?;
        unlocked?;
        Ok(path)
    }

    /// The fetch-and-publish sequence. Runs with the fingerprint lock held.
    async fn fetch_under_lock(
        &self,
        id: &ArtifactId,
        record: &Record,
        remote: &RemoteRepo,
    ) -> Result<PathBuf> {
        // Double-checked: another process may have published while this one
        // waited on the lock.
        if let Some(path) = self.lookup(id).await? {
            debug!(%id, ?path, "published while waiting on lock");
            return Ok(path);
        }

        let staging = self.staging_dir(id);
        // A `.partial` directory here is a leftover from a fetch that died
        // without unwinding; it is owned by whoever holds the lock.
        fs::remove_dir_all(&staging).await?;
        fs::create_dir_all(&staging).await?;
        let mut guard = StagingGuard::new(staging.clone());

        remote
            .fetch_payload(record, &staging)
            .await
            .with_context(|| format!("fetch payload of {id}"))?;

        let payload_dir = self.payload_dir(id);
        fs::remove_dir_all(&payload_dir).await?;
        fs::rename(&staging, &payload_dir).await?;
        guard.disarm();

        let target = payload_dir.join(&record.name);
        fs::write(self.record_path(id), record.to_canonical_bytes()?).await?;
        fs::write(self.side_path(id, "env"), render_env_script(&record.env)).await?;

        let link = self.side_path(id, "target");
        let link_staged = link.with_extension("target.tmp");
        fs::symlink(&target, &link_staged).await?;
        fs::rename(&link_staged, &link).await?;

        debug!(%id, ?target, "materialized");
        Ok(target)
    }
}

/// Removes the staging directory on drop unless the fetch published it.
///
/// Drop also runs when the enclosing future is cancelled (interrupt), so a
/// cancelled fetch leaves no `.partial` directory behind.
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?self.path, ?err, "could not remove staging directory");
                }
            }
        }
    }
}

/// Render the record's environment bindings as an idempotent POSIX script.
///
/// Values are single-quoted with embedded quotes escaped as `'\''`, so
/// sourcing the output sets variables and nothing else.
pub fn render_env_script(env: &BTreeMap<String, String>) -> String {
    let mut script = String::new();
    for (key, value) in env {
        script.push_str("export ");
        script.push_str(key);
        script.push_str("='");
        script.push_str(&value.replace('\'', r"'\''"));
        script.push_str("'\n");
    }
    script
}
