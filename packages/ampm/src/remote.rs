//! The remote repository gateway.
//!
//! The repository is a directory tree on a mounted share; there is no index
//! server. `metadata/<type>/<fingerprint>.toml` files *are* the index, and
//! `artifacts/` holds payloads at the locations the records name. Everything
//! multi-step funnels through a final rename, the only atomicity primitive
//! the share provides.

use std::{
    fmt::Debug as StdDebug,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use futures::Stream;
use tokio::task::spawn_blocking;
use tracing::{debug, error, instrument, warn};

use crate::{
    archive,
    artifact::{ArtifactId, ArtifactType, Compression, Fingerprint, PathType, Record},
    error::Fault,
    fs,
};

/// Directory under the share (and cache) root holding metadata records.
pub const METADATA_DIR: &str = "metadata";

/// Directory under the share (and cache) root holding payloads.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// A repository reachable as a directory tree.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{}", root.display())]
pub struct RemoteRepo {
    root: PathBuf,
}

impl RemoteRepo {
    /// Open the repository rooted at the provided directory.
    ///
    /// The directory must exist: for NFS repositories a missing root almost
    /// always means the share is not mounted, which is worth a precise error
    /// rather than a cascade of per-operation failures.
    #[instrument]
    pub async fn open(root: impl Into<PathBuf> + StdDebug) -> Result<Self> {
        let root = root.into();
        if !fs::is_dir(&root).await {
            return Err(Fault::IoError(format!(
                "repository root is not a directory (is the share mounted?): {}",
                root.display()
            ))
            .into());
        }
        debug!(?root, "open remote repository");
        Ok(Self { root })
    }

    /// The repository's metadata tree.
    pub fn metadata_root(&self) -> PathBuf {
        self.root.join(METADATA_DIR)
    }

    fn metadata_path(&self, id: &ArtifactId) -> PathBuf {
        record_path(&self.metadata_root(), &id.artifact_type, &id.fingerprint)
    }

    fn payload_path(&self, record: &Record) -> PathBuf {
        self.root.join(&record.remote_path)
    }

    /// Enumerate records, optionally below a type prefix.
    ///
    /// Records that fail to read, parse, or verify are skipped with a
    /// warning; they never abort the scan.
    pub fn list(
        &self,
        prefix: Option<&ArtifactType>,
    ) -> impl Stream<Item = Result<(ArtifactId, Record)>> + Unpin {
        scan_records(self.metadata_root(), prefix)
    }

    /// Read one record by exact identifier. `None` if it isn't there.
    #[instrument]
    pub async fn read_record(&self, id: &ArtifactId) -> Result<Option<Record>> {
        let path = self.metadata_path(id);
        let Some(bytes) = fs::read_buffered(&path).await? else {
            return Ok(None);
        };
        let record =
            Record::parse(&bytes).with_context(|| format!("parse record: {path:?}"))?;
        verify_fingerprint(&record, &id.fingerprint)
            .with_context(|| format!("read record: {path:?}"))?;
        Ok(Some(record))
    }

    /// Copy the record's payload into `dest_dir`, decompressing as the
    /// record requires. Returns the path to the materialized payload,
    /// always `dest_dir/<name>`.
    #[instrument(skip(record), fields(remote_path = %record.remote_path))]
    pub async fn fetch_payload(&self, record: &Record, dest_dir: &Path) -> Result<PathBuf> {
        let src = self.payload_path(record);
        let dest = dest_dir.join(&record.name);
        match (record.compression, record.path_type) {
            (Compression::None, PathType::File) => {
                fs::copy_file(&src, &dest).await?;
            }
            (Compression::None, PathType::Dir) => {
                fs::copy_dir(&src, &dest).await?;
            }
            (Compression::Gzip, PathType::File) => {
                archive::gunzip_file(&src, &dest).await?;
            }
            (Compression::TarGzip, PathType::Dir) => {
                archive::unpack_tar_gz(&src, dest_dir).await?;
                if !fs::is_dir(&dest).await {
                    return Err(Fault::FormatError(format!(
                        "archive {} does not contain a top-level {:?} directory",
                        record.remote_path, record.name
                    ))
                    .into());
                }
            }
            (compression, path_type) => {
                return Err(Fault::FormatError(format!(
                    "record pairs a {path_type} payload with {compression} compression"
                ))
                .into());
            }
        }
        Ok(dest)
    }

    /// Publish a record and its packed payload.
    ///
    /// Both are staged under temporary names and committed by rename; the
    /// metadata rename is the publication point, so a reader that sees the
    /// record is guaranteed to see the payload. Publishing a fingerprint
    /// that already exists is a no-op; returns whether anything was written.
    #[instrument(skip(record, payload_src))]
    pub async fn publish(&self, record: &Record, payload_src: &Path) -> Result<bool> {
        let id = record.id()?;
        let meta_final = self.metadata_path(&id);
        if fs::exists(&meta_final).await {
            debug!(%id, "already published");
            return Ok(false);
        }

        let payload_final = self.payload_path(record);
        let payload_staged = fs::temp_sibling(&payload_final);
        let stage = async {
            if fs::is_dir(payload_src).await {
                fs::copy_dir(payload_src, &payload_staged).await?;
            } else {
                fs::copy_file(payload_src, &payload_staged).await?;
            }
            // A crashed upload may have left a payload behind; renaming over
            // a non-empty directory would fail, so clear it first.
            fs::remove_path(&payload_final).await?;
            fs::rename(&payload_staged, &payload_final).await
        };
        if let Err(err) = stage.await {
            cleanup(&payload_staged).await;
            return Err(err).with_context(|| format!("publish payload for {id}"));
        }

        let meta_staged = meta_final.with_extension("toml.tmp");
        let stage = async {
            fs::write(&meta_staged, record.to_canonical_bytes()?).await?;
            fs::rename(&meta_staged, &meta_final).await
        };
        if let Err(err) = stage.await {
            cleanup(&meta_staged).await;
            return Err(err).with_context(|| format!("publish record for {id}"));
        }

        debug!(%id, "published");
        Ok(true)
    }

    /// Remove the record with this exact identifier and the payload it
    /// references. The metadata file goes first so no new reader can resolve
    /// a record whose payload is about to disappear.
    #[instrument]
    pub async fn remove(&self, id: &ArtifactId) -> Result<()> {
        let path = self.metadata_path(id);
        let bytes = fs::read_buffered(&path)
            .await?
            .ok_or_else(|| Fault::NotFound(id.to_string()))?;
        let record =
            Record::parse(&bytes).with_context(|| format!("parse record: {path:?}"))?;
        verify_fingerprint(&record, &id.fingerprint)
            .with_context(|| format!("remove record: {path:?}"))?;

        fs::remove_file(&path).await?;
        fs::remove_path(self.payload_path(&record)).await?;
        debug!(%id, "removed");
        Ok(())
    }
}

/// Best-effort removal of a staging path after a failed publication.
async fn cleanup(staged: &Path) {
    if let Err(err) = fs::remove_path(staged).await {
        warn!(?staged, ?err, "could not clean up staging path");
    }
}

/// The canonical path of a record below a metadata root.
pub fn record_path(
    metadata_root: &Path,
    artifact_type: &ArtifactType,
    fingerprint: &Fingerprint,
) -> PathBuf {
    metadata_root
        .join(artifact_type.as_str())
        .join(format!("{fingerprint}.toml"))
}

/// Walk a metadata tree and emit every record below the type prefix.
///
/// Used against the remote share and, in offline mode, against the local
/// cache's own metadata tree. Per-record failures (unreadable, unparseable,
/// fingerprint mismatch) are logged and skipped; only walk failures are
/// emitted as errors. The walk reads whatever snapshot the filesystem
/// offers: records appearing or disappearing mid-scan are acceptable.
pub fn scan_records(
    metadata_root: PathBuf,
    prefix: Option<&ArtifactType>,
) -> impl Stream<Item = Result<(ArtifactId, Record)>> + Unpin {
    let scan_root = match prefix {
        Some(prefix) => metadata_root.join(prefix.as_str()),
        None => metadata_root.clone(),
    };
    let (tx, rx) = flume::bounded::<Result<(ArtifactId, Record)>>(0);

    spawn_blocking(move || {
        if !scan_root.is_dir() {
            return;
        }
        for entry in jwalk::WalkDir::new(&scan_root).skip_hidden(false) {
            let item = match entry.with_context(|| format!("walk records in {scan_root:?}")) {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let path = entry.path();
                    if path.extension().is_none_or(|ext| ext != "toml") {
                        continue;
                    }
                    match read_record_entry(&metadata_root, &path) {
                        Ok(parsed) => Ok(parsed),
                        Err(err) => {
                            warn!(?path, ?err, "skipping unparseable record");
                            continue;
                        }
                    }
                }
                Err(err) => Err(err),
            };
            if let Err(send) = tx.send(item) {
                let item = send.into_inner();
                error!(?item, "walk records: receiver dropped");
                return;
            }
        }
    });

    rx.into_stream()
}

/// Parse one on-disk record, checking that its file name agrees with the
/// record's type and fingerprint.
fn read_record_entry(metadata_root: &Path, path: &Path) -> Result<(ArtifactId, Record)> {
    let rel = path
        .strip_prefix(metadata_root)
        .with_context(|| format!("{path:?} is outside {metadata_root:?}"))?;
    let type_str = rel
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let artifact_type: ArtifactType = type_str.parse()?;
    let fingerprint: Fingerprint = rel
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
        .parse()?;

    let bytes = std::fs::read(path).with_context(|| format!("read record: {path:?}"))?;
    let record = Record::parse(&bytes)?;
    if record.artifact_type != artifact_type {
        bail!(
            "record at {path:?} declares type {}, expected {artifact_type}",
            record.artifact_type
        );
    }
    verify_fingerprint(&record, &fingerprint)?;
    Ok((ArtifactId::new(artifact_type, fingerprint), record))
}

/// Check that the record's content hashes to the expected fingerprint.
fn verify_fingerprint(record: &Record, expected: &Fingerprint) -> Result<()> {
    let actual = record.fingerprint()?;
    if actual != *expected {
        return Err(Fault::IntegrityError {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}
