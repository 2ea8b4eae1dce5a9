//! The uploader: validate, pack, publish.

use std::{collections::BTreeMap, path::PathBuf};

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use jiff::Timestamp;
use tracing::{debug, instrument};

use crate::{
    archive,
    artifact::{ArtifactId, ArtifactType, Compression, PathType, Record},
    error::Fault,
    fs,
    remote::{ARTIFACTS_DIR, RemoteRepo},
};

/// One upload: a payload plus everything that goes into its record.
#[derive(Clone, Debug, Builder)]
pub struct UploadRequest {
    /// The file or directory to upload.
    pub source: PathBuf,

    /// The artifact type to publish under.
    pub artifact_type: ArtifactType,

    /// Overrides the payload name; defaults to the source's file name.
    pub name: Option<String>,

    /// Overrides the computed location within the share.
    pub remote_path: Option<String>,

    /// Store the payload as-is instead of gzip / tar+gzip.
    #[builder(default)]
    pub uncompressed: bool,

    #[builder(default)]
    pub attributes: BTreeMap<String, String>,

    #[builder(default)]
    pub env: BTreeMap<String, String>,
}

/// Publish the request's payload and record.
///
/// The fingerprint is derived from the record's identity (which excludes
/// `pubdate` and `remote_path`), so re-uploading identical content is a
/// no-op against the repository and both invocations report success.
#[instrument(skip(remote, request), fields(source = ?request.source))]
pub async fn upload(remote: &RemoteRepo, request: UploadRequest) -> Result<(ArtifactId, Record)> {
    let meta = fs::metadata(&request.source)
        .await?
        .ok_or_else(|| Fault::IoError(format!("no such payload: {:?}", request.source)))?;
    let path_type = if meta.is_dir() {
        PathType::Dir
    } else if meta.is_file() {
        PathType::File
    } else {
        bail!("payload is neither a file nor a directory: {:?}", request.source);
    };

    let name = match request.name {
        Some(name) => name,
        None => request
            .source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Fault::IoError(format!("payload has no name: {:?}", request.source)))?,
    };
    validate_name(&name)?;
    validate_attribute_keys(&request.attributes)?;
    validate_env_keys(&request.env)?;

    let compression = if request.uncompressed {
        Compression::None
    } else {
        match path_type {
            PathType::File => Compression::Gzip,
            PathType::Dir => Compression::TarGzip,
        }
    };

    let mut record = Record {
        artifact_type: request.artifact_type,
        name,
        path_type,
        remote_path: String::new(),
        compression,
        attributes: request.attributes,
        env: request.env,
        pubdate: Timestamp::now(),
    };
    let fingerprint = record.fingerprint()?;
    record.remote_path = match request.remote_path {
        Some(path) => path,
        None => format!(
            "{ARTIFACTS_DIR}/{}/{fingerprint}/{}",
            record.artifact_type,
            record.compression.packed_name(&record.name)
        ),
    };
    let id = ArtifactId::new(record.artifact_type.clone(), fingerprint);

    let staging = tempfile::tempdir().context("create packing directory")?;
    let payload = match record.compression {
        Compression::None => request.source.clone(),
        Compression::Gzip => {
            let packed = staging.path().join(record.compression.packed_name(&record.name));
            archive::gzip_file(&request.source, &packed).await?;
            packed
        }
        Compression::TarGzip => {
            let packed = staging.path().join(record.compression.packed_name(&record.name));
            archive::pack_tar_gz(&request.source, &record.name, &packed).await?;
            packed
        }
    };

    let written = remote.publish(&record, &payload).await?;
    debug!(%id, written, "upload complete");
    Ok((id, record))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        bail!("invalid payload name: {name:?}");
    }
    Ok(())
}

/// Keys starting with `@` are reserved by the query language (`@any`,
/// `@ignore`, ...), and `=` would make the CLI's `KEY=EXPR` form unparseable.
fn validate_attribute_keys(attributes: &BTreeMap<String, String>) -> Result<()> {
    for key in attributes.keys() {
        if key.is_empty() || key.contains('=') || key.starts_with('@') {
            bail!("invalid attribute key: {key:?}");
        }
    }
    Ok(())
}

/// Env names must be plain POSIX identifiers: the rendered `.env` script is
/// sourced by shells, and anything fancier could change how it parses.
fn validate_env_keys(env: &BTreeMap<String, String>) -> Result<()> {
    for key in env.keys() {
        let mut chars = key.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid environment variable name: {key:?}");
        }
    }
    Ok(())
}
