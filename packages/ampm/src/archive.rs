//! Payload packing and unpacking.
//!
//! Single files travel as gzip streams; directory trees travel as `tar+gzip`
//! archives with one top-level directory named for the artifact. Tar handling
//! goes through the blocking `tar`/`flate2` stack on a blocking thread, which
//! preserves relative paths, symbolic links, and mode bits; directory entries
//! are created before their contents because the builder walks top-down.

use std::path::Path;

use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use color_eyre::{Result, eyre::Context};
use tap::TapFallible as _;
use tokio::{
    io::{AsyncWriteExt as _, BufReader},
    task::spawn_blocking,
};
use tracing::{instrument, trace};

use crate::fs;

/// Gzip-compress the file at `src` to `dst`.
///
/// Returns the number of uncompressed bytes consumed.
#[instrument]
pub async fn gzip_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open file: {src:?}"))?;
    let writer = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create file: {dst:?}"))?;

    let mut encoder = GzipEncoder::new(writer);
    let bytes = tokio::io::copy(&mut reader, &mut encoder)
        .await
        .with_context(|| format!("compress {src:?} to {dst:?}"))?;
    encoder.shutdown().await.context("flush gzip encoder")?;
    encoder.into_inner().flush().await.context("flush file")?;

    trace!(?src, ?dst, ?bytes, "gzip file");
    Ok(bytes)
}

/// Decompress the gzip stream at `src` into the file at `dst`.
///
/// Returns the number of uncompressed bytes produced.
#[instrument]
pub async fn gunzip_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open file: {src:?}"))?;
    let mut decoder = GzipDecoder::new(BufReader::new(reader));
    let mut writer = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create file: {dst:?}"))?;

    let bytes = tokio::io::copy(&mut decoder, &mut writer)
        .await
        .with_context(|| format!("decompress {src:?} to {dst:?}"))?;
    writer.flush().await.context("flush file")?;

    trace!(?src, ?dst, ?bytes, "gunzip file");
    Ok(bytes)
}

/// Pack the directory at `src` into a `tar+gzip` archive at `dst`, with all
/// entries under a single top-level directory named `root_name`.
#[instrument]
pub async fn pack_tar_gz(src: &Path, root_name: &str, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    let src = src.to_path_buf();
    let root_name = root_name.to_string();
    let dst = dst.to_path_buf();
    spawn_blocking(move || -> Result<()> {
        let file =
            std::fs::File::create(&dst).with_context(|| format!("create archive: {dst:?}"))?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(&root_name, &src)
            .with_context(|| format!("archive {src:?}"))?;
        builder
            .into_inner()
            .context("finish archive")?
            .finish()
            .context("finish gzip stream")?;
        Ok(())
    })
    .await
    .context("join task")?
    .tap_ok(|_| trace!("packed tar+gzip archive"))
}

/// Unpack the `tar+gzip` archive at `src` into `dst_dir`.
///
/// Relative paths, symbolic links, and mode bits are preserved.
#[instrument]
pub async fn unpack_tar_gz(src: &Path, dst_dir: &Path) -> Result<()> {
    fs::create_dir_all(dst_dir).await?;
    let src = src.to_path_buf();
    let dst_dir = dst_dir.to_path_buf();
    spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&src).with_context(|| format!("open archive: {src:?}"))?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive
            .unpack(&dst_dir)
            .with_context(|| format!("unpack {src:?} into {dst_dir:?}"))?;
        Ok(())
    })
    .await
    .context("join task")?
    .tap_ok(|_| trace!("unpacked tar+gzip archive"))
}
