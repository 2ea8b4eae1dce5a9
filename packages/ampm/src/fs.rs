//! Filesystem operations tailored to `ampm`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using. Every error
//! leaving this module carries the offending path.
//!
//! The repository and cache both live on ordinary POSIX namespaces (the
//! remote is a mounted network share), so the only atomicity primitive any
//! caller may assume is `rename` within a directory.

use std::{fmt::Debug as StdDebug, marker::PhantomData, path::{Path, PathBuf}, sync::Arc};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use futures::Stream;
use tap::TapFallible as _;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{error, instrument, trace};

/// Concurrency used when copying directory trees.
pub const COPY_CONCURRENCY: usize = 8;

/// Exclusive advisory lock file on the file system.
///
/// Lock with [`LockFile::lock`]; unlock with [`LockFile::unlock`] or by
/// dropping the locked instance (the OS releases advisory locks with the
/// process in any case, so a crashed holder never wedges other processes).
#[derive(Debug, Clone, Display)]
#[display("{path:?}")]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    /// Open a lock file at the provided path, creating parents if needed.
    pub async fn open(path: impl Into<PathBuf> + StdDebug) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        let (file, path) = spawn_blocking(move || {
            FsLockFile::open(path.as_path()).map(|file| (file, path))
        })
        .await
        .context("join task")?
        .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Take the lock, blocking until the current holder releases it.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile panics if the handle is already locked,
                // but typestate makes locking a locked handle unrepresentable.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Release the lock.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + StdDebug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Buffer the file content from disk.
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk.
/// Unlike [`read_buffered`], errors if the file doesn't exist.
#[instrument]
pub async fn must_read_buffered(path: impl AsRef<Path> + StdDebug) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Buffer the file content from disk and parse it as UTF-8.
/// Returns `None` if the file does not exist.
#[instrument]
pub async fn read_buffered_utf8(path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk, creating parents if needed.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + StdDebug, content: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Remove a file or symlink.
#[instrument]
pub async fn remove_file(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("remove file: {path:?}"))
        .tap_ok(|_| trace!(?path, "remove file"))
}

/// Remove a file or symlink if it exists; absent is fine.
#[instrument]
pub async fn remove_file_if_exists(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!(?path, "remove file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Remove the directory and all its contents; absent is fine.
#[instrument]
pub async fn remove_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Remove whatever is at the path: file, symlink, or directory tree.
/// Absent is fine.
#[instrument]
pub async fn remove_path(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match symlink_metadata(path).await? {
        None => Ok(()),
        Some(meta) if meta.is_dir() => remove_dir_all(path).await,
        Some(_) => remove_file_if_exists(path).await,
    }
}

/// Rename a file or folder. Atomic within a filesystem; this is the only
/// publication primitive used anywhere in the repository or cache.
#[instrument]
pub async fn rename(src: impl AsRef<Path> + StdDebug, dst: impl AsRef<Path> + StdDebug) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    tokio::fs::rename(src, dst)
        .await
        .with_context(|| format!("rename: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Copy the file from `src` to `dst`, creating parents if needed.
///
/// Returns the total number of bytes copied.
#[instrument]
pub async fn copy_file(src: impl AsRef<Path> + StdDebug, dst: impl AsRef<Path> + StdDebug) -> Result<u64> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await?;
    }
    let bytes = tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("copy file: {src:?} -> {dst:?}"))?;
    trace!(?src, ?dst, ?bytes, "copy file");
    Ok(bytes)
}

/// Walk regular files in a directory recursively.
///
/// Symbolic links and directories are not emitted in the stream.
#[instrument]
pub fn walk_files(root: impl Into<PathBuf> + StdDebug) -> impl Stream<Item = Result<PathBuf>> + Unpin {
    let root = root.into();
    let (tx, rx) = flume::bounded::<Result<PathBuf>>(0);

    spawn_blocking(move || {
        for entry in jwalk::WalkDir::new(&root).skip_hidden(false) {
            let item = entry
                .with_context(|| format!("walk files in {root:?}"))
                .map(|entry| (entry.file_type().is_file(), entry.path()));
            let send = match item {
                Ok((false, _)) => continue,
                Ok((true, path)) => tx.send(Ok(path)),
                Err(err) => tx.send(Err(err)),
            };
            if let Err(send) = send {
                let item = send.into_inner();
                error!(?item, "walk files: receiver dropped");
                return;
            }
        }
    });

    rx.into_stream()
}

/// Recursively copy the regular files under `src` into `dst`.
///
/// Returns the total number of bytes copied across all files.
#[instrument]
pub async fn copy_dir(src: impl AsRef<Path> + StdDebug, dst: impl AsRef<Path> + StdDebug) -> Result<u64> {
    use futures::TryStreamExt as _;

    let (src, dst) = (src.as_ref(), dst.as_ref());
    walk_files(src)
        .map_ok(|src_file| async move {
            let rel = src_file
                .strip_prefix(src)
                .with_context(|| format!("{src_file:?} is not under {src:?}"))?;
            copy_file(&src_file, dst.join(rel)).await
        })
        .try_buffer_unordered(COPY_CONCURRENCY)
        .try_fold(0u64, |total, copied| async move { Ok(total + copied) })
        .await
}

/// Read the *text* of a symbolic link without resolving it.
/// Returns `None` if the path does not exist or is not a symlink.
#[instrument]
pub async fn read_link_text(path: impl AsRef<Path> + StdDebug) -> Result<Option<PathBuf>> {
    let path = path.as_ref();
    match tokio::fs::read_link(path).await {
        Ok(text) => {
            trace!(?path, ?text, "read link");
            Ok(Some(text))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        // Not a symlink at all; callers treat this the same as absent.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(None),
        Err(err) => Err(err).context(format!("read link: {path:?}")),
    }
}

/// Create a symbolic link at `link` whose text is `target`.
/// Any existing file or link at `link` is replaced.
#[instrument]
pub async fn symlink(target: impl AsRef<Path> + StdDebug, link: impl AsRef<Path> + StdDebug) -> Result<()> {
    let (target, link) = (target.as_ref(), link.as_ref());
    remove_file_if_exists(link).await?;
    tokio::fs::symlink(target, link)
        .await
        .with_context(|| format!("symlink: {link:?} -> {target:?}"))
        .tap_ok(|_| trace!(?link, ?target, "symlink"))
}

/// Get the standard metadata for the path, without following symlinks.
/// Returns `None` if the path does not exist.
#[instrument]
pub async fn symlink_metadata(
    path: impl AsRef<Path> + StdDebug,
) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat: {path:?}")),
    }
}

/// Get the standard metadata for the path, following symlinks.
/// Returns `None` if the path does not exist.
#[instrument]
pub async fn metadata(path: impl AsRef<Path> + StdDebug) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat: {path:?}")),
    }
}

/// Check whether the path exists (following symlinks).
///
/// Note that this sort of check is prone to race conditions; if you plan
/// to do anything with the path after checking, you should probably just
/// try the operation and handle the case of the path not existing.
#[instrument]
pub async fn exists(path: impl AsRef<Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.is_ok_and(|found| found)
}

/// Return whether the path is a directory.
/// Returns `false` if it doesn't exist or the metadata can't be read.
#[instrument]
pub async fn is_dir(path: impl AsRef<Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_dir()))
}

/// Return whether the path is a regular file.
/// Returns `false` if it doesn't exist or the metadata can't be read.
#[instrument]
pub async fn is_file(path: impl AsRef<Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_file()))
}

/// A uuid-suffixed temporary sibling of `target`, for write-then-rename.
pub fn temp_sibling(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(uuid::Uuid::new_v4().to_string());
    PathBuf::from(temp)
}
