//! Configuration for `ampm`.
//!
//! The repository location comes from, in order of precedence: the
//! `--server` flag, the `AMPM_SERVER` environment variable, and the
//! `/opt/ampm/repo_uri` file written by the installer. The cache root comes
//! from `AMPM_CACHE_DIR` and defaults to `/var/ampm`.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::Display;
use tracing::{debug, instrument};
use url::Url;

use crate::fs;

/// Default local cache root.
pub const DEFAULT_CACHE_DIR: &str = "/var/ampm";

/// File written by the installer naming the repository to use.
pub const REPO_URI_PATH: &str = "/opt/ampm/repo_uri";

/// Overrides the cache root.
pub const CACHE_DIR_ENV: &str = "AMPM_CACHE_DIR";

/// Overrides the repository URI from [`REPO_URI_PATH`].
pub const SERVER_ENV: &str = "AMPM_SERVER";

/// Where a repository lives.
///
/// `nfs://<host><export>#<subdir>` names an NFS export; mounting it is the
/// installer's job, and the gateway expects to find it under the cache's
/// `mnt/` tree. `file://<path>#<subdir>` names a local directory directly.
/// In both forms the fragment is a subdirectory beneath the share root.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
pub enum RepoUri {
    #[display("file://{}{}", path.display(), fragment(subdir))]
    File {
        path: PathBuf,
        subdir: Option<String>,
    },
    #[display("nfs://{host}{}{}", export.display(), fragment(subdir))]
    Nfs {
        host: String,
        export: PathBuf,
        subdir: Option<String>,
    },
}

fn fragment(subdir: &Option<String>) -> String {
    match subdir {
        Some(subdir) => format!("#{subdir}"),
        None => String::new(),
    }
}

impl RepoUri {
    /// The directory the repository root is expected at, given the cache
    /// root. For NFS this is where the installer mounts the export:
    /// `<cache>/mnt/<host>/<export>`.
    pub fn share_root(&self, cache_dir: &Path) -> PathBuf {
        match self {
            RepoUri::File { path, subdir } => join_subdir(path.clone(), subdir),
            RepoUri::Nfs {
                host,
                export,
                subdir,
            } => {
                let mount = cache_dir
                    .join("mnt")
                    .join(host)
                    .join(export.strip_prefix("/").unwrap_or(export));
                join_subdir(mount, subdir)
            }
        }
    }
}

fn join_subdir(root: PathBuf, subdir: &Option<String>) -> PathBuf {
    match subdir {
        Some(subdir) => root.join(subdir),
        None => root,
    }
}

impl std::str::FromStr for RepoUri {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s).with_context(|| format!("parse repository uri: {s:?}"))?;
        let subdir = match url.fragment() {
            Some("") | None => None,
            Some(fragment) => {
                let fragment = fragment.trim_matches('/');
                if fragment.is_empty() || fragment.split('/').any(|seg| seg.is_empty() || seg == "..") {
                    bail!("invalid subdirectory fragment in repository uri: {s:?}");
                }
                Some(fragment.to_string())
            }
        };
        match url.scheme() {
            "file" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    bail!("file repository uri has no path: {s:?}");
                }
                Ok(RepoUri::File {
                    path: PathBuf::from(path),
                    subdir,
                })
            }
            "nfs" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| eyre!("nfs repository uri has no host: {s:?}"))?
                    .to_string();
                let export = url.path();
                if export.is_empty() || export == "/" {
                    bail!("nfs repository uri has no export path: {s:?}");
                }
                Ok(RepoUri::Nfs {
                    host,
                    export: PathBuf::from(export),
                    subdir,
                })
            }
            other => bail!("unsupported repository uri scheme {other:?} in {s:?}"),
        }
    }
}

/// Resolved invocation configuration.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Config {
    /// Local cache root. Always absolute.
    pub cache_dir: PathBuf,

    /// The configured repository, if any. Offline invocations may have none.
    pub repo_uri: Option<RepoUri>,

    /// Resolve from the local cache only; never touch the remote.
    pub offline: bool,
}

impl Config {
    /// Load configuration for one invocation.
    ///
    /// `server` is the value of the `--server` flag (clap also fills it from
    /// `AMPM_SERVER`); when absent the installer's `repo_uri` file is
    /// consulted. A missing repository is only an error for operations that
    /// actually need one, so it is not an error here.
    #[instrument]
    pub async fn load(server: Option<&str>, offline: bool) -> Result<Self> {
        let cache_dir = match std::env::var_os(CACHE_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(DEFAULT_CACHE_DIR),
        };
        let cache_dir = std::path::absolute(&cache_dir)
            .with_context(|| format!("resolve cache dir: {cache_dir:?}"))?;

        let repo_uri = match server {
            Some(uri) => Some(uri.parse::<RepoUri>()?),
            None => match fs::read_buffered_utf8(REPO_URI_PATH).await? {
                Some(contents) => {
                    let line = contents.trim();
                    if line.is_empty() {
                        None
                    } else {
                        Some(
                            line.parse::<RepoUri>()
                                .with_context(|| format!("parse {REPO_URI_PATH}"))?,
                        )
                    }
                }
                None => None,
            },
        };

        debug!(?cache_dir, ?repo_uri, ?offline, "loaded configuration");
        Ok(Self {
            cache_dir,
            repo_uri,
            offline,
        })
    }

    /// The repository root directory, or an error naming how to configure one.
    pub fn share_root(&self) -> Result<PathBuf> {
        let uri = self.repo_uri.as_ref().ok_or_else(|| {
            eyre!(
                "no repository configured: pass --server, set {SERVER_ENV}, \
                 or write {REPO_URI_PATH}"
            )
        })?;
        Ok(uri.share_root(&self.cache_dir))
    }
}
