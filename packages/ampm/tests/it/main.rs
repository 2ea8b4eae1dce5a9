use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::Result;
use tempfile::TempDir;

use ampm::{
    artifact::{ArtifactId, Record},
    config::{Config, RepoUri},
    resolve::Resolver,
    upload::UploadRequest,
};

pub mod cache;
pub mod query;
pub mod repo;
pub mod upload;

/// A scratch repository and cache for one test.
pub struct Fixture {
    pub repo_dir: TempDir,
    pub cache_dir: TempDir,
    pub work_dir: TempDir,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture {
            repo_dir: TempDir::new().expect("create repository directory"),
            cache_dir: TempDir::new().expect("create cache directory"),
            work_dir: TempDir::new().expect("create work directory"),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            cache_dir: self.cache_dir.path().to_path_buf(),
            repo_uri: Some(RepoUri::File {
                path: self.repo_dir.path().to_path_buf(),
                subdir: None,
            }),
            offline: false,
        }
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.config()).expect("open resolver")
    }

    pub fn offline_resolver(&self) -> Resolver {
        let config = Config {
            offline: true,
            ..self.config()
        };
        Resolver::new(config).expect("open offline resolver")
    }

    /// Write a file under the fixture's scratch area.
    pub async fn stage_file(&self, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = self.work_dir.path().join(name);
        ampm::fs::write(&path, content).await.expect("stage file");
        path
    }
}

/// Upload a single file with the provided attributes and env bindings.
pub async fn upload_file(
    fixture: &Fixture,
    ty: &str,
    name: &str,
    content: &[u8],
    attrs: &[(&str, &str)],
    env: &[(&str, &str)],
) -> Result<(ArtifactId, Record)> {
    let source = fixture.stage_file(name, content).await;
    let request = UploadRequest::builder()
        .source(source)
        .artifact_type(ty.parse()?)
        .attributes(pairs(attrs))
        .env(pairs(env))
        .build();
    fixture.resolver().upload(request).await
}

pub fn pairs(raw: &[(&str, &str)]) -> BTreeMap<String, String> {
    raw.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Recursively collect `(relative path, content)` for every regular file.
pub async fn snapshot_tree(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    use futures::TryStreamExt as _;

    let files = ampm::fs::walk_files(root.to_path_buf())
        .try_collect::<Vec<_>>()
        .await?;
    let mut snapshot = BTreeMap::new();
    for file in files {
        let rel = file
            .strip_prefix(root)
            .expect("walked file is under its root")
            .to_string_lossy()
            .into_owned();
        let content = ampm::fs::must_read_buffered(&file).await?;
        snapshot.insert(rel, content);
    }
    Ok(snapshot)
}
