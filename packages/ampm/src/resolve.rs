//! The resolver: composes the query engine, local cache, and remote gateway.
//!
//! Exact `type:fingerprint` inputs skip the query engine entirely; queries
//! scan the repository (or, offline, the cache's own metadata tree), reduce
//! to one record, and materialize it through the cache.

use std::path::PathBuf;

use color_eyre::{Result, eyre::bail};
use futures::TryStreamExt as _;
use tracing::instrument;

use crate::{
    artifact::{ArtifactId, ArtifactType, Record},
    cache::LocalCache,
    config::Config,
    error::Fault,
    query::{Constraint, Query},
    remote::{RemoteRepo, scan_records},
    upload::{self, UploadRequest},
};

/// What a command-line invocation is asking for.
#[derive(Clone, Debug)]
pub enum Target {
    /// An exact identifier: no query engine involved.
    Exact(ArtifactId),
    /// A type prefix plus attribute constraints.
    Search(Query),
}

impl Target {
    /// Interpret a `<id-or-type>` argument together with `-a` constraints.
    pub fn parse(spec: &str, constraints: Vec<Constraint>) -> Result<Self> {
        if spec.contains(':') {
            let id: ArtifactId = spec.parse()?;
            if !constraints.is_empty() {
                return Err(Fault::MalformedExpression(format!(
                    "attribute constraints cannot be combined with exact identifier {id}"
                ))
                .into());
            }
            return Ok(Target::Exact(id));
        }
        let type_prefix = if spec.is_empty() {
            None
        } else {
            Some(spec.parse::<ArtifactType>()?)
        };
        Ok(Target::Search(Query::new(type_prefix, constraints)))
    }
}

/// One invocation's view of the cache and repository. Stateless between
/// invocations: the filesystem is the only shared state.
#[derive(Clone, Debug)]
pub struct Resolver {
    cache: LocalCache,
    config: Config,
}

impl Resolver {
    pub fn new(config: Config) -> Result<Self> {
        let cache = LocalCache::open(&config.cache_dir)?;
        Ok(Self { cache, config })
    }

    /// The local cache this resolver materializes into.
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Connect to the configured repository. Fails offline.
    async fn remote(&self) -> Result<RemoteRepo> {
        if self.config.offline {
            bail!("offline mode: the remote repository is unavailable");
        }
        RemoteRepo::open(self.config.share_root()?).await
    }

    /// Resolve the target to exactly one record.
    #[instrument(skip(self))]
    async fn resolve(&self, target: &Target) -> Result<(ArtifactId, Record)> {
        match target {
            Target::Exact(id) => {
                // The cached copy of the record is authoritative (records
                // are immutable), so a warm cache needs no network at all.
                if let Some(record) = self.cache.cached_record(id).await? {
                    return Ok((id.clone(), record));
                }
                if self.config.offline {
                    return Err(Fault::OfflineMiss(id.to_string()).into());
                }
                match self.remote().await?.read_record(id).await? {
                    Some(record) => Ok((id.clone(), record)),
                    None => Err(Fault::NotFound(id.to_string()).into()),
                }
            }
            Target::Search(query) => {
                let candidates = self.candidates(query.type_prefix.as_ref()).await?;
                query.select_one(candidates)
            }
        }
    }

    /// Enumerate candidate records below the type prefix.
    async fn candidates(
        &self,
        prefix: Option<&ArtifactType>,
    ) -> Result<Vec<(ArtifactId, Record)>> {
        if self.config.offline {
            scan_records(self.cache.metadata_root(), prefix)
                .try_collect()
                .await
        } else {
            self.remote().await?.list(prefix).try_collect().await
        }
    }

    /// Materialize the record's payload and return its absolute path.
    async fn materialize(&self, id: &ArtifactId, record: &Record) -> Result<PathBuf> {
        if let Some(path) = self.cache.lookup(id).await? {
            return Ok(path);
        }
        if self.config.offline {
            return Err(Fault::OfflineMiss(id.to_string()).into());
        }
        let remote = self.remote().await?;
        self.cache.ensure_local(record, &remote).await
    }

    /// Resolve and materialize: the payload's filesystem path.
    #[instrument(skip(self))]
    pub async fn get(&self, target: &Target) -> Result<PathBuf> {
        let (id, record) = self.resolve(target).await?;
        self.materialize(&id, &record).await
    }

    /// Resolve, materialize, and return the artifact's environment script.
    #[instrument(skip(self))]
    pub async fn env(&self, target: &Target) -> Result<String> {
        let (id, record) = self.resolve(target).await?;
        self.materialize(&id, &record).await?;
        self.cache
            .env_script(&id)
            .await?
            .ok_or_else(|| Fault::IoError(format!("missing env script for {id}")).into())
    }

    /// All records passing the query's filter stage, unreduced.
    #[instrument(skip(self))]
    pub async fn list(&self, query: &Query) -> Result<Vec<(ArtifactId, Record)>> {
        let candidates = self.candidates(query.type_prefix.as_ref()).await?;
        query.filter(candidates)
    }

    /// Publish a new artifact.
    #[instrument(skip(self, request))]
    pub async fn upload(&self, request: UploadRequest) -> Result<(ArtifactId, Record)> {
        let remote = self.remote().await?;
        upload::upload(&remote, request).await
    }

    /// Remove a record (and its payload) from the repository, hash-exact.
    #[instrument(skip(self))]
    pub async fn remote_rm(&self, id: &ArtifactId) -> Result<()> {
        self.remote().await?.remove(id).await
    }
}
