use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tracing::instrument;

use ampm::{artifact::ArtifactType, upload::UploadRequest};

use super::Global;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// File or directory to publish
    path: PathBuf,

    /// Artifact type to publish under
    #[arg(long = "type", value_name = "TYPE")]
    artifact_type: String,

    /// Location within the share; computed from the fingerprint if omitted
    #[arg(long, value_name = "PATH")]
    remote_path: Option<String>,

    /// Payload name; defaults to the file or directory name
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Store the payload as-is instead of gzip / tar+gzip
    #[arg(long)]
    uncompressed: bool,

    /// Attribute to record, `KEY=VALUE`; repeatable
    #[arg(short = 'a', value_name = "KEY=VALUE")]
    attribute: Vec<String>,

    /// Environment binding to export when sourcing, `NAME=VALUE`; repeatable
    #[arg(short = 'e', value_name = "NAME=VALUE")]
    env: Vec<String>,
}

#[instrument(skip(global))]
pub async fn exec(global: &Global, options: Options) -> Result<()> {
    let attributes = super::parse_pairs(&options.attribute)?;
    let env = super::parse_pairs(&options.env)?;
    let request = UploadRequest::builder()
        .source(options.path)
        .artifact_type(options.artifact_type.parse::<ArtifactType>()?)
        .maybe_name(options.name)
        .maybe_remote_path(options.remote_path)
        .uncompressed(options.uncompressed)
        .attributes(attributes)
        .env(env)
        .build();

    let resolver = global.resolver().await?;
    let (id, _) = resolver.upload(request).await?;
    println!("{id}");
    Ok(())
}
