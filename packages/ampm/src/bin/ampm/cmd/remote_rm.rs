use clap::Args;
use color_eyre::Result;
use tracing::instrument;

use ampm::artifact::ArtifactId;

use super::Global;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Exact identifier (`type:fingerprint`) of the record to remove
    id: String,

    /// Acknowledge that removal is permanent and repository-wide
    #[arg(
        long = "i-realise-this-may-break-other-peoples-builds-in-the-future",
        required = true
    )]
    acknowledged: bool,
}

#[instrument(skip(global))]
pub async fn exec(global: &Global, options: Options) -> Result<()> {
    let id: ArtifactId = options.id.parse()?;
    let resolver = global.resolver().await?;
    resolver.remote_rm(&id).await?;
    println!("removed {id}");
    Ok(())
}
