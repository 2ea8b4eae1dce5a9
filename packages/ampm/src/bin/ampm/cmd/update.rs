use clap::Args;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::instrument;

use super::Global;

/// Installer-owned script that replaces the running `ampm`.
const UPDATE_SCRIPT: &str = "/opt/ampm/update.sh";

#[derive(Clone, Debug, Args)]
pub struct Options {}

#[instrument(skip(_global))]
pub async fn exec(_global: &Global, _options: Options) -> Result<()> {
    let status = tokio::process::Command::new(UPDATE_SCRIPT)
        .status()
        .await
        .with_context(|| format!("run {UPDATE_SCRIPT}"))?;
    if !status.success() {
        bail!("update script exited with {status}");
    }
    Ok(())
}
