use clap::Args;
use color_eyre::Result;
use tracing::instrument;

use ampm::resolve::Target;

use super::Global;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Artifact identifier (`type:fingerprint`) or type to query
    spec: String,

    /// Attribute constraint, `KEY=EXPR`; repeatable
    #[arg(short = 'a', value_name = "KEY=EXPR")]
    attribute: Vec<String>,
}

#[instrument(skip(global))]
pub async fn exec(global: &Global, options: Options) -> Result<()> {
    let constraints = super::parse_constraints(&options.attribute)?;
    let target = Target::parse(&options.spec, constraints)?;
    let resolver = global.resolver().await?;

    // The script is already newline-terminated; suitable for `eval "$(...)"`.
    let script = resolver.env(&target).await?;
    print!("{script}");
    Ok(())
}
