use std::collections::BTreeMap;

use color_eyre::Result;

use ampm::{config::Config, error::Fault, query::Constraint, resolve::Resolver};

pub mod env;
pub mod get;
pub mod list;
pub mod remote_rm;
pub mod update;
pub mod upload;

/// Flags shared by every subcommand.
#[derive(Clone, Debug)]
pub struct Global {
    pub server: Option<String>,
    pub offline: bool,
}

impl Global {
    /// Load configuration and build the resolver for this invocation.
    pub async fn resolver(&self) -> Result<Resolver> {
        let config = Config::load(self.server.as_deref(), self.offline).await?;
        Resolver::new(config)
    }
}

/// Parse repeated `-a KEY=EXPR` arguments.
pub fn parse_constraints(raw: &[String]) -> Result<Vec<Constraint>> {
    raw.iter()
        .map(|arg| Constraint::parse(arg).map_err(Into::into))
        .collect()
}

/// Parse repeated `KEY=VALUE` arguments into a map, rejecting duplicates.
pub fn parse_pairs(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for arg in raw {
        let (key, value) = arg.split_once('=').ok_or_else(|| {
            Fault::MalformedExpression(format!("expected KEY=VALUE, got {arg:?}"))
        })?;
        if pairs
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            return Err(Fault::MalformedExpression(format!("duplicate key {key:?}")).into());
        }
    }
    Ok(pairs)
}
