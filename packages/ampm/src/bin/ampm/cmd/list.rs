use std::collections::BTreeMap;

use clap::{Args, ValueEnum};
use color_eyre::Result;
use colored::Colorize as _;
use itertools::Itertools as _;
use jiff::Timestamp;
use serde::Serialize;
use tracing::instrument;

use ampm::{
    artifact::{ArtifactType, Compression, PathType, Record},
    query::Query,
};

use super::Global;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Type prefix to list below; omit to list every record
    #[arg(default_value = "")]
    type_prefix: String,

    /// Attribute constraint, `KEY=EXPR`; repeatable
    #[arg(short = 'a', value_name = "KEY=EXPR")]
    attribute: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Pretty)]
    format: Format,

    /// URL prefix prepended to payload locations with `--format=index-file`
    #[arg(long, value_name = "URL")]
    index_file_prefix: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Pretty,
    Json,
    IndexFile,
}

/// `--format=json` row shape: one object per record.
#[derive(Serialize)]
struct JsonEntry<'a> {
    identifier: String,
    #[serde(rename = "type")]
    artifact_type: &'a ArtifactType,
    name: &'a str,
    path_type: PathType,
    compression: Compression,
    attributes: &'a BTreeMap<String, String>,
    env: &'a BTreeMap<String, String>,
    pubdate: Timestamp,
    remote_path: &'a str,
}

#[instrument(skip(global))]
pub async fn exec(global: &Global, options: Options) -> Result<()> {
    let constraints = super::parse_constraints(&options.attribute)?;
    let type_prefix = if options.type_prefix.is_empty() {
        None
    } else {
        Some(options.type_prefix.parse::<ArtifactType>()?)
    };
    let query = Query::new(type_prefix, constraints);

    let resolver = global.resolver().await?;
    let records = resolver.list(&query).await?;

    for (id, record) in &records {
        match options.format {
            Format::Pretty => {
                println!("{} {}", id.to_string().bold(), attribute_summary(record));
            }
            Format::Json => {
                let entry = JsonEntry {
                    identifier: id.to_string(),
                    artifact_type: &record.artifact_type,
                    name: &record.name,
                    path_type: record.path_type,
                    compression: record.compression,
                    attributes: &record.attributes,
                    env: &record.env,
                    pubdate: record.pubdate,
                    remote_path: &record.remote_path,
                };
                println!("{}", serde_json::to_string(&entry)?);
            }
            Format::IndexFile => {
                println!("{id}  {}  {}", attribute_summary(record), location(record, &options));
            }
        }
    }
    Ok(())
}

fn attribute_summary(record: &Record) -> String {
    record
        .attributes
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .join(" ")
}

fn location(record: &Record, options: &Options) -> String {
    match &options.index_file_prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), record.remote_path),
        None => record.remote_path.clone(),
    }
}
