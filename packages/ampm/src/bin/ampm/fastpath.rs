//! The launcher fast path.
//!
//! When the command is exactly `get <id>` or `env <id>` with an exact
//! identifier, the answer is already materialized in the cache's side-files
//! and can be produced with two `std::fs` calls: no runtime, no clap, no
//! locks, no network. Any miss at all falls through to the full resolver.
//!
//! This is purely an optimization; correctness never depends on it. In
//! particular the `.target` symlink's *text* is read, never resolved, and a
//! link pointing at something that no longer exists falls through rather
//! than printing a bogus path.

use std::{path::PathBuf, process::ExitCode};

use lazy_regex::regex_captures;

use ampm::{
    config::{CACHE_DIR_ENV, DEFAULT_CACHE_DIR},
    remote::METADATA_DIR,
};

pub fn try_exec() -> Option<ExitCode> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let [verb, id] = args.as_slice() else {
        return None;
    };
    let (_, artifact_type, fingerprint) = regex_captures!(r"^(.+):([a-z0-9]{32})$", id)?;

    let cache_dir =
        std::env::var(CACHE_DIR_ENV).unwrap_or_else(|_| DEFAULT_CACHE_DIR.to_string());
    let side_file = |ext: &str| {
        PathBuf::from(&cache_dir)
            .join(METADATA_DIR)
            .join(artifact_type)
            .join(format!("{fingerprint}.{ext}"))
    };

    match verb.as_str() {
        "get" => {
            let text = std::fs::read_link(side_file("target")).ok()?;
            std::fs::symlink_metadata(&text).ok()?;
            println!("{}", text.display());
            Some(ExitCode::SUCCESS)
        }
        "env" => {
            let script = std::fs::read_to_string(side_file("env")).ok()?;
            print!("{script}");
            Some(ExitCode::SUCCESS)
        }
        _ => None,
    }
}
