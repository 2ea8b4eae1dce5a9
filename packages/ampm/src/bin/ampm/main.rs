//! The binary entrypoint for `ampm`, the artifact store and fetcher.

use std::process::ExitCode;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::Result;
use colored::Colorize as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use ampm::error::{self, Fault};

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod cmd;
mod fastpath;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "ampm",
    about = "Content-addressed artifact store and fetcher",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Repository URI, overriding the installer's repo_uri file
    #[arg(long, global = true, env = "AMPM_SERVER")]
    server: Option<String>,

    /// Resolve from the local cache only; never touch the repository
    #[arg(long, global = true)]
    offline: bool,

    /// When to colorize output
    #[arg(long, value_enum, global = true, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Resolve an artifact and print its payload path
    Get(cmd::get::Options),

    /// Resolve an artifact and print its environment exports
    Env(cmd::env::Options),

    /// List records, optionally below a type prefix
    List(cmd::list::Options),

    /// Publish a file or directory as a new artifact
    Upload(cmd::upload::Options),

    /// Remove a record and its payload from the repository, hash-exact
    #[command(name = "remote-rm")]
    RemoteRm(cmd::remote_rm::Options),

    /// Run the installer's update script
    Update(cmd::update::Options),
}

fn main() -> ExitCode {
    // Exact-identifier lookups answer from pre-materialized side-files
    // before clap or the runtime spin up; anything else falls through.
    if let Some(code) = fastpath::try_exec() {
        return code;
    }
    run()
}

#[tokio::main]
async fn run() -> ExitCode {
    match exec().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            let kind = match error::classify(&report) {
                Some(fault) => format!("{fault}"),
                None => format!("{report:#}"),
            };
            eprintln!("{} {kind}", "ampm:".red());
            ExitCode::from(error::exit_code(&report))
        }
    }
}

async fn exec() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    match top.color {
        log::WhenColor::Always => colored::control::set_override(true),
        log::WhenColor::Never => colored::control::set_override(false),
        log::WhenColor::Auto => {}
    }
    log::make_logger(std::io::stderr, top.color)?.init();

    let global = cmd::Global {
        server: top.server,
        offline: top.offline,
    };
    let work = async {
        match top.command {
            Command::Get(opts) => cmd::get::exec(&global, opts).await,
            Command::Env(opts) => cmd::env::exec(&global, opts).await,
            Command::List(opts) => cmd::list::exec(&global, opts).await,
            Command::Upload(opts) => cmd::upload::exec(&global, opts).await,
            Command::RemoteRm(opts) => cmd::remote_rm::exec(&global, opts).await,
            Command::Update(opts) => cmd::update::exec(&global, opts).await,
        }
    };

    // Dropping the command future on interrupt unwinds its staging guards,
    // so a cancelled fetch leaves no partial state behind.
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => Err(Fault::Interrupted.into()),
    }
}
