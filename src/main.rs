pub mod args;
pub mod chksums;
pub mod compression;
pub mod config;
pub mod db;
pub mod errors;
pub mod fetcher;
pub mod metadata;
pub mod nevra;
pub mod ops;
pub mod resolver;

use crate::args::{Args, SubCommand};
use crate::config::Config;
use crate::errors::*;
use crate::ops::Operations;
use clap::Parser;
use env_logger::Env;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = match args.verbose {
        0 => "windnf=info",
        1 => "info,windnf=debug",
        2 => "debug",
        3 => "debug,windnf=trace",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if debug_enabled() {
                eprintln!("error: {err:?}");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load()?;
    let ops = Operations::new(config).await?;

    let command = async {
        match args.subcommand {
            SubCommand::RepoAdd(args) => ops.repo_add(&args).await,
            SubCommand::RepoLink(args) => ops.repo_link(&args).await,
            SubCommand::RepoList(_) => ops.repo_list().await,
            SubCommand::RepoSync(args) => ops.repo_sync(&args).await,
            SubCommand::RepoDel(args) => ops.repo_del(&args).await,
            SubCommand::Search(args) => ops.search(&args).await,
            SubCommand::Info(args) => ops.info(&args).await,
            SubCommand::Resolve(args) => ops.resolve(&args).await,
            SubCommand::Download(args) => ops.download(&args).await,
        }
    };

    // an interrupt aborts the in-flight operation; open store transactions
    // roll back and temp files are cleaned by their finalizers
    tokio::select! {
        result = command => result,
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    }
}

fn debug_enabled() -> bool {
    std::env::var("WINDNF_DEBUG")
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false" && value != "no"
        })
        .unwrap_or(false)
}
