use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Increase logging output (can be used multiple times)
    #[arg(short, long, global = true, action(ArgAction::Count))]
    pub verbose: u8,
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    RepoAdd(RepoAdd),
    RepoLink(RepoLink),
    RepoList(RepoList),
    RepoSync(RepoSync),
    RepoDel(RepoDel),
    Search(Search),
    Info(Info),
    Resolve(Resolve),
    Download(Download),
}

/// Add or update a repository
#[derive(Debug, Parser)]
pub struct RepoAdd {
    pub name: String,
    pub base_url: String,
    /// Path of repomd.xml relative to the base URL (or an absolute URL)
    #[arg(long = "repomd", default_value = "repodata/repomd.xml")]
    pub repomd: String,
    /// Repository kind
    #[arg(long = "type", default_value = "binary")]
    pub repo_type: String,
    /// Source repository providing the SRPMs for this binary repository
    #[arg(long = "source-repo")]
    pub source_repo: Option<String>,
    /// Sync the repository immediately after adding it
    #[arg(long)]
    pub sync: bool,
}

/// Link a binary repository to the source repository holding its SRPMs
#[derive(Debug, Parser)]
pub struct RepoLink {
    pub binary: String,
    pub source: String,
}

/// List configured repositories
#[derive(Debug, Parser)]
pub struct RepoList {}

/// Fetch repository metadata and rebuild the local package index
#[derive(Debug, Parser)]
pub struct RepoSync {
    pub names: Vec<String>,
    /// Sync every configured repository
    #[arg(short = 'A', long)]
    pub all: bool,
}

/// Delete repositories and their indexed packages
#[derive(Debug, Parser)]
pub struct RepoDel {
    pub names: Vec<String>,
    /// Delete every configured repository
    #[arg(short = 'A', long)]
    pub all: bool,
    /// Do not ask for confirmation
    #[arg(short, long)]
    pub force: bool,
}

/// Search the package index by name and summary
#[derive(Debug, Parser)]
pub struct Search {
    #[arg(required = true)]
    pub patterns: Vec<String>,
    /// Restrict to the given repositories
    #[arg(long = "repo")]
    pub repo: Vec<String>,
    /// Show every matching version instead of the latest per name
    #[arg(long)]
    pub show_duplicates: bool,
}

/// Show the details of one package
#[derive(Debug, Parser)]
pub struct Info {
    pub pattern: String,
    /// Restrict to the given repositories
    #[arg(long = "repo")]
    pub repo: Vec<String>,
}

/// Compute the dependency closure of the given packages
#[derive(Debug, Parser)]
pub struct Resolve {
    #[arg(required = true)]
    pub patterns: Vec<String>,
    /// Restrict to the given repositories
    #[arg(long = "repo")]
    pub repo: Vec<String>,
    /// Follow weak dependencies (recommends and friends) too
    #[arg(long)]
    pub weak: bool,
    /// Walk requirements transitively, optionally bounded to DEPTH levels
    #[arg(long, value_name = "DEPTH", require_equals = true)]
    pub recursive: Option<Option<u32>>,
    /// Preferred architecture for provider selection
    #[arg(long)]
    pub arch: Option<String>,
}

/// Download package artifacts (and optionally their dependencies)
#[derive(Debug, Parser)]
pub struct Download {
    #[arg(required = true)]
    pub patterns: Vec<String>,
    /// Restrict to the given repositories
    #[arg(long = "repo")]
    pub repo: Vec<String>,
    /// Directory to download into (defaults to the configured download path)
    #[arg(long)]
    pub downloaddir: Option<PathBuf>,
    /// Copy finished downloads into this secondary directory as well
    #[arg(long)]
    pub destdir: Option<PathBuf>,
    /// Also download direct dependencies
    #[arg(long)]
    pub resolve: bool,
    /// Walk dependencies transitively, optionally bounded to DEPTH levels
    #[arg(long, value_name = "DEPTH", require_equals = true)]
    pub recurse: Option<Option<u32>>,
    /// Also download the SRPM each selected package was built from
    #[arg(long)]
    pub source: bool,
    /// Print the resolved URLs instead of downloading
    #[arg(long)]
    pub urls: bool,
    /// Preferred architecture for provider selection
    #[arg(long)]
    pub arch: Option<String>,
}
