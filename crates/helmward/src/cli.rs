use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(about, version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the deployment engine's background jobs.
    Serve,

    /// Prune all untagged, non-running projects once and exit.
    Prune,

    /// Adopt an externally created container into the control plane.
    MigrateContainer(MigrateContainerArgs),
}

#[derive(Args)]
pub(crate) struct MigrateContainerArgs {
    /// Name of the container to adopt.
    pub name: String,

    /// Team that will own the adopted container.
    #[arg(long)]
    pub team_id: i64,

    /// Repository to record on the project.
    #[arg(long)]
    pub github_url: Option<String>,

    /// User to record as the deployer.
    #[arg(long)]
    pub deployed_by: Option<i64>,
}
