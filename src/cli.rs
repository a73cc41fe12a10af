// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cutover")]
#[command(about = "Zero-downtime deployment orchestration for local services")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new cutover.yml configuration file
    Init {
        /// Service name written into the template
        #[arg(short, long)]
        service: Option<String>,

        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },

    /// Deploy a new version of the service
    Deploy {
        /// Version label to deploy
        version: String,

        /// Path to the artifact to roll out
        #[arg(short, long)]
        artifact: PathBuf,
    },

    /// Roll back to the previously deployed version
    Rollback {
        /// Deployment to roll back (defaults to the most recent eligible one)
        #[arg(long)]
        id: Option<String>,
    },

    /// Show service and deployment status
    Status,
}
