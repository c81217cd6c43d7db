//! ferry - move files between a local workspace and a remote server.
//!
//! Usage:
//!   ferry upload <PATH>...      Upload local files to the mirrored remote paths
//!   ferry download <PATH>...    Download remote files into the workspace
//!   ferry diff <PATH>           Compare a local file with its remote copy
//!   ferry mkdir|rm|rmdir|mv|touch  Remote file operations

mod commands;
mod progress;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Move files between a local workspace and a remote server"
)]
struct Cli {
    /// Service config file (one JSON object or an array of them)
    #[arg(short, long, default_value = "ferry.json", global = true)]
    config: PathBuf,

    /// Service to use when the config file defines several
    #[arg(short, long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload local files to their mirrored remote paths
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of transfers to run at once
        #[arg(short, long, default_value = "4")]
        jobs: usize,
    },

    /// Download remote files into the local workspace
    Download {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Number of transfers to run at once
        #[arg(short, long, default_value = "4")]
        jobs: usize,
    },

    /// Compare a local file with its remote counterpart
    Diff { path: PathBuf },

    /// Create a remote directory
    Mkdir {
        path: String,

        /// Create missing parent directories
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove a remote file
    Rm {
        path: String,

        /// Remove a directory and its contents
        #[arg(short, long)]
        recursive: bool,
    },

    /// Remove a remote directory and its contents
    Rmdir { path: String },

    /// Rename a remote file or directory
    Mv { from: String, to: String },

    /// Create an empty remote file; fails if it exists
    Touch { path: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    info!("ferry {VERSION}");
    let service = commands::load_service(&cli.config, cli.name.as_deref())?;

    match cli.command {
        Command::Upload { paths, jobs } => commands::upload(&service, &paths, jobs).await,
        Command::Download { paths, jobs } => commands::download(&service, &paths, jobs).await,
        Command::Diff { path } => commands::diff(&service, &path).await,
        Command::Mkdir { path, parents } => commands::mkdir(&service, &path, parents).await,
        Command::Rm { path, recursive } => commands::rm(&service, &path, recursive).await,
        Command::Rmdir { path } => commands::rm(&service, &path, true).await,
        Command::Mv { from, to } => commands::mv(&service, &from, &to).await,
        Command::Touch { path } => commands::touch(&service, &path).await,
    }
}
