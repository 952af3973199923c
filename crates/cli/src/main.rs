//! Shadow tree CLI - shadow command

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;
mod util;

/// Shadow - mirror a directory tree and stream its changes
#[derive(Parser)]
#[command(name = "shadow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory and print one line per applied change
    Watch {
        /// Directory to watch
        root: PathBuf,

        /// TOML file with watcher settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Debounce drain interval in milliseconds (overrides the config)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Apply every notification as it arrives (legacy mode)
        #[arg(long)]
        immediate: bool,

        /// Save a tree snapshot here on exit
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Restore the tree from this snapshot after startup
        #[arg(long)]
        restore: Option<PathBuf>,

        /// Print transactions as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Build the shadow tree once and print it as JSON
    Tree {
        /// Directory to mirror
        root: PathBuf,
    },
    /// Print a saved snapshot as JSON
    Show {
        /// Snapshot file written by `watch --snapshot`
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            root,
            config,
            interval_ms,
            immediate,
            snapshot,
            restore,
            json,
        } => {
            let options = cmd::watch::Options {
                root,
                config,
                interval_ms,
                immediate,
                snapshot,
                restore,
                json,
            };
            cmd::watch::run(options).await
        }
        Commands::Tree { root } => cmd::tree::run(&root),
        Commands::Show { snapshot } => cmd::show::run(&snapshot),
    }
}
