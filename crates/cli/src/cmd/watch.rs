//! Watch a directory until Ctrl-C

use crate::util;
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use shadow_core::snapshot;
use shadow_watcher::{DispatchMode, TreeWatcher, WatcherConfig};
use std::path::PathBuf;
use tracing::{error, info};

pub struct Options {
    pub root: PathBuf,
    pub config: Option<PathBuf>,
    pub interval_ms: Option<u64>,
    pub immediate: bool,
    pub snapshot: Option<PathBuf>,
    pub restore: Option<PathBuf>,
    pub json: bool,
}

pub async fn run(options: Options) -> Result<()> {
    let config = load_config(&options)?;

    let (mut watcher, initial) = TreeWatcher::new_path_watcher(&options.root, config)
        .with_context(|| format!("Failed to watch {}", options.root.display()))?;

    if let Some(path) = &options.restore {
        let tree = snapshot::load(path)
            .with_context(|| format!("Failed to load snapshot {}", path.display()))?;
        info!("Restored {} nodes from {}", tree.node_count(), path.display());
        watcher.restore(tree);
    }

    let mut events = watcher
        .take_events()
        .context("Events stream already taken")?;
    let mut errors = watcher
        .take_errors()
        .context("Errors stream already taken")?;

    if !options.json {
        println!(
            "Watching {} ({} directories)",
            watcher.root().to_string().cyan(),
            watcher.watched_directories().len()
        );
    }
    util::print_transaction(&initial, options.json)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(transaction) = events.recv() => util::print_transaction(&transaction, options.json)?,
            Some(e) = errors.recv() => error!("{}", e),
            else => break,
        }
    }

    // Apply what is still queued so the snapshot reflects it
    watcher.flush().await;
    while let Ok(transaction) = events.try_recv() {
        util::print_transaction(&transaction, options.json)?;
    }
    while let Ok(e) = errors.try_recv() {
        error!("{}", e);
    }

    let tree = watcher.tree();
    watcher.shutdown().await;

    if let Some(path) = &options.snapshot {
        snapshot::save(&tree, path)
            .with_context(|| format!("Failed to save snapshot {}", path.display()))?;
        if !options.json {
            println!("Saved snapshot to {}", path.display().to_string().cyan());
        }
    }

    Ok(())
}

fn load_config(options: &Options) -> Result<WatcherConfig> {
    let mut config = match &options.config {
        Some(path) => WatcherConfig::load(path)?,
        None => WatcherConfig::default(),
    };
    if let Some(ms) = options.interval_ms {
        config.drain_interval_ms = ms;
    }
    if options.immediate {
        config.mode = DispatchMode::Immediate;
    }
    config.validate()?;
    Ok(config)
}
