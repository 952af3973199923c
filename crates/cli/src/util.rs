//! Shared output helpers for CLI commands

use anyhow::Result;
use owo_colors::OwoColorize;
use shadow_watcher::{EventKind, Transaction};

/// Print one transaction, as a JSON line or a colored summary
pub fn print_transaction(transaction: &Transaction, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(transaction)?);
    } else {
        println!("{}", describe(transaction));
    }
    Ok(())
}

/// Human-readable one-line summary
pub fn describe(transaction: &Transaction) -> String {
    let kind = format!("{:<6}", transaction.kind.to_string());
    let kind = match transaction.kind {
        EventKind::Create => kind.green().to_string(),
        EventKind::Write => kind.yellow().to_string(),
        EventKind::Remove => kind.red().to_string(),
        EventKind::Rename | EventKind::Move => kind.magenta().to_string(),
    };

    let mut line = format!("{} {}", kind, transaction.path);
    if let Some(previous) = &transaction.previous {
        line.push_str(&format!(" {}", format!("(from {})", previous).dimmed()));
    }

    let node = &transaction.node;
    if node.is_dir() {
        let nodes = node.node_count();
        if nodes > 1 {
            line.push_str(&format!(" {}", format!("[{} nodes]", nodes).dimmed()));
        }
    } else if !node.meta.checksum.is_empty() && transaction.kind != EventKind::Remove {
        line.push_str(&format!(" {}", short_checksum(&node.meta.checksum).dimmed()));
    }
    line
}

/// First 12 characters of a checksum
pub fn short_checksum(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}
