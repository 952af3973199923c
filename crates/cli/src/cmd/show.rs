//! Print a saved snapshot

use anyhow::{Context, Result};
use std::path::Path;

pub fn run(path: &Path) -> Result<()> {
    let tree = shadow_core::snapshot::load(path)
        .with_context(|| format!("Failed to load snapshot {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}
