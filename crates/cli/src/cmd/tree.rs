//! Build the shadow tree of a directory once

use anyhow::{Context, Result};
use shadow_core::{Blake3Checksum, Node, RelativePath, SourcePath};
use std::path::Path;

pub fn run(root: &Path) -> Result<()> {
    let tree = build(root)?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

pub fn build(root: &Path) -> Result<Node> {
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("Failed to resolve {}", root.display()))?;
    let source = SourcePath::fs(&root);
    if source.name().is_empty() {
        return Err(shadow_core::Error::UnnamedRoot(root).into());
    }

    let mut tree = Node::root(source.name());
    tree.create(
        &RelativePath::parse(&source.name()),
        &source,
        &Blake3Checksum::default(),
        None,
        &mut |_| {},
    )
    .with_context(|| format!("Failed to read {}", root.display()))?;
    Ok(tree)
}
