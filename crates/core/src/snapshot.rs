//! Tree snapshots for restoring a shadow tree after a restart
//!
//! Format:
//! - magic: "SHD1" (4 bytes)
//! - version: u32 (little endian)
//! - root: bincode-encoded [`Node`]
//!
//! Writes go to a temporary file in the target directory which is then
//! renamed over the target, so a crash never leaves a torn snapshot.

use crate::error::{Error, Result};
use crate::tree::Node;
use bincode::Options;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: [u8; 4] = *b"SHD1";
const VERSION: u32 = 1;

fn encoding() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Persist `root` at `target`, replacing any previous snapshot atomically
pub fn save(root: &Node, target: &Path) -> Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(snapshot_error)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        writer.write_all(&MAGIC).map_err(snapshot_error)?;
        writer
            .write_all(&VERSION.to_le_bytes())
            .map_err(snapshot_error)?;
        encoding()
            .serialize_into(&mut writer, root)
            .map_err(snapshot_error)?;
        writer.flush().map_err(snapshot_error)?;
    }
    tmp.as_file().sync_all().map_err(snapshot_error)?;
    tmp.persist(target).map_err(|e| snapshot_error(e.error))?;
    Ok(())
}

/// Load a snapshot written by [`save`]
pub fn load(source: &Path) -> Result<Node> {
    let file = File::open(source).map_err(snapshot_error)?;
    let len = file.metadata().map_err(snapshot_error)?.len();
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 8];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::Snapshot(format!("{} is not a tree snapshot", source.display())))?;
    if header[..4] != MAGIC {
        return Err(Error::Snapshot(format!(
            "{} is not a tree snapshot",
            source.display()
        )));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != VERSION {
        return Err(Error::Snapshot(format!(
            "unsupported snapshot version {}",
            version
        )));
    }

    // Bound decoding by the file size so corrupt lengths cannot balloon
    encoding()
        .with_limit(len)
        .deserialize_from(reader)
        .map_err(snapshot_error)
}

fn snapshot_error(e: impl std::fmt::Display) -> Error {
    Error::Snapshot(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Metadata;
    use tempfile::TempDir;

    fn sample_tree() -> Node {
        let mut root = Node::root("data");
        let mut dir = Node::new("a", Metadata::directory(), None);
        dir.children.insert(
            "f.txt".to_string(),
            Node::new("f.txt", Metadata::file("abc123".to_string()), None),
        );
        root.children.insert("a".to_string(), dir);
        root
    }

    #[test]
    fn test_saved_tree_loads_identically() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("tree.snap");
        let tree = sample_tree();

        save(&tree, &target).unwrap();
        let loaded = load(&target).unwrap();

        assert_eq!(loaded, tree);
        // No temp files left behind
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("tree.snap");

        save(&Node::root("old"), &target).unwrap();
        save(&sample_tree(), &target).unwrap();
        assert_eq!(load(&target).unwrap().name, "data");
    }

    #[test]
    fn test_load_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("junk.snap");
        std::fs::write(&target, b"definitely not a snapshot").unwrap();

        assert!(matches!(load(&target), Err(Error::Snapshot(_))));
        assert!(matches!(
            load(&temp_dir.path().join("missing.snap")),
            Err(Error::Snapshot(_))
        ));
    }
}
