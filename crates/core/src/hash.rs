//! Content checksums for file nodes
//!
//! File nodes record a BLAKE3 digest of their content as lowercase hex.
//! Directories never carry a checksum.

use crate::error::{Error, Result};
use crate::path::SourcePath;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Default size above which files are hashed through a memory map
pub const DEFAULT_MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// A BLAKE3 digest (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct Blake3Hash([u8; 32]);

impl Blake3Hash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        const HEX_CHARS: &[u8] = b"0123456789abcdef";
        let mut hex = String::with_capacity(64);
        for &byte in &self.0 {
            hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
            hex.push(HEX_CHARS[(byte & 0xf) as usize] as char);
        }
        hex
    }
}

impl std::fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blake3Hash({})", self.to_hex())
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn hash_bytes(data: &[u8]) -> Blake3Hash {
    Blake3Hash::from_bytes(*blake3::hash(data).as_bytes())
}

/// Hash a file by streaming it through an 8KB buffer
pub fn hash_file(path: &Path) -> std::io::Result<Blake3Hash> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Blake3Hash::from_bytes(*hasher.finalize().as_bytes()))
}

/// Hash a file through a read-only memory map
pub fn hash_file_mmap(path: &Path) -> std::io::Result<Blake3Hash> {
    use memmap2::Mmap;

    let file = File::open(path)?;
    // The map is dropped before returning; a concurrent truncation can at
    // worst produce a stale digest, which the next Write event corrects.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(hash_bytes(&mmap))
}

/// Computes the checksum recorded on file nodes
pub trait Checksum: Send + Sync {
    fn checksum(&self, path: &SourcePath) -> Result<String>;
}

impl<F> Checksum for F
where
    F: Fn(&SourcePath) -> Result<String> + Send + Sync,
{
    fn checksum(&self, path: &SourcePath) -> Result<String> {
        self(path)
    }
}

/// BLAKE3 checksum provider
///
/// Small files are streamed, large ones are memory-mapped. Virtual paths
/// have no content and checksum to the empty string.
#[derive(Debug, Clone)]
pub struct Blake3Checksum {
    mmap_threshold: u64,
}

impl Blake3Checksum {
    pub fn new(mmap_threshold: u64) -> Self {
        Self { mmap_threshold }
    }
}

impl Default for Blake3Checksum {
    fn default() -> Self {
        Self::new(DEFAULT_MMAP_THRESHOLD)
    }
}

impl Checksum for Blake3Checksum {
    fn checksum(&self, path: &SourcePath) -> Result<String> {
        let fs_path = match path {
            SourcePath::Fs(fs_path) => fs_path,
            SourcePath::Virtual { .. } => return Ok(String::new()),
        };

        let to_error = |source: std::io::Error| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::PathDoesNotExist(fs_path.clone())
            } else {
                Error::Checksum {
                    path: fs_path.clone(),
                    source,
                }
            }
        };

        let len = std::fs::metadata(fs_path).map_err(to_error)?.len();
        let hash = if len > self.mmap_threshold {
            hash_file_mmap(fs_path)
        } else {
            hash_file(fs_path)
        }
        .map_err(to_error)?;

        Ok(hash.to_hex())
    }
}
