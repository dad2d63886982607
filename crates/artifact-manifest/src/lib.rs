//! Content-addressed manifests of a directory tree.
//!
//! A [`Manifest`] maps relative file paths to [`ManifestEntry`] records:
//! size, modification time, and an MD5 content hash. Re-adding a file
//! whose size and mtime are unchanged from the existing entry skips
//! re-hashing entirely.
//!
//! Self-describing Avro records would carry their own schema inside every
//! file and need no out-of-band version negotiation, but no Avro crate
//! exists in this workspace's dependency stack. Manifests here use a
//! framed MessagePack encoding instead: a one-byte format tag, a
//! little-endian `u32` payload length, then the `rmp-serde` payload. The
//! tag lets a future format change be detected without guessing from
//! content.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Format tag for the current framing. Bumped whenever the payload shape
/// changes in a way that isn't forward compatible.
pub const FORMAT_TAG: u8 = 1;

/// Files are hashed in chunks this size, so hashing a large artifact does
/// not require holding the whole file in memory at once.
const HASH_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported manifest format tag {0}, expected {FORMAT_TAG}")]
    UnsupportedFormatTag(u8),
    #[error("manifest frame is truncated")]
    TruncatedFrame,
    #[error("failed to decode manifest payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode manifest payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// One file's recorded state within a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub mtime_unix_secs: i64,
    pub md5_hex: String,
}

/// A content-addressed snapshot of a directory tree: relative path to
/// entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries.get(relative_path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn remove(&mut self, relative_path: &str) -> Option<ManifestEntry> {
        self.entries.remove(relative_path)
    }

    /// Adds or updates a single file, identified by `relative_path`,
    /// reading its content from `absolute_path`. Skips re-hashing when the
    /// file's size and mtime exactly match the existing entry.
    pub fn add_file(
        &mut self,
        relative_path: &str,
        absolute_path: &Path,
    ) -> Result<(), ManifestError> {
        let metadata = std::fs::metadata(absolute_path).map_err(|source| ManifestError::Io {
            path: absolute_path.to_path_buf(),
            source,
        })?;
        let size = metadata.len();
        let mtime_unix_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if let Some(existing) = self.entries.get(relative_path) {
            if existing.size == size && existing.mtime_unix_secs == mtime_unix_secs {
                return Ok(());
            }
        }

        let md5_hex = hash_file(absolute_path)?;
        self.entries.insert(
            relative_path.to_string(),
            ManifestEntry {
                size,
                mtime_unix_secs,
                md5_hex,
            },
        );
        Ok(())
    }

    /// Walks `absolute_root` recursively, adding every regular file found
    /// under it with a path relative to `absolute_root`.
    pub fn add_dir(&mut self, absolute_root: &Path) -> Result<(), ManifestError> {
        for entry in walkdir::WalkDir::new(absolute_root)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(absolute_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            self.add_file(&relative, entry.path())?;
        }
        Ok(())
    }

    /// Serializes this manifest using the framed MessagePack encoding.
    pub fn encode(&self) -> Result<Vec<u8>, ManifestError> {
        let payload = rmp_serde::to_vec(self)?;
        let mut framed = Vec::with_capacity(payload.len() + 5);
        framed
            .write_u8(FORMAT_TAG)
            .expect("write to Vec<u8> is infallible");
        framed
            .write_u32::<LittleEndian>(payload.len() as u32)
            .expect("write to Vec<u8> is infallible");
        framed.extend_from_slice(&payload);
        Ok(framed)
    }

    /// Decodes a manifest previously produced by [`Manifest::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ManifestError> {
        let mut cursor = std::io::Cursor::new(bytes);
        let tag = cursor.read_u8().map_err(|_| ManifestError::TruncatedFrame)?;
        if tag != FORMAT_TAG {
            return Err(ManifestError::UnsupportedFormatTag(tag));
        }
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| ManifestError::TruncatedFrame)?;
        let start = cursor.position() as usize;
        let end = start + len as usize;
        let payload = bytes.get(start..end).ok_or(ManifestError::TruncatedFrame)?;
        Ok(rmp_serde::from_slice(payload)?)
    }
}

fn hash_file(path: &Path) -> Result<String, ManifestError> {
    let mut file = std::fs::File::open(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
