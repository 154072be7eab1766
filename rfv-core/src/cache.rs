//! Persistent frame-payload cache.
//!
//! Frame payloads are cached across sessions under the server-supplied
//! fingerprint so the server can skip retransmitting screens the
//! client has already seen. Two sibling files, each prefixed with a
//! 4-byte version tag:
//!
//! **Key file** (`FrameUpdates.keys`) — flat array of records in
//! insertion order:
//! ```text
//! length:      u32 LE  (payload byte length)
//! hash:        u32 LE  (server-supplied hash)
//! data_offset: u32 LE  (absolute offset into the data file)
//! ```
//!
//! **Data file** (`FrameUpdates.data`) — raw concatenated payloads.
//!
//! Append-only: entries are never overwritten or compacted, only
//! dropped wholesale by [`FrameCache::clear`]. Duplicate keys resolve
//! to the last write. Single-writer: one active session at a time;
//! concurrent add/get/clear is not supported.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::CacheError;

// ── Constants ────────────────────────────────────────────────────

/// On-disk format version written at the head of both files.
pub const CACHE_VERSION: u32 = 1;

const KEY_FILE_NAME: &str = "FrameUpdates.keys";
const DATA_FILE_NAME: &str = "FrameUpdates.data";

const VERSION_TAG_SIZE: u64 = 4;
const KEY_RECORD_SIZE: usize = 12;

// ── CacheKey ─────────────────────────────────────────────────────

/// Weak payload fingerprint: byte length plus the server's hash.
///
/// Not cryptographic; collisions are possible and undefended — the
/// protocol specifies nothing stronger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub length: u32,
    pub hash: u32,
}

// ── CacheInfo ────────────────────────────────────────────────────

/// Summary returned by [`FrameCache::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    /// Distinct keys currently indexed.
    pub items: usize,
    /// Data file size in bytes (version tag included).
    pub data_size: u64,
}

// ── FrameCache ───────────────────────────────────────────────────

/// Append-only key→blob store on persistent storage.
#[derive(Debug)]
pub struct FrameCache {
    index: HashMap<CacheKey, u32>,
    key_file: File,
    data_file: File,
}

impl FrameCache {
    /// Open (or create) the cache files under `dir` and rebuild the
    /// in-memory index with one scan of the key file.
    ///
    /// A version-tag mismatch fails with
    /// [`CacheError::InvalidCacheVersion`] without mutating either
    /// file.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        let mut key_file = open_or_create(
            &dir.join(KEY_FILE_NAME),
            CacheError::CannotCreateKeyFile,
        )?;
        let mut data_file = open_or_create(
            &dir.join(DATA_FILE_NAME),
            CacheError::CannotCreateDataFile,
        )?;

        // Key file: validate tag, then scan records.
        key_file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        key_file.read_to_end(&mut contents)?;
        validate_version(&contents)?;

        let mut index = HashMap::new();
        // A truncated trailing record is ignored, matching the scan
        // granularity of the writer.
        for record in contents[VERSION_TAG_SIZE as usize..].chunks_exact(KEY_RECORD_SIZE) {
            let key = CacheKey {
                length: u32::from_le_bytes([record[0], record[1], record[2], record[3]]),
                hash: u32::from_le_bytes([record[4], record[5], record[6], record[7]]),
            };
            let offset = u32::from_le_bytes([record[8], record[9], record[10], record[11]]);
            index.insert(key, offset);
        }

        // Data file: validate tag only.
        data_file.seek(SeekFrom::Start(0))?;
        let mut tag = Vec::with_capacity(VERSION_TAG_SIZE as usize);
        std::io::Read::by_ref(&mut data_file)
            .take(VERSION_TAG_SIZE)
            .read_to_end(&mut tag)?;
        validate_version(&tag)?;

        let mut cache = Self {
            index,
            key_file,
            data_file,
        };
        let stats = cache.info()?;
        info!(
            "frame cache: {} entries, {} bytes",
            stats.items, stats.data_size
        );
        Ok(cache)
    }

    /// Append a payload under `key`, flush both files, and update the
    /// index. A duplicate key appends a fresh record; the last write
    /// wins.
    pub fn add(&mut self, key: CacheKey, payload: &[u8]) -> Result<(), CacheError> {
        // Offsets are u32 on disk; the cache is cleared long before
        // that limit matters.
        let data_offset = self.data_file.seek(SeekFrom::End(0))? as u32;
        self.key_file.seek(SeekFrom::End(0))?;

        let mut record = [0u8; KEY_RECORD_SIZE];
        record[0..4].copy_from_slice(&key.length.to_le_bytes());
        record[4..8].copy_from_slice(&key.hash.to_le_bytes());
        record[8..12].copy_from_slice(&data_offset.to_le_bytes());

        self.key_file.write_all(&record)?;
        self.data_file.write_all(payload)?;
        self.key_file.sync_data()?;
        self.data_file.sync_data()?;

        self.index.insert(key, data_offset);
        debug!("cached {} bytes, hash {:#010x}", key.length, key.hash);
        Ok(())
    }

    /// Look `key` up and read exactly `key.length` payload bytes.
    pub fn get(&mut self, key: CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(&offset) = self.index.get(&key) else {
            return Ok(None);
        };
        self.data_file.seek(SeekFrom::Start(offset as u64))?;
        let mut payload = vec![0u8; key.length as usize];
        self.data_file.read_exact(&mut payload)?;
        debug!(
            "cache hit: {} bytes, hash {:#010x}",
            key.length, key.hash
        );
        Ok(Some(payload))
    }

    /// Drop every entry: truncate both files, rewrite the version
    /// tags, empty the index.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.key_file.set_len(0)?;
        self.data_file.set_len(0)?;
        self.key_file.seek(SeekFrom::Start(0))?;
        self.data_file.seek(SeekFrom::Start(0))?;
        self.key_file.write_all(&CACHE_VERSION.to_le_bytes())?;
        self.data_file.write_all(&CACHE_VERSION.to_le_bytes())?;
        self.key_file.sync_data()?;
        self.data_file.sync_data()?;
        self.index.clear();
        Ok(())
    }

    /// Item count and total data-file size.
    pub fn info(&mut self) -> Result<CacheInfo, CacheError> {
        let data_size = self.data_file.seek(SeekFrom::End(0))?;
        Ok(CacheInfo {
            items: self.index.len(),
            data_size,
        })
    }
}

// ── Internal ─────────────────────────────────────────────────────

/// Open a cache file for update, creating it with a fresh version tag
/// when absent. Creation failures map through `create_err`.
fn open_or_create(
    path: &Path,
    create_err: fn(std::io::Error) -> CacheError,
) -> Result<File, CacheError> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(create_err)?;
            file.write_all(&CACHE_VERSION.to_le_bytes())
                .map_err(create_err)?;
            file.sync_data().map_err(create_err)?;
            Ok(file)
        }
        Err(e) => Err(create_err(e)),
    }
}

fn validate_version(head: &[u8]) -> Result<(), CacheError> {
    if head.len() < VERSION_TAG_SIZE as usize {
        return Err(CacheError::InvalidCacheVersion { found: 0 });
    }
    let found = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    if found != CACHE_VERSION {
        return Err(CacheError::InvalidCacheVersion { found });
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
