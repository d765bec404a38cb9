//! Disk chunk indexing.
//!
//! Consumes the archive's header sequence and builds a sparse, per-disk map
//! of which 1 MiB chunk lives at which byte offset. The index can be
//! persisted to a JSON artifact keyed by the archive's identity so later
//! runs skip the scan.

use crate::archive::{ArchiveFile, SourceId};
use crate::error::{Error, Result};
use crate::table::{CHUNK_SIZE, MAX_CHUNK_INDEX};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Artifact format version, bumped on any layout change.
const CACHE_VERSION: u32 = 1;

/// Location of one stored chunk within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// Absolute byte offset of the chunk payload start within the archive.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u64,
}

/// Sparse per-disk chunk maps for one archive.
///
/// Keys are disk reference labels (e.g. "Ref:1"); each disk maps chunk index
/// to [`ChunkLocation`]. Absent indices denote all-zero chunks of
/// [`CHUNK_SIZE`] bytes. The archive format materializes the first and last
/// chunk of every disk, so the largest present index always determines the
/// disk's logical length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskIndex {
    disks: BTreeMap<String, BTreeMap<u64, ChunkLocation>>,
}

/// On-disk shape of the persisted index artifact.
#[derive(Serialize, Deserialize)]
struct CacheArtifact {
    version: u32,
    source: SourceId,
    disks: BTreeMap<String, BTreeMap<u64, ChunkLocation>>,
}

impl DiskIndex {
    /// Builds the index by scanning the archive's full header sequence.
    ///
    /// Entries named `<diskRef>/<chunkIndex>` with a non-zero payload are
    /// recorded; zero-size matches are dropped (they read back as zeroes
    /// without storage) and non-matching names are ignored as archive
    /// metadata.
    ///
    /// # Errors
    ///
    /// Propagates scanner errors, and returns [`Error::Empty`] if the scan
    /// completes without finding a single disk reference.
    pub fn scan(archive: &ArchiveFile) -> Result<Self> {
        let (index, _) = Self::scan_with_metadata(archive, None)?;
        Ok(index)
    }

    /// Scans like [`DiskIndex::scan`] and, in the same header pass, captures
    /// the payload of one named non-chunk member (e.g. `ova.xml`).
    ///
    /// Returns `None` for the payload if no member with that name exists.
    pub fn scan_with_metadata(
        archive: &ArchiveFile,
        metadata_name: Option<&str>,
    ) -> Result<(Self, Option<Vec<u8>>)> {
        let mut disks: BTreeMap<String, BTreeMap<u64, ChunkLocation>> = BTreeMap::new();
        let mut metadata = None;

        for entry in archive.scan() {
            let entry = entry?;
            if metadata.is_none() && metadata_name == Some(entry.name.as_str()) {
                metadata = Some(archive.payload(&entry)?.to_vec());
                continue;
            }
            let Some((disk_ref, chunk_index)) = parse_chunk_name(&entry.name) else {
                continue;
            };
            if entry.payload_size == 0 {
                continue;
            }
            disks.entry(disk_ref.to_string()).or_default().insert(
                chunk_index,
                ChunkLocation {
                    offset: entry.payload_offset,
                    size: entry.payload_size,
                },
            );
        }

        if disks.is_empty() {
            return Err(Error::Empty);
        }
        Ok((Self { disks }, metadata))
    }

    /// Loads the index from a persisted artifact, or scans the archive and
    /// persists the result.
    ///
    /// This is the cache-or-compute entry point: `refresh` forces a rescan
    /// that overwrites the artifact. A missing, unreadable, corrupt, or
    /// stale artifact falls back to a fresh scan whose result overwrites
    /// the artifact; the cache is purely a performance aid and never
    /// blocks a scan. Use [`DiskIndex::load`] directly to surface artifact
    /// problems instead.
    pub fn load_or_scan(archive: &ArchiveFile, cache_path: &Path, refresh: bool) -> Result<Self> {
        if !refresh {
            if let Ok(index) = Self::load(cache_path, archive.source_id()) {
                return Ok(index);
            }
        }

        let index = Self::scan(archive)?;
        index.save(cache_path, archive.source_id())?;
        Ok(index)
    }

    /// Persists the index to `path`, keyed by the archive identity.
    pub fn save(&self, path: &Path, source: SourceId) -> Result<()> {
        let artifact = CacheArtifact {
            version: CACHE_VERSION,
            source,
            disks: self.disks.clone(),
        };
        let json = serde_json::to_string_pretty(&artifact)
            .map_err(|e| Error::cache(format!("failed to serialize index: {}", e)))?;
        fs::write(path, json).map_err(|e| Error::io(e, path))
    }

    /// Loads a persisted index from `path`, verifying it was produced from
    /// the archive identified by `source`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the artifact cannot be read, and a cache
    /// error if it cannot be parsed, carries a different format version, or
    /// was built from a different archive state.
    pub fn load(path: &Path, source: SourceId) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        let artifact: CacheArtifact = serde_json::from_str(&json)
            .map_err(|e| Error::cache(format!("corrupt index artifact: {}", e)))?;

        if artifact.version != CACHE_VERSION {
            return Err(Error::cache(format!(
                "index artifact version {} does not match expected {}",
                artifact.version, CACHE_VERSION
            )));
        }
        if artifact.source != source {
            return Err(Error::cache(
                "index artifact is stale: archive size or mtime changed; \
                 rescan with refresh or delete the artifact",
            ));
        }

        Ok(Self {
            disks: artifact.disks,
        })
    }

    /// Returns the disk reference labels in sorted order.
    pub fn disk_refs(&self) -> impl Iterator<Item = &str> {
        self.disks.keys().map(String::as_str)
    }

    /// Returns the number of disks in the index.
    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    /// Returns the sparse chunk map for one disk.
    pub fn chunks(&self, disk_ref: &str) -> Option<&BTreeMap<u64, ChunkLocation>> {
        self.disks.get(disk_ref)
    }

    /// Number of chunk slots for a disk, including gaps: largest present
    /// index + 1, or 0 if the disk is unknown.
    pub fn chunk_slots(&self, disk_ref: &str) -> u64 {
        self.disks
            .get(disk_ref)
            .and_then(|chunks| chunks.last_key_value())
            .map(|(&last, _)| last + 1)
            .unwrap_or(0)
    }

    /// Logical disk size in bytes: chunk slots times the chunk unit size.
    pub fn disk_size_bytes(&self, disk_ref: &str) -> u64 {
        self.chunk_slots(disk_ref) * CHUNK_SIZE
    }
}

/// Parses an entry name of the form `<diskRef>/<chunkIndex>`.
///
/// The final path component must be entirely decimal digits and fit within
/// [`MAX_CHUNK_INDEX`]; anything else is archive metadata, not disk payload.
/// The bound keeps downstream slot and byte arithmetic within `u64`.
pub fn parse_chunk_name(name: &str) -> Option<(&str, u64)> {
    let (disk_ref, index_str) = name.rsplit_once('/')?;
    if disk_ref.is_empty() || index_str.is_empty() {
        return None;
    }
    if !index_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = index_str.parse::<u64>().ok()?;
    if index > MAX_CHUNK_INDEX {
        return None;
    }
    Some((disk_ref, index))
}
