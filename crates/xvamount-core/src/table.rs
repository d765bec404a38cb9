//! Segment table construction.
//!
//! Converts one disk's sparse chunk map into an ordered device-mapper table:
//! linear segments for chunks stored in the archive and zero segments for
//! runs of absent chunks. The table covers the disk's full logical extent
//! with no gaps and no overlaps.

use crate::error::{Error, Result};
use crate::index::ChunkLocation;
use std::collections::BTreeMap;
use std::fmt;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Size of one disk chunk in bytes (1 MiB).
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Sectors per full chunk.
pub const CHUNK_SECTORS: u64 = CHUNK_SIZE / SECTOR_SIZE;

/// Largest chunk index a disk may use. Caps the slot count so byte and
/// sector arithmetic on `largest index + 1` cannot overflow `u64`.
pub const MAX_CHUNK_INDEX: u64 = u64::MAX / CHUNK_SIZE - 1;

/// The mapping kind of a table segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    /// Maps to a byte range of the backing device.
    Linear {
        /// Backing device identifier (e.g. "/dev/loop0").
        device: String,
        /// Offset into the backing device, in sectors.
        offset_sectors: u64,
    },
    /// Reads as all zeroes; no backing storage.
    Zero,
}

/// One entry of a device-mapper table.
///
/// Entries are contiguous and non-overlapping: each segment starts where the
/// previous one ended, and the last segment ends at the disk's total sector
/// count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sector offset within the logical disk.
    pub start_sector: u64,
    /// Length in sectors.
    pub length_sectors: u64,
    /// Mapping kind.
    pub kind: SegmentKind,
}

impl fmt::Display for Segment {
    /// Renders one device-mapper table line:
    /// `<start> <len> linear <device> <offset>` or `<start> <len> zero`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SegmentKind::Linear {
                device,
                offset_sectors,
            } => write!(
                f,
                "{} {} linear {} {}",
                self.start_sector, self.length_sectors, device, offset_sectors
            ),
            SegmentKind::Zero => {
                write!(f, "{} {} zero", self.start_sector, self.length_sectors)
            }
        }
    }
}

/// Builds the segment table for one disk.
///
/// Walks chunk indices `0..N` (N = largest present index + 1) with a sector
/// cursor. A present chunk becomes a linear segment of `size / 512` sectors
/// pointing at `offset / 512` on the backing device. Runs of absent indices
/// collapse into a single zero segment of `run_length * CHUNK_SECTORS`
/// sectors. A chunk recorded with size 0 counts as absent for coalescing but
/// still bounds N.
///
/// # Errors
///
/// Returns a format error if the largest chunk index exceeds
/// [`MAX_CHUNK_INDEX`], if a chunk's size is not a multiple of the sector
/// size, exceeds [`CHUNK_SIZE`], or its archive offset is not sector-aligned.
pub fn build_table(chunks: &BTreeMap<u64, ChunkLocation>, device: &str) -> Result<Vec<Segment>> {
    let Some((&last, _)) = chunks.last_key_value() else {
        return Ok(Vec::new());
    };
    if last > MAX_CHUNK_INDEX {
        return Err(Error::format(format!(
            "chunk index {} exceeds the maximum of {}",
            last, MAX_CHUNK_INDEX
        )));
    }
    let slots = last + 1;

    let mut segments = Vec::new();
    let mut cursor = 0u64;
    let mut index = 0u64;

    while index < slots {
        match chunks.get(&index).filter(|loc| loc.size > 0) {
            Some(loc) => {
                if loc.size % SECTOR_SIZE != 0 || loc.size > CHUNK_SIZE {
                    return Err(Error::format(format!(
                        "chunk {} has unmappable size {}",
                        index, loc.size
                    )));
                }
                if loc.offset % SECTOR_SIZE != 0 {
                    return Err(Error::format(format!(
                        "chunk {} payload offset {} is not sector-aligned",
                        index, loc.offset
                    )));
                }

                let length = loc.size / SECTOR_SIZE;
                segments.push(Segment {
                    start_sector: cursor,
                    length_sectors: length,
                    kind: SegmentKind::Linear {
                        device: device.to_string(),
                        offset_sectors: loc.offset / SECTOR_SIZE,
                    },
                });
                cursor += length;
                index += 1;
            }
            None => {
                // The gap scan is bounded: the slot at `slots - 1` is always
                // materialized, so the run cannot extend past it.
                let run_start = index;
                while index < slots && chunks.get(&index).map_or(true, |loc| loc.size == 0) {
                    index += 1;
                }
                let length = (index - run_start) * CHUNK_SECTORS;
                segments.push(Segment {
                    start_sector: cursor,
                    length_sectors: length,
                    kind: SegmentKind::Zero,
                });
                cursor += length;
            }
        }
    }

    Ok(segments)
}

/// Renders a full table in the text protocol consumed by `dmsetup`,
/// one line per segment with a trailing newline.
pub fn render_table(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push_str(&segment.to_string());
        out.push('\n');
    }
    out
}

/// Total sector count covered by a table.
pub fn total_sectors(segments: &[Segment]) -> u64 {
    segments
        .last()
        .map(|s| s.start_sector + s.length_sectors)
        .unwrap_or(0)
}
