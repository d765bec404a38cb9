//! Chunked archive access and header scanning.
//!
//! An XVA-style archive is a tar-like stream of 512-byte header records,
//! each followed by its payload padded to the next 512-byte boundary. The
//! scanner decodes headers and skips payloads; chunk contents are never read
//! while building an index.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Size of one header record in bytes. Payloads are padded to this boundary.
pub const RECORD_SIZE: u64 = 512;

/// Byte range of the NUL-padded name field within a record.
const NAME_FIELD: std::ops::Range<usize> = 0..100;

/// Byte range of the 11-character ASCII-octal payload size field.
const SIZE_FIELD: std::ops::Range<usize> = 124..135;

/// Identity of an archive file, used to key the persisted index cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceId {
    /// File length in bytes.
    pub len: u64,
    /// Modification time in whole seconds since the Unix epoch.
    pub mtime: u64,
}

/// A memory-mapped, read-only archive file.
///
/// The mapping is shared immutably; scanners borrow it and own their cursor
/// offset internally, so sequential access never mutates shared state.
///
/// # Example
///
/// ```no_run
/// use xvamount_core::archive::ArchiveFile;
/// use std::path::Path;
///
/// let archive = ArchiveFile::open(Path::new("vm.xva")).unwrap();
/// for entry in archive.scan() {
///     let entry = entry.unwrap();
///     println!("{}: {} bytes", entry.name, entry.payload_size);
/// }
/// ```
pub struct ArchiveFile {
    /// The memory-mapped file data.
    mmap: Arc<Mmap>,
    /// The size of the file in bytes.
    len: u64,
    /// Path the archive was opened from.
    path: PathBuf,
    /// Identity snapshot taken at open time.
    source_id: SourceId,
}

impl ArchiveFile {
    /// Opens an archive file and creates a memory-mapped view of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be opened or
    /// mapped, or is empty (a valid archive holds at least one record).
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;

        let metadata = file.metadata().map_err(|e| Error::io(e, path))?;
        let len = metadata.len();
        if len == 0 {
            return Err(Error::io(
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "archive is empty"),
                path,
            ));
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        // Safety: the file was opened read-only and the Mmap holds it alive
        // for the lifetime of the mapping.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self {
            mmap: Arc::new(mmap),
            len,
            path: path.to_path_buf(),
            source_id: SourceId { len, mtime },
        })
    }

    /// Returns the size of the archive in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the mapping holds no bytes. Kept for API completeness;
    /// `open` rejects empty files.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a reference to the raw memory-mapped data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Returns the path the archive was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the payload bytes of a scanned entry.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the entry's declared payload extends beyond
    /// the end of the archive.
    pub fn payload(&self, entry: &HeaderEntry) -> Result<&[u8]> {
        let start = entry.payload_offset as usize;
        let end = start.saturating_add(entry.payload_size as usize);
        if end > self.mmap.len() {
            return Err(Error::io_simple(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("payload of '{}' extends beyond archive", entry.name),
            )));
        }
        Ok(&self.mmap[start..end])
    }

    /// Returns the identity snapshot used to key the index cache.
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Creates a lazy header scanner starting at offset 0.
    pub fn scan(&self) -> HeaderScanner<'_> {
        self.scan_from(0)
    }

    /// Creates a lazy header scanner starting at the given byte offset.
    ///
    /// The offset must be the start of a header record; scanners are
    /// restartable from any offset previously reported by [`HeaderScanner::offset`].
    pub fn scan_from(&self, offset: u64) -> HeaderScanner<'_> {
        HeaderScanner {
            data: &self.mmap,
            offset,
            done: false,
        }
    }
}

/// One decoded header record.
///
/// Entries are produced transiently by the scanner; the payload itself is
/// never read, only located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    /// Entry name, decoded from the NUL-padded name field.
    pub name: String,
    /// Absolute byte offset of the payload start within the archive.
    pub payload_offset: u64,
    /// Payload size in bytes, decoded from the ASCII-octal size field.
    pub payload_size: u64,
}

impl HeaderEntry {
    /// Bytes of NUL padding between this payload and the next record.
    pub fn padding(&self) -> u64 {
        (RECORD_SIZE - self.payload_size % RECORD_SIZE) % RECORD_SIZE
    }
}

/// A lazy iterator over the archive's header records.
///
/// The scanner owns its cursor: each step decodes one record and advances
/// past the payload and its padding. Iteration ends at a terminator record
/// (first byte 0x00) or when the mapping is exactly exhausted. Dropping the
/// scanner mid-way has no side effects.
pub struct HeaderScanner<'a> {
    data: &'a [u8],
    offset: u64,
    done: bool,
}

impl HeaderScanner<'_> {
    /// Returns the current cursor offset.
    ///
    /// After iteration completes this is either the start of the terminator
    /// record or the exact archive length.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Iterator for HeaderScanner<'_> {
    type Item = Result<HeaderEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = self.offset as usize;
        if start == self.data.len() {
            // Source exhausted exactly on a record boundary.
            self.done = true;
            return None;
        }

        if start + RECORD_SIZE as usize > self.data.len() {
            self.done = true;
            return Some(Err(Error::io_simple(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("truncated header record at offset {}", self.offset),
            ))));
        }

        let record = &self.data[start..start + RECORD_SIZE as usize];
        if record[0] == 0 {
            // Terminator record.
            self.done = true;
            return None;
        }

        let name = match decode_name(&record[NAME_FIELD]) {
            Ok(name) => name,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let payload_size = match parse_octal(&record[SIZE_FIELD]) {
            Ok(size) => size,
            Err(e) => {
                self.done = true;
                return Some(Err(Error::format(format!(
                    "record '{}' at offset {}: {}",
                    name, self.offset, e
                ))));
            }
        };

        let entry = HeaderEntry {
            name,
            payload_offset: self.offset + RECORD_SIZE,
            payload_size,
        };

        self.offset += RECORD_SIZE + entry.payload_size + entry.padding();
        Some(Ok(entry))
    }
}

/// Decode the NUL-padded name field into a string.
fn decode_name(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| Error::format("entry name is not valid UTF-8"))
}

/// Parse a fixed-width ASCII-octal size field.
///
/// Trailing NUL or space padding is tolerated (tar writers vary); the
/// remaining characters must be octal digits.
fn parse_octal(field: &[u8]) -> std::result::Result<u64, String> {
    let end = field
        .iter()
        .rposition(|&b| b != 0 && b != b' ')
        .map(|p| p + 1)
        .unwrap_or(0);
    let digits = &field[..end];

    if digits.is_empty() {
        return Err("empty size field".to_string());
    }
    if !digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
        return Err(format!(
            "size field is not octal: {:?}",
            String::from_utf8_lossy(field)
        ));
    }

    let text = std::str::from_utf8(digits).map_err(|_| "size field is not ASCII".to_string())?;
    u64::from_str_radix(text, 8).map_err(|e| format!("size field overflow: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_octal_plain() {
        assert_eq!(parse_octal(b"00000002000").unwrap(), 0o2000);
    }

    #[test]
    fn test_parse_octal_nul_terminated() {
        assert_eq!(parse_octal(b"0000000644\0").unwrap(), 0o644);
    }

    #[test]
    fn test_parse_octal_space_padded() {
        assert_eq!(parse_octal(b"0000000644 ").unwrap(), 0o644);
    }

    #[test]
    fn test_parse_octal_rejects_non_octal() {
        assert!(parse_octal(b"000000089AB").is_err());
        assert!(parse_octal(b"\0\0\0\0\0\0\0\0\0\0\0").is_err());
    }

    #[test]
    fn test_decode_name_strips_padding() {
        let mut field = [0u8; 100];
        field[..9].copy_from_slice(b"Ref:1/000");
        assert_eq!(decode_name(&field).unwrap(), "Ref:1/000");
    }

    #[test]
    fn test_padding() {
        let entry = HeaderEntry {
            name: "x".to_string(),
            payload_offset: 512,
            payload_size: 100,
        };
        assert_eq!(entry.padding(), 412);

        let aligned = HeaderEntry {
            name: "x".to_string(),
            payload_offset: 512,
            payload_size: 1024,
        };
        assert_eq!(aligned.padding(), 0);
    }

    #[test]
    fn test_open_nonexistent() {
        let result = ArchiveFile::open(Path::new("/nonexistent/path/vm.xva"));
        assert!(result.is_err());
    }
}
