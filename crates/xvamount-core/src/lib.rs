//! xvamount Core Library
//!
//! This crate exposes the virtual disks packed inside a chunked XVA-style
//! archive as read-only block devices, without unpacking the archive.
//!
//! # Overview
//!
//! An XVA archive is a tar-like stream whose members `<diskRef>/<chunkIndex>`
//! hold 1 MiB chunks of one or more disks; chunks that are entirely zero are
//! simply absent. The library scans the header stream once, builds a sparse
//! per-disk index of chunk offsets, and converts each index into a
//! device-mapper table of linear and zero-fill segments backed by a loop
//! device over the unmodified archive.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`archive`] - Memory-mapped archive access and header scanning
//! - [`index`] - Sparse per-disk chunk indexing and the persisted index cache
//! - [`table`] - Segment table construction and the table text protocol
//! - [`meta`] - VM metadata extraction from `ova.xml`
//! - [`mount`] - Loop attach, table installation, and explicit teardown
//!
//! # Quick Start
//!
//! ```no_run
//! use xvamount_core::{mount_archive, MountOptions};
//! use std::path::Path;
//!
//! let report = mount_archive(Path::new("vm.xva"), &MountOptions::default()).unwrap();
//! for disk in &report.disks {
//!     println!("{} -> {}", disk.disk_ref, disk.device);
//! }
//! ```

pub mod archive;
pub mod error;
pub mod index;
pub mod meta;
pub mod mount;
pub mod table;

pub use error::{Error, Result};

// Re-export the main types for convenience.
pub use archive::{ArchiveFile, HeaderEntry, HeaderScanner, SourceId, RECORD_SIZE};
pub use index::{ChunkLocation, DiskIndex};
pub use mount::{
    mount_archive, unmount_archive, CleanupStack, LoopDevice, MappedDisk, MountOptions,
    MountReport, Resource,
};
pub use table::{
    build_table, render_table, total_sectors, Segment, SegmentKind, CHUNK_SECTORS, CHUNK_SIZE,
    MAX_CHUNK_INDEX, SECTOR_SIZE,
};
