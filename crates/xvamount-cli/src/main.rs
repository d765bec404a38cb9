//! xvamount CLI - attach disks inside chunked XVA archives as block devices.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use xvamount_core::archive::ArchiveFile;
use xvamount_core::index::DiskIndex;
use xvamount_core::table::{build_table, render_table, SECTOR_SIZE};
use xvamount_core::{meta, mount_archive, unmount_archive, MountOptions};

/// Mount the virtual disks inside an XVA archive without unpacking it.
#[derive(Parser)]
#[command(name = "xvamount")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display information about an archive: disks, sizes, VM name.
    Info {
        /// Path to the archive file.
        archive: PathBuf,

        /// Suppress the scan spinner.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the device-mapper table for one disk to stdout.
    Table {
        /// Path to the archive file.
        archive: PathBuf,

        /// Disk reference label (see `info` output).
        disk_ref: String,

        /// Backing device identifier to reference in linear entries.
        #[arg(short, long)]
        device: String,
    },

    /// Attach every disk in the archive as a read-only block device.
    Mount {
        /// Path to the archive file.
        archive: PathBuf,

        /// Base name for created mappings. Defaults to the archive file stem.
        #[arg(long)]
        name: Option<String>,

        /// Index artifact path. Defaults to `<archive>.index.json`.
        #[arg(long)]
        cache: Option<PathBuf>,

        /// Rescan the archive, overwriting the index artifact.
        #[arg(long)]
        refresh_index: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Remove the mappings and loop device created by a previous mount.
    Unmount {
        /// Path to the archive file.
        archive: PathBuf,

        /// Base name used at mount time, if one was given.
        #[arg(long)]
        name: Option<String>,

        /// Index artifact path. Defaults to `<archive>.index.json`.
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { archive, quiet } => show_info(&archive, quiet)?,
        Commands::Table {
            archive,
            disk_ref,
            device,
        } => print_table(&archive, &disk_ref, &device)?,
        Commands::Mount {
            archive,
            name,
            cache,
            refresh_index,
            quiet,
        } => run_mount(&archive, name, cache, refresh_index, quiet)?,
        Commands::Unmount {
            archive,
            name,
            cache,
        } => run_unmount(&archive, name, cache)?,
    }

    Ok(())
}

fn scan_spinner(quiet: bool) -> Option<ProgressBar> {
    if quiet {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message("Scanning archive...");
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn show_info(archive_path: &Path, quiet: bool) -> Result<()> {
    let archive = ArchiveFile::open(archive_path)?;

    let spinner = scan_spinner(quiet);
    let (index, metadata) = DiskIndex::scan_with_metadata(&archive, Some(meta::METADATA_NAME))?;
    let vm_name = metadata.and_then(|xml| meta::display_name(&String::from_utf8_lossy(&xml)));
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    println!("Archive Information");
    println!("===================");
    println!();
    println!("Archive:   {}", archive_path.display());
    println!("Size:      {}", format_bytes(archive.len()));
    if let Some(name) = vm_name {
        println!("VM name:   {}", name);
    }
    println!();

    println!("Disks:");
    let mut total = 0u64;
    for (i, disk_ref) in index.disk_refs().enumerate() {
        let size = index.disk_size_bytes(disk_ref);
        let stored = index
            .chunks(disk_ref)
            .map(|chunks| chunks.values().map(|c| c.size).sum::<u64>())
            .unwrap_or(0);
        total += size;
        println!(
            "  {}. {} - {} logical ({} stored, {} chunks)",
            i + 1,
            disk_ref,
            format_bytes(size),
            format_bytes(stored),
            index.chunks(disk_ref).map(|c| c.len()).unwrap_or(0)
        );
    }
    println!();
    println!("Total logical size: {}", format_bytes(total));

    Ok(())
}

fn print_table(archive_path: &Path, disk_ref: &str, device: &str) -> Result<()> {
    let archive = ArchiveFile::open(archive_path)?;
    let index = DiskIndex::scan(&archive)?;

    let chunks = index
        .chunks(disk_ref)
        .ok_or_else(|| anyhow::anyhow!("no disk '{}' in archive", disk_ref))?;
    let segments = build_table(chunks, device)?;
    print!("{}", render_table(&segments));

    Ok(())
}

fn run_mount(
    archive_path: &Path,
    name: Option<String>,
    cache: Option<PathBuf>,
    refresh_index: bool,
    quiet: bool,
) -> Result<()> {
    let options = MountOptions {
        name,
        cache_path: cache,
        refresh_index,
    };

    let spinner = scan_spinner(quiet);
    let report = mount_archive(archive_path, &options);
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    let report = report?;

    if !quiet {
        println!("Attached {} on {}", archive_path.display(), report.loop_device);
    }
    for disk in &report.disks {
        println!(
            "{} -> {} ({})",
            disk.disk_ref,
            disk.device,
            format_bytes(disk.sectors * SECTOR_SIZE)
        );
    }

    Ok(())
}

fn run_unmount(archive_path: &Path, name: Option<String>, cache: Option<PathBuf>) -> Result<()> {
    let options = MountOptions {
        name,
        cache_path: cache,
        refresh_index: false,
    };

    let released = unmount_archive(archive_path, &options)?;
    for resource in released {
        println!("Released {}", resource);
    }

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
