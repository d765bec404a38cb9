//! Mount orchestration over external collaborators.
//!
//! The core never manipulates block devices itself: `losetup` attaches the
//! archive as a read-only loop device and `dmsetup` installs the generated
//! segment tables. Created resources are registered on an explicit
//! [`CleanupStack`] as they appear and are released in reverse order by a
//! caller-invoked teardown, never by ambient signal handlers.

use crate::archive::ArchiveFile;
use crate::error::{Error, Result};
use crate::index::DiskIndex;
use crate::table::{build_table, render_table, total_sectors, Segment};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A loop device backing the archive file.
#[derive(Debug, Clone)]
pub struct LoopDevice {
    device: String,
}

impl LoopDevice {
    /// Attaches `path` to the next free loop device, read-only.
    pub fn attach(path: &Path) -> Result<Self> {
        let mut cmd = Command::new("losetup");
        cmd.arg("--find").arg("--show").arg("--read-only").arg(path);
        let device = run_command(cmd, "losetup")?;
        if device.is_empty() {
            return Err(Error::mount("losetup reported no device name"));
        }
        Ok(Self { device })
    }

    /// The device path, e.g. "/dev/loop0".
    pub fn path(&self) -> &str {
        &self.device
    }

    /// Detaches the loop device.
    pub fn detach(&self) -> Result<()> {
        let mut cmd = Command::new("losetup");
        cmd.arg("--detach").arg(&self.device);
        run_command(cmd, "losetup --detach").map(|_| ())
    }
}

/// Finds the loop device currently backing `path`, if any.
pub fn loop_device_for(path: &Path) -> Result<Option<String>> {
    let mut cmd = Command::new("losetup");
    cmd.arg("--associated").arg(path);
    let output = run_command(cmd, "losetup --associated")?;

    // Output lines look like "/dev/loop3: []: (/path/to/vm.xva)".
    Ok(output
        .lines()
        .next()
        .and_then(|line| line.split(':').next())
        .map(str::to_string)
        .filter(|dev| !dev.is_empty()))
}

/// Installs a read-only device-mapper table under `/dev/mapper/<name>`.
pub fn install_table(name: &str, segments: &[Segment]) -> Result<()> {
    let mut child = Command::new("dmsetup")
        .args(["create", name, "--readonly"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::mount(format!("failed to run dmsetup: {}", e)))?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(render_table(segments).as_bytes())
            .map_err(|e| Error::mount(format!("failed to feed table to dmsetup: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| Error::mount(format!("failed to wait for dmsetup: {}", e)))?;
    if !output.status.success() {
        return Err(Error::mount(format!(
            "dmsetup create {} failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Removes a device-mapper table previously installed with [`install_table`].
pub fn remove_table(name: &str) -> Result<()> {
    let mut cmd = Command::new("dmsetup");
    cmd.arg("remove").arg(name);
    run_command(cmd, "dmsetup remove").map(|_| ())
}

/// An external resource created during mounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// An installed device-mapper table, by name.
    MappedDevice(String),
    /// An attached loop device, by device path.
    Loop(String),
}

/// Explicit teardown list for created external resources.
///
/// Resources are pushed in creation order and released in reverse order.
/// Teardown reports failures but keeps going, so one stuck device does not
/// leak the rest.
#[derive(Debug, Default)]
pub struct CleanupStack {
    resources: Vec<Resource>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a created resource.
    pub fn push(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    /// Returns the registered resources in creation order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Releases all registered resources in reverse creation order,
    /// returning any failures.
    pub fn teardown(&mut self) -> Vec<Error> {
        let mut failures = Vec::new();
        while let Some(resource) = self.resources.pop() {
            let result = match &resource {
                Resource::MappedDevice(name) => remove_table(name),
                Resource::Loop(device) => {
                    let mut cmd = Command::new("losetup");
                    cmd.arg("--detach").arg(device);
                    run_command(cmd, "losetup --detach").map(|_| ())
                }
            };
            if let Err(err) = result {
                failures.push(err);
            }
        }
        failures
    }
}

/// Options for [`mount_archive`] and [`unmount_archive`].
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Base name for created mappings; defaults to the archive file stem.
    pub name: Option<String>,
    /// Index artifact path; defaults to `<archive>.index.json`.
    pub cache_path: Option<PathBuf>,
    /// Force a rescan, overwriting the index artifact.
    pub refresh_index: bool,
}

/// One disk attached as a mapped device.
#[derive(Debug, Clone)]
pub struct MappedDisk {
    /// Disk reference label from the archive.
    pub disk_ref: String,
    /// Path of the created mapping, e.g. "/dev/mapper/vm-Ref_1".
    pub device: String,
    /// Logical size of the disk in sectors.
    pub sectors: u64,
}

/// Result of a successful mount.
#[derive(Debug, Clone)]
pub struct MountReport {
    /// Loop device backing the archive.
    pub loop_device: String,
    /// Created mappings, one per disk.
    pub disks: Vec<MappedDisk>,
}

/// Mounts every disk in the archive as a read-only block device.
///
/// Indexes the archive (cache-or-compute), attaches one loop device, then
/// builds and installs one device-mapper table per disk. On any failure the
/// resources created so far are torn down before the error propagates.
pub fn mount_archive(archive_path: &Path, options: &MountOptions) -> Result<MountReport> {
    let archive = ArchiveFile::open(archive_path)?;
    let cache_path = options
        .cache_path
        .clone()
        .unwrap_or_else(|| default_cache_path(archive_path));
    let index = DiskIndex::load_or_scan(&archive, &cache_path, options.refresh_index)?;
    let base = options
        .name
        .clone()
        .unwrap_or_else(|| base_name(archive_path));

    let mut cleanup = CleanupStack::new();
    let loop_device = LoopDevice::attach(archive_path)?;
    cleanup.push(Resource::Loop(loop_device.path().to_string()));

    match mount_disks(&index, &loop_device, &base, &mut cleanup) {
        Ok(disks) => Ok(MountReport {
            loop_device: loop_device.path().to_string(),
            disks,
        }),
        Err(err) => {
            // Roll back everything created so far; the original error wins.
            let _ = cleanup.teardown();
            Err(err)
        }
    }
}

fn mount_disks(
    index: &DiskIndex,
    loop_device: &LoopDevice,
    base: &str,
    cleanup: &mut CleanupStack,
) -> Result<Vec<MappedDisk>> {
    let mut disks = Vec::new();
    for disk_ref in index.disk_refs() {
        let chunks = index
            .chunks(disk_ref)
            .ok_or_else(|| Error::format(format!("unknown disk reference '{}'", disk_ref)))?;
        let segments = build_table(chunks, loop_device.path())?;

        let name = mapping_name(base, disk_ref);
        install_table(&name, &segments)?;
        cleanup.push(Resource::MappedDevice(name.clone()));

        disks.push(MappedDisk {
            disk_ref: disk_ref.to_string(),
            device: format!("/dev/mapper/{}", name),
            sectors: total_sectors(&segments),
        });
    }
    Ok(disks)
}

/// Removes the mappings and loop device created by a previous mount.
///
/// Disk names are reconstructed from the index artifact (or a fresh scan).
/// All removals are attempted; accumulated failures surface as one error.
pub fn unmount_archive(archive_path: &Path, options: &MountOptions) -> Result<Vec<String>> {
    let archive = ArchiveFile::open(archive_path)?;
    let cache_path = options
        .cache_path
        .clone()
        .unwrap_or_else(|| default_cache_path(archive_path));
    let index = DiskIndex::load_or_scan(&archive, &cache_path, options.refresh_index)?;
    let base = options
        .name
        .clone()
        .unwrap_or_else(|| base_name(archive_path));

    let mut released = Vec::new();
    let mut failures = Vec::new();

    for disk_ref in index.disk_refs() {
        let name = mapping_name(base.as_str(), disk_ref);
        match remove_table(&name) {
            Ok(()) => released.push(format!("/dev/mapper/{}", name)),
            Err(err) => failures.push(err.to_string()),
        }
    }

    match loop_device_for(archive_path) {
        Ok(Some(device)) => {
            let loop_device = LoopDevice {
                device: device.clone(),
            };
            match loop_device.detach() {
                Ok(()) => released.push(device),
                Err(err) => failures.push(err.to_string()),
            }
        }
        Ok(None) => {}
        Err(err) => failures.push(err.to_string()),
    }

    if !failures.is_empty() {
        return Err(Error::mount(failures.join("; ")));
    }
    Ok(released)
}

/// Default index artifact path: the archive path with `.index.json` appended.
pub fn default_cache_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_os_string();
    name.push(".index.json");
    PathBuf::from(name)
}

/// Base mapping name derived from the archive file stem.
fn base_name(archive_path: &Path) -> String {
    archive_path
        .file_stem()
        .map(|s| sanitize_name(&s.to_string_lossy()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "xva".to_string())
}

fn mapping_name(base: &str, disk_ref: &str) -> String {
    format!("{}-{}", base, sanitize_name(disk_ref))
}

/// Sanitize a device-mapper name by replacing invalid characters.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn run_command(mut cmd: Command, what: &str) -> Result<String> {
    let output = cmd
        .output()
        .map_err(|e| Error::mount(format!("failed to run {}: {}", what, e)))?;
    if !output.status.success() {
        return Err(Error::mount(format!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
