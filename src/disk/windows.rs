//! Windows disk topology through the PowerShell Storage cmdlets.
//!
//! Volumes are drive letters. `Get-Partition -DriveLetter X | Get-Disk`
//! lists the disks behind a letter; its JSON output is a single object for
//! one disk and an array for several. The parsing lives here on every
//! platform so it stays testable; only [`super::host_topology`] picks this
//! topology on Windows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::debug;

use super::{DiskTopology, PhysicalDiskRef, VolumeRef};
use crate::error::{LocateError, PrivilegeError};
use crate::process::{CommandRunner, SystemRunner};

const POWERSHELL: &str = "powershell.exe";
const DRIVE_PREFIX: &str = "PhysicalDrive";

pub struct WindowsTopology<R: CommandRunner = SystemRunner> {
    runner: R,
    /// `%SystemDrive%`, e.g. `C:`.
    system_drive: Option<String>,
}

impl WindowsTopology<SystemRunner> {
    pub fn from_env() -> Self {
        Self::new(SystemRunner, std::env::var("SystemDrive").ok())
    }
}

impl<R: CommandRunner> WindowsTopology<R> {
    pub fn new(runner: R, system_drive: Option<String>) -> Self {
        Self {
            runner,
            system_drive,
        }
    }

    fn powershell(&self, script: &str) -> anyhow::Result<String> {
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script.to_string(),
        ];
        let out = self
            .runner
            .run(Path::new(POWERSHELL), &args)
            .context("failed to spawn powershell")?;
        if !out.success() {
            bail!(
                "powershell exited with {:?}: {}",
                out.code,
                out.stderr.trim()
            );
        }
        Ok(out.stdout)
    }

    fn is_elevated(&self) -> anyhow::Result<bool> {
        let out = self.powershell(
            "([Security.Principal.WindowsPrincipal]\
             [Security.Principal.WindowsIdentity]::GetCurrent())\
             .IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)",
        )?;
        Ok(out.trim().eq_ignore_ascii_case("true"))
    }

    /// Free physical memory in bytes.
    pub fn available_memory_bytes(&self) -> anyhow::Result<u64> {
        let out =
            self.powershell("(Get-CimInstance Win32_OperatingSystem).FreePhysicalMemory")?;
        let kib: u64 = out
            .trim()
            .parse()
            .with_context(|| format!("unexpected FreePhysicalMemory output {:?}", out.trim()))?;
        Ok(kib * 1024)
    }
}

impl<R: CommandRunner> DiskTopology for WindowsTopology<R> {
    fn volume_of(&self, path: &Path) -> Result<VolumeRef, LocateError> {
        match drive_letter(path) {
            Some(letter) => Ok(VolumeRef::new(format!("{letter}:"))),
            None => Err(LocateError::Volume {
                path: path.to_path_buf(),
                reason: "path is not on a lettered local drive (network share?)".to_string(),
            }),
        }
    }

    fn system_volume(&self) -> Result<VolumeRef, LocateError> {
        let drive = self
            .system_drive
            .as_deref()
            .ok_or_else(|| LocateError::Volume {
                path: PathBuf::from("%SystemDrive%"),
                reason: "SystemDrive is not set".to_string(),
            })?;
        self.volume_of(Path::new(drive))
    }

    fn disks_of(&self, volume: &VolumeRef) -> Result<Vec<PhysicalDiskRef>, LocateError> {
        let enumeration = |reason: String| LocateError::Enumeration {
            volume: volume.clone(),
            reason,
        };

        let letter = volume
            .id()
            .chars()
            .next()
            .filter(char::is_ascii_alphabetic)
            .ok_or_else(|| enumeration("not a drive letter".to_string()))?;

        let script = format!(
            "Get-Partition -DriveLetter {letter} | Get-Disk | \
             Select-Object Number, Size | ConvertTo-Json -Compress"
        );
        let json = self
            .powershell(&script)
            .map_err(|e| enumeration(format!("{e:#}")))?;
        let records = parse_disk_records(&json).map_err(|e| enumeration(format!("{e:#}")))?;
        debug!(%volume, ?records, "Get-Disk records");

        Ok(records.into_keys().map(physical_drive).collect())
    }

    fn disk_size(&self, disk: &PhysicalDiskRef) -> anyhow::Result<u64> {
        let number = disk_number(disk)?;
        let out = self.powershell(&format!("(Get-Disk -Number {number}).Size"))?;
        out.trim()
            .parse()
            .with_context(|| format!("unexpected Get-Disk size output {:?}", out.trim()))
    }

    fn check_raw_access(&self, disk: &PhysicalDiskRef) -> Result<(), PrivilegeError> {
        let device = disk.device_path().display().to_string();
        match self.is_elevated() {
            Ok(true) => Ok(()),
            Ok(false) => Err(PrivilegeError {
                device,
                reason: "the process is not elevated".to_string(),
            }),
            Err(e) => Err(PrivilegeError {
                device,
                reason: format!("cannot determine elevation: {e:#}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskRecord {
    number: u32,
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// Disk number → size, deduplicated across partitions on the same disk.
fn parse_disk_records(json: &str) -> anyhow::Result<BTreeMap<u32, u64>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(BTreeMap::new());
    }
    let records = match serde_json::from_str::<OneOrMany<DiskRecord>>(json)
        .with_context(|| format!("unexpected Get-Disk output {json:?}"))?
    {
        OneOrMany::One(record) => vec![record],
        OneOrMany::Many(records) => records,
    };
    Ok(records.into_iter().map(|r| (r.number, r.size)).collect())
}

/// Upper-case drive letter of an absolute path such as `E:\diskvm.exe` or
/// `\\?\E:\diskvm.exe`.
fn drive_letter(path: &Path) -> Option<char> {
    let text = path.to_string_lossy();
    let text = text.strip_prefix(r"\\?\").unwrap_or(&text);
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
            Some(letter.to_ascii_uppercase())
        }
        _ => None,
    }
}

fn physical_drive(number: u32) -> PhysicalDiskRef {
    PhysicalDiskRef::new(
        format!("{DRIVE_PREFIX}{number}"),
        format!(r"\\.\{DRIVE_PREFIX}{number}"),
    )
}

fn disk_number(disk: &PhysicalDiskRef) -> anyhow::Result<u32> {
    let name = disk.name();
    name.get(..DRIVE_PREFIX.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(DRIVE_PREFIX))
        .and_then(|_| name[DRIVE_PREFIX.len()..].parse().ok())
        .with_context(|| format!("{name} is not a PhysicalDriveN name"))
}
