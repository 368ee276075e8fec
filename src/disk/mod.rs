//! Physical disk resolution for the running executable.
//!
//! The host's volume/disk enumeration sits behind [`DiskTopology`]; the
//! [`locator::DiskLocator`] and [`safety::SafetyGuard`] only ever see that
//! trait, which keeps them testable with scripted topologies.
//!
//! ```text
//! current_exe ──► volume_of ──► disks_of ──► exactly one PhysicalDiskRef
//! system volume ─► volume_of ──► disks_of ──► host disk ─► SafetyGuard
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{LocateError, PrivilegeError};

pub mod locator;
pub mod safety;
#[cfg(target_os = "linux")]
pub mod sysfs;
pub mod windows;

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// One physical storage device as enumerated by the host OS.
///
/// Only valid for the current boot session: device numbering can change
/// across reboots and hotplug, so it is resolved fresh on every run.
#[derive(Debug, Clone)]
pub struct PhysicalDiskRef {
    name: String,
    device_path: PathBuf,
}

impl PhysicalDiskRef {
    pub fn new(name: impl Into<String>, device_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            device_path: device_path.into(),
        }
    }

    /// Short platform name, e.g. `sdb` or `PhysicalDrive1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw device path handed to the hypervisor, e.g. `/dev/sdb` or
    /// `\\.\PhysicalDrive1`.
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}

// Windows device paths are case-insensitive.
impl PartialEq for PhysicalDiskRef {
    fn eq(&self, other: &Self) -> bool {
        self.device_path
            .to_string_lossy()
            .eq_ignore_ascii_case(&other.device_path.to_string_lossy())
    }
}

impl Eq for PhysicalDiskRef {}

impl fmt::Display for PhysicalDiskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.device_path.display())
    }
}

/// The filesystem volume a path lives on.
///
/// The identifier is opaque outside the topology that produced it: a
/// `major:minor` device number on Linux, a drive letter on Windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeRef(String);

impl VolumeRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Host OS collaborator
// ---------------------------------------------------------------------------

/// Read-only view of the host's volumes and physical disks.
pub trait DiskTopology {
    /// Volume containing `path`.
    fn volume_of(&self, path: &Path) -> Result<VolumeRef, LocateError>;

    /// Volume the host operating system is installed on.
    fn system_volume(&self) -> Result<VolumeRef, LocateError>;

    /// Every physical disk backing `volume`, without duplicates.
    fn disks_of(&self, volume: &VolumeRef) -> Result<Vec<PhysicalDiskRef>, LocateError>;

    /// Exact size of `disk` in bytes.
    fn disk_size(&self, disk: &PhysicalDiskRef) -> anyhow::Result<u64>;

    /// Whether this process may hand `disk` to the hypervisor for raw access.
    fn check_raw_access(&self, disk: &PhysicalDiskRef) -> Result<(), PrivilegeError>;
}

/// Topology for platforms without a resolver. Every query fails, so the
/// safety gate always denies.
#[derive(Debug, Default)]
pub struct UnsupportedTopology;

impl DiskTopology for UnsupportedTopology {
    fn volume_of(&self, _path: &Path) -> Result<VolumeRef, LocateError> {
        Err(LocateError::UnsupportedPlatform)
    }

    fn system_volume(&self) -> Result<VolumeRef, LocateError> {
        Err(LocateError::UnsupportedPlatform)
    }

    fn disks_of(&self, _volume: &VolumeRef) -> Result<Vec<PhysicalDiskRef>, LocateError> {
        Err(LocateError::UnsupportedPlatform)
    }

    fn disk_size(&self, disk: &PhysicalDiskRef) -> anyhow::Result<u64> {
        anyhow::bail!("cannot query the size of {disk} on this platform")
    }

    fn check_raw_access(&self, disk: &PhysicalDiskRef) -> Result<(), PrivilegeError> {
        Err(PrivilegeError {
            device: disk.device_path().display().to_string(),
            reason: "raw disk access is not supported on this platform".to_string(),
        })
    }
}

/// The topology for the platform this binary was built for.
#[cfg(target_os = "linux")]
pub fn host_topology() -> Box<dyn DiskTopology> {
    Box::new(sysfs::SysfsTopology::new())
}

#[cfg(target_os = "windows")]
pub fn host_topology() -> Box<dyn DiskTopology> {
    Box::new(windows::WindowsTopology::from_env())
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn host_topology() -> Box<dyn DiskTopology> {
    Box::new(UnsupportedTopology)
}
