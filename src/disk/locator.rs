//! Map the running executable to the physical disk it was loaded from.

use std::path::Path;

use tracing::{debug, info};

use super::{DiskTopology, PhysicalDiskRef, VolumeRef};
use crate::error::LocateError;

pub struct DiskLocator<'a> {
    topology: &'a dyn DiskTopology,
}

impl<'a> DiskLocator<'a> {
    pub fn new(topology: &'a dyn DiskTopology) -> Self {
        Self { topology }
    }

    /// Physical disk holding the currently running executable.
    pub fn locate(&self) -> Result<PhysicalDiskRef, LocateError> {
        let exe = std::env::current_exe().map_err(LocateError::CurrentExe)?;
        info!(exe = %exe.display(), "locating launch disk");
        self.resolve(&exe)
    }

    /// Physical disk holding `path`.
    ///
    /// Volumes spanning zero or several disks are rejected rather than
    /// guessed at.
    pub fn resolve(&self, path: &Path) -> Result<PhysicalDiskRef, LocateError> {
        let volume = self.topology.volume_of(path)?;
        debug!(path = %path.display(), %volume, "resolved volume");
        self.single_disk(volume)
    }

    /// Physical disk the host operating system runs from.
    pub fn host_disk(&self) -> Result<PhysicalDiskRef, LocateError> {
        let volume = self.topology.system_volume()?;
        debug!(%volume, "resolved system volume");
        self.single_disk(volume)
    }

    fn single_disk(&self, volume: VolumeRef) -> Result<PhysicalDiskRef, LocateError> {
        let mut disks = self.topology.disks_of(&volume)?;
        if disks.len() != 1 {
            return Err(LocateError::AmbiguousOrUnsupportedTopology {
                count: disks.len(),
                volume,
            });
        }

        let disk = disks.remove(0);
        debug!(%volume, %disk, "resolved physical disk");
        Ok(disk)
    }
}
