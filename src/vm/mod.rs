//! VM management for diskvm.
//!
//! Builds the raw-disk descriptor for the launch disk, sizes the VM from the
//! host's free resources, and drives VirtualBox through `VBoxManage` to
//! destroy, recreate and start the VM on every run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

pub mod descriptor;
pub mod provisioning;
pub mod resources;
pub mod vboxmanage;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Firmware the guest boots with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    #[default]
    Efi,
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Firmware::Bios => "bios",
            Firmware::Efi => "efi",
        })
    }
}

/// Hardware given to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmResources {
    pub memory_mb: u64,
    pub vram_mb: u64,
    pub cpus: u32,
}

/// Everything needed to create the VM definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    /// Registry name; exactly one VM with this name exists after provisioning.
    pub name: String,
    /// VirtualBox guest OS type id, e.g. `ArchLinux_64`.
    pub os_type: String,
    pub firmware: Firmware,
    pub resources: VmResources,
}

/// A provisioned VM ready to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    name: String,
}

impl VmHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Control operations the provisioner needs from a hypervisor.
///
/// Every call blocks until the hypervisor has finished the operation.
pub trait Hypervisor {
    fn vm_exists(&self, name: &str) -> Result<bool, ProvisionError>;

    fn is_running(&self, name: &str) -> Result<bool, ProvisionError>;

    fn power_off(&self, name: &str) -> Result<(), ProvisionError>;

    /// Image in the VM's boot slot, if any.
    fn boot_disk(&self, name: &str) -> Result<Option<PathBuf>, ProvisionError>;

    /// Detach the boot disk from the VM's storage controller.
    fn detach_storage(&self, name: &str) -> Result<(), ProvisionError>;

    /// Unregister the VM and delete its hypervisor-owned files.
    ///
    /// Media still attached are deleted with it, so callers detach the
    /// descriptor first.
    fn delete_vm(&self, name: &str) -> Result<(), ProvisionError>;

    /// Drop a disk image from the media registry without deleting the file.
    fn close_medium(&self, path: &Path) -> Result<(), ProvisionError>;

    /// Remove a machine folder left behind by an unclean earlier removal.
    fn remove_leftover_files(&self, name: &str) -> Result<(), ProvisionError>;

    /// Create and register the VM with its controller, firmware, resources
    /// and boot order.
    fn create_vm(&self, spec: &VmSpec) -> Result<(), ProvisionError>;

    /// Attach a disk image as the first boot device.
    fn attach_boot_disk(&self, name: &str, image: &Path) -> Result<(), ProvisionError>;

    fn start_vm(&self, name: &str) -> Result<(), ProvisionError>;
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use descriptor::{DescriptorBuilder, RawDiskDescriptor};
pub use provisioning::VmProvisioner;
pub use vboxmanage::VBoxManage;
