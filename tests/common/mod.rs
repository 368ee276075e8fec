//! Scripted stand-ins for the host disk topology, the hypervisor and the
//! host's free resources.
//!
//! `FakeHypervisor` keeps an in-memory registry and a log of every call, so
//! tests can assert both the end state and that no commands were issued.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use diskvm::disk::{DiskTopology, PhysicalDiskRef, VolumeRef};
use diskvm::error::{LocateError, PrivilegeError, ProvisionError};
use diskvm::vm::resources::HostResources;
use diskvm::vm::{Hypervisor, RawDiskDescriptor, VmSpec};

pub const GB_500: u64 = 500_107_862_016;
pub const GB_520: u64 = 520_000_000_000;

pub fn drive(n: u32) -> PhysicalDiskRef {
    PhysicalDiskRef::new(
        format!("PhysicalDrive{n}"),
        format!(r"\\.\PhysicalDrive{n}"),
    )
}

// ---------------------------------------------------------------------------
// Disk topology
// ---------------------------------------------------------------------------

/// Executable on `E:`, host OS on `C:`.
pub struct FakeTopology {
    pub volumes: RefCell<BTreeMap<String, Vec<PhysicalDiskRef>>>,
    pub sizes: RefCell<BTreeMap<String, u64>>,
    pub system_volume_fails: Cell<bool>,
    pub raw_access_denied: Cell<bool>,
}

impl FakeTopology {
    pub const EXE_VOLUME: &'static str = "E:";
    pub const SYSTEM_VOLUME: &'static str = "C:";

    /// Target disk behind `E:`, host disk behind `C:`.
    pub fn new(target: PhysicalDiskRef, target_size: u64, host: PhysicalDiskRef) -> Self {
        let topo = Self {
            volumes: RefCell::new(BTreeMap::new()),
            sizes: RefCell::new(BTreeMap::new()),
            system_volume_fails: Cell::new(false),
            raw_access_denied: Cell::new(false),
        };
        topo.set_volume(Self::EXE_VOLUME, vec![target.clone()]);
        topo.set_volume(Self::SYSTEM_VOLUME, vec![host]);
        topo.set_size(&target, target_size);
        topo
    }

    pub fn set_volume(&self, volume: &str, disks: Vec<PhysicalDiskRef>) {
        self.volumes.borrow_mut().insert(volume.to_string(), disks);
    }

    pub fn set_size(&self, disk: &PhysicalDiskRef, size: u64) {
        self.sizes.borrow_mut().insert(disk.name().to_string(), size);
    }
}

impl DiskTopology for FakeTopology {
    fn volume_of(&self, _path: &Path) -> Result<VolumeRef, LocateError> {
        Ok(VolumeRef::new(Self::EXE_VOLUME))
    }

    fn system_volume(&self) -> Result<VolumeRef, LocateError> {
        if self.system_volume_fails.get() {
            return Err(LocateError::Volume {
                path: PathBuf::from("%SystemDrive%"),
                reason: "SystemDrive is not set".to_string(),
            });
        }
        Ok(VolumeRef::new(Self::SYSTEM_VOLUME))
    }

    fn disks_of(&self, volume: &VolumeRef) -> Result<Vec<PhysicalDiskRef>, LocateError> {
        Ok(self
            .volumes
            .borrow()
            .get(volume.id())
            .cloned()
            .unwrap_or_default())
    }

    fn disk_size(&self, disk: &PhysicalDiskRef) -> anyhow::Result<u64> {
        self.sizes
            .borrow()
            .get(disk.name())
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no such disk {disk}"))
    }

    fn check_raw_access(&self, disk: &PhysicalDiskRef) -> Result<(), PrivilegeError> {
        if self.raw_access_denied.get() {
            return Err(PrivilegeError {
                device: disk.device_path().display().to_string(),
                reason: "the process is not elevated".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeVm {
    pub spec: VmSpec,
    /// Attached image path and the size its descriptor declares.
    pub boot_disk: Option<(PathBuf, u64)>,
    pub running: bool,
}

#[derive(Default)]
pub struct FakeHypervisor {
    pub vms: RefCell<BTreeMap<String, FakeVm>>,
    pub media: RefCell<BTreeSet<PathBuf>>,
    pub calls: RefCell<Vec<String>>,
    /// Operation name that fails with a command error.
    pub fail_on: RefCell<Option<&'static str>>,
    /// Operation name that fails with an access-denied error.
    pub deny_on: RefCell<Option<&'static str>>,
    /// Power-off requests are accepted but the VM keeps running.
    pub ignore_power_off: Cell<bool>,
    /// Detach requests succeed but the disk stays attached.
    pub ignore_detach: Cell<bool>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn call(&self, op: &'static str, target: &str) -> Result<(), ProvisionError> {
        self.calls.borrow_mut().push(format!("{op} {target}"));
        let command = format!("VBoxManage {op} {target}");
        if *self.deny_on.borrow() == Some(op) {
            return Err(ProvisionError::AccessDenied {
                command,
                stderr: "VERR_ACCESS_DENIED".to_string(),
            });
        }
        if *self.fail_on.borrow() == Some(op) {
            return Err(ProvisionError::CommandFailed {
                command,
                code: 1,
                stderr: format!("{op} failed"),
            });
        }
        Ok(())
    }

    fn missing(op: &str, name: &str) -> ProvisionError {
        ProvisionError::CommandFailed {
            command: format!("VBoxManage {op} {name}"),
            code: 1,
            stderr: format!("Could not find a registered machine named '{name}'"),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|c| c.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    /// Calls that change hypervisor state.
    pub fn mutations(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter(|op| !matches!(op.as_str(), "vm_exists" | "is_running" | "boot_disk"))
            .collect()
    }

    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.vms.borrow().get(name).cloned()
    }

    /// A VM left over from an earlier run.
    pub fn register(&self, vm: FakeVm) {
        if let Some((image, _)) = &vm.boot_disk {
            self.media.borrow_mut().insert(image.clone());
        }
        self.vms.borrow_mut().insert(vm.spec.name.clone(), vm);
    }
}

impl Hypervisor for FakeHypervisor {
    fn vm_exists(&self, name: &str) -> Result<bool, ProvisionError> {
        self.call("vm_exists", name)?;
        Ok(self.vms.borrow().contains_key(name))
    }

    fn is_running(&self, name: &str) -> Result<bool, ProvisionError> {
        self.call("is_running", name)?;
        Ok(self.vms.borrow().get(name).is_some_and(|vm| vm.running))
    }

    fn power_off(&self, name: &str) -> Result<(), ProvisionError> {
        self.call("power_off", name)?;
        let mut vms = self.vms.borrow_mut();
        let vm = vms.get_mut(name).ok_or_else(|| Self::missing("controlvm", name))?;
        if !vm.running {
            return Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage controlvm {name} poweroff"),
                code: 1,
                stderr: "Machine is not currently running".to_string(),
            });
        }
        if !self.ignore_power_off.get() {
            vm.running = false;
        }
        Ok(())
    }

    fn boot_disk(&self, name: &str) -> Result<Option<PathBuf>, ProvisionError> {
        self.call("boot_disk", name)?;
        let vms = self.vms.borrow();
        let vm = vms.get(name).ok_or_else(|| Self::missing("showvminfo", name))?;
        Ok(vm.boot_disk.as_ref().map(|(image, _)| image.clone()))
    }

    fn detach_storage(&self, name: &str) -> Result<(), ProvisionError> {
        self.call("detach_storage", name)?;
        let mut vms = self.vms.borrow_mut();
        let vm = vms.get_mut(name).ok_or_else(|| Self::missing("storageattach", name))?;
        if vm.boot_disk.is_none() {
            return Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage storageattach {name} --medium none"),
                code: 1,
                stderr: "No storage device attached to device slot 0 on port 0".to_string(),
            });
        }
        if !self.ignore_detach.get() {
            vm.boot_disk = None;
        }
        Ok(())
    }

    fn delete_vm(&self, name: &str) -> Result<(), ProvisionError> {
        self.call("delete_vm", name)?;
        let mut vms = self.vms.borrow_mut();
        match vms.get(name) {
            None => Err(Self::missing("unregistervm", name)),
            Some(vm) if vm.running => Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage unregistervm {name} --delete"),
                code: 1,
                stderr: "Cannot unregister the machine while it is running".to_string(),
            }),
            Some(_) => {
                // `--delete` takes attached media with it.
                if let Some(vm) = vms.remove(name) {
                    if let Some((image, _)) = vm.boot_disk {
                        self.media.borrow_mut().remove(&image);
                        let _ = std::fs::remove_file(&image);
                    }
                }
                Ok(())
            }
        }
    }

    fn close_medium(&self, path: &Path) -> Result<(), ProvisionError> {
        self.call("close_medium", &path.display().to_string())?;
        let in_use = self
            .vms
            .borrow()
            .values()
            .any(|vm| vm.boot_disk.as_ref().is_some_and(|(p, _)| p == path));
        if in_use {
            return Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage closemedium disk {}", path.display()),
                code: 1,
                stderr: "medium is locked for reading by another task".to_string(),
            });
        }
        if !self.media.borrow_mut().remove(path) {
            return Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage closemedium disk {}", path.display()),
                code: 1,
                stderr: "Could not find file for the medium".to_string(),
            });
        }
        Ok(())
    }

    fn remove_leftover_files(&self, name: &str) -> Result<(), ProvisionError> {
        self.call("remove_leftover_files", name)
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        self.call("create_vm", &spec.name)?;
        let mut vms = self.vms.borrow_mut();
        if vms.contains_key(&spec.name) {
            return Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage createvm --name {}", spec.name),
                code: 1,
                stderr: format!("Machine settings file '{}.vbox' already exists", spec.name),
            });
        }
        vms.insert(
            spec.name.clone(),
            FakeVm {
                spec: spec.clone(),
                boot_disk: None,
                running: false,
            },
        );
        Ok(())
    }

    fn attach_boot_disk(&self, name: &str, image: &Path) -> Result<(), ProvisionError> {
        self.call("attach_boot_disk", name)?;
        let descriptor =
            RawDiskDescriptor::load(image).map_err(|e| ProvisionError::CommandFailed {
                command: format!("VBoxManage storageattach {name}"),
                code: 1,
                stderr: e.to_string(),
            })?;
        if self.media.borrow().contains(image) {
            return Err(ProvisionError::CommandFailed {
                command: format!("VBoxManage storageattach {name}"),
                code: 1,
                stderr: "Cannot register the hard disk because a hard disk with UUID \
                         already exists"
                    .to_string(),
            });
        }
        let mut vms = self.vms.borrow_mut();
        let vm = vms.get_mut(name).ok_or_else(|| Self::missing("storageattach", name))?;
        vm.boot_disk = Some((image.to_path_buf(), descriptor.size_bytes()));
        self.media.borrow_mut().insert(image.to_path_buf());
        Ok(())
    }

    fn start_vm(&self, name: &str) -> Result<(), ProvisionError> {
        self.call("start_vm", name)?;
        let mut vms = self.vms.borrow_mut();
        let vm = vms.get_mut(name).ok_or_else(|| Self::missing("startvm", name))?;
        vm.running = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host resources
// ---------------------------------------------------------------------------

pub struct FakeHost {
    pub cpus: usize,
    pub available_mb: u64,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            cpus: 8,
            available_mb: 16_384,
        }
    }
}

impl HostResources for FakeHost {
    fn logical_cpus(&self) -> usize {
        self.cpus
    }

    fn available_memory_bytes(&self) -> anyhow::Result<u64> {
        Ok(self.available_mb * 1024 * 1024)
    }
}
