//! The launch pipeline.
//!
//! locate → safety → privilege → descriptor build → provision → start.
//! Each stage runs only if the previous one succeeded, and nothing reaches
//! the hypervisor unless the safety gate allowed the target disk.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::GuestProfile;
use crate::disk::locator::DiskLocator;
use crate::disk::safety::{SafetyDecision, SafetyGuard};
use crate::disk::{DiskTopology, PhysicalDiskRef};
use crate::error::LaunchError;
use crate::vm::resources::{self, HostResources};
use crate::vm::{DescriptorBuilder, Hypervisor, VmProvisioner, VmSpec};

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The VM was recreated around `disk` and started.
    Started {
        vm: String,
        disk: PhysicalDiskRef,
        size_bytes: u64,
    },
    /// Dry run: `disk` was located and passed the safety gate.
    Checked { disk: PhysicalDiskRef },
}

pub struct LaunchController<'a> {
    topology: &'a dyn DiskTopology,
    hypervisor: &'a dyn Hypervisor,
    host: &'a dyn HostResources,
    profile: GuestProfile,
    descriptor_path: PathBuf,
    dry_run: bool,
}

impl<'a> LaunchController<'a> {
    pub fn new(
        topology: &'a dyn DiskTopology,
        hypervisor: &'a dyn Hypervisor,
        host: &'a dyn HostResources,
        profile: GuestProfile,
        descriptor_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            topology,
            hypervisor,
            host,
            profile,
            descriptor_path: descriptor_path.into(),
            dry_run: false,
        }
    }

    /// Stop after the safety gate.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run the whole pipeline for the disk this executable was started from.
    pub fn run(&self) -> Result<LaunchOutcome, LaunchError> {
        let disk = DiskLocator::new(self.topology).locate()?;
        info!(%disk, "launch disk located");
        self.launch(disk)
    }

    /// Run the pipeline for an already resolved disk.
    pub fn launch(&self, disk: PhysicalDiskRef) -> Result<LaunchOutcome, LaunchError> {
        if let SafetyDecision::Deny(reason) = SafetyGuard::new(self.topology).check(&disk) {
            warn!(%disk, %reason, "launch denied");
            return Err(LaunchError::SafetyDenied(reason));
        }

        if self.dry_run {
            info!(%disk, "dry run, stopping before the hypervisor");
            return Ok(LaunchOutcome::Checked { disk });
        }

        self.topology.check_raw_access(&disk)?;

        let descriptor = DescriptorBuilder::new(self.topology).build(&disk, &self.descriptor_path)?;

        let spec = VmSpec {
            name: self.profile.vm_name.clone(),
            os_type: self.profile.os_type.clone(),
            firmware: self.profile.firmware,
            resources: resources::plan(self.host, &self.profile)
                .map_err(LaunchError::provision)?,
        };

        let provisioner = VmProvisioner::new(self.hypervisor);
        let handle = provisioner
            .provision(&spec, &descriptor)
            .map_err(LaunchError::provision)?;
        provisioner.start(&handle).map_err(LaunchError::start)?;

        info!(vm = handle.name(), %disk, "VM started");
        Ok(LaunchOutcome::Started {
            vm: handle.name().to_string(),
            size_bytes: descriptor.size_bytes(),
            disk,
        })
    }
}
