//! Destroy-then-recreate provisioning of the launch VM.
//!
//! Every run tears down whatever VM carries the configured name and builds a
//! fresh one around the current descriptor. Attachment size and geometry are
//! fixed when a VM is created, so a definition from an earlier run is never
//! reused.
//!
//! Provisioning is one transaction:
//!
//! 1. **Teardown**: power off (best-effort), detach storage, unregister and
//!    delete the VM, then drop the descriptor from the media registry. The
//!    descriptor file and the physical disk are never deleted: deleting a VM
//!    also deletes whatever is still attached, so a VM whose disk cannot be
//!    detached is left in place and the run fails.
//! 2. **Build**: create the VM and attach the descriptor as boot disk. If
//!    either step fails, the half-built VM is removed again so the registry
//!    holds either a complete VM or none.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{Hypervisor, RawDiskDescriptor, VmHandle, VmSpec};
use crate::error::ProvisionError;

/// How long to wait for a powered-off VM to leave the running list.
const POWEROFF_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct VmProvisioner<'a> {
    hypervisor: &'a dyn Hypervisor,
    poweroff_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> VmProvisioner<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor) -> Self {
        Self {
            hypervisor,
            poweroff_timeout: POWEROFF_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the power-off wait.
    pub fn with_poweroff_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.poweroff_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Replace any existing VM named `spec.name` with a fresh one booting
    /// from `descriptor`.
    pub fn provision(
        &self,
        spec: &VmSpec,
        descriptor: &RawDiskDescriptor,
    ) -> Result<VmHandle, ProvisionError> {
        info!(vm = %spec.name, disk = %descriptor.disk(), "provisioning VM");

        self.teardown(&spec.name, descriptor)?;

        if let Err(e) = self.build(spec, descriptor) {
            warn!(vm = %spec.name, error = %e, "provisioning failed, rolling back");
            self.rollback(&spec.name, descriptor);
            return Err(e);
        }

        info!(vm = %spec.name, "VM provisioned");
        Ok(VmHandle::new(spec.name.clone()))
    }

    /// Start a provisioned VM. Returns once the hypervisor has launched it.
    pub fn start(&self, handle: &VmHandle) -> Result<(), ProvisionError> {
        info!(vm = handle.name(), "starting VM");
        self.hypervisor.start_vm(handle.name())
    }

    fn teardown(&self, name: &str, descriptor: &RawDiskDescriptor) -> Result<(), ProvisionError> {
        if self.hypervisor.vm_exists(name)? {
            info!(vm = name, "removing existing VM");

            if self.hypervisor.is_running(name)? {
                // An "already off" failure is fine; the wait below decides.
                if let Err(e) = self.hypervisor.power_off(name) {
                    debug!(vm = name, error = %e, "power-off request failed");
                }
                self.wait_until_stopped(name)?;
            }

            self.detach(name)?;
            self.hypervisor.delete_vm(name)?;
        }

        // The descriptor was rewritten with a new identity, so any earlier
        // registration of the same path is stale.
        if let Err(e) = self.hypervisor.close_medium(descriptor.path()) {
            debug!(path = %descriptor.path().display(), error = %e, "no stale medium to close");
        }

        self.hypervisor.remove_leftover_files(name)
    }

    /// Detach whatever sits in the boot slot and confirm the slot is empty.
    fn detach(&self, name: &str) -> Result<(), ProvisionError> {
        let Some(image) = self.hypervisor.boot_disk(name)? else {
            return Ok(());
        };
        debug!(vm = name, image = %image.display(), "detaching boot disk");
        self.hypervisor.detach_storage(name)?;
        if self.hypervisor.boot_disk(name)?.is_some() {
            return Err(ProvisionError::StillAttached {
                name: name.to_string(),
                image,
            });
        }
        Ok(())
    }

    fn wait_until_stopped(&self, name: &str) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + self.poweroff_timeout;
        loop {
            if !self.hypervisor.is_running(name)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::StillRunning {
                    name: name.to_string(),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn build(&self, spec: &VmSpec, descriptor: &RawDiskDescriptor) -> Result<(), ProvisionError> {
        self.hypervisor.create_vm(spec)?;
        self.hypervisor
            .attach_boot_disk(&spec.name, descriptor.path())?;
        Ok(())
    }

    /// Best-effort removal of a partially built VM.
    fn rollback(&self, name: &str, descriptor: &RawDiskDescriptor) {
        match self.hypervisor.vm_exists(name) {
            Ok(true) => {
                if let Err(e) = self.detach(name) {
                    warn!(vm = name, error = %e, "rollback left the VM in place");
                } else if let Err(e) = self.hypervisor.delete_vm(name) {
                    warn!(vm = name, error = %e, "rollback could not delete VM");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(vm = name, error = %e, "rollback could not query registry"),
        }
        if let Err(e) = self.hypervisor.close_medium(descriptor.path()) {
            debug!(error = %e, "rollback: medium not registered");
        }
    }
}
