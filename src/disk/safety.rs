//! Refuse to hand the host OS's own disk to the hypervisor.
//!
//! A VM writing to the disk the host is running from corrupts it, so every
//! uncertain case denies. The decision is computed fresh on every call.

use std::fmt;

use tracing::{info, warn};

use super::locator::DiskLocator;
use super::{DiskTopology, PhysicalDiskRef};

/// Why a launch was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The target is the disk the host OS runs from.
    SameDiskAsHostOs { disk: PhysicalDiskRef },
    /// The host OS disk could not be determined.
    ResolutionFailed(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::SameDiskAsHostOs { disk } => write!(
                f,
                "{disk} is the disk the host operating system is running from; \
                 attaching it to a VM could destroy the host installation"
            ),
            DenyReason::ResolutionFailed(reason) => write!(
                f,
                "cannot determine which disk the host operating system runs from \
                 ({reason}); refusing to continue"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    Deny(DenyReason),
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

pub struct SafetyGuard<'a> {
    topology: &'a dyn DiskTopology,
}

impl<'a> SafetyGuard<'a> {
    pub fn new(topology: &'a dyn DiskTopology) -> Self {
        Self { topology }
    }

    pub fn check(&self, target: &PhysicalDiskRef) -> SafetyDecision {
        let host = match DiskLocator::new(self.topology).host_disk() {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "host OS disk resolution failed");
                return SafetyDecision::Deny(DenyReason::ResolutionFailed(e.to_string()));
            }
        };

        info!(target = %target, host = %host, "comparing launch disk with host OS disk");

        if *target == host {
            SafetyDecision::Deny(DenyReason::SameDiskAsHostOs { disk: host })
        } else {
            SafetyDecision::Allow
        }
    }
}
