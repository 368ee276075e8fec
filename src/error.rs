//! Error taxonomy for the launch pipeline.
//!
//! Each stage owns a typed error. [`LaunchError`] aggregates them and knows
//! which [`Stage`] failed so the binary can tell the user where it stopped.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::disk::VolumeRef;
use crate::disk::safety::DenyReason;

/// The executable could not be mapped to exactly one physical disk.
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("cannot determine the path of the running executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("cannot resolve the volume containing {path}: {reason}")]
    Volume { path: PathBuf, reason: String },

    #[error(
        "volume {volume} resolves to {count} physical disks; only a volume on \
         exactly one local disk is supported"
    )]
    AmbiguousOrUnsupportedTopology { volume: VolumeRef, count: usize },

    #[error("disk enumeration failed for volume {volume}: {reason}")]
    Enumeration { volume: VolumeRef, reason: String },

    #[error("physical disk resolution is not supported on this platform")]
    UnsupportedPlatform,
}

/// The raw-disk descriptor could not be produced (or read back).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot query the size of disk {disk}: {reason}")]
    SizeQuery { disk: String, reason: String },

    #[error("disk {disk} reports an unusable size of {size_bytes} bytes")]
    InvalidSize { disk: String, size_bytes: u64 },

    #[error("cannot write descriptor {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read descriptor {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("descriptor {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// A hypervisor command (or the resource planning feeding it) failed.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(
        "VBoxManage not found (searched: {searched}). Install VirtualBox and add \
         its install directory to PATH, or set `vboxmanage` in the config file."
    )]
    ToolNotFound { searched: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` was refused by the hypervisor: {stderr}")]
    AccessDenied { command: String, stderr: String },

    #[error("cannot remove leftover machine folder {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to remove {path}: it is not a folder inside the machine folder")]
    UnsafeLeftoverPath { path: PathBuf },

    #[error("{image} is still attached to VM {name} after detaching; not deleting the VM")]
    StillAttached { name: String, image: PathBuf },

    #[error("VM {name} is still running after power-off was requested")]
    StillRunning { name: String },

    #[error("not enough free memory ({available_mb} MB available, at least {required_mb} MB needed)")]
    InsufficientMemory { available_mb: u64, required_mb: u64 },

    #[error("cannot query host resources: {0}")]
    ResourceQuery(String),
}

/// The process lacks the rights to hand the raw device to the hypervisor.
#[derive(Debug, Error)]
#[error(
    "insufficient privilege to attach raw device {device}: {reason}. \
     Re-run as administrator (or root)."
)]
pub struct PrivilegeError {
    pub device: String,
    pub reason: String,
}

/// Pipeline stage, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Locate,
    Safety,
    Privilege,
    DescriptorBuild,
    Provision,
    Start,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Locate => "locate",
            Stage::Safety => "safety",
            Stage::Privilege => "privilege",
            Stage::DescriptorBuild => "descriptor build",
            Stage::Provision => "provision",
            Stage::Start => "start",
        };
        f.write_str(name)
    }
}

/// Any failure that aborts a launch.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("locate failed: {0}")]
    Locate(#[from] LocateError),

    #[error("safety check denied the launch: {0}")]
    SafetyDenied(DenyReason),

    #[error("privilege check failed: {0}")]
    Privilege(#[from] PrivilegeError),

    #[error("descriptor build failed: {0}")]
    Build(#[from] BuildError),

    #[error("provision failed: {0}")]
    Provision(ProvisionError),

    #[error("start failed: {0}")]
    Start(ProvisionError),
}

impl LaunchError {
    pub fn stage(&self) -> Stage {
        match self {
            LaunchError::Locate(_) => Stage::Locate,
            LaunchError::SafetyDenied(_) => Stage::Safety,
            LaunchError::Privilege(_) => Stage::Privilege,
            LaunchError::Build(_) => Stage::DescriptorBuild,
            LaunchError::Provision(_) => Stage::Provision,
            LaunchError::Start(_) => Stage::Start,
        }
    }

    /// Wrap a provisioning failure, promoting hypervisor access denials to
    /// [`LaunchError::Privilege`].
    pub fn provision(err: ProvisionError) -> Self {
        match err {
            ProvisionError::AccessDenied { command, stderr } => {
                LaunchError::Privilege(PrivilegeError {
                    device: command,
                    reason: stderr,
                })
            }
            other => LaunchError::Provision(other),
        }
    }

    pub fn start(err: ProvisionError) -> Self {
        match err {
            ProvisionError::AccessDenied { command, stderr } => {
                LaunchError::Privilege(PrivilegeError {
                    device: command,
                    reason: stderr,
                })
            }
            other => LaunchError::Start(other),
        }
    }
}
