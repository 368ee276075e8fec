//! Size the VM from the host's free resources.
//!
//! Half the logical CPUs, half the available RAM and a sixth of it for video
//! memory (VirtualBox caps that at 256 MB). Any of the three can be pinned
//! by the guest profile.

use tracing::info;

use super::VmResources;
use crate::config::GuestProfile;
use crate::error::ProvisionError;

/// Below this much available RAM the guest would not boot usefully.
pub const MIN_AVAILABLE_MEMORY_MB: u64 = 1024;

/// VirtualBox's hard limit on video memory.
pub const VRAM_LIMIT_MB: u64 = 256;

const MIB: u64 = 1024 * 1024;

/// What the host has available right now.
pub trait HostResources {
    fn logical_cpus(&self) -> usize;

    fn available_memory_bytes(&self) -> anyhow::Result<u64>;
}

/// Live host resources.
#[derive(Debug, Default)]
pub struct SystemResources;

impl HostResources for SystemResources {
    fn logical_cpus(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    #[cfg(target_os = "linux")]
    fn available_memory_bytes(&self) -> anyhow::Result<u64> {
        use anyhow::Context;
        let meminfo =
            std::fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
        parse_mem_available(&meminfo).context("MemAvailable missing from /proc/meminfo")
    }

    #[cfg(target_os = "windows")]
    fn available_memory_bytes(&self) -> anyhow::Result<u64> {
        crate::disk::windows::WindowsTopology::from_env().available_memory_bytes()
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    fn available_memory_bytes(&self) -> anyhow::Result<u64> {
        anyhow::bail!("available memory cannot be queried on this platform")
    }
}

/// `MemAvailable` from `/proc/meminfo`, in bytes.
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let value = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = value.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}

/// Decide the VM's hardware from the host and the profile's overrides.
pub fn plan(
    host: &dyn HostResources,
    profile: &GuestProfile,
) -> Result<VmResources, ProvisionError> {
    let cpus = match profile.cpus {
        Some(cpus) => cpus,
        None => u32::try_from(host.logical_cpus() / 2).unwrap_or(u32::MAX).max(1),
    };

    let (memory_mb, vram_mb) = match (profile.memory_mb, profile.vram_mb) {
        (Some(memory), Some(vram)) => (memory, vram),
        (memory, vram) => {
            let available_mb = host
                .available_memory_bytes()
                .map_err(|e| ProvisionError::ResourceQuery(format!("{e:#}")))?
                / MIB;
            if available_mb < MIN_AVAILABLE_MEMORY_MB {
                return Err(ProvisionError::InsufficientMemory {
                    available_mb,
                    required_mb: MIN_AVAILABLE_MEMORY_MB,
                });
            }
            (
                memory.unwrap_or(available_mb / 2),
                // Video memory comes out of host RAM, not the graphics card.
                vram.unwrap_or((available_mb / 6).min(VRAM_LIMIT_MB)),
            )
        }
    };

    let resources = VmResources {
        memory_mb,
        vram_mb,
        cpus,
    };
    info!(memory_mb, vram_mb, cpus, "planned VM resources");
    Ok(resources)
}
