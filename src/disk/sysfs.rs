//! Linux disk topology read from sysfs and procfs.
//!
//! A path's device number (`stat`) names its block device in
//! `/sys/dev/block/<major>:<minor>`. From there:
//!
//! - a partition resolves to its parent directory (the whole disk);
//! - a stacked device (device-mapper, md) resolves through `slaves/`;
//! - anything left under `/sys/devices/virtual` (loop, zram) is not a
//!   physical disk and contributes nothing.
//!
//! Filesystems with anonymous device numbers (btrfs) are mapped back to their
//! source block device through `/proc/self/mountinfo`.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use super::{DiskTopology, PhysicalDiskRef, VolumeRef};
use crate::error::{LocateError, PrivilegeError};

/// sysfs reports block device sizes in 512-byte units regardless of the
/// device's logical sector size.
const SYSFS_SECTOR_BYTES: u64 = 512;

const MAX_STACK_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct SysfsTopology {
    sysfs_root: PathBuf,
    proc_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_roots("/sys", "/proc", "/dev")
    }

    /// Topology rooted somewhere other than the live system.
    pub fn with_roots(
        sysfs_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            proc_root: proc_root.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Volume for a filesystem with an anonymous (`0:N`) device number.
    fn anonymous_volume(&self, path: &Path, minor: u32) -> Result<VolumeRef, LocateError> {
        let fail = |reason: String| LocateError::Volume {
            path: path.to_path_buf(),
            reason,
        };

        let devno = format!("0:{minor}");
        let mountinfo_path = self.proc_root.join("self/mountinfo");
        let mountinfo = fs::read_to_string(&mountinfo_path)
            .map_err(|e| fail(format!("reading {}: {e}", mountinfo_path.display())))?;
        let mount = find_mount(&mountinfo, &devno)
            .ok_or_else(|| fail(format!("no mount has device number {devno}")))?;

        let Some(relative) = mount.source.strip_prefix("/dev/") else {
            return Err(fail(format!(
                "{} filesystem from {} is not backed by a local block device",
                mount.fstype, mount.source
            )));
        };

        let node = fs::canonicalize(self.dev_root.join(relative))
            .map_err(|e| fail(format!("resolving {}: {e}", mount.source)))?;
        let name = file_name(&node).map_err(|e| fail(e.to_string()))?;

        let members = if mount.fstype == "btrfs" {
            self.btrfs_members(&name)
                .map_err(|e| fail(format!("listing btrfs devices: {e}")))?
        } else {
            vec![name]
        };

        if members.len() != 1 {
            return Err(LocateError::AmbiguousOrUnsupportedTopology {
                count: members.len(),
                volume: VolumeRef::new(members.join("+")),
            });
        }

        let dev_file = self.sysfs_root.join("class/block").join(&members[0]).join("dev");
        let devno = fs::read_to_string(&dev_file)
            .map_err(|e| fail(format!("reading {}: {e}", dev_file.display())))?;
        debug!(source = mount.source, fstype = mount.fstype, "mapped anonymous device");
        Ok(VolumeRef::new(devno.trim()))
    }

    /// All member devices of the btrfs filesystem that `member` belongs to.
    fn btrfs_members(&self, member: &str) -> io::Result<Vec<String>> {
        for fs_dir in fs::read_dir(self.sysfs_root.join("fs/btrfs"))? {
            let devices = fs_dir?.path().join("devices");
            if devices.join(member).symlink_metadata().is_err() {
                continue;
            }
            let mut names = fs::read_dir(&devices)?
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<io::Result<Vec<_>>>()?;
            names.sort();
            return Ok(names);
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{member} is not listed under any btrfs filesystem"),
        ))
    }

    fn collect_disks(
        &self,
        node: &Path,
        disks: &mut BTreeSet<String>,
        depth: usize,
    ) -> io::Result<()> {
        if depth > MAX_STACK_DEPTH {
            return Err(io::Error::other(format!(
                "block device stack under {} is too deep",
                node.display()
            )));
        }

        if node.join("partition").exists() {
            let parent = node
                .parent()
                .ok_or_else(|| io::Error::other("partition without a parent device"))?;
            return self.collect_disks(parent, disks, depth + 1);
        }

        let mut stacked = false;
        let slaves = node.join("slaves");
        if slaves.is_dir() {
            for entry in fs::read_dir(&slaves)? {
                let lower = fs::canonicalize(entry?.path())?;
                self.collect_disks(&lower, disks, depth + 1)?;
                stacked = true;
            }
        }

        if stacked || is_virtual_device(node) {
            return Ok(());
        }

        disks.insert(file_name(node)?);
        Ok(())
    }
}

impl DiskTopology for SysfsTopology {
    fn volume_of(&self, path: &Path) -> Result<VolumeRef, LocateError> {
        let meta = fs::metadata(path).map_err(|e| LocateError::Volume {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let (major, minor) = split_dev(meta.dev());
        if major == 0 {
            return self.anonymous_volume(path, minor);
        }
        Ok(VolumeRef::new(format!("{major}:{minor}")))
    }

    fn system_volume(&self) -> Result<VolumeRef, LocateError> {
        self.volume_of(Path::new("/"))
    }

    fn disks_of(&self, volume: &VolumeRef) -> Result<Vec<PhysicalDiskRef>, LocateError> {
        let enumeration = |reason: String| LocateError::Enumeration {
            volume: volume.clone(),
            reason,
        };

        let link = self.sysfs_root.join("dev/block").join(volume.id());
        let node = fs::canonicalize(&link)
            .map_err(|e| enumeration(format!("{}: {e}", link.display())))?;

        let mut names = BTreeSet::new();
        self.collect_disks(&node, &mut names, 0)
            .map_err(|e| enumeration(e.to_string()))?;

        Ok(names
            .into_iter()
            .map(|name| {
                let device = self.dev_root.join(&name);
                PhysicalDiskRef::new(name, device)
            })
            .collect())
    }

    fn disk_size(&self, disk: &PhysicalDiskRef) -> anyhow::Result<u64> {
        let size_file = self.sysfs_root.join("class/block").join(disk.name()).join("size");
        let sectors: u64 = fs::read_to_string(&size_file)
            .with_context(|| format!("reading {}", size_file.display()))?
            .trim()
            .parse()
            .with_context(|| format!("parsing {}", size_file.display()))?;
        sectors
            .checked_mul(SYSFS_SECTOR_BYTES)
            .with_context(|| format!("{} sectors overflows a byte count", sectors))
    }

    fn check_raw_access(&self, disk: &PhysicalDiskRef) -> Result<(), PrivilegeError> {
        // Open only; nothing is read or written.
        match OpenOptions::new().read(true).write(true).open(disk.device_path()) {
            Ok(_) => Ok(()),
            Err(e) => Err(PrivilegeError {
                device: disk.device_path().display().to_string(),
                reason: if e.kind() == io::ErrorKind::PermissionDenied {
                    "permission denied opening the device read-write".to_string()
                } else {
                    e.to_string()
                },
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split a Linux `dev_t` into major and minor numbers (glibc encoding).
pub(crate) fn split_dev(dev: u64) -> (u32, u32) {
    let major = (((dev >> 8) & 0xfff) as u32) | (((dev >> 32) as u32) & !0xfff);
    let minor = ((dev & 0xff) as u32) | (((dev >> 12) as u32) & !0xff);
    (major, minor)
}

#[derive(Debug, PartialEq, Eq)]
struct MountEntry<'a> {
    fstype: &'a str,
    source: &'a str,
}

/// First `/proc/self/mountinfo` entry with device number `devno`.
fn find_mount<'a>(mountinfo: &'a str, devno: &str) -> Option<MountEntry<'a>> {
    mountinfo.lines().find_map(|line| {
        let (mount, super_block) = line.split_once(" - ")?;
        if mount.split_whitespace().nth(2)? != devno {
            return None;
        }
        let mut fields = super_block.split_whitespace();
        Some(MountEntry {
            fstype: fields.next()?,
            source: fields.next()?,
        })
    })
}

fn is_virtual_device(node: &Path) -> bool {
    let parts: Vec<_> = node.components().map(|c| c.as_os_str()).collect();
    parts.windows(2).any(|w| w[0] == "devices" && w[1] == "virtual")
}

fn file_name(node: &Path) -> io::Result<String> {
    node.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::other(format!("{} has no device name", node.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    /// A fake `/sys` + `/dev` tree built inside a temporary directory.
    struct FakeSys {
        _tmp: tempfile::TempDir,
        root: PathBuf,
    }

    impl FakeSys {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            for dir in ["sys/dev/block", "sys/class/block", "dev", "proc/self"] {
                fs::create_dir_all(root.join(dir)).unwrap();
            }
            Self { _tmp: tmp, root }
        }

        fn topology(&self) -> SysfsTopology {
            SysfsTopology::with_roots(
                self.root.join("sys"),
                self.root.join("proc"),
                self.root.join("dev"),
            )
        }

        /// Register a block device directory and its `dev`/`class` links.
        fn device(&self, rel: &str, devno: &str) -> PathBuf {
            let dir = self.root.join("sys/devices").join(rel);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("dev"), format!("{devno}\n")).unwrap();
            let name = dir.file_name().unwrap().to_owned();
            symlink(&dir, self.root.join("sys/dev/block").join(devno)).unwrap();
            symlink(&dir, self.root.join("sys/class/block").join(&name)).unwrap();
            fs::write(self.root.join("dev").join(&name), b"").unwrap();
            dir
        }

        fn disk(&self, rel: &str, devno: &str, sectors: u64) -> PathBuf {
            let dir = self.device(rel, devno);
            fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
            dir
        }

        fn partition(&self, disk: &Path, name: &str, devno: &str) -> PathBuf {
            let rel = disk
                .strip_prefix(self.root.join("sys/devices"))
                .unwrap()
                .join(name);
            let dir = self.device(rel.to_str().unwrap(), devno);
            fs::write(dir.join("partition"), "1\n").unwrap();
            dir
        }

        fn stacked(&self, name: &str, devno: &str, lower: &[&Path]) -> PathBuf {
            let dir = self.device(&format!("virtual/block/{name}"), devno);
            fs::create_dir_all(dir.join("slaves")).unwrap();
            for l in lower {
                symlink(l, dir.join("slaves").join(l.file_name().unwrap())).unwrap();
            }
            dir
        }
    }

    const SATA: &str = "pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block";
    const NVME: &str = "pci0000:00/0000:00:1d.0/nvme/nvme0";

    fn names(disks: &[PhysicalDiskRef]) -> Vec<&str> {
        disks.iter().map(|d| d.name()).collect()
    }

    #[test]
    fn partition_resolves_to_its_whole_disk() {
        let sys = FakeSys::new();
        let sda = sys.disk(&format!("{SATA}/sda"), "8:0", 976_773_168);
        sys.partition(&sda, "sda1", "8:1");

        let topo = sys.topology();
        let disks = topo.disks_of(&VolumeRef::new("8:1")).unwrap();
        assert_eq!(names(&disks), ["sda"]);
        assert_eq!(disks[0].device_path(), sys.root.join("dev/sda"));
    }

    #[test]
    fn nvme_namespace_partition_resolves() {
        let sys = FakeSys::new();
        let ns = sys.disk(&format!("{NVME}/nvme0n1"), "259:0", 1000);
        sys.partition(&ns, "nvme0n1p3", "259:3");

        let disks = sys.topology().disks_of(&VolumeRef::new("259:3")).unwrap();
        assert_eq!(names(&disks), ["nvme0n1"]);
    }

    #[test]
    fn device_mapper_on_one_disk_resolves_through_slaves() {
        let sys = FakeSys::new();
        let sda = sys.disk(&format!("{SATA}/sda"), "8:0", 1000);
        let sda2 = sys.partition(&sda, "sda2", "8:2");
        sys.stacked("dm-0", "253:0", &[&sda2]);

        let disks = sys.topology().disks_of(&VolumeRef::new("253:0")).unwrap();
        assert_eq!(names(&disks), ["sda"]);
    }

    #[test]
    fn raid_across_two_disks_reports_both() {
        let sys = FakeSys::new();
        let sda = sys.disk(&format!("{SATA}/sda"), "8:0", 1000);
        let sda3 = sys.partition(&sda, "sda3", "8:3");
        let sdb = sys.disk("pci0000:00/0000:00:17.0/ata2/host1/block/sdb", "8:16", 1000);
        let sdb1 = sys.partition(&sdb, "sdb1", "8:17");
        sys.stacked("md0", "9:0", &[&sda3, &sdb1]);

        let disks = sys.topology().disks_of(&VolumeRef::new("9:0")).unwrap();
        assert_eq!(names(&disks), ["sda", "sdb"]);
    }

    #[test]
    fn loop_device_has_no_physical_disk() {
        let sys = FakeSys::new();
        sys.device("virtual/block/loop0", "7:0");

        let disks = sys.topology().disks_of(&VolumeRef::new("7:0")).unwrap();
        assert!(disks.is_empty());
    }

    #[test]
    fn unknown_device_number_is_an_enumeration_error() {
        let sys = FakeSys::new();
        let err = sys.topology().disks_of(&VolumeRef::new("8:99")).unwrap_err();
        assert!(matches!(err, LocateError::Enumeration { .. }));
    }

    #[test]
    fn disk_size_is_sysfs_sectors_times_512() {
        let sys = FakeSys::new();
        sys.disk(&format!("{SATA}/sdb"), "8:16", 976_773_168);
        let disk = PhysicalDiskRef::new("sdb", sys.root.join("dev/sdb"));
        assert_eq!(sys.topology().disk_size(&disk).unwrap(), 500_107_862_016);
    }

    #[test]
    fn btrfs_with_two_members_is_ambiguous() {
        let sys = FakeSys::new();
        let sda = sys.disk(&format!("{SATA}/sda"), "8:0", 1000);
        let sda2 = sys.partition(&sda, "sda2", "8:2");
        let sdb = sys.disk("pci0000:00/0000:00:17.0/ata2/host1/block/sdb", "8:16", 1000);
        let sdb1 = sys.partition(&sdb, "sdb1", "8:17");
        let devices = sys.root.join("sys/fs/btrfs/5f3c/devices");
        fs::create_dir_all(&devices).unwrap();
        symlink(&sda2, devices.join("sda2")).unwrap();
        symlink(&sdb1, devices.join("sdb1")).unwrap();
        fs::write(
            sys.root.join("proc/self/mountinfo"),
            "29 1 0:26 /@ / rw,relatime shared:1 - btrfs /dev/sda2 rw,ssd\n",
        )
        .unwrap();

        let err = sys
            .topology()
            .anonymous_volume(Path::new("/"), 26)
            .unwrap_err();
        assert!(matches!(
            err,
            LocateError::AmbiguousOrUnsupportedTopology { count: 2, .. }
        ));
    }

    #[test]
    fn single_device_btrfs_maps_to_its_partition() {
        let sys = FakeSys::new();
        let ns = sys.disk(&format!("{NVME}/nvme0n1"), "259:0", 1000);
        let p3 = sys.partition(&ns, "nvme0n1p3", "259:3");
        let devices = sys.root.join("sys/fs/btrfs/a1b2/devices");
        fs::create_dir_all(&devices).unwrap();
        symlink(&p3, devices.join("nvme0n1p3")).unwrap();
        fs::write(
            sys.root.join("proc/self/mountinfo"),
            "22 1 0:21 / /boot rw - vfat /dev/nvme0n1p1 rw\n\
             29 1 0:26 /root / rw,relatime shared:1 - btrfs /dev/nvme0n1p3 rw\n",
        )
        .unwrap();

        let topo = sys.topology();
        let volume = topo.anonymous_volume(Path::new("/"), 26).unwrap();
        assert_eq!(volume, VolumeRef::new("259:3"));
        assert_eq!(names(&topo.disks_of(&volume).unwrap()), ["nvme0n1"]);
    }

    #[test]
    fn network_filesystem_is_unsupported() {
        let sys = FakeSys::new();
        fs::write(
            sys.root.join("proc/self/mountinfo"),
            "40 1 0:45 / /mnt/share rw - nfs4 server:/export rw\n",
        )
        .unwrap();

        let err = sys
            .topology()
            .anonymous_volume(Path::new("/mnt/share/diskvm"), 45)
            .unwrap_err();
        assert!(matches!(err, LocateError::Volume { .. }));
        assert!(err.to_string().contains("nfs4"));
    }

    #[test]
    fn split_dev_matches_glibc_encoding() {
        assert_eq!(split_dev(0x801), (8, 1));
        assert_eq!(split_dev(0x10303), (259, 3));
        assert_eq!(split_dev(0x10_0800), (8, 256));
    }

    #[test]
    fn find_mount_reads_fstype_and_source_after_separator() {
        let info = "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue\n";
        assert_eq!(
            find_mount(info, "98:0"),
            Some(MountEntry {
                fstype: "ext3",
                source: "/dev/root"
            })
        );
        assert_eq!(find_mount(info, "98:1"), None);
    }
}
