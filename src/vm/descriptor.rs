//! Raw-disk VMDK descriptor for the launch disk.
//!
//! The descriptor is a few hundred bytes of text pointing VirtualBox at the
//! physical device; it never holds disk contents:
//!
//! ```text
//! # Disk DescriptorFile
//! createType="fullDevice"
//! RW <sectors> FLAT "\\.\PhysicalDrive1" 0
//! ```
//!
//! It is regenerated on every run and written through a temporary file that
//! is renamed over the target, so a crash mid-write never leaves a truncated
//! descriptor at the well-known path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::disk::{DiskTopology, PhysicalDiskRef};
use crate::error::BuildError;

pub const SECTOR_SIZE: u64 = 512;

const HEADER: &str = "# Disk DescriptorFile";
const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// A descriptor on disk exposing one physical device as a virtual drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDiskDescriptor {
    disk: PhysicalDiskRef,
    size_bytes: u64,
    path: PathBuf,
}

impl RawDiskDescriptor {
    pub fn disk(&self) -> &PhysicalDiskRef {
        &self.disk
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the device and size recorded in the descriptor at `path`.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let text = fs::read_to_string(path).map_err(|source| BuildError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let malformed = |reason: &str| BuildError::Malformed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if !text.starts_with(HEADER) {
            return Err(malformed("missing descriptor header"));
        }
        let extents: Vec<&str> = text.lines().filter(|l| l.starts_with("RW ")).collect();
        let [extent] = extents.as_slice() else {
            return Err(malformed("expected exactly one extent"));
        };
        let (sectors, device) =
            parse_extent(extent).ok_or_else(|| malformed("unparseable extent line"))?;
        let size_bytes = sectors
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| malformed("extent sector count overflows a byte size"))?;

        Ok(Self {
            disk: PhysicalDiskRef::new(device_name(&device), device.as_str()),
            size_bytes,
            path: path.to_path_buf(),
        })
    }
}

pub struct DescriptorBuilder<'a> {
    topology: &'a dyn DiskTopology,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(topology: &'a dyn DiskTopology) -> Self {
        Self { topology }
    }

    /// Query the size of `target` and (over)write the descriptor at `path`.
    pub fn build(
        &self,
        target: &PhysicalDiskRef,
        path: &Path,
    ) -> Result<RawDiskDescriptor, BuildError> {
        let size_bytes = self
            .topology
            .disk_size(target)
            .map_err(|e| BuildError::SizeQuery {
                disk: target.to_string(),
                reason: format!("{e:#}"),
            })?;

        if size_bytes == 0 || size_bytes % SECTOR_SIZE != 0 {
            return Err(BuildError::InvalidSize {
                disk: target.to_string(),
                size_bytes,
            });
        }

        let contents = render_vmdk(target.device_path(), size_bytes, Uuid::new_v4());
        write_atomic(path, &contents)?;

        info!(
            disk = %target,
            size_bytes,
            path = %path.display(),
            "wrote raw-disk descriptor"
        );

        Ok(RawDiskDescriptor {
            disk: target.clone(),
            size_bytes,
            path: path.to_path_buf(),
        })
    }
}

// ---------------------------------------------------------------------------
// VMDK text
// ---------------------------------------------------------------------------

/// Render a `fullDevice` VMDK descriptor for `device`.
fn render_vmdk(device: &Path, size_bytes: u64, image_uuid: Uuid) -> String {
    let sectors = size_bytes / SECTOR_SIZE;
    // ATA CHS geometry caps, as VirtualBox computes them for raw disks.
    let cylinders = (sectors / (16 * 63)).min(16383);
    let bios_cylinders = (sectors / (255 * 63)).min(1024);
    let cid = image_uuid.as_fields().0;

    format!(
        "{HEADER}\n\
         version=1\n\
         CID={cid:08x}\n\
         parentCID=ffffffff\n\
         createType=\"fullDevice\"\n\
         \n\
         # Extent description\n\
         RW {sectors} FLAT \"{device}\" 0\n\
         \n\
         # The disk Data Base\n\
         #DDB\n\
         \n\
         ddb.virtualHWVersion = \"4\"\n\
         ddb.adapterType=\"ide\"\n\
         ddb.geometry.cylinders=\"{cylinders}\"\n\
         ddb.geometry.heads=\"16\"\n\
         ddb.geometry.sectors=\"63\"\n\
         ddb.geometry.biosCylinders=\"{bios_cylinders}\"\n\
         ddb.geometry.biosHeads=\"255\"\n\
         ddb.geometry.biosSectors=\"63\"\n\
         ddb.uuid.image=\"{image_uuid}\"\n\
         ddb.uuid.parent=\"{NIL_UUID}\"\n\
         ddb.uuid.modification=\"{NIL_UUID}\"\n\
         ddb.uuid.parentmodification=\"{NIL_UUID}\"\n",
        device = device.display(),
    )
}

/// `RW <sectors> FLAT "<device>" 0` → (sectors, device).
fn parse_extent(line: &str) -> Option<(u64, String)> {
    let rest = line.strip_prefix("RW ")?;
    let (sectors, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix("FLAT \"")?;
    let (device, offset) = rest.rsplit_once('"')?;
    if offset.trim() != "0" {
        return None;
    }
    Some((sectors.parse().ok()?, device.to_string()))
}

fn device_name(device: &str) -> &str {
    device.rsplit(['\\', '/']).next().unwrap_or(device)
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), BuildError> {
    let write_err = |source: std::io::Error| BuildError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".diskvm-")
        .suffix(".vmdk.tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
