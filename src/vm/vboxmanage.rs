//! VirtualBox control through the `VBoxManage` CLI.
//!
//! ## External requirements
//!
//! - `VBoxManage` resolvable from the config file, `PATH`, or the default
//!   VirtualBox install directory (see [`find_vboxmanage`]).
//!
//! The commands used, in provisioning order:
//!
//! ```text
//! list vms | list runningvms
//! controlvm <vm> poweroff
//! showvminfo <vm> --machinereadable
//! storageattach <vm> --storagectl "SATA Controller" ... --medium none
//! unregistervm <vm> --delete
//! closemedium disk <descriptor>
//! createvm --name <vm> --ostype <type> --register
//! storagectl <vm> --name "SATA Controller" --add sata --controller IntelAHCI
//! modifyvm <vm> --ioapic on --firmware efi --memory .. --boot1 disk ..
//! storageattach <vm> ... --type hdd --medium <descriptor> --nonrotational on
//! startvm <vm> --type gui
//! ```

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{Hypervisor, VmSpec};
use crate::error::ProvisionError;
use crate::process::{CommandRunner, SystemRunner, display_command};

pub const SATA_CONTROLLER: &str = "SATA Controller";

/// Markers VirtualBox prints when the host refuses raw device access.
const ACCESS_DENIED_MARKERS: &[&str] = &["VERR_ACCESS_DENIED", "E_ACCESSDENIED"];

pub struct VBoxManage<R: CommandRunner = SystemRunner> {
    program: Option<PathBuf>,
    searched: String,
    runner: R,
}

impl VBoxManage<SystemRunner> {
    /// Look for `VBoxManage` on this host. A missing tool is only reported
    /// when the first command runs, so nothing fails before the safety gate.
    pub fn discover(configured: Option<&Path>) -> Self {
        let defaults = default_install_paths();
        let searched = describe_search(configured, &defaults);
        let program = find_vboxmanage(configured, std::env::var_os("PATH"), &defaults);
        match &program {
            Some(path) => info!(path = %path.display(), "found VBoxManage"),
            None => warn!(searched = %searched, "VBoxManage not found"),
        }
        Self {
            program,
            searched,
            runner: SystemRunner,
        }
    }
}

impl<R: CommandRunner> VBoxManage<R> {
    /// Use an explicit program path and command runner.
    pub fn with_runner(program: impl Into<PathBuf>, runner: R) -> Self {
        let program = program.into();
        Self {
            searched: program.display().to_string(),
            program: Some(program),
            runner,
        }
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    /// Run one command, returning stdout on success.
    fn run(&self, args: &[String]) -> Result<String, ProvisionError> {
        let program = self
            .program
            .as_deref()
            .ok_or_else(|| ProvisionError::ToolNotFound {
                searched: self.searched.clone(),
            })?;
        let command = display_command(program, args);
        debug!(%command, "VBoxManage");

        let out = self
            .runner
            .run(program, args)
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;

        if out.success() {
            return Ok(out.stdout);
        }

        let stderr = out.stderr.trim().to_string();
        if ACCESS_DENIED_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Err(ProvisionError::AccessDenied { command, stderr });
        }
        Err(ProvisionError::CommandFailed {
            command,
            code: out.code.unwrap_or(-1),
            stderr,
        })
    }

    fn default_machine_folder(&self) -> Result<Option<PathBuf>, ProvisionError> {
        let out = self.run(&args(["list", "systemproperties"]))?;
        Ok(parse_machine_folder(&out))
    }
}

impl<R: CommandRunner> Hypervisor for VBoxManage<R> {
    fn vm_exists(&self, name: &str) -> Result<bool, ProvisionError> {
        let out = self.run(&args(["list", "vms"]))?;
        Ok(parse_vm_names(&out).iter().any(|vm| vm == name))
    }

    fn is_running(&self, name: &str) -> Result<bool, ProvisionError> {
        let out = self.run(&args(["list", "runningvms"]))?;
        Ok(parse_vm_names(&out).iter().any(|vm| vm == name))
    }

    fn power_off(&self, name: &str) -> Result<(), ProvisionError> {
        self.run(&args(["controlvm", name, "poweroff"]))?;
        Ok(())
    }

    fn boot_disk(&self, name: &str) -> Result<Option<PathBuf>, ProvisionError> {
        let out = self.run(&args(["showvminfo", name, "--machinereadable"]))?;
        Ok(parse_boot_disk(&out))
    }

    fn detach_storage(&self, name: &str) -> Result<(), ProvisionError> {
        self.run(&args([
            "storageattach",
            name,
            "--storagectl",
            SATA_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--medium",
            "none",
        ]))?;
        Ok(())
    }

    fn delete_vm(&self, name: &str) -> Result<(), ProvisionError> {
        self.run(&args(["unregistervm", name, "--delete"]))?;
        Ok(())
    }

    fn close_medium(&self, path: &Path) -> Result<(), ProvisionError> {
        let image = path.display().to_string();
        self.run(&args(["closemedium", "disk", &image]))?;
        Ok(())
    }

    fn remove_leftover_files(&self, name: &str) -> Result<(), ProvisionError> {
        let Some(folder) = self.default_machine_folder()? else {
            return Ok(());
        };
        let leftover = folder.join(name);
        // Only a direct child named exactly `name`; never `.`, `..` or a
        // nested path.
        if leftover.parent() != Some(folder.as_path())
            || leftover.file_name() != Some(OsStr::new(name))
        {
            return Err(ProvisionError::UnsafeLeftoverPath { path: leftover });
        }
        if leftover.is_dir() {
            warn!(path = %leftover.display(), "removing leftover machine folder");
            fs::remove_dir_all(&leftover).map_err(|source| ProvisionError::Cleanup {
                path: leftover.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<(), ProvisionError> {
        let name = spec.name.as_str();
        self.run(&args([
            "createvm",
            "--name",
            name,
            "--ostype",
            &spec.os_type,
            "--register",
        ]))?;
        self.run(&args([
            "storagectl",
            name,
            "--name",
            SATA_CONTROLLER,
            "--add",
            "sata",
            "--controller",
            "IntelAHCI",
            "--portcount",
            "1",
        ]))?;
        self.run(&modifyvm_args(spec))?;
        Ok(())
    }

    fn attach_boot_disk(&self, name: &str, image: &Path) -> Result<(), ProvisionError> {
        let medium = image.display().to_string();
        self.run(&args([
            "storageattach",
            name,
            "--storagectl",
            SATA_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "hdd",
            "--medium",
            &medium,
            "--nonrotational",
            "on",
        ]))?;
        Ok(())
    }

    fn start_vm(&self, name: &str) -> Result<(), ProvisionError> {
        self.run(&args(["startvm", name, "--type", "gui"]))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Argument building
// ---------------------------------------------------------------------------

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Firmware, resources and boot order. The attached disk is the only boot
/// device.
fn modifyvm_args(spec: &VmSpec) -> Vec<String> {
    let mut cmd = args(["modifyvm", &spec.name]);

    // Required for 64-bit guests and more than one CPU.
    cmd.extend(args(["--ioapic", "on"]));
    cmd.extend(args(["--firmware", &spec.firmware.to_string()]));

    cmd.extend(args(["--memory", &spec.resources.memory_mb.to_string()]));
    cmd.extend(args(["--vram", &spec.resources.vram_mb.to_string()]));
    cmd.extend(args(["--cpus", &spec.resources.cpus.to_string()]));

    cmd.extend(args([
        "--boot1", "disk", "--boot2", "none", "--boot3", "none", "--boot4", "none",
    ]));
    cmd
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Names from `list vms` / `list runningvms` (`"name" {uuid}` per line).
pub fn parse_vm_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix('"')?;
            let (name, _uuid) = rest.rsplit_once("\" {")?;
            Some(name.to_string())
        })
        .collect()
}

/// Medium in the boot slot from `showvminfo --machinereadable`
/// (`"SATA Controller-0-0"="<path>"`). Empty slots read `none`.
fn parse_boot_disk(output: &str) -> Option<PathBuf> {
    let key = format!("\"{SATA_CONTROLLER}-0-0\"=");
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix(&key)?.trim_matches('"');
        match value {
            "" | "none" | "emptydrive" => None,
            path => Some(PathBuf::from(path)),
        }
    })
}

/// `Default machine folder:` from `list systemproperties`.
fn parse_machine_folder(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        let value = line.strip_prefix("Default machine folder:")?.trim();
        (!value.is_empty()).then(|| PathBuf::from(value))
    })
}

// ---------------------------------------------------------------------------
// Tool discovery
// ---------------------------------------------------------------------------

fn executable_name() -> String {
    format!("VBoxManage{}", std::env::consts::EXE_SUFFIX)
}

/// Install locations checked after `PATH`.
pub fn default_install_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let program_files = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        vec![program_files.join("Oracle").join("VirtualBox").join(executable_name())]
    }
    #[cfg(target_os = "macos")]
    {
        vec![PathBuf::from(
            "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
        )]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/VBoxManage"),
            PathBuf::from("/usr/local/bin/VBoxManage"),
        ]
    }
}

/// Configured path first (it must exist), then `PATH`, then `defaults`.
pub fn find_vboxmanage(
    configured: Option<&Path>,
    path_var: Option<OsString>,
    defaults: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(configured) = configured {
        return configured.is_file().then(|| configured.to_path_buf());
    }

    if let Some(path_var) = path_var {
        let name = executable_name();
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    defaults.iter().find(|p| p.is_file()).cloned()
}

fn describe_search(configured: Option<&Path>, defaults: &[PathBuf]) -> String {
    match configured {
        Some(path) => format!("configured path {}", path.display()),
        None => {
            let mut places = vec!["PATH".to_string()];
            places.extend(defaults.iter().map(|p| p.display().to_string()));
            places.join(", ")
        }
    }
}
