//! Launcher configuration.
//!
//! An optional TOML file selects the guest profile and can override the
//! `VBoxManage` location and the descriptor path. Every field has a default
//! so a partial file (or none at all) works:
//!
//! ```toml
//! profile = "ubuntu"
//!
//! [profiles.ubuntu]
//! memory_mb = 4096
//! ```
//!
//! Profiles named like a built-in inherit its fields; other profiles must
//! set `vm_name` and `os_type` themselves.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::vm::Firmware;

pub const DEFAULT_PROFILE: &str = "manjaro";

/// Names of the profiles shipped with the launcher.
pub const BUILTIN_PROFILES: &[&str] = &["manjaro", "ubuntu", "windows"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown profile {name:?} (available: {available})")]
    UnknownProfile { name: String, available: String },

    #[error("profile {name:?} is invalid: {reason}")]
    InvalidProfile { name: String, reason: String },
}

/// Guest OS profile: what VM gets created around the launch disk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GuestProfile {
    /// Registry name of the VM. Recreated on every run.
    pub vm_name: String,
    /// VirtualBox guest OS type id.
    pub os_type: String,
    pub firmware: Firmware,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vram_mb: Option<u64>,
}

impl GuestProfile {
    pub fn builtin(name: &str) -> Option<Self> {
        let (vm_name, os_type) = match name {
            "manjaro" => ("portable-manjaro-DO-NOT-BOOT-FROM-GUI", "ArchLinux_64"),
            "ubuntu" => ("portable-ubuntu-DO-NOT-BOOT-FROM-GUI", "Ubuntu_64"),
            "windows" => ("portable-windows-DO-NOT-BOOT-FROM-GUI", "Windows10_64"),
            _ => return None,
        };
        Some(Self {
            vm_name: vm_name.to_string(),
            os_type: os_type.to_string(),
            firmware: Firmware::Efi,
            ..Self::default()
        })
    }

    /// Take fields left empty from `base`.
    fn inherit(&mut self, base: &GuestProfile) {
        if self.vm_name.is_empty() {
            self.vm_name = base.vm_name.clone();
        }
        if self.os_type.is_empty() {
            self.os_type = base.os_type.clone();
        }
        self.memory_mb = self.memory_mb.or(base.memory_mb);
        self.cpus = self.cpus.or(base.cpus);
        self.vram_mb = self.vram_mb.or(base.vram_mb);
    }

    /// The VM name doubles as a machine folder name, so it must be a valid
    /// file name on every host.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.vm_name.as_str();
        if name.trim().is_empty() {
            return Err("vm_name is empty".to_string());
        }
        if name == "." || name == ".." {
            return Err(format!("vm_name {name:?} is not a folder name"));
        }
        if name != name.trim() || name.starts_with('.') || name.ends_with('.') {
            return Err("vm_name must not start or end with a dot or whitespace".to_string());
        }
        if let Some(bad) = self
            .vm_name
            .chars()
            .find(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control())
        {
            return Err(format!("vm_name contains {bad:?}"));
        }
        if self.os_type.trim().is_empty() {
            return Err("os_type is empty".to_string());
        }
        if self.cpus == Some(0) {
            return Err("cpus must be at least 1".to_string());
        }
        if self.memory_mb == Some(0) {
            return Err("memory_mb must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Profile used when none is given on the command line.
    pub profile: String,
    /// Explicit `VBoxManage` executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vboxmanage: Option<PathBuf>,
    /// Where the raw-disk descriptor is written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor_path: Option<PathBuf>,
    pub profiles: BTreeMap<String, GuestProfile>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let profiles = BUILTIN_PROFILES
            .iter()
            .filter_map(|name| Some((name.to_string(), GuestProfile::builtin(name)?)))
            .collect();
        Self {
            profile: DEFAULT_PROFILE.to_string(),
            vboxmanage: None,
            descriptor_path: None,
            profiles,
        }
    }
}

impl LauncherConfig {
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Parse a config file, merging the built-in profiles.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(s)?;
        for name in BUILTIN_PROFILES {
            let Some(builtin) = GuestProfile::builtin(name) else {
                continue;
            };
            config
                .profiles
                .entry(name.to_string())
                .and_modify(|p| p.inherit(&builtin))
                .or_insert(builtin);
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), profile = %config.profile, "loaded config");
        Ok(config)
    }

    /// Load `path` if it exists, built-in defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the profile to launch: `requested` if given, the configured
    /// default otherwise.
    pub fn select_profile(&self, requested: Option<&str>) -> Result<&GuestProfile, ConfigError> {
        let name = requested.unwrap_or(&self.profile);
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_string(),
                available: self.profiles.keys().cloned().collect::<Vec<_>>().join(", "),
            })?;
        profile
            .validate()
            .map_err(|reason| ConfigError::InvalidProfile {
                name: name.to_string(),
                reason,
            })?;
        Ok(profile)
    }
}
