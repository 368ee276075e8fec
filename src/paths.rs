//! Application directory structure for diskvm.
//!
//! - Config: `%APPDATA%\diskvm\` on Windows, `$XDG_CONFIG_HOME/diskvm/` or
//!   `~/.config/diskvm/` elsewhere
//! - Data:   `%LOCALAPPDATA%\diskvm\`, `$XDG_DATA_HOME/diskvm/` or
//!   `~/.local/share/diskvm/` (holds the raw-disk descriptor)
//! - Logs:   `<data>/logs/`

use std::path::PathBuf;

const APP_NAME: &str = "diskvm";
const CONFIG_FILE: &str = "config.toml";
const DESCRIPTOR_FILE: &str = "linked_drive.vmdk";

/// All resolved application directory paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve from the process environment. Nothing is created; the
    /// descriptor and log writers create their directories on demand.
    pub fn resolve() -> Option<Self> {
        Self::resolve_from(|key| std::env::var_os(key).filter(|v| !v.is_empty()))
    }

    /// Resolve using `lookup` for environment variables.
    pub fn resolve_from(lookup: impl Fn(&str) -> Option<std::ffi::OsString>) -> Option<Self> {
        let var = |key: &str| lookup(key).map(PathBuf::from);

        let (config, data) = if cfg!(target_os = "windows") {
            let roaming = var("APPDATA")?;
            let local = var("LOCALAPPDATA").unwrap_or_else(|| roaming.clone());
            (roaming.join(APP_NAME), local.join(APP_NAME))
        } else {
            let home = var("HOME");
            let config = var("XDG_CONFIG_HOME").or_else(|| home.as_ref().map(|h| h.join(".config")))?;
            let data = var("XDG_DATA_HOME")
                .or_else(|| home.as_ref().map(|h| h.join(".local").join("share")))?;
            (config.join(APP_NAME), data.join(APP_NAME))
        };

        Some(Self {
            logs: data.join("logs"),
            config,
            data,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    /// Default location of the raw-disk descriptor.
    pub fn descriptor_path(&self) -> PathBuf {
        self.data.join(DESCRIPTOR_FILE)
    }
}
