//! diskvm: boot the physical disk this executable lives on as a VirtualBox VM.
//!
//! The binary finds the disk it was started from, refuses to continue if that
//! disk is the one the host OS runs from, writes a raw-disk VMDK descriptor
//! for the whole disk, and recreates and starts a VirtualBox VM booting from
//! it. See [`launch::LaunchController`] for the pipeline.

pub mod config;
pub mod disk;
pub mod error;
pub mod launch;
pub mod logging;
pub mod paths;
pub mod process;
pub mod vm;

pub use error::{LaunchError, Stage};
pub use launch::{LaunchController, LaunchOutcome};
