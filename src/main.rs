//! diskvm command-line entry point.
//!
//! Meant to be double-clicked from the portable disk: no flags are needed,
//! and on failure the console window stays open until Enter is pressed.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use diskvm::config::LauncherConfig;
use diskvm::disk;
use diskvm::paths::AppPaths;
use diskvm::vm::VBoxManage;
use diskvm::vm::resources::SystemResources;
use diskvm::{LaunchController, LaunchOutcome, logging};

/// Boot the physical disk this binary lives on as a VirtualBox VM
#[derive(Parser, Debug)]
#[command(name = "diskvm", version, about)]
struct Args {
    /// Config file (default: <config dir>/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest profile to launch (overrides the config file)
    #[arg(short, long)]
    profile: Option<String>,

    /// Exit immediately on failure instead of waiting for Enter
    #[arg(long)]
    no_pause: bool,

    /// Locate the disk and run the safety check only
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let paths = AppPaths::resolve();
    let _log_guard = logging::init(paths.as_ref().map(|p| p.logs.as_path()));

    println!("diskvm v{}", env!("CARGO_PKG_VERSION"));

    match run(&args, paths.as_ref()) {
        Ok(LaunchOutcome::Started {
            vm,
            disk,
            size_bytes,
        }) => {
            println!("Started VM {vm} on {disk} ({size_bytes} bytes).");
            ExitCode::SUCCESS
        }
        Ok(LaunchOutcome::Checked { disk }) => {
            println!("{disk} can be launched (dry run, nothing changed).");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("\nError: {e:#}");
            if !args.no_pause {
                pause();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, paths: Option<&AppPaths>) -> Result<LaunchOutcome> {
    let config = match (&args.config, paths) {
        (Some(path), _) => LauncherConfig::load(path)?,
        (None, Some(paths)) => LauncherConfig::load_or_default(&paths.config_file())?,
        (None, None) => LauncherConfig::default(),
    };
    let profile = config.select_profile(args.profile.as_deref())?.clone();

    let descriptor_path = match (&config.descriptor_path, paths) {
        (Some(path), _) => path.clone(),
        (None, Some(paths)) => paths.descriptor_path(),
        (None, None) => {
            anyhow::bail!("cannot determine the data directory; set descriptor_path in the config")
        }
    };

    let topology = disk::host_topology();
    let vbox = VBoxManage::discover(config.vboxmanage.as_deref());
    let host = SystemResources;

    // LaunchError messages lead with the failed stage.
    let outcome = LaunchController::new(topology.as_ref(), &vbox, &host, profile, descriptor_path)
        .dry_run(args.dry_run)
        .run()?;
    Ok(outcome)
}

fn pause() {
    eprint!("Press Enter to exit...");
    let _ = io::stderr().flush();
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}
