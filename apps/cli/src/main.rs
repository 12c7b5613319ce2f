//! usbmount CLI - inspect disk images and run the mount manager as a daemon.
//!
//! `inspect` attaches a raw disk image as drive `sda`, lists its partitions
//! and optionally mounts them. `daemon` keeps the registries alive and takes
//! JSON-lines commands on stdin.

mod daemon;
mod logger;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use usbmount_core::{
    Config, ConnectionEvent, DeviceWatcher, ImageDriver, MountContext, MountLifecycleManager,
    UnmountOutcome, VolumeProbe,
};

/// usbmount CLI tool.
#[derive(Parser)]
#[command(name = "usbmount-cli")]
#[command(about = "Removable drive and mount-point manager", long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/usbmount/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the partitions of a disk image.
    Inspect {
        /// Raw disk image file.
        image: PathBuf,

        /// Mount every available partition, report labels, then release the
        /// drive.
        #[arg(long)]
        mount: bool,
    },
    /// Run as a daemon, accepting commands via stdin.
    Daemon,
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    logger::init(logger::level_with_verbosity(
        config.log_level_filter(),
        cli.verbose,
    ));

    match cli.command {
        Commands::Inspect { image, mount } => {
            if let Err(e) = inspect(&image, mount, config) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Daemon => {
            if let Err(e) = daemon::run_daemon(config) {
                eprintln!("Daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn inspect(image: &Path, mount: bool, config: Config) -> usbmount_core::Result<()> {
    let ctx = MountContext::new(Box::new(VolumeProbe::new()), config);
    let manager = MountLifecycleManager::new(ctx);
    manager.attach(0, Box::new(ImageDriver::open(image, mount)?))?;

    let watcher = DeviceWatcher::with_system_clock(manager.clone());
    if watcher.wait(0)? == ConnectionEvent::TimedOut {
        eprintln!("{} did not come up", image.display());
        std::process::exit(1);
    }

    for device in manager.get_block_device_list().iter().filter(|d| d.attached) {
        println!("{}", device);
    }

    let available: Vec<usize> = manager
        .get_mount_list()
        .iter()
        .filter(|p| p.available())
        .map(|p| p.mount_id())
        .collect();
    if available.is_empty() {
        println!("  no partitions");
        return Ok(());
    }

    if mount {
        for (id, reason) in manager.mount_all_for_device(0)?.failed {
            eprintln!("  [{}] {}", id, reason);
        }
    }
    let mounts = manager.get_mount_list();
    for &id in &available {
        println!("  {}", mounts[id]);
        if mounts[id].mounted()
            && let Ok(stats) = manager.volume_stats(id)
        {
            println!(
                "    {} bytes total, {} used, {} free",
                stats.total_bytes(),
                stats.used_bytes(),
                stats.free_bytes()
            );
        }
    }

    if mount {
        let release = manager.unmount_all_for_device(0)?;
        for (id, outcome) in release.outcomes {
            if let UnmountOutcome::Degraded { stage, error } = outcome {
                eprintln!("  [{}] unmount degraded at {:?}: {}", id, stage, error);
            }
        }
    }
    Ok(())
}
