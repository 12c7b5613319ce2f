//! usbmount-core: removable block-device and mount-point lifecycle manager.
//!
//! Sits between a USB mass-storage transport and a filesystem driver. Tracks
//! up to four physical drives, reads their MBR partition tables, exposes the
//! partitions as named mount points (`sda1`..`sdd4`) and keeps every mount
//! point consistent when a drive is pulled out mid-operation.
//!
//! # Modules
//!
//! - [`driver`]: Contracts for the transport and filesystem drivers
//! - [`device`]: Physical block-device registry
//! - [`mbr`]: Partition table scanning
//! - [`mount`]: Mount-point registry
//! - [`lifecycle`]: Mount/unmount state machine and forced removal
//! - [`watcher`]: Bounded wait for drive connection
//! - [`image`]: Disk-image transport driver
//! - [`probe`]: Volume-identifying filesystem driver
//! - [`protocol`]: Daemon request/response types
//! - [`config`]: Runtime configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use usbmount_core::{
//!     Config, DeviceWatcher, ImageDriver, MountContext, MountLifecycleManager, VolumeProbe,
//! };
//!
//! let ctx = MountContext::new(Box::new(VolumeProbe::new()), Config::default());
//! let manager = MountLifecycleManager::new(ctx);
//! manager.attach(0, Box::new(ImageDriver::new("/tmp/disk.img"))).unwrap();
//!
//! // Opens and scans the drive once it shows up; nothing is mounted yet.
//! let watcher = DeviceWatcher::with_system_clock(manager.clone());
//! watcher.wait(0).unwrap();
//!
//! for point in manager.get_mount_list().iter().filter(|p| p.available()) {
//!     manager.mount(point.mount_id()).unwrap();
//!     println!("{}", manager.get_mount_list()[point.mount_id()]);
//! }
//!
//! manager.unmount_all_for_device(0).unwrap();
//! ```

pub mod config;
mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod mbr;
pub mod mount;
pub mod probe;
pub mod protocol;
pub mod watcher;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use context::MountContext;
pub use device::BlockDeviceInfo;
pub use driver::{BlockDriver, BlockHandle, BlockIo, DriverError, FsDriver, VolumeStats};
pub use error::{Error, Result};
pub use image::ImageDriver;
pub use lifecycle::{DeviceRelease, MountLifecycleManager, MountReport, UnmountOutcome};
pub use mbr::{PartitionDescriptor, PartitionKind};
pub use mount::{MountPoint, MountState};
pub use probe::VolumeProbe;
pub use watcher::{Clock, ConnectionEvent, DeviceWatcher, SystemClock};
