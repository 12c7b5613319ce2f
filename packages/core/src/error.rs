//! Unified error types for the usbmount-core library.
//!
//! Uses SNAFU for context-rich error handling. Failures reported by the
//! external block and filesystem drivers are carried as [`DriverError`]
//! sources so their numeric codes reach the caller unchanged.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

use crate::driver::DriverError;
use crate::mbr::PartitionDescriptor;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A block transfer did not complete.
    #[snafu(display("I/O error on {device} (blocks {first_block}+{count}): {source}"))]
    Io {
        device: String,
        first_block: u64,
        count: u32,
        source: DriverError,
    },

    /// Physical device initialization failed.
    #[snafu(display("failed to initialize {device}: {source}"))]
    DeviceInit { device: String, source: DriverError },

    /// Block 0 could not be read or holds no valid partition table.
    ///
    /// When only the signature check failed, `partitions` holds the
    /// best-effort decode of the four entries.
    #[snafu(display("partition table scan of {device} failed: {message}"))]
    Scan {
        device: String,
        message: String,
        partitions: Option<[PartitionDescriptor; 4]>,
    },

    /// Mount point has no partition ready to mount.
    #[snafu(display("mount point {mount_id} is not available"))]
    NotAvailable { mount_id: usize },

    /// Mount point is already mounted.
    #[snafu(display("mount point {mount_id} ({name}) is already mounted"))]
    AlreadyMounted { mount_id: usize, name: String },

    /// Mount point is not mounted.
    #[snafu(display("mount point {mount_id} is not mounted"))]
    NotMounted { mount_id: usize },

    /// The filesystem driver refused to register a partition.
    #[snafu(display("failed to register {name}: {source}"))]
    Register { name: String, source: DriverError },

    /// The filesystem driver failed to mount a registered partition.
    #[snafu(display("failed to mount {name}: {source}"))]
    Mount { name: String, source: DriverError },

    /// A stat request against a mounted partition failed.
    #[snafu(display("stat of {path} failed: {source}"))]
    Stat { path: String, source: DriverError },

    /// The filesystem driver could not report space usage.
    #[snafu(display("space statistics of {name} unavailable: {source}"))]
    VolumeStats { name: String, source: DriverError },

    /// No available mount point carries the name.
    #[snafu(display("no mount point named {name}"))]
    UnknownMountName { name: String },

    /// A block handle or slot did not resolve to a live device.
    #[snafu(display("block device not found: {what}"))]
    DeviceNotFound { what: String },

    /// The device vanished while an operation was in flight.
    #[snafu(display("{device} was removed during the operation"))]
    RemovedDuringOperation { device: String },

    /// Device slot index outside the registry.
    #[snafu(display("unknown device slot {slot_id}"))]
    UnknownSlot { slot_id: usize },

    /// Mount point index outside the registry.
    #[snafu(display("unknown mount point {mount_id}"))]
    UnknownMountPoint { mount_id: usize },

    /// No transport driver is attached to the slot.
    #[snafu(display("no driver attached to device slot {slot_id}"))]
    NoDriver { slot_id: usize },

    /// The device still has registered or mounted partitions.
    #[snafu(display("{device} has mounted partitions"))]
    DeviceBusy { device: String },

    /// Block request beyond the end of the device or partition.
    #[snafu(display("blocks {first_block}+{count} exceed {device} ({limit} blocks)"))]
    OutOfRange {
        device: String,
        first_block: u64,
        count: u32,
        limit: u64,
    },

    /// Caller buffer length does not match the requested block count.
    #[snafu(display("buffer holds {actual} bytes, transfer needs {expected}"))]
    BufferSize { expected: usize, actual: usize },

    /// Configuration file could not be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for [`crate::config::Config`].
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Disk image could not be opened.
    #[snafu(display("failed to open disk image at {}", path.display()))]
    ImageOpen {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// Returns true for errors that leave the caller's mount point unusable
    /// because the hardware disappeared.
    pub fn is_removal(&self) -> bool {
        matches!(self, Error::RemovedDuringOperation { .. })
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for configuration read errors.
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for disk image open errors.
    fn image_open_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn config_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ConfigReadSnafu { path: path.into() })
    }

    fn image_open_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(ImageOpenSnafu { path: path.into() })
    }
}
