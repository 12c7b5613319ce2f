//! Contracts for the external drivers this crate sits between.
//!
//! - [`BlockDriver`]: the USB mass-storage transport (connect, init, block
//!   transfers).
//! - [`FsDriver`]: the filesystem driver that interprets partitions.
//! - [`BlockIo`]: the bridge handed to the filesystem driver so it can read
//!   and write blocks of the partitions it has been given.

use std::fmt;

use serde::Serialize;

use crate::error::Result;

/// Errno-style code for a failed transfer.
pub const EIO: i32 = 5;
/// Errno-style code for a missing device.
pub const ENODEV: i32 = 19;
/// Errno-style code for an already registered name.
pub const EEXIST: i32 = 17;
/// Errno-style code for a missing file or name.
pub const ENOENT: i32 = 2;
/// Errno-style code for an invalid argument.
pub const EINVAL: i32 = 22;
/// Errno-style code for an unsupported operation.
pub const ENOTSUP: i32 = 95;

/// A failure reported by an external driver.
///
/// The numeric code is preserved so it can be surfaced to operators unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Transfer failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(EIO, message)
    }

    /// Device is gone.
    pub fn no_device(message: impl Into<String>) -> Self {
        Self::new(ENODEV, message)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for DriverError {}

impl From<crate::error::Error> for DriverError {
    fn from(err: crate::error::Error) -> Self {
        use crate::error::Error;

        let code = match &err {
            Error::Io { source, .. } => source.code,
            Error::DeviceNotFound { .. } | Error::RemovedDuringOperation { .. } => ENODEV,
            Error::OutOfRange { .. } | Error::BufferSize { .. } => EINVAL,
            _ => EIO,
        };
        Self::new(code, err.to_string())
    }
}

/// Addressable size of an initialized drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub block_size: usize,
    pub block_count: u64,
}

/// Direction and buffer of a single block transfer.
pub enum Transfer<'a> {
    /// Device to host.
    Read(&'a mut [u8]),
    /// Host to device.
    Write(&'a [u8]),
}

impl Transfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport driver for one physical drive.
pub trait BlockDriver: Send {
    /// Attempts to (re)establish the link. Returns the connection state.
    fn connect(&mut self) -> bool;

    /// Current connection signal.
    fn connected(&self) -> bool;

    /// Initializes the drive and reports its geometry.
    fn init(&mut self) -> std::result::Result<Geometry, DriverError>;

    /// Moves `count` blocks starting at `first_block`.
    fn transfer(
        &mut self,
        xfer: Transfer<'_>,
        first_block: u64,
        count: u32,
    ) -> std::result::Result<(), DriverError>;

    /// Largest block count accepted by a single [`BlockDriver::transfer`].
    fn max_transfer_blocks(&self) -> u32 {
        u8::MAX as u32
    }
}

/// Contiguous block range of a partition on its parent device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    pub offset: u64,
    pub count: u64,
}

impl BlockRange {
    pub fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    /// First block past the end of the range.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
enum HandleTarget {
    Device(usize),
    Partition(usize),
}

/// Opaque reference to a raw device or a partition, handed to the filesystem
/// driver at registration and passed back on every block request.
///
/// A handle is bound to the connection generation it was issued for, so a
/// handle kept across a disconnect never resolves to the next drive plugged
/// into the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockHandle {
    target: HandleTarget,
    generation: u64,
}

/// What a [`BlockHandle`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Device { slot_id: usize },
    Partition { mount_id: usize },
}

impl BlockHandle {
    pub(crate) fn device(slot_id: usize, generation: u64) -> Self {
        Self {
            target: HandleTarget::Device(slot_id),
            generation,
        }
    }

    pub(crate) fn partition(mount_id: usize, generation: u64) -> Self {
        Self {
            target: HandleTarget::Partition(mount_id),
            generation,
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self.target {
            HandleTarget::Device(slot_id) => HandleKind::Device { slot_id },
            HandleTarget::Partition(mount_id) => HandleKind::Partition { mount_id },
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of a journal recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Recovered,
    /// The filesystem has no journal to replay.
    Unsupported,
}

/// File type reported by [`FsDriver::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    Directory,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub mode: FileMode,
    /// Size in bytes, regular files only.
    pub size: u64,
}

/// Space usage of a mounted volume, in filesystem blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

impl VolumeStats {
    pub fn total_bytes(&self) -> u64 {
        self.total_blocks.saturating_mul(self.block_size)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.saturating_mul(self.block_size)
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes().saturating_sub(self.free_bytes())
    }
}

/// Block access for the filesystem driver, scoped to one locked operation.
pub trait BlockIo {
    /// Block size of the device behind `handle`.
    fn block_size(&self, handle: BlockHandle) -> Result<usize>;

    /// Reads blocks relative to the start of the handle's range.
    fn read_blocks(
        &mut self,
        handle: BlockHandle,
        first_block: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Writes blocks relative to the start of the handle's range.
    fn write_blocks(
        &mut self,
        handle: BlockHandle,
        first_block: u64,
        count: u32,
        buf: &[u8],
    ) -> Result<()>;
}

/// Filesystem driver contract.
///
/// Names are mount names (`sda1`, ...). Every call that may touch the medium
/// receives the [`BlockIo`] bridge for the duration of the call.
pub trait FsDriver: Send {
    fn register_device(
        &mut self,
        name: &str,
        handle: BlockHandle,
        range: BlockRange,
    ) -> std::result::Result<(), DriverError>;

    fn unregister_device(&mut self, name: &str) -> std::result::Result<(), DriverError>;

    fn mount(&mut self, name: &str, io: &mut dyn BlockIo) -> std::result::Result<(), DriverError>;

    fn unmount(&mut self, name: &str, io: &mut dyn BlockIo)
    -> std::result::Result<(), DriverError>;

    fn recover(
        &mut self,
        name: &str,
        io: &mut dyn BlockIo,
    ) -> std::result::Result<Recovery, DriverError>;

    /// Enables or disables (and flushes) the write-back cache.
    fn flush_cache(
        &mut self,
        name: &str,
        enable: bool,
        io: &mut dyn BlockIo,
    ) -> std::result::Result<(), DriverError>;

    /// Stats a path of the form `/<mount_name>/<relative path>`.
    fn stat(&mut self, path: &str, io: &mut dyn BlockIo)
    -> std::result::Result<FileStat, DriverError>;

    fn volume_label(
        &mut self,
        name: &str,
        io: &mut dyn BlockIo,
    ) -> std::result::Result<String, DriverError>;

    /// Space statistics of a mounted volume.
    fn volume_stats(
        &mut self,
        name: &str,
        io: &mut dyn BlockIo,
    ) -> std::result::Result<VolumeStats, DriverError> {
        let _ = io;
        Err(DriverError::new(
            ENOTSUP,
            format!("{}: space statistics not supported", name),
        ))
    }
}
