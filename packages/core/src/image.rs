//! Disk-image block driver.
//!
//! Serves a raw disk image file as a drive with 512-byte blocks. The drive
//! counts as connected while the file exists; deleting or moving the file
//! behaves like pulling the plug.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::driver::{BlockDriver, DriverError, Geometry, Transfer};
use crate::error::{IoResultExt, Result};
use crate::mbr::SECTOR_SIZE;

pub struct ImageDriver {
    path: PathBuf,
    file: Option<File>,
    writable: bool,
}

impl ImageDriver {
    /// Creates a driver for `path` without touching the file. The image may
    /// appear later; [`BlockDriver::connect`] opens it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            writable: true,
        }
    }

    /// Opens an existing image right away.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = open_image(path, writable).image_open_context(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> std::result::Result<&mut File, DriverError> {
        if self.file.is_none() {
            let file = open_image(&self.path, self.writable)
                .map_err(|e| DriverError::no_device(format!("{}: {}", self.path.display(), e)))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| DriverError::no_device("image not open"))
    }
}

fn open_image(path: &Path, writable: bool) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(writable).open(path)
}

impl BlockDriver for ImageDriver {
    fn connect(&mut self) -> bool {
        if !self.path.exists() {
            self.file = None;
            return false;
        }
        match self.file() {
            Ok(_) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    fn connected(&self) -> bool {
        self.path.exists()
    }

    fn init(&mut self) -> std::result::Result<Geometry, DriverError> {
        // A replaced image must not be served through the old descriptor.
        self.file = None;
        let len = self
            .file()?
            .metadata()
            .map_err(|e| DriverError::io(e.to_string()))?
            .len();
        Ok(Geometry {
            block_size: SECTOR_SIZE,
            block_count: len / SECTOR_SIZE as u64,
        })
    }

    fn transfer(
        &mut self,
        xfer: Transfer<'_>,
        first_block: u64,
        count: u32,
    ) -> std::result::Result<(), DriverError> {
        if !self.path.exists() {
            self.file = None;
            return Err(DriverError::no_device("image file is gone"));
        }
        if xfer.len() != count as usize * SECTOR_SIZE {
            return Err(DriverError::new(crate::driver::EINVAL, "buffer size mismatch"));
        }
        let file = self.file()?;
        let io_err = |e: std::io::Error| DriverError::io(e.to_string());
        file.seek(SeekFrom::Start(first_block * SECTOR_SIZE as u64))
            .map_err(io_err)?;
        match xfer {
            Transfer::Read(buf) => file.read_exact(buf).map_err(io_err),
            Transfer::Write(buf) => file.write_all(buf).map_err(io_err),
        }
    }
}
