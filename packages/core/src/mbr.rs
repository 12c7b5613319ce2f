//! Master boot record scanning.
//!
//! Block 0 of a device carries four 16-byte partition entries starting at
//! byte 446, followed by the `0x55 0xAA` signature at byte 510.

use std::fmt;

use serde::Serialize;

use crate::device::{BlockDeviceRegistry, device_name};
use crate::driver::BlockRange;
use crate::error::{Error, Result};

/// Bytes of block 0 that hold the boot record.
pub const SECTOR_SIZE: usize = 512;

const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;
const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Ext2/3/4 (Linux native) partition type.
pub const LINUX_TYPE: u8 = 0x83;
/// FAT32 (CHS) partition type.
pub const FAT32_TYPE: u8 = 0x0B;
/// FAT32 (LBA) partition type.
pub const FAT32_LBA_TYPE: u8 = 0x0C;

/// One legacy partition table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    pub partition_type: u8,
    /// First block.
    pub offset: u64,
    /// Length in blocks.
    pub size: u64,
    pub present: bool,
    pub bootable: bool,
}

impl PartitionDescriptor {
    fn parse(entry: &[u8; PARTITION_ENTRY_SIZE]) -> Self {
        let partition_type = entry[4];
        let offset = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
        let size = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]) as u64;
        Self {
            partition_type,
            offset,
            size,
            present: partition_type != 0 && size != 0,
            bootable: entry[0] == 0x80,
        }
    }

    pub fn range(&self) -> BlockRange {
        BlockRange::new(self.offset, self.size)
    }

    pub fn kind(&self) -> PartitionKind {
        PartitionKind::from(self.partition_type)
    }
}

/// Filesystem family announced by a partition type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Empty,
    Linux,
    Fat32,
    Fat16,
    /// NTFS or exFAT share the same type byte.
    Ntfs,
    Extended,
    Other(u8),
}

impl From<u8> for PartitionKind {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => PartitionKind::Empty,
            LINUX_TYPE => PartitionKind::Linux,
            FAT32_TYPE | FAT32_LBA_TYPE => PartitionKind::Fat32,
            0x04 | 0x06 | 0x0E => PartitionKind::Fat16,
            0x07 => PartitionKind::Ntfs,
            0x05 | 0x0F | 0x85 => PartitionKind::Extended,
            other => PartitionKind::Other(other),
        }
    }
}

impl PartitionKind {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionKind::Empty => "empty",
            PartitionKind::Linux => "Linux",
            PartitionKind::Fat32 => "FAT32",
            PartitionKind::Fat16 => "FAT16",
            PartitionKind::Ntfs => "NTFS/exFAT",
            PartitionKind::Extended => "extended",
            PartitionKind::Other(_) => "other",
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded boot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrTable {
    pub partitions: [PartitionDescriptor; 4],
    pub signature_valid: bool,
}

/// Decodes the partition table of a boot sector.
pub fn parse_mbr(sector: &[u8; SECTOR_SIZE]) -> MbrTable {
    let mut partitions = [PartitionDescriptor::default(); 4];
    for (i, slot) in partitions.iter_mut().enumerate() {
        let start = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        if let Some(entry) = sector[start..].first_chunk::<PARTITION_ENTRY_SIZE>() {
            *slot = PartitionDescriptor::parse(entry);
        }
    }
    MbrTable {
        partitions,
        signature_valid: sector[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 2] == SIGNATURE,
    }
}

/// Reads block 0 of a connected device and returns its four entries.
///
/// A missing signature is an error that still carries the best-effort
/// decode of the entries.
pub fn scan(devices: &mut BlockDeviceRegistry, slot_id: usize) -> Result<[PartitionDescriptor; 4]> {
    let device = device_name(slot_id);
    let geometry = devices.geometry(slot_id)?;
    if geometry.block_size < SECTOR_SIZE {
        return Err(Error::Scan {
            device,
            message: format!("block size {} is too small", geometry.block_size),
            partitions: None,
        });
    }

    let mut block = vec![0u8; geometry.block_size];
    match devices.read_blocks(slot_id, 0, 1, &mut block) {
        Ok(()) => {}
        Err(err @ Error::Io { .. }) => {
            return Err(Error::Scan {
                device,
                message: format!("block 0 unreadable: {}", err),
                partitions: None,
            });
        }
        Err(err) => return Err(err),
    }

    let Some(sector) = block.first_chunk::<SECTOR_SIZE>() else {
        return Err(Error::Scan {
            device,
            message: "short boot sector".to_string(),
            partitions: None,
        });
    };
    let table = parse_mbr(sector);
    if !table.signature_valid {
        return Err(Error::Scan {
            device,
            message: "boot record signature missing".to_string(),
            partitions: Some(table.partitions),
        });
    }

    log::debug!(
        "{}: partition types [{}]",
        device,
        table
            .partitions
            .iter()
            .map(|p| format!("0x{:02x}", p.partition_type))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(table.partitions)
}
