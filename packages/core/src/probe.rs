//! Minimal filesystem driver that identifies volumes without interpreting
//! their contents.
//!
//! Recognizes ext2/3/4 by the superblock magic and FAT by the boot-sector
//! signature, reads their volume names and answers `stat` on a volume's
//! root. Space statistics come from the ext superblock counters or, for
//! FAT32, the boot sector and FSInfo free count. Journal recovery is not
//! supported.

use std::collections::HashMap;

use log::debug;

use crate::driver::{
    BlockHandle, BlockIo, BlockRange, DriverError, EEXIST, EINVAL, ENOENT, ENOTSUP, FileMode,
    FileStat, FsDriver, Recovery, VolumeStats,
};

const EXT_SUPERBLOCK: usize = 1024;
const EXT_MAGIC_OFFSET: usize = EXT_SUPERBLOCK + 56;
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];
const EXT_LABEL_OFFSET: usize = EXT_SUPERBLOCK + 120;
const EXT_LABEL_LEN: usize = 16;
const EXT_BLOCKS_COUNT_OFFSET: usize = EXT_SUPERBLOCK + 4;
const EXT_FREE_BLOCKS_OFFSET: usize = EXT_SUPERBLOCK + 12;
const EXT_LOG_BLOCK_SIZE_OFFSET: usize = EXT_SUPERBLOCK + 24;
/// Largest `s_log_block_size` (64 KiB blocks).
const EXT_MAX_LOG_BLOCK_SIZE: u32 = 6;

const FAT_SIGNATURE_OFFSET: usize = 510;
const FAT32_LABEL_OFFSET: usize = 71;
const FAT32_TYPE_OFFSET: usize = 82;
const FAT16_LABEL_OFFSET: usize = 43;
const FAT_LABEL_LEN: usize = 11;

// BIOS parameter block
const FAT_BYTES_PER_SECTOR_OFFSET: usize = 11;
const FAT_SECTORS_PER_CLUSTER_OFFSET: usize = 13;
const FAT_RESERVED_SECTORS_OFFSET: usize = 14;
const FAT_NUM_FATS_OFFSET: usize = 16;
const FAT_TOTAL_SECTORS16_OFFSET: usize = 19;
const FAT_TOTAL_SECTORS32_OFFSET: usize = 32;
const FAT32_FAT_SIZE_OFFSET: usize = 36;
const FAT32_FSINFO_SECTOR_OFFSET: usize = 48;

const FSINFO_LEAD_SIGNATURE: [u8; 4] = *b"RRaA";
const FSINFO_FREE_COUNT_OFFSET: usize = 488;
const FSINFO_FREE_COUNT_UNKNOWN: u32 = u32::MAX;

/// Bytes needed to see every field probed above.
const PROBE_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Ext,
    Fat32,
    Fat,
}

impl VolumeKind {
    fn detect(head: &[u8]) -> Option<Self> {
        if head.get(EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2) == Some(&EXT_MAGIC[..]) {
            return Some(VolumeKind::Ext);
        }
        if head.get(FAT_SIGNATURE_OFFSET..FAT_SIGNATURE_OFFSET + 2) == Some(&[0x55, 0xAA][..]) {
            let fat32 = head.get(FAT32_TYPE_OFFSET..FAT32_TYPE_OFFSET + 5) == Some(&b"FAT32"[..]);
            return Some(if fat32 {
                VolumeKind::Fat32
            } else {
                VolumeKind::Fat
            });
        }
        None
    }

    fn label(self, head: &[u8]) -> String {
        let (offset, len) = match self {
            VolumeKind::Ext => (EXT_LABEL_OFFSET, EXT_LABEL_LEN),
            VolumeKind::Fat32 => (FAT32_LABEL_OFFSET, FAT_LABEL_LEN),
            VolumeKind::Fat => (FAT16_LABEL_OFFSET, FAT_LABEL_LEN),
        };
        let Some(raw) = head.get(offset..offset + len) else {
            return String::new();
        };
        let label = String::from_utf8_lossy(raw)
            .trim_end_matches(['\0', ' '])
            .to_string();
        // mkfs.fat writes this placeholder when no label was given.
        if self != VolumeKind::Ext && label == "NO NAME" {
            return String::new();
        }
        label
    }

    fn stats(self, head: &[u8]) -> Result<VolumeStats, DriverError> {
        match self {
            VolumeKind::Ext => ext_stats(head),
            VolumeKind::Fat32 => fat32_stats(head),
            VolumeKind::Fat => Err(DriverError::new(
                ENOTSUP,
                "FAT12/16 free space needs a FAT walk",
            )),
        }
    }
}

fn le_u16(head: &[u8], at: usize) -> Option<u16> {
    head.get(at..at + 2)?.try_into().ok().map(u16::from_le_bytes)
}

fn le_u32(head: &[u8], at: usize) -> Option<u32> {
    head.get(at..at + 4)?.try_into().ok().map(u32::from_le_bytes)
}

fn truncated(what: &str) -> DriverError {
    DriverError::new(EINVAL, format!("{} is truncated", what))
}

fn ext_stats(head: &[u8]) -> Result<VolumeStats, DriverError> {
    let total = le_u32(head, EXT_BLOCKS_COUNT_OFFSET).ok_or_else(|| truncated("superblock"))?;
    let free = le_u32(head, EXT_FREE_BLOCKS_OFFSET).ok_or_else(|| truncated("superblock"))?;
    let log = le_u32(head, EXT_LOG_BLOCK_SIZE_OFFSET).ok_or_else(|| truncated("superblock"))?;
    if log > EXT_MAX_LOG_BLOCK_SIZE || free > total {
        return Err(DriverError::new(EINVAL, "implausible superblock counters"));
    }
    Ok(VolumeStats {
        block_size: 1024 << log,
        total_blocks: total as u64,
        free_blocks: free as u64,
    })
}

/// Cluster counts of a FAT32 volume. The free count is the one the
/// filesystem keeps in its FSInfo sector.
fn fat32_stats(head: &[u8]) -> Result<VolumeStats, DriverError> {
    let bpb = |at| le_u16(head, at).ok_or_else(|| truncated("boot sector"));
    let bytes_per_sector = bpb(FAT_BYTES_PER_SECTOR_OFFSET)? as u64;
    let sectors_per_cluster = head
        .get(FAT_SECTORS_PER_CLUSTER_OFFSET)
        .copied()
        .ok_or_else(|| truncated("boot sector"))? as u64;
    let reserved = bpb(FAT_RESERVED_SECTORS_OFFSET)? as u64;
    let num_fats = head
        .get(FAT_NUM_FATS_OFFSET)
        .copied()
        .ok_or_else(|| truncated("boot sector"))? as u64;
    let total_sectors: u64 = match bpb(FAT_TOTAL_SECTORS16_OFFSET)? {
        0 => le_u32(head, FAT_TOTAL_SECTORS32_OFFSET).ok_or_else(|| truncated("boot sector"))?
            as u64,
        n => n as u64,
    };
    let fat_size =
        le_u32(head, FAT32_FAT_SIZE_OFFSET).ok_or_else(|| truncated("boot sector"))? as u64;
    if bytes_per_sector == 0 || sectors_per_cluster == 0 {
        return Err(DriverError::new(EINVAL, "zero sector or cluster size"));
    }

    let fsinfo = bpb(FAT32_FSINFO_SECTOR_OFFSET)? as u64 * bytes_per_sector;
    let fsinfo = usize::try_from(fsinfo).map_err(|_| truncated("FSInfo"))?;
    if head.get(fsinfo..fsinfo + 4) != Some(&FSINFO_LEAD_SIGNATURE[..]) {
        return Err(DriverError::new(ENOTSUP, "no FSInfo sector"));
    }
    let free = le_u32(head, fsinfo + FSINFO_FREE_COUNT_OFFSET).ok_or_else(|| truncated("FSInfo"))?;
    if free == FSINFO_FREE_COUNT_UNKNOWN {
        return Err(DriverError::new(ENOTSUP, "FSInfo free count not maintained"));
    }

    let data_sectors = total_sectors.saturating_sub(reserved + num_fats * fat_size);
    let clusters = data_sectors / sectors_per_cluster;
    Ok(VolumeStats {
        block_size: bytes_per_sector * sectors_per_cluster,
        total_blocks: clusters,
        free_blocks: (free as u64).min(clusters),
    })
}

struct Volume {
    handle: BlockHandle,
    range: BlockRange,
    kind: Option<VolumeKind>,
}

#[derive(Default)]
pub struct VolumeProbe {
    volumes: HashMap<String, Volume>,
}

impl VolumeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn volume(&self, name: &str) -> Result<&Volume, DriverError> {
        self.volumes
            .get(name)
            .ok_or_else(|| DriverError::new(ENOENT, format!("{} is not registered", name)))
    }

    fn mounted(&self, name: &str) -> Result<(&Volume, VolumeKind), DriverError> {
        let volume = self.volume(name)?;
        match volume.kind {
            Some(kind) => Ok((volume, kind)),
            None => Err(DriverError::new(EINVAL, format!("{} is not mounted", name))),
        }
    }
}

/// Reads the first [`PROBE_LEN`] bytes of a partition, or all of it if it is
/// smaller.
fn read_head(io: &mut dyn BlockIo, volume: &Volume) -> Result<Vec<u8>, DriverError> {
    let block_size = io.block_size(volume.handle)?;
    let blocks = PROBE_LEN.div_ceil(block_size) as u64;
    let count = blocks.min(volume.range.count) as u32;
    let mut head = vec![0u8; count as usize * block_size];
    io.read_blocks(volume.handle, 0, count, &mut head)?;
    Ok(head)
}

impl FsDriver for VolumeProbe {
    fn register_device(
        &mut self,
        name: &str,
        handle: BlockHandle,
        range: BlockRange,
    ) -> Result<(), DriverError> {
        if self.volumes.contains_key(name) {
            return Err(DriverError::new(EEXIST, format!("{} is already registered", name)));
        }
        self.volumes.insert(
            name.to_string(),
            Volume {
                handle,
                range,
                kind: None,
            },
        );
        Ok(())
    }

    fn unregister_device(&mut self, name: &str) -> Result<(), DriverError> {
        self.volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(ENOENT, format!("{} is not registered", name)))
    }

    fn mount(&mut self, name: &str, io: &mut dyn BlockIo) -> Result<(), DriverError> {
        let head = read_head(io, self.volume(name)?)?;
        let Some(kind) = VolumeKind::detect(&head) else {
            return Err(DriverError::new(EINVAL, "no ext or FAT signature"));
        };
        debug!("{}: detected {:?} volume", name, kind);
        if let Some(volume) = self.volumes.get_mut(name) {
            volume.kind = Some(kind);
        }
        Ok(())
    }

    fn unmount(&mut self, name: &str, _io: &mut dyn BlockIo) -> Result<(), DriverError> {
        self.mounted(name)?;
        if let Some(volume) = self.volumes.get_mut(name) {
            volume.kind = None;
        }
        Ok(())
    }

    fn recover(&mut self, name: &str, _io: &mut dyn BlockIo) -> Result<Recovery, DriverError> {
        self.mounted(name)?;
        Ok(Recovery::Unsupported)
    }

    fn flush_cache(
        &mut self,
        name: &str,
        _enable: bool,
        _io: &mut dyn BlockIo,
    ) -> Result<(), DriverError> {
        self.mounted(name).map(|_| ())
    }

    fn stat(&mut self, path: &str, _io: &mut dyn BlockIo) -> Result<FileStat, DriverError> {
        let mut parts = path.trim_start_matches('/').splitn(2, '/');
        let name = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();
        self.mounted(name)?;
        if rest.trim_matches('/').is_empty() {
            Ok(FileStat {
                mode: FileMode::Directory,
                size: 0,
            })
        } else {
            Err(DriverError::new(
                ENOTSUP,
                format!("{}: only the volume root can be inspected", path),
            ))
        }
    }

    fn volume_label(&mut self, name: &str, io: &mut dyn BlockIo) -> Result<String, DriverError> {
        let (volume, kind) = self.mounted(name)?;
        let head = read_head(io, volume)?;
        Ok(kind.label(&head))
    }

    fn volume_stats(
        &mut self,
        name: &str,
        io: &mut dyn BlockIo,
    ) -> Result<VolumeStats, DriverError> {
        let (volume, kind) = self.mounted(name)?;
        let head = read_head(io, volume)?;
        kind.stats(&head)
    }
}
