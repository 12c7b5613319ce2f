//! Mount-point registry.
//!
//! Four mount points per device slot, addressed by a stable index
//! (`slot_id * 4 + partition index`). Each mount point refers back to its
//! parent device by slot index and connection generation rather than by
//! reference, so a cleared or reconnected slot can always be detected.

use std::fmt;
use std::ops::Range;

use serde::Serialize;
use snafu::OptionExt;

use crate::device::{MAX_DEVICES, device_name};
use crate::driver::BlockRange;
use crate::error::{Result, UnknownMountPointSnafu};
use crate::mbr::{PartitionDescriptor, PartitionKind};

/// Mount points per physical device (legacy MBR entries).
pub const PARTITIONS_PER_DEVICE: usize = 4;

/// Total number of mount points.
pub const MAX_MOUNT_POINTS: usize = MAX_DEVICES * PARTITIONS_PER_DEVICE;

/// Name carried by mount points that hold no partition.
pub const UNKNOWN_MOUNT_NAME: &str = "unknown";

/// Deterministic mount name: `sda1`..`sda4`, `sdb1`, ...
pub(crate) fn mount_name(slot_id: usize, index: usize) -> String {
    format!("{}{}", device_name(slot_id), index + 1)
}

/// Lifecycle state of a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountState {
    /// No scan has run since the parent connected (or since startup).
    Unscanned,
    /// Scanned, but the table entry is empty.
    Empty,
    /// A partition is present and can be mounted.
    Available,
    /// Registered with the filesystem driver, mount in progress.
    Registered,
    Mounted,
    /// Torn down after removal or a failed unmount.
    Cleared,
}

impl MountState {
    pub fn is_available(self) -> bool {
        matches!(
            self,
            MountState::Available | MountState::Registered | MountState::Mounted
        )
    }

    pub fn is_mounted(self) -> bool {
        self == MountState::Mounted
    }

    /// The filesystem driver knows the mount name.
    pub fn is_registered(self) -> bool {
        matches!(self, MountState::Registered | MountState::Mounted)
    }
}

/// Back reference from a mount point to its parent device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceRef {
    pub slot_id: usize,
    pub generation: u64,
}

/// One logical, nameable mount location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    mount_id: usize,
    state: MountState,
    mount_name: String,
    volume_label: String,
    parent: Option<DeviceRef>,
    partition_type: u8,
    bootable: bool,
    range: BlockRange,
}

impl MountPoint {
    fn new(mount_id: usize) -> Self {
        Self {
            mount_id,
            state: MountState::Unscanned,
            mount_name: UNKNOWN_MOUNT_NAME.to_string(),
            volume_label: String::new(),
            parent: None,
            partition_type: 0,
            bootable: false,
            range: BlockRange::default(),
        }
    }

    pub fn mount_id(&self) -> usize {
        self.mount_id
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn available(&self) -> bool {
        self.state.is_available()
    }

    pub fn mounted(&self) -> bool {
        self.state.is_mounted()
    }

    pub fn mount_name(&self) -> &str {
        &self.mount_name
    }

    /// `/<mount_name>/`, the prefix of every path on this mount point.
    pub fn mount_path(&self) -> String {
        format!("/{}/", self.mount_name)
    }

    pub fn volume_label(&self) -> &str {
        &self.volume_label
    }

    pub fn parent(&self) -> Option<DeviceRef> {
        self.parent
    }

    pub fn partition_type(&self) -> u8 {
        self.partition_type
    }

    pub fn partition_kind(&self) -> PartitionKind {
        PartitionKind::from(self.partition_type)
    }

    pub fn bootable(&self) -> bool {
        self.bootable
    }

    pub fn range(&self) -> BlockRange {
        self.range
    }

    /// Slot index this mount point belongs to in the fixed layout.
    pub fn home_slot(&self) -> usize {
        self.mount_id / PARTITIONS_PER_DEVICE
    }

    /// Resets everything except the index.
    fn reset(&mut self, state: MountState) {
        *self = Self {
            state,
            ..Self::new(self.mount_id)
        };
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.mount_id, self.mount_name)?;
        if self.state.is_available() {
            write!(
                f,
                " type 0x{:02x} ({}), {} blocks at {}",
                self.partition_type,
                self.partition_kind().name(),
                self.range.count,
                self.range.offset
            )?;
        }
        let state = match self.state {
            MountState::Unscanned => "unscanned",
            MountState::Empty => "empty",
            MountState::Available => "unmounted",
            MountState::Registered => "registered",
            MountState::Mounted => "mounted",
            MountState::Cleared => "cleared",
        };
        write!(f, " - {}", state)?;
        if !self.volume_label.is_empty() {
            write!(f, " \"{}\"", self.volume_label)?;
        }
        Ok(())
    }
}

pub struct MountRegistry {
    points: Vec<MountPoint>,
}

impl Default for MountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            points: (0..MAX_MOUNT_POINTS).map(MountPoint::new).collect(),
        }
    }

    pub fn get(&self, mount_id: usize) -> Result<&MountPoint> {
        self.points
            .get(mount_id)
            .context(UnknownMountPointSnafu { mount_id })
    }

    fn get_mut(&mut self, mount_id: usize) -> Result<&mut MountPoint> {
        self.points
            .get_mut(mount_id)
            .context(UnknownMountPointSnafu { mount_id })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.points.iter()
    }

    /// Mount ids laid out for a device slot.
    pub fn ids_for_slot(slot_id: usize) -> Range<usize> {
        let first = slot_id * PARTITIONS_PER_DEVICE;
        first..first + PARTITIONS_PER_DEVICE
    }

    /// Mount ids whose parent link points at `slot_id`.
    pub fn linked_to(&self, slot_id: usize) -> Vec<usize> {
        self.points
            .iter()
            .filter(|p| p.parent.is_some_and(|d| d.slot_id == slot_id))
            .map(|p| p.mount_id)
            .collect()
    }

    /// True if any mount point of the slot is registered or mounted.
    pub fn device_busy(&self, slot_id: usize) -> bool {
        self.points
            .iter()
            .any(|p| p.parent.is_some_and(|d| d.slot_id == slot_id) && p.state.is_registered())
    }

    /// Another mount point already registered under `name`.
    pub fn registered_under(&self, name: &str, except: usize) -> Option<usize> {
        self.points
            .iter()
            .find(|p| p.mount_id != except && p.state.is_registered() && p.mount_name == name)
            .map(|p| p.mount_id)
    }

    /// Links the slot's four mount points to a freshly connected device.
    pub fn link_device(&mut self, slot_id: usize, generation: u64) {
        for id in Self::ids_for_slot(slot_id) {
            let point = &mut self.points[id];
            point.reset(MountState::Unscanned);
            point.parent = Some(DeviceRef {
                slot_id,
                generation,
            });
        }
    }

    /// Copies scan results into the slot's mount points, in table order.
    ///
    /// Entries reaching past `block_count` are treated as absent.
    pub fn apply_scan(
        &mut self,
        slot_id: usize,
        partitions: &[PartitionDescriptor; PARTITIONS_PER_DEVICE],
        block_count: u64,
    ) {
        for (index, (id, part)) in Self::ids_for_slot(slot_id)
            .zip(partitions.iter())
            .enumerate()
        {
            let point = &mut self.points[id];
            let parent = point.parent;
            if part.present && part.range().end() <= block_count {
                point.reset(MountState::Available);
                point.mount_name = mount_name(slot_id, index);
                point.partition_type = part.partition_type;
                point.bootable = part.bootable;
                point.range = part.range();
            } else {
                if part.present {
                    log::warn!(
                        "{}: partition {} ({} blocks at {}) exceeds the device ({} blocks), ignored",
                        device_name(slot_id),
                        index + 1,
                        part.size,
                        part.offset,
                        block_count
                    );
                }
                point.reset(MountState::Empty);
            }
            point.parent = parent;
        }
    }

    /// Marks the slot's mount points unusable after a failed scan.
    pub fn mark_scan_failed(&mut self, slot_id: usize) {
        for id in Self::ids_for_slot(slot_id) {
            let point = &mut self.points[id];
            let parent = point.parent;
            point.reset(MountState::Empty);
            point.parent = parent;
        }
    }

    pub fn set_state(&mut self, mount_id: usize, state: MountState) -> Result<()> {
        self.get_mut(mount_id)?.state = state;
        Ok(())
    }

    pub fn set_volume_label(&mut self, mount_id: usize, label: String) -> Result<()> {
        self.get_mut(mount_id)?.volume_label = label;
        Ok(())
    }

    /// Back to `Available` after a clean unmount.
    pub fn release(&mut self, mount_id: usize) -> Result<()> {
        let point = self.get_mut(mount_id)?;
        point.state = MountState::Available;
        point.volume_label.clear();
        Ok(())
    }

    /// Unconditional teardown: not available, not mounted, sentinel name,
    /// no parent link.
    pub fn clear(&mut self, mount_id: usize) -> Result<()> {
        self.get_mut(mount_id)?.reset(MountState::Cleared);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<MountPoint> {
        self.points.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(partition_type: u8, offset: u64, size: u64) -> PartitionDescriptor {
        PartitionDescriptor {
            partition_type,
            offset,
            size,
            present: true,
            bootable: false,
        }
    }

    #[test]
    fn test_mount_names() {
        assert_eq!(mount_name(0, 0), "sda1");
        assert_eq!(mount_name(1, 3), "sdb4");
        assert_eq!(MountRegistry::ids_for_slot(2), 8..12);
    }

    #[test]
    fn test_new_registry_is_unscanned() {
        let registry = MountRegistry::new();
        assert_eq!(registry.iter().count(), MAX_MOUNT_POINTS);
        assert!(registry.iter().all(|p| {
            p.state() == MountState::Unscanned
                && !p.available()
                && p.mount_name() == UNKNOWN_MOUNT_NAME
                && p.parent().is_none()
        }));
    }

    #[test]
    fn test_apply_scan_in_table_order() {
        let mut registry = MountRegistry::new();
        registry.link_device(1, 7);
        let parts = [
            part(0x83, 2048, 1000),
            PartitionDescriptor::default(),
            part(0x0B, 4096, 500),
            PartitionDescriptor::default(),
        ];
        registry.apply_scan(1, &parts, 10_000);

        let points: Vec<_> = MountRegistry::ids_for_slot(1)
            .map(|id| registry.get(id).unwrap().clone())
            .collect();
        assert!(points[0].available());
        assert_eq!(points[0].mount_name(), "sdb1");
        assert_eq!(points[0].range(), BlockRange::new(2048, 1000));
        assert!(!points[1].available());
        assert_eq!(points[1].mount_name(), UNKNOWN_MOUNT_NAME);
        assert_eq!(points[2].mount_name(), "sdb3");
        assert_eq!(points[2].partition_type(), 0x0B);
        assert!(points.iter().all(|p| p.parent()
            == Some(DeviceRef {
                slot_id: 1,
                generation: 7
            })));
    }

    #[test]
    fn test_apply_scan_rejects_oversized_partition() {
        let mut registry = MountRegistry::new();
        registry.link_device(0, 1);
        let parts = [
            part(0x83, 100, 1000),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
        ];
        registry.apply_scan(0, &parts, 512);
        assert_eq!(registry.get(0).unwrap().state(), MountState::Empty);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut registry = MountRegistry::new();
        registry.link_device(0, 1);
        let parts = [
            part(0x83, 1, 10),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
        ];
        registry.apply_scan(0, &parts, 100);
        registry.set_state(0, MountState::Mounted).unwrap();
        registry.set_volume_label(0, "DATA".into()).unwrap();

        registry.clear(0).unwrap();
        let point = registry.get(0).unwrap();
        assert_eq!(point.state(), MountState::Cleared);
        assert!(!point.mounted());
        assert!(!point.available());
        assert_eq!(point.mount_name(), UNKNOWN_MOUNT_NAME);
        assert_eq!(point.volume_label(), "");
        assert!(point.parent().is_none());
        assert!(registry.linked_to(0).len() == 3);
    }

    #[test]
    fn test_busy_and_registered_lookup() {
        let mut registry = MountRegistry::new();
        registry.link_device(0, 1);
        let parts = [
            part(0x83, 1, 10),
            part(0x83, 11, 10),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
        ];
        registry.apply_scan(0, &parts, 100);
        assert!(!registry.device_busy(0));

        registry.set_state(1, MountState::Registered).unwrap();
        assert!(registry.device_busy(0));
        assert_eq!(registry.registered_under("sda2", 0), Some(1));
        assert_eq!(registry.registered_under("sda2", 1), None);
    }

    #[test]
    fn test_display() {
        let mut registry = MountRegistry::new();
        registry.link_device(0, 1);
        let parts = [
            part(0x83, 2048, 100),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
            PartitionDescriptor::default(),
        ];
        registry.apply_scan(0, &parts, 4096);
        assert_eq!(
            registry.get(0).unwrap().to_string(),
            "[0] sda1 type 0x83 (Linux), 100 blocks at 2048 - unmounted"
        );
        assert_eq!(registry.get(1).unwrap().to_string(), "[1] unknown - empty");
    }
}
