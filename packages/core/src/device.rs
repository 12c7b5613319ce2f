//! Physical block-device registry.
//!
//! A fixed table of [`MAX_DEVICES`] slots. Each slot may have a transport
//! driver attached (the "port") and, while the drive is connected, a live
//! driver handle carrying the geometry recorded at open time and a connection
//! generation. All block I/O to physical devices goes through this table.

use std::fmt;

use log::debug;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};

use crate::driver::{
    BlockDriver, BlockHandle, BlockIo, DriverError, Geometry, HandleKind, Transfer,
};
use crate::error::{
    BufferSizeSnafu, DeviceInitSnafu, DeviceNotFoundSnafu, Error, IoSnafu, NoDriverSnafu,
    OutOfRangeSnafu, RemovedDuringOperationSnafu, Result, UnknownSlotSnafu,
};
use crate::mount::MountRegistry;

/// Number of physical device slots.
pub const MAX_DEVICES: usize = 4;

/// Display name of a device slot: `sda`, `sdb`, ... Slots past `sdz` get a
/// numeric name.
pub(crate) fn device_name(slot_id: usize) -> String {
    match u8::try_from(slot_id).ok().filter(|&i| i < 26) {
        Some(i) => format!("sd{}", (b'a' + i) as char),
        None => format!("sd#{}", slot_id),
    }
}

/// Live session with a connected drive.
#[derive(Debug, Clone, Copy)]
struct DriverHandle {
    generation: u64,
    geometry: Geometry,
}

/// One physical drive slot.
pub struct BlockDeviceSlot {
    slot_id: usize,
    name: String,
    port: Option<Box<dyn BlockDriver>>,
    handle: Option<DriverHandle>,
}

impl BlockDeviceSlot {
    fn new(slot_id: usize) -> Self {
        Self {
            slot_id,
            name: device_name(slot_id),
            port: None,
            handle: None,
        }
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while a live driver handle is held.
    pub fn connected(&self) -> bool {
        self.handle.is_some()
    }

    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            slot_id: self.slot_id,
            name: self.name.clone(),
            attached: self.port.is_some(),
            connected: self.connected(),
            generation: self.handle.map(|h| h.generation),
            block_size: self.handle.map(|h| h.geometry.block_size),
            block_count: self.handle.map(|h| h.geometry.block_count),
        }
    }
}

/// Read-only snapshot of a [`BlockDeviceSlot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDeviceInfo {
    pub slot_id: usize,
    pub name: String,
    /// A transport driver is plugged into the slot.
    pub attached: bool,
    pub connected: bool,
    pub generation: Option<u64>,
    pub block_size: Option<usize>,
    pub block_count: Option<u64>,
}

impl fmt::Display for BlockDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.slot_id, self.name)?;
        match (self.connected, self.block_count, self.block_size) {
            (true, Some(count), Some(size)) => {
                write!(f, " connected, {} blocks of {} bytes", count, size)
            }
            _ if self.attached => write!(f, " disconnected"),
            _ => write!(f, " empty"),
        }
    }
}

/// Where a [`BlockHandle`] lands on a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub slot_id: usize,
    /// First physical block of the addressed range.
    pub base: u64,
    /// Number of blocks addressable through the handle.
    pub limit: u64,
}

pub struct BlockDeviceRegistry {
    slots: Vec<BlockDeviceSlot>,
    next_generation: u64,
}

impl Default for BlockDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDeviceRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DEVICES).map(BlockDeviceSlot::new).collect(),
            next_generation: 1,
        }
    }

    pub fn slot(&self, slot_id: usize) -> Result<&BlockDeviceSlot> {
        self.slots.get(slot_id).context(UnknownSlotSnafu { slot_id })
    }

    fn slot_mut(&mut self, slot_id: usize) -> Result<&mut BlockDeviceSlot> {
        self.slots.get_mut(slot_id).context(UnknownSlotSnafu { slot_id })
    }

    /// Plugs a transport driver into a slot, dropping any previous one.
    ///
    /// The slot starts disconnected; [`BlockDeviceRegistry::open`] brings it up.
    pub fn attach(&mut self, slot_id: usize, driver: Box<dyn BlockDriver>) -> Result<()> {
        let slot = self.slot_mut(slot_id)?;
        slot.handle = None;
        slot.port = Some(driver);
        debug!("driver attached to {}", slot.name);
        Ok(())
    }

    pub fn is_connected(&self, slot_id: usize) -> bool {
        self.slots.get(slot_id).is_some_and(BlockDeviceSlot::connected)
    }

    /// Connection generation of a connected slot.
    pub fn generation(&self, slot_id: usize) -> Option<u64> {
        self.slots
            .get(slot_id)
            .and_then(|slot| slot.handle)
            .map(|h| h.generation)
    }

    /// Geometry recorded when the slot was opened.
    pub fn geometry(&self, slot_id: usize) -> Result<Geometry> {
        let slot = self.slot(slot_id)?;
        slot.handle.map(|h| h.geometry).context(DeviceNotFoundSnafu {
            what: format!("{} is not connected", slot.name),
        })
    }

    /// Raw connection signal of the attached driver, `None` without a driver.
    pub fn signal(&self, slot_id: usize) -> Option<bool> {
        self.slots
            .get(slot_id)
            .and_then(|slot| slot.port.as_ref())
            .map(|port| port.connected())
    }

    /// Checks the connection signal, asking the driver to connect first when
    /// the link is down.
    pub fn probe(&mut self, slot_id: usize) -> Result<bool> {
        let slot = self.slot_mut(slot_id)?;
        let port = slot.port.as_mut().context(NoDriverSnafu { slot_id })?;
        if port.connected() {
            return Ok(true);
        }
        Ok(port.connect())
    }

    /// Initializes the physical device and records its geometry.
    ///
    /// Returns `false` when the slot was already open on a drive that is still
    /// connected (nothing changed), `true` when a new session was started.
    pub fn open(&mut self, slot_id: usize) -> Result<bool> {
        let generation = self.next_generation;
        let slot = self.slot_mut(slot_id)?;
        let name = slot.name.clone();
        let port = slot.port.as_mut().context(NoDriverSnafu { slot_id })?;

        if !port.connected() {
            slot.handle = None;
            return Err(DriverError::no_device("drive not connected")).context(DeviceInitSnafu {
                device: name,
            });
        }
        if slot.handle.is_some() {
            return Ok(false);
        }

        let geometry = port.init().context(DeviceInitSnafu {
            device: name.clone(),
        })?;
        if geometry.block_size == 0 {
            return Err(DriverError::new(crate::driver::EINVAL, "zero block size"))
                .context(DeviceInitSnafu { device: name });
        }

        slot.handle = Some(DriverHandle {
            generation,
            geometry,
        });
        self.next_generation += 1;
        debug!(
            "{} opened: {} blocks of {} bytes (generation {})",
            name, geometry.block_count, geometry.block_size, generation
        );
        Ok(true)
    }

    /// Releases the driver handle. Never fails; the hardware may already be gone.
    pub fn close(&mut self, slot_id: usize) {
        if let Some(slot) = self.slots.get_mut(slot_id)
            && slot.handle.take().is_some()
        {
            debug!("{} closed", slot.name);
        }
    }

    pub fn read_blocks(
        &mut self,
        slot_id: usize,
        first_block: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        self.transfer(slot_id, first_block, count, Transfer::Read(buf))
    }

    pub fn write_blocks(
        &mut self,
        slot_id: usize,
        first_block: u64,
        count: u32,
        buf: &[u8],
    ) -> Result<()> {
        self.transfer(slot_id, first_block, count, Transfer::Write(buf))
    }

    /// Runs a transfer, split into chunks the driver accepts.
    fn transfer(
        &mut self,
        slot_id: usize,
        first_block: u64,
        count: u32,
        mut xfer: Transfer<'_>,
    ) -> Result<()> {
        let slot = self.slot_mut(slot_id)?;
        let BlockDeviceSlot {
            name, port, handle, ..
        } = slot;
        let (Some(port), Some(handle)) = (port.as_mut(), handle.as_ref()) else {
            return DeviceNotFoundSnafu {
                what: format!("{} is not connected", name),
            }
            .fail();
        };

        let block_size = handle.geometry.block_size;
        let limit = handle.geometry.block_count;
        if first_block
            .checked_add(count as u64)
            .is_none_or(|end| end > limit)
        {
            return OutOfRangeSnafu {
                device: name.clone(),
                first_block,
                count,
                limit,
            }
            .fail();
        }
        let expected = count as usize * block_size;
        if xfer.len() != expected {
            return BufferSizeSnafu {
                expected,
                actual: xfer.len(),
            }
            .fail();
        }

        let max = port.max_transfer_blocks().max(1);
        let mut done = 0u32;
        while done < count {
            let n = (count - done).min(max);
            let start = done as usize * block_size;
            let end = start + n as usize * block_size;
            let chunk = match &mut xfer {
                Transfer::Read(buf) => Transfer::Read(&mut buf[start..end]),
                Transfer::Write(buf) => Transfer::Write(&buf[start..end]),
            };
            let lba = first_block + done as u64;
            port.transfer(chunk, lba, n).context(IoSnafu {
                device: name.clone(),
                first_block: lba,
                count: n,
            })?;
            done += n;
        }
        Ok(())
    }

    /// Resolves an opaque handle to a physical range.
    ///
    /// Anything that does not resolve to a connected device of the handle's
    /// generation, or to a scanned partition on one, is `DeviceNotFound`.
    pub fn resolve(&self, handle: BlockHandle, mounts: &MountRegistry) -> Result<Resolved> {
        let not_found = |what: String| DeviceNotFoundSnafu { what }.fail();

        match handle.kind() {
            HandleKind::Device { slot_id } => match self.slots.get(slot_id).and_then(|s| s.handle)
            {
                Some(h) if h.generation == handle.generation() => Ok(Resolved {
                    slot_id,
                    base: 0,
                    limit: h.geometry.block_count,
                }),
                _ => not_found(format!("stale or unknown device handle {:?}", handle)),
            },
            HandleKind::Partition { mount_id } => {
                let Some(point) = mounts.get(mount_id).ok() else {
                    return not_found(format!("unknown partition handle {:?}", handle));
                };
                match point.parent() {
                    Some(parent)
                        if point.state().is_available()
                            && parent.generation == handle.generation()
                            && self.generation(parent.slot_id) == Some(parent.generation) =>
                    {
                        Ok(Resolved {
                            slot_id: parent.slot_id,
                            base: point.range().offset,
                            limit: point.range().count,
                        })
                    }
                    _ => not_found(format!("stale partition handle {:?}", handle)),
                }
            }
        }
    }

    /// Snapshot of every slot.
    pub fn snapshot(&self) -> Vec<BlockDeviceInfo> {
        self.slots.iter().map(BlockDeviceSlot::info).collect()
    }
}

/// [`BlockIo`] bridge handed to the filesystem driver for one locked call.
///
/// Before every transfer the device's connection signal is checked; a
/// vanished device is remembered so the caller can force it through removal
/// once the driver call returns.
pub(crate) struct DeviceIo<'a> {
    devices: &'a mut BlockDeviceRegistry,
    mounts: &'a MountRegistry,
    removed: Option<usize>,
}

impl<'a> DeviceIo<'a> {
    pub(crate) fn new(devices: &'a mut BlockDeviceRegistry, mounts: &'a MountRegistry) -> Self {
        Self {
            devices,
            mounts,
            removed: None,
        }
    }

    /// Slot found disconnected during the call, if any.
    pub(crate) fn removed(&self) -> Option<usize> {
        self.removed
    }

    fn prepare(&mut self, handle: BlockHandle, first_block: u64, count: u32) -> Result<u64> {
        let target = self.devices.resolve(handle, self.mounts)?;
        if self.devices.signal(target.slot_id) == Some(false) {
            self.removed = Some(target.slot_id);
            return RemovedDuringOperationSnafu {
                device: device_name(target.slot_id),
            }
            .fail();
        }
        if first_block
            .checked_add(count as u64)
            .is_none_or(|end| end > target.limit)
        {
            return OutOfRangeSnafu {
                device: format!("{:?}", handle.kind()),
                first_block,
                count,
                limit: target.limit,
            }
            .fail();
        }
        Ok(target.base + first_block)
    }

    fn note_failure(&mut self, err: &Error, handle: BlockHandle) {
        if let Error::Io { .. } = err
            && let Ok(target) = self.devices.resolve(handle, self.mounts)
            && self.devices.signal(target.slot_id) == Some(false)
        {
            self.removed = Some(target.slot_id);
        }
    }

    fn slot_of(&self, handle: BlockHandle) -> Result<usize> {
        Ok(self.devices.resolve(handle, self.mounts)?.slot_id)
    }
}

impl BlockIo for DeviceIo<'_> {
    fn block_size(&self, handle: BlockHandle) -> Result<usize> {
        let slot_id = self.slot_of(handle)?;
        Ok(self.devices.geometry(slot_id)?.block_size)
    }

    fn read_blocks(
        &mut self,
        handle: BlockHandle,
        first_block: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let lba = self.prepare(handle, first_block, count)?;
        let slot_id = self.slot_of(handle)?;
        let result = self.devices.read_blocks(slot_id, lba, count, buf);
        if let Err(err) = &result {
            self.note_failure(err, handle);
        }
        result
    }

    fn write_blocks(
        &mut self,
        handle: BlockHandle,
        first_block: u64,
        count: u32,
        buf: &[u8],
    ) -> Result<()> {
        let lba = self.prepare(handle, first_block, count)?;
        let slot_id = self.slot_of(handle)?;
        let result = self.devices.write_blocks(slot_id, lba, count, buf);
        if let Err(err) = &result {
            self.note_failure(err, handle);
        }
        result
    }
}
