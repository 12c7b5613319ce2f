//! Mount lifecycle management.
//!
//! Drives each mount point through
//! `Unscanned -> Available -> Registered -> Mounted -> Available | Cleared`
//! and keeps the registries consistent when a drive disappears.
//!
//! Two teardown paths exist:
//!
//! - the clean unmount (flush, unmount, unregister), which leaves the mount
//!   point `Available`;
//! - the forced clear, which attempts unmount and unregister but ignores
//!   their failures and always ends in `Cleared`. It is the only way to
//!   reclaim a mount point whose hardware is gone. It never fails.
//!
//! Once the driver's unmount has been attempted the in-memory registry is the
//! authority: a failed driver unmount still releases the slot, and the error
//! is handed back as a [`UnmountOutcome::Degraded`] warning.

use log::{debug, error, info, warn};
use serde::Serialize;
use snafu::ResultExt;

use crate::context::{MountContext, SystemState};
use crate::device::{BlockDeviceInfo, device_name};
use crate::driver::{
    BlockDriver, BlockHandle, BlockIo, DriverError, EEXIST, FileStat, FsDriver, Recovery,
    VolumeStats,
};
use crate::error::{
    AlreadyMountedSnafu, DeviceNotFoundSnafu, Error, MountSnafu, NotAvailableSnafu,
    NotMountedSnafu, RegisterSnafu, RemovedDuringOperationSnafu, Result, StatSnafu,
    UnknownMountNameSnafu, VolumeStatsSnafu,
};
use crate::mbr::{self, PartitionDescriptor};
use crate::mount::{MountPoint, MountRegistry, MountState};

/// Step of the clean unmount sequence that reported an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmountStage {
    Flush,
    Unmount,
    Unregister,
}

/// Result of releasing a mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnmountOutcome {
    /// Flushed, unmounted and unregistered without complaint.
    Clean,
    /// The slot was released but the driver reported an error; cached writes
    /// may not have reached the medium.
    Degraded {
        stage: UnmountStage,
        error: DriverError,
    },
    /// The drive was already gone; the mount point was cleared without a
    /// clean unmount.
    Forced,
}

impl UnmountOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, UnmountOutcome::Clean)
    }
}

/// Result of mounting every available partition of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountReport {
    pub slot_id: usize,
    pub mounted: Vec<usize>,
    /// Mount points the driver refused, with the reason.
    pub failed: Vec<(usize, String)>,
}

/// Per mount point outcomes of releasing a whole device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRelease {
    pub slot_id: usize,
    pub outcomes: Vec<(usize, UnmountOutcome)>,
}

impl SystemState {
    /// Detects a drive that vanished since it was opened and forces it
    /// through removal.
    pub(crate) fn ensure_present(&mut self, slot_id: usize) -> Result<()> {
        if self.devices.is_connected(slot_id) && self.devices.signal(slot_id) == Some(false) {
            self.remove_device(slot_id);
            return RemovedDuringOperationSnafu {
                device: device_name(slot_id),
            }
            .fail();
        }
        Ok(())
    }

    /// Runs a driver call on behalf of a partition of `slot_id`.
    ///
    /// If the drive disappeared underneath it, whether or not the driver
    /// touched the medium, the device is removed and `RemovedDuringOperation`
    /// replaces whatever the call returned.
    fn driver_call<T>(
        &mut self,
        slot_id: usize,
        f: impl FnOnce(&mut dyn FsDriver, &mut dyn BlockIo) -> T,
    ) -> Result<T> {
        let (out, removed) = self.with_io(|fs, io| f(fs, io));
        let vanished =
            self.devices.is_connected(slot_id) && self.devices.signal(slot_id) == Some(false);
        if let Some(slot_id) = removed.or(vanished.then_some(slot_id)) {
            self.remove_device(slot_id);
            return RemovedDuringOperationSnafu {
                device: device_name(slot_id),
            }
            .fail();
        }
        Ok(out)
    }

    /// Forces every mount point linked to the slot to `Cleared` and closes
    /// the slot.
    pub(crate) fn remove_device(&mut self, slot_id: usize) {
        let name = device_name(slot_id);
        let linked = self.mounts.linked_to(slot_id);
        let mounted: Vec<_> = linked
            .iter()
            .filter_map(|&id| self.mounts.get(id).ok())
            .filter(|p| p.mounted())
            .map(|p| p.mount_name().to_string())
            .collect();
        if mounted.is_empty() {
            info!("{} removed", name);
        } else {
            warn!(
                "{} removed while {} mounted; cached writes may have been lost",
                name,
                mounted.join(", ")
            );
        }

        for id in linked {
            self.force_clear(id);
        }
        self.devices.close(slot_id);
        debug_assert!(self.invariants_hold());
    }

    /// Best-effort teardown of one mount point. Driver errors are logged,
    /// never returned.
    pub(crate) fn force_clear(&mut self, mount_id: usize) {
        let Ok(point) = self.mounts.get(mount_id) else {
            return;
        };
        let state = point.state();
        let name = point.mount_name().to_string();

        if state.is_mounted() {
            let (res, _) = self.with_io(|fs, io| fs.unmount(&name, io));
            if let Err(e) = res {
                warn!("{}: forced unmount: {}", name, e);
            }
        }
        if state.is_registered()
            && let Err(e) = self.fs.unregister_device(&name)
        {
            warn!("{}: forced unregister: {}", name, e);
        }
        if self.mounts.clear(mount_id).is_ok() && state != MountState::Cleared {
            debug!("mount point {} ({}) cleared", mount_id, name);
        }
    }

    /// Scans the partition table of a connected device into its mount points.
    pub(crate) fn scan_device(&mut self, slot_id: usize) -> Result<[PartitionDescriptor; 4]> {
        self.devices.slot(slot_id)?;
        self.ensure_present(slot_id)?;
        let Some(generation) = self.devices.generation(slot_id) else {
            return DeviceNotFoundSnafu {
                what: format!("{} is not connected", device_name(slot_id)),
            }
            .fail();
        };
        if self.mounts.device_busy(slot_id) {
            return Err(Error::DeviceBusy {
                device: device_name(slot_id),
            });
        }

        self.mounts.link_device(slot_id, generation);
        match mbr::scan(&mut self.devices, slot_id) {
            Ok(partitions) => {
                let block_count = self.devices.geometry(slot_id)?.block_count;
                self.mounts.apply_scan(slot_id, &partitions, block_count);
                info!(
                    "{}: {} partition(s) available",
                    device_name(slot_id),
                    MountRegistry::ids_for_slot(slot_id)
                        .filter(|&id| self.mounts.get(id).is_ok_and(MountPoint::available))
                        .count()
                );
                Ok(partitions)
            }
            Err(err) => {
                self.ensure_present(slot_id)?;
                self.mounts.mark_scan_failed(slot_id);
                Err(err)
            }
        }
    }

    pub(crate) fn mount_point(&mut self, mount_id: usize) -> Result<()> {
        let point = self.mounts.get(mount_id)?;
        match point.state() {
            MountState::Mounted => {
                return AlreadyMountedSnafu {
                    mount_id,
                    name: point.mount_name(),
                }
                .fail();
            }
            MountState::Available => {}
            _ => return NotAvailableSnafu { mount_id }.fail(),
        }
        let Some(parent) = point.parent() else {
            return NotAvailableSnafu { mount_id }.fail();
        };
        let name = point.mount_name().to_string();
        let range = point.range();

        self.ensure_present(parent.slot_id)?;
        if self.devices.generation(parent.slot_id) != Some(parent.generation) {
            self.force_clear(mount_id);
            return DeviceNotFoundSnafu {
                what: format!("parent of {} was replaced", name),
            }
            .fail();
        }

        if let Some(other) = self.mounts.registered_under(&name, mount_id) {
            return Err(DriverError::new(
                EEXIST,
                format!("name already registered by mount point {}", other),
            ))
            .context(RegisterSnafu { name });
        }
        let handle = BlockHandle::partition(mount_id, parent.generation);
        self.fs
            .register_device(&name, handle, range)
            .context(RegisterSnafu { name: name.clone() })?;
        self.mounts.set_state(mount_id, MountState::Registered)?;
        debug!("{} registered ({} blocks at {})", name, range.count, range.offset);

        let mounted = self.driver_call(parent.slot_id, |fs, io| fs.mount(&name, io))?;
        if let Err(source) = mounted {
            error!("{}: mount failed: {}", name, source);
            if let Err(e) = self.fs.unregister_device(&name) {
                warn!("{}: unregister after failed mount: {}", name, e);
            }
            self.mounts.set_state(mount_id, MountState::Available)?;
            return Err(source).context(MountSnafu { name });
        }
        self.mounts.set_state(mount_id, MountState::Mounted)?;

        match self.driver_call(parent.slot_id, |fs, io| fs.recover(&name, io))? {
            Ok(Recovery::Recovered) => debug!("{}: journal recovered", name),
            Ok(Recovery::Unsupported) => debug!("{}: no journal recovery", name),
            Err(e) => warn!("{}: journal recovery failed: {}", name, e),
        }

        if self.write_back_cache
            && let Err(e) = self.driver_call(parent.slot_id, |fs, io| fs.flush_cache(&name, true, io))?
        {
            warn!("{}: enabling write-back cache failed: {}", name, e);
        }

        let label = match self.driver_call(parent.slot_id, |fs, io| fs.volume_label(&name, io))? {
            Ok(label) => label,
            Err(e) => {
                warn!("{}: volume label unreadable: {}", name, e);
                String::new()
            }
        };
        self.mounts.set_volume_label(mount_id, label)?;

        debug_assert!(self.invariants_hold());
        info!("{} mounted", name);
        Ok(())
    }

    pub(crate) fn unmount_point(&mut self, mount_id: usize) -> Result<UnmountOutcome> {
        let point = self.mounts.get(mount_id)?;
        if !point.mounted() {
            return NotMountedSnafu { mount_id }.fail();
        }
        let name = point.mount_name().to_string();
        let Some(parent) = point.parent() else {
            return NotAvailableSnafu { mount_id }.fail();
        };
        self.ensure_present(parent.slot_id)?;
        let slot_id = parent.slot_id;

        let mut warning = None;
        if let Err(e) = self.driver_call(slot_id, |fs, io| fs.flush_cache(&name, false, io))? {
            warn!("{}: cache flush failed: {}", name, e);
            warning = Some((UnmountStage::Flush, e));
        }

        // Unmount is attempted once; from here on a teardown only unregisters.
        self.mounts.set_state(mount_id, MountState::Registered)?;
        if let Err(source) = self.driver_call(slot_id, |fs, io| fs.unmount(&name, io))? {
            warn!(
                "{}: unmount failed ({}); clearing the mount point, cached writes may have been lost",
                name, source
            );
            self.force_clear(mount_id);
            return Ok(UnmountOutcome::Degraded {
                stage: UnmountStage::Unmount,
                error: source,
            });
        }

        if let Err(e) = self.fs.unregister_device(&name) {
            warn!("{}: unregister failed: {}", name, e);
            warning = warning.or(Some((UnmountStage::Unregister, e)));
        }
        self.mounts.release(mount_id)?;

        debug_assert!(self.invariants_hold());
        info!("{} unmounted", name);
        Ok(match warning {
            None => UnmountOutcome::Clean,
            Some((stage, error)) => UnmountOutcome::Degraded { stage, error },
        })
    }

    /// Mounts every available, not yet mounted partition of a connected
    /// device. A refused partition does not stop the others; a removal does.
    pub(crate) fn mount_device(&mut self, slot_id: usize) -> Result<MountReport> {
        self.devices.slot(slot_id)?;
        self.ensure_present(slot_id)?;
        if !self.devices.is_connected(slot_id) {
            return DeviceNotFoundSnafu {
                what: format!("{} is not connected", device_name(slot_id)),
            }
            .fail();
        }

        let pending: Vec<usize> = MountRegistry::ids_for_slot(slot_id)
            .filter(|&id| self.mounts.get(id).is_ok_and(|p| p.available() && !p.mounted()))
            .collect();
        let mut report = MountReport {
            slot_id,
            mounted: Vec::with_capacity(pending.len()),
            failed: Vec::new(),
        };
        for id in pending {
            match self.mount_point(id) {
                Ok(()) => report.mounted.push(id),
                Err(err) if err.is_removal() => return Err(err),
                Err(err) => {
                    warn!("{}: {}", device_name(slot_id), err);
                    report.failed.push((id, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Unmounts every mounted partition of a device, clears all its mount
    /// points and closes the slot so the drive can be pulled.
    pub(crate) fn release_device(&mut self, slot_id: usize) -> Result<DeviceRelease> {
        self.devices.slot(slot_id)?;
        let linked = self.mounts.linked_to(slot_id);
        let mounted: Vec<usize> = linked
            .iter()
            .copied()
            .filter(|&id| self.mounts.get(id).is_ok_and(MountPoint::mounted))
            .collect();
        let mut outcomes = Vec::with_capacity(mounted.len());

        let vanished =
            self.devices.is_connected(slot_id) && self.devices.signal(slot_id) == Some(false);
        if vanished {
            self.remove_device(slot_id);
            outcomes.extend(mounted.into_iter().map(|id| (id, UnmountOutcome::Forced)));
            return Ok(DeviceRelease { slot_id, outcomes });
        }

        for id in mounted {
            let outcome = match self.unmount_point(id) {
                Ok(outcome) => outcome,
                Err(err) if err.is_removal() => UnmountOutcome::Forced,
                Err(err) => {
                    warn!("{}: {}", device_name(slot_id), err);
                    UnmountOutcome::Degraded {
                        stage: UnmountStage::Unmount,
                        error: err.into(),
                    }
                }
            };
            outcomes.push((id, outcome));
        }

        for id in self.mounts.linked_to(slot_id) {
            self.force_clear(id);
        }
        self.devices.close(slot_id);
        info!("{} can be safely removed now", device_name(slot_id));
        Ok(DeviceRelease { slot_id, outcomes })
    }

    /// Handles one look at a slot's connection signal.
    ///
    /// Returns whether the drive is connected afterwards.
    pub(crate) fn check_connection(&mut self, slot_id: usize) -> Result<bool> {
        self.devices.slot(slot_id)?;
        if self.devices.is_connected(slot_id) {
            if self.devices.signal(slot_id) == Some(true) {
                return Ok(true);
            }
            self.remove_device(slot_id);
            return Ok(false);
        }
        if self.devices.probe(slot_id)? {
            self.on_connected(slot_id)
        } else {
            Ok(false)
        }
    }

    fn on_connected(&mut self, slot_id: usize) -> Result<bool> {
        if !self.devices.open(slot_id)? {
            return Ok(true);
        }
        info!("{} connected", device_name(slot_id));
        match self.scan_device(slot_id) {
            Ok(_) => Ok(true),
            Err(err) if err.is_removal() => Ok(false),
            Err(err) => {
                warn!("{}: {}", device_name(slot_id), err);
                Ok(true)
            }
        }
    }

    /// `mounted` implies `available` and a connected parent of the same
    /// generation.
    pub(crate) fn invariants_hold(&self) -> bool {
        self.mounts.iter().all(|p| {
            !p.mounted()
                || (p.available()
                    && p.parent()
                        .is_some_and(|d| self.devices.generation(d.slot_id) == Some(d.generation)))
        })
    }
}

/// Public facade over the shared context.
///
/// Every method takes the context lock for its whole duration, so at most one
/// scan, mount, unmount or block transfer is in flight at a time.
#[derive(Clone)]
pub struct MountLifecycleManager {
    ctx: MountContext,
}

impl MountLifecycleManager {
    pub fn new(ctx: MountContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &MountContext {
        &self.ctx
    }

    /// Plugs a transport driver into a slot. A drive previously open in the
    /// slot goes through removal first.
    pub fn attach(&self, slot_id: usize, driver: Box<dyn BlockDriver>) -> Result<()> {
        let mut state = self.ctx.lock();
        state.devices.slot(slot_id)?;
        if state.devices.is_connected(slot_id) {
            state.remove_device(slot_id);
        }
        state.devices.attach(slot_id, driver)
    }

    pub fn scan(&self, slot_id: usize) -> Result<[PartitionDescriptor; 4]> {
        self.ctx.lock().scan_device(slot_id)
    }

    pub fn mount(&self, mount_id: usize) -> Result<()> {
        self.ctx.lock().mount_point(mount_id)
    }

    pub fn unmount(&self, mount_id: usize) -> Result<UnmountOutcome> {
        self.ctx.lock().unmount_point(mount_id)
    }

    pub fn mount_all_for_device(&self, slot_id: usize) -> Result<MountReport> {
        self.ctx.lock().mount_device(slot_id)
    }

    pub fn unmount_all_for_device(&self, slot_id: usize) -> Result<DeviceRelease> {
        self.ctx.lock().release_device(slot_id)
    }

    /// Removal notification: the drive in `slot_id` is known to be gone.
    pub fn notify_removed(&self, slot_id: usize) -> Result<()> {
        let mut state = self.ctx.lock();
        state.devices.slot(slot_id)?;
        state.remove_device(slot_id);
        Ok(())
    }

    pub(crate) fn check_connection(&self, slot_id: usize) -> Result<bool> {
        self.ctx.lock().check_connection(slot_id)
    }

    pub fn get_mount_list(&self) -> Vec<MountPoint> {
        self.ctx.lock().mounts.snapshot()
    }

    pub fn get_block_device_list(&self) -> Vec<BlockDeviceInfo> {
        self.ctx.lock().devices.snapshot()
    }

    /// Label read back when the mount point was mounted; empty otherwise.
    pub fn volume_label(&self, mount_id: usize) -> Result<String> {
        let mut state = self.ctx.lock();
        if let Some(parent) = state.mounts.get(mount_id)?.parent() {
            state.ensure_present(parent.slot_id)?;
        }
        Ok(state.mounts.get(mount_id)?.volume_label().to_string())
    }

    /// Resolves a mount name to its mount point. Accepts `sda1`, `/sda1/`
    /// and paths below a mount point such as `/sda1/logs/boot.txt`.
    pub fn mount_id_by_name(&self, name: &str) -> Result<usize> {
        let wanted = name.trim_start_matches('/').split('/').next().unwrap_or_default();
        self.ctx
            .lock()
            .mounts
            .iter()
            .find(|p| p.available() && p.mount_name() == wanted)
            .map(MountPoint::mount_id)
            .ok_or_else(|| UnknownMountNameSnafu { name }.build())
    }

    /// Space statistics of a mounted partition.
    pub fn volume_stats(&self, mount_id: usize) -> Result<VolumeStats> {
        let mut state = self.ctx.lock();
        let point = state.mounts.get(mount_id)?;
        let (Some(parent), true) = (point.parent(), point.mounted()) else {
            return NotMountedSnafu { mount_id }.fail();
        };
        let name = point.mount_name().to_string();
        state.ensure_present(parent.slot_id)?;
        state
            .driver_call(parent.slot_id, |fs, io| fs.volume_stats(&name, io))?
            .context(VolumeStatsSnafu { name: name.clone() })
    }

    /// Stats `path` (relative to the mount point's root) on a mounted
    /// partition.
    pub fn stat(&self, mount_id: usize, path: &str) -> Result<FileStat> {
        let mut state = self.ctx.lock();
        let point = state.mounts.get(mount_id)?;
        if !point.mounted() {
            return NotMountedSnafu { mount_id }.fail();
        }
        let full_path = format!("{}{}", point.mount_path(), path.trim_start_matches('/'));
        let Some(parent) = point.parent() else {
            return NotMountedSnafu { mount_id }.fail();
        };
        state.ensure_present(parent.slot_id)?;
        state
            .driver_call(parent.slot_id, |fs, io| fs.stat(&full_path, io))?
            .context(StatSnafu { path: full_path.clone() })
    }

    /// Handle addressing the whole physical device in its current session.
    pub fn device_handle(&self, slot_id: usize) -> Result<BlockHandle> {
        let state = self.ctx.lock();
        state.devices.slot(slot_id)?;
        match state.devices.generation(slot_id) {
            Some(generation) => Ok(BlockHandle::device(slot_id, generation)),
            None => DeviceNotFoundSnafu {
                what: format!("{} is not connected", device_name(slot_id)),
            }
            .fail(),
        }
    }

    /// Handle addressing a scanned partition.
    pub fn partition_handle(&self, mount_id: usize) -> Result<BlockHandle> {
        let state = self.ctx.lock();
        let point = state.mounts.get(mount_id)?;
        match point.parent() {
            Some(parent) if point.available() => {
                Ok(BlockHandle::partition(mount_id, parent.generation))
            }
            _ => NotAvailableSnafu { mount_id }.fail(),
        }
    }

    /// Reads blocks through a handle, as the filesystem driver would.
    pub fn read_blocks(
        &self,
        handle: BlockHandle,
        first_block: u64,
        count: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut state = self.ctx.lock();
        let slot_id = state.devices.resolve(handle, &state.mounts)?.slot_id;
        state.ensure_present(slot_id)?;
        state.driver_call(slot_id, |_, io| io.read_blocks(handle, first_block, count, buf))?
    }

    /// Writes blocks through a handle.
    pub fn write_blocks(
        &self,
        handle: BlockHandle,
        first_block: u64,
        count: u32,
        buf: &[u8],
    ) -> Result<()> {
        let mut state = self.ctx.lock();
        let slot_id = state.devices.resolve(handle, &state.mounts)?.slot_id;
        state.ensure_present(slot_id)?;
        state.driver_call(slot_id, |_, io| io.write_blocks(handle, first_block, count, buf))?
    }

    /// `mounted` implies `available` and a connected parent.
    pub fn invariants_hold(&self) -> bool {
        self.ctx.lock().invariants_hold()
    }
}
