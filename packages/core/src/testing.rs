//! In-crate test doubles: a scriptable drive, a recording filesystem driver
//! and a manual clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::context::MountContext;
use crate::driver::{
    BlockDriver, BlockHandle, BlockIo, BlockRange, DriverError, EEXIST, ENOENT, FileMode,
    FileStat, FsDriver, Geometry, Recovery, Transfer, VolumeStats,
};
use crate::lifecycle::MountLifecycleManager;
use crate::mbr::SECTOR_SIZE;
use crate::watcher::Clock;

/// Raw image with a boot record holding `(type, first block, blocks)`
/// entries and a valid signature.
pub(crate) fn mbr_image(parts: &[(u8, u32, u32)], total_blocks: u64) -> Vec<u8> {
    let mut image = blank_image(total_blocks.max(1));
    for (i, &(partition_type, start, size)) in parts.iter().take(4).enumerate() {
        let entry = 446 + i * 16;
        image[entry + 4] = partition_type;
        image[entry + 8..entry + 12].copy_from_slice(&start.to_le_bytes());
        image[entry + 12..entry + 16].copy_from_slice(&size.to_le_bytes());
    }
    image[510] = 0x55;
    image[511] = 0xAA;
    image
}

pub(crate) fn blank_image(blocks: u64) -> Vec<u8> {
    vec![0u8; blocks as usize * SECTOR_SIZE]
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

struct DriveState {
    image: Vec<u8>,
    connected: bool,
    refuse_connect: bool,
    connect_after: u32,
    connect_calls: u32,
    fail_init: bool,
    fail_transfers: bool,
    max_transfer: u32,
    init_calls: u32,
    transfer_calls: u32,
}

/// In-memory drive with 512-byte blocks. Starts connected.
pub(crate) struct FakeDrive {
    state: Arc<Mutex<DriveState>>,
}

/// Test-side switchboard of a [`FakeDrive`].
#[derive(Clone)]
pub(crate) struct DriveControl {
    state: Arc<Mutex<DriveState>>,
}

impl FakeDrive {
    pub(crate) fn new(image: Vec<u8>) -> (FakeDrive, DriveControl) {
        let state = Arc::new(Mutex::new(DriveState {
            image,
            connected: true,
            refuse_connect: false,
            connect_after: 1,
            connect_calls: 0,
            fail_init: false,
            fail_transfers: false,
            max_transfer: 255,
            init_calls: 0,
            transfer_calls: 0,
        }));
        (
            FakeDrive {
                state: state.clone(),
            },
            DriveControl { state },
        )
    }
}

impl BlockDriver for FakeDrive {
    fn connect(&mut self) -> bool {
        let mut s = locked(&self.state);
        if s.connected {
            return true;
        }
        s.connect_calls += 1;
        if !s.refuse_connect && s.connect_calls >= s.connect_after {
            s.connected = true;
        }
        s.connected
    }

    fn connected(&self) -> bool {
        locked(&self.state).connected
    }

    fn init(&mut self) -> Result<Geometry, DriverError> {
        let mut s = locked(&self.state);
        s.init_calls += 1;
        if s.fail_init {
            return Err(DriverError::io("injected init failure"));
        }
        Ok(Geometry {
            block_size: SECTOR_SIZE,
            block_count: (s.image.len() / SECTOR_SIZE) as u64,
        })
    }

    fn transfer(
        &mut self,
        xfer: Transfer<'_>,
        first_block: u64,
        count: u32,
    ) -> Result<(), DriverError> {
        let mut s = locked(&self.state);
        s.transfer_calls += 1;
        if !s.connected {
            return Err(DriverError::no_device("drive unplugged"));
        }
        if s.fail_transfers {
            return Err(DriverError::io("injected transfer failure"));
        }
        if count > s.max_transfer {
            return Err(DriverError::io("transfer too long"));
        }
        let start = first_block as usize * SECTOR_SIZE;
        let end = start + count as usize * SECTOR_SIZE;
        if end > s.image.len() || xfer.len() != end - start {
            return Err(DriverError::io("transfer outside the image"));
        }
        match xfer {
            Transfer::Read(buf) => buf.copy_from_slice(&s.image[start..end]),
            Transfer::Write(buf) => s.image[start..end].copy_from_slice(buf),
        }
        Ok(())
    }

    fn max_transfer_blocks(&self) -> u32 {
        locked(&self.state).max_transfer
    }
}

impl DriveControl {
    pub(crate) fn set_connected(&self, connected: bool) {
        locked(&self.state).connected = connected;
    }

    /// Every later `connect()` fails.
    pub(crate) fn refuse_connect(&self) {
        locked(&self.state).refuse_connect = true;
    }

    /// The `n`-th `connect()` from now succeeds.
    pub(crate) fn connect_after(&self, n: u32) {
        let mut s = locked(&self.state);
        s.refuse_connect = false;
        s.connect_after = n;
        s.connect_calls = 0;
    }

    pub(crate) fn fail_init(&self, fail: bool) {
        locked(&self.state).fail_init = fail;
    }

    pub(crate) fn fail_transfers(&self, fail: bool) {
        locked(&self.state).fail_transfers = fail;
    }

    pub(crate) fn set_max_transfer(&self, blocks: u32) {
        locked(&self.state).max_transfer = blocks;
    }

    pub(crate) fn fill_block(&self, lba: u64, byte: u8) {
        let start = lba as usize * SECTOR_SIZE;
        locked(&self.state).image[start..start + SECTOR_SIZE].fill(byte);
    }

    pub(crate) fn init_calls(&self) -> u32 {
        locked(&self.state).init_calls
    }

    pub(crate) fn transfer_calls(&self) -> u32 {
        locked(&self.state).transfer_calls
    }
}

/// Filesystem driver calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FsOp {
    Register,
    Unregister,
    Mount,
    Unmount,
    Recover,
    Flush,
    Stat,
    Label,
    Stats,
}

const ALL_OPS: [FsOp; 9] = [
    FsOp::Register,
    FsOp::Unregister,
    FsOp::Mount,
    FsOp::Unmount,
    FsOp::Recover,
    FsOp::Flush,
    FsOp::Stat,
    FsOp::Label,
    FsOp::Stats,
];

#[derive(Default)]
struct FsState {
    registered: HashMap<String, BlockHandle>,
    mounted: HashSet<String>,
    labels: HashMap<String, String>,
    failures: HashSet<FsOp>,
    calls: Vec<String>,
    unplug_during: Option<(FsOp, DriveControl)>,
}

impl FsState {
    fn enter(&mut self, op: FsOp, call: String) -> Result<(), DriverError> {
        self.calls.push(call);
        if self.unplug_during.as_ref().is_some_and(|(at, _)| *at == op)
            && let Some((_, drive)) = self.unplug_during.take()
        {
            drive.set_connected(false);
        }
        if self.failures.contains(&op) {
            return Err(DriverError::io(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

/// Filesystem driver that records every call and reads block 0 of the
/// partition on mount.
pub(crate) struct FakeFs {
    state: Arc<Mutex<FsState>>,
}

#[derive(Clone)]
pub(crate) struct FsControl {
    state: Arc<Mutex<FsState>>,
}

impl FakeFs {
    pub(crate) fn new() -> (FakeFs, FsControl) {
        let state = Arc::new(Mutex::new(FsState::default()));
        (
            FakeFs {
                state: state.clone(),
            },
            FsControl { state },
        )
    }
}

impl FsDriver for FakeFs {
    fn register_device(
        &mut self,
        name: &str,
        handle: BlockHandle,
        _range: BlockRange,
    ) -> Result<(), DriverError> {
        let mut s = locked(&self.state);
        s.enter(FsOp::Register, format!("register {}", name))?;
        if s.registered.contains_key(name) {
            return Err(DriverError::new(EEXIST, "already registered"));
        }
        s.registered.insert(name.to_string(), handle);
        Ok(())
    }

    fn unregister_device(&mut self, name: &str) -> Result<(), DriverError> {
        let mut s = locked(&self.state);
        s.enter(FsOp::Unregister, format!("unregister {}", name))?;
        s.registered
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::new(ENOENT, "not registered"))
    }

    fn mount(&mut self, name: &str, io: &mut dyn BlockIo) -> Result<(), DriverError> {
        let handle = {
            let mut s = locked(&self.state);
            s.enter(FsOp::Mount, format!("mount {}", name))?;
            *s.registered
                .get(name)
                .ok_or_else(|| DriverError::new(ENOENT, "not registered"))?
        };
        let mut block = vec![0u8; io.block_size(handle)?];
        io.read_blocks(handle, 0, 1, &mut block)?;
        locked(&self.state).mounted.insert(name.to_string());
        Ok(())
    }

    fn unmount(&mut self, name: &str, _io: &mut dyn BlockIo) -> Result<(), DriverError> {
        let mut s = locked(&self.state);
        s.enter(FsOp::Unmount, format!("unmount {}", name))?;
        s.mounted.remove(name);
        Ok(())
    }

    fn recover(&mut self, name: &str, _io: &mut dyn BlockIo) -> Result<Recovery, DriverError> {
        locked(&self.state).enter(FsOp::Recover, format!("recover {}", name))?;
        Ok(Recovery::Recovered)
    }

    fn flush_cache(
        &mut self,
        name: &str,
        enable: bool,
        _io: &mut dyn BlockIo,
    ) -> Result<(), DriverError> {
        let call = format!("flush {} {}", name, if enable { "on" } else { "off" });
        locked(&self.state).enter(FsOp::Flush, call)
    }

    fn stat(&mut self, path: &str, _io: &mut dyn BlockIo) -> Result<FileStat, DriverError> {
        locked(&self.state).enter(FsOp::Stat, format!("stat {}", path))?;
        if path.ends_with('/') {
            Ok(FileStat {
                mode: FileMode::Directory,
                size: 0,
            })
        } else {
            Err(DriverError::new(ENOENT, "no such file"))
        }
    }

    fn volume_label(&mut self, name: &str, _io: &mut dyn BlockIo) -> Result<String, DriverError> {
        let mut s = locked(&self.state);
        s.enter(FsOp::Label, format!("label {}", name))?;
        Ok(s.labels.get(name).cloned().unwrap_or_default())
    }

    /// 1000 blocks of 4 KiB, a quarter of them free.
    fn volume_stats(
        &mut self,
        name: &str,
        _io: &mut dyn BlockIo,
    ) -> Result<VolumeStats, DriverError> {
        locked(&self.state).enter(FsOp::Stats, format!("stats {}", name))?;
        Ok(VolumeStats {
            block_size: 4096,
            total_blocks: 1000,
            free_blocks: 250,
        })
    }
}

impl FsControl {
    pub(crate) fn set_label(&self, name: &str, label: &str) {
        locked(&self.state)
            .labels
            .insert(name.to_string(), label.to_string());
    }

    pub(crate) fn is_registered(&self, name: &str) -> bool {
        locked(&self.state).registered.contains_key(name)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    pub(crate) fn fail(&self, op: FsOp) {
        locked(&self.state).failures.insert(op);
    }

    pub(crate) fn fail_all(&self) {
        locked(&self.state).failures.extend(ALL_OPS);
    }

    pub(crate) fn clear_failures(&self) {
        locked(&self.state).failures.clear();
    }

    /// The next call of `op` unplugs `drive` on entry, before any injected
    /// failure and before touching the partition.
    pub(crate) fn unplug_during(&self, op: FsOp, drive: DriveControl) {
        locked(&self.state).unplug_during = Some((op, drive));
    }

    pub(crate) fn call_count(&self, call: &str) -> usize {
        locked(&self.state).calls.iter().filter(|c| *c == call).count()
    }
}

/// Clock that only moves when slept on.
pub(crate) struct FakeClock {
    base: Instant,
    state: Mutex<(Duration, u32)>,
}

impl FakeClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new((Duration::ZERO, 0)),
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        locked(&self.state).0
    }

    pub(crate) fn sleeps(&self) -> u32 {
        locked(&self.state).1
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + locked(&self.state).0
    }

    fn sleep(&self, duration: Duration) {
        let mut s = locked(&self.state);
        s.0 += duration;
        s.1 += 1;
    }
}

/// A manager with a [`FakeDrive`] attached to slot 0 (not yet opened) and
/// a [`FakeFs`] driver.
pub(crate) struct Harness {
    pub(crate) manager: MountLifecycleManager,
    pub(crate) drive: DriveControl,
    pub(crate) fs: FsControl,
}

impl Harness {
    pub(crate) fn new(image: Vec<u8>) -> Self {
        Self::with_config(image, Config::default())
    }

    pub(crate) fn with_config(image: Vec<u8>, config: Config) -> Self {
        let (fs, fs_ctl) = FakeFs::new();
        let manager = MountLifecycleManager::new(MountContext::new(Box::new(fs), config));
        let (drive, drive_ctl) = FakeDrive::new(image);
        manager.attach(0, Box::new(drive)).unwrap();
        Self {
            manager,
            drive: drive_ctl,
            fs: fs_ctl,
        }
    }

    /// Opens and scans slot 0.
    pub(crate) fn connect(&self) {
        assert!(self.manager.check_connection(0).unwrap());
    }
}
