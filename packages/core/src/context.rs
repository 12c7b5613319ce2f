//! Shared state and the lock that serializes every operation on it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Config;
use crate::device::{BlockDeviceRegistry, DeviceIo};
use crate::driver::FsDriver;
use crate::mount::MountRegistry;

/// Everything guarded by the context lock.
pub(crate) struct SystemState {
    pub(crate) devices: BlockDeviceRegistry,
    pub(crate) mounts: MountRegistry,
    pub(crate) fs: Box<dyn FsDriver>,
    pub(crate) write_back_cache: bool,
}

impl SystemState {
    /// Runs a filesystem-driver call with a block I/O bridge over the
    /// registries. Also returns the slot found disconnected during the call.
    pub(crate) fn with_io<T>(
        &mut self,
        f: impl FnOnce(&mut dyn FsDriver, &mut DeviceIo<'_>) -> T,
    ) -> (T, Option<usize>) {
        let SystemState {
            devices,
            mounts,
            fs,
            ..
        } = self;
        let mut io = DeviceIo::new(devices, mounts);
        let out = f(fs.as_mut(), &mut io);
        let removed = io.removed();
        (out, removed)
    }
}

/// Process-lifetime context shared by the lifecycle manager and the device
/// watcher.
///
/// Cloning is cheap; all clones refer to the same registries.
#[derive(Clone)]
pub struct MountContext {
    state: Arc<Mutex<SystemState>>,
    config: Arc<Config>,
}

impl MountContext {
    pub fn new(fs: Box<dyn FsDriver>, config: Config) -> Self {
        let state = SystemState {
            devices: BlockDeviceRegistry::new(),
            mounts: MountRegistry::new(),
            fs,
            write_back_cache: config.write_back_cache,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Takes the global lock.
    ///
    /// A panic while holding the lock does not make the registries unusable;
    /// every transition leaves them consistent before it can fail.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SystemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
