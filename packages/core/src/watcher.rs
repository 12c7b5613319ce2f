//! Connection watcher.
//!
//! Waits for a drive to show up in a slot. Each check takes the context lock
//! briefly; the wait between checks happens outside it, so mounts and
//! listings on other slots proceed while a poll is pending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;

use crate::device::device_name;
use crate::error::Result;
use crate::lifecycle::MountLifecycleManager;

/// Outcome of a bounded wait for a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The drive is connected, opened and scanned.
    Connected,
    TimedOut,
}

/// Time source for polling.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub struct DeviceWatcher {
    manager: MountLifecycleManager,
    clock: Arc<dyn Clock>,
}

impl DeviceWatcher {
    pub fn new(manager: MountLifecycleManager, clock: Arc<dyn Clock>) -> Self {
        Self { manager, clock }
    }

    pub fn with_system_clock(manager: MountLifecycleManager) -> Self {
        Self::new(manager, Arc::new(SystemClock))
    }

    /// Checks the slot until the drive is connected or `timeout` elapses.
    ///
    /// A new connection is opened and scanned before `Connected` is
    /// returned; nothing is mounted. A drive that was connected and is now
    /// gone is forced through removal, then waited for like any other.
    pub fn poll(&self, slot_id: usize, timeout: Duration) -> Result<ConnectionEvent> {
        let interval = self.manager.context().config().poll_interval();
        let start = self.clock.now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.manager.check_connection(slot_id)? {
                debug!(
                    "{} connected after {} check(s)",
                    device_name(slot_id),
                    attempts
                );
                return Ok(ConnectionEvent::Connected);
            }

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= timeout {
                debug!(
                    "{}: no connection within {:?}",
                    device_name(slot_id),
                    timeout
                );
                return Ok(ConnectionEvent::TimedOut);
            }
            self.clock.sleep(interval.min(timeout - elapsed));
        }
    }

    /// [`DeviceWatcher::poll`] with the configured connect timeout.
    pub fn wait(&self, slot_id: usize) -> Result<ConnectionEvent> {
        let timeout = self.manager.context().config().connect_timeout();
        self.poll(slot_id, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mount::MountState;
    use crate::testing::{FakeClock, Harness, mbr_image};

    fn image() -> Vec<u8> {
        mbr_image(&[(0x83, 64, 256), (0x0B, 320, 128)], 1024)
    }

    #[test]
    fn test_poll_times_out_on_system_clock() {
        let h = Harness::new(image());
        h.drive.set_connected(false);
        h.drive.refuse_connect();
        let before = h.manager.get_mount_list();
        let watcher = DeviceWatcher::with_system_clock(h.manager.clone());

        let start = Instant::now();
        let event = watcher.poll(0, Duration::from_millis(100)).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(event, ConnectionEvent::TimedOut);
        assert!(elapsed >= Duration::from_millis(100));
        assert_eq!(h.manager.get_mount_list(), before);
        assert!(!h.manager.get_block_device_list()[0].connected);
    }

    #[test]
    fn test_poll_connects_after_attempts() {
        let h = Harness::new(image());
        h.drive.set_connected(false);
        h.drive.connect_after(3);
        let clock = Arc::new(FakeClock::new());
        let watcher = DeviceWatcher::new(h.manager.clone(), clock.clone());

        let event = watcher.poll(0, Duration::from_secs(1)).unwrap();
        assert_eq!(event, ConnectionEvent::Connected);
        assert_eq!(clock.sleeps(), 2);

        let mounts = h.manager.get_mount_list();
        assert!(mounts[0].available());
        assert!(mounts[1].available());
        assert!(!mounts[0].mounted());
    }

    #[test]
    fn test_poll_fake_clock_timeout() {
        let h = Harness::new(image());
        h.drive.set_connected(false);
        h.drive.refuse_connect();
        let clock = Arc::new(FakeClock::new());
        let watcher = DeviceWatcher::new(h.manager.clone(), clock.clone());

        let event = watcher.poll(0, Duration::from_millis(50)).unwrap();
        assert_eq!(event, ConnectionEvent::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_millis(50));
        assert_eq!(clock.sleeps(), 5);
    }

    #[test]
    fn test_poll_last_sleep_is_cut_to_timeout() {
        let h = Harness::new(image());
        h.drive.set_connected(false);
        h.drive.refuse_connect();
        let clock = Arc::new(FakeClock::new());
        let watcher = DeviceWatcher::new(h.manager.clone(), clock.clone());
        let timeout = Duration::from_millis(55);

        let event = watcher.poll(0, timeout).unwrap();
        assert_eq!(event, ConnectionEvent::TimedOut);
        assert_eq!(clock.elapsed(), timeout);
        assert_eq!(clock.sleeps(), 6);
    }

    #[test]
    fn test_poll_already_connected() {
        let h = Harness::new(image());
        h.connect();
        let generation = h.manager.get_block_device_list()[0].generation;
        let watcher = DeviceWatcher::new(h.manager.clone(), Arc::new(FakeClock::new()));

        assert_eq!(
            watcher.poll(0, Duration::ZERO).unwrap(),
            ConnectionEvent::Connected
        );
        assert_eq!(h.manager.get_block_device_list()[0].generation, generation);
    }

    #[test]
    fn test_poll_detects_disconnect() {
        let h = Harness::new(image());
        h.connect();
        h.manager.mount(0).unwrap();
        h.drive.set_connected(false);
        h.drive.refuse_connect();
        let watcher = DeviceWatcher::new(h.manager.clone(), Arc::new(FakeClock::new()));

        let event = watcher.poll(0, Duration::from_millis(20)).unwrap();
        assert_eq!(event, ConnectionEvent::TimedOut);
        let mounts = h.manager.get_mount_list();
        assert!(mounts[..4].iter().all(|p| p.state() == MountState::Cleared));
        assert!(h.manager.invariants_hold());
    }

    #[test]
    fn test_reconnect_gets_new_generation() {
        let h = Harness::new(image());
        h.connect();
        let first = h.manager.get_block_device_list()[0].generation.unwrap();
        h.drive.set_connected(false);
        h.manager.notify_removed(0).unwrap();
        h.drive.set_connected(true);

        let watcher = DeviceWatcher::new(h.manager.clone(), Arc::new(FakeClock::new()));
        assert_eq!(
            watcher.poll(0, Duration::from_millis(10)).unwrap(),
            ConnectionEvent::Connected
        );
        let second = h.manager.get_block_device_list()[0].generation.unwrap();
        assert!(second > first);
        assert!(h.manager.get_mount_list()[0].available());
    }

    #[test]
    fn test_open_failure_is_returned() {
        let h = Harness::new(image());
        h.drive.fail_init(true);
        let watcher = DeviceWatcher::new(h.manager.clone(), Arc::new(FakeClock::new()));

        assert!(matches!(
            watcher.poll(0, Duration::from_millis(10)),
            Err(Error::DeviceInit { .. })
        ));
    }

    #[test]
    fn test_poll_without_driver() {
        let h = Harness::new(image());
        let watcher = DeviceWatcher::new(h.manager.clone(), Arc::new(FakeClock::new()));
        assert!(matches!(
            watcher.poll(2, Duration::from_millis(10)),
            Err(Error::NoDriver { slot_id: 2 })
        ));
    }
}
