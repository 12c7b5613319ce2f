//! Daemon mode: one mount manager serving JSON-lines commands.
//!
//! Each line on stdin is a [`DaemonRequest`]; each answer is written as one
//! [`DaemonResponse`] line on stdout. The daemon exits on `shutdown` or when
//! stdin closes, releasing every connected drive first.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use usbmount_core::device::MAX_DEVICES;
use usbmount_core::lifecycle::UnmountStage;
use usbmount_core::protocol::{DaemonCommand, DaemonRequest, DaemonResponse};
use usbmount_core::{
    Config, DeviceWatcher, ImageDriver, MountContext, MountLifecycleManager, UnmountOutcome,
    VolumeProbe, VolumeStats,
};

/// Runs the daemon, reading requests from stdin and writing responses to stdout.
pub fn run_daemon(config: Config) -> io::Result<()> {
    let session = Session::new(config);
    let mut stdout = io::stdout();
    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                // Can't respond without an ID
                warn!("failed to parse request: {}", e);
                continue;
            }
        };

        if request.cmd == DaemonCommand::Shutdown {
            write_response(&mut stdout, &DaemonResponse::success(request.id, ().into()))?;
            break;
        }
        let response = session.handle(request);
        write_response(&mut stdout, &response)?;
    }

    session.release_all();
    Ok(())
}

fn write_response(stdout: &mut io::Stdout, response: &DaemonResponse) -> io::Result<()> {
    let json = serde_json::to_string(response).map_err(io::Error::other)?;
    writeln!(stdout, "{}", json)?;
    stdout.flush()
}

struct Session {
    manager: MountLifecycleManager,
    watcher: DeviceWatcher,
}

impl Session {
    fn new(config: Config) -> Self {
        let ctx = MountContext::new(Box::new(VolumeProbe::new()), config);
        let manager = MountLifecycleManager::new(ctx);
        let watcher = DeviceWatcher::with_system_clock(manager.clone());
        Self { manager, watcher }
    }

    fn handle(&self, request: DaemonRequest) -> DaemonResponse {
        let id = request.id;
        match self.dispatch(request.cmd) {
            Ok((data, None)) => DaemonResponse::success(id, data),
            Ok((data, Some(warning))) => DaemonResponse::success(id, data).with_warning(warning),
            Err(message) => DaemonResponse::failure(id, message),
        }
    }

    fn dispatch(&self, cmd: DaemonCommand) -> Result<(serde_json::Value, Option<String>), String> {
        let m = &self.manager;
        match cmd {
            DaemonCommand::AttachImage { slot_id, path } => {
                m.attach(slot_id, Box::new(ImageDriver::new(path)))
                    .map_err(|e| e.to_string())?;
                Ok((serde_json::Value::Null, None))
            }
            DaemonCommand::Poll {
                slot_id,
                timeout_ms,
            } => {
                let event = match timeout_ms {
                    Some(ms) => self.watcher.poll(slot_id, Duration::from_millis(ms)),
                    None => self.watcher.wait(slot_id),
                }
                .map_err(|e| e.to_string())?;
                data(&event)
            }
            DaemonCommand::Scan { slot_id } => data(&m.scan(slot_id).map_err(|e| e.to_string())?),
            DaemonCommand::Mount { mount_id } => {
                m.mount(mount_id).map_err(|e| e.to_string())?;
                Ok((serde_json::Value::Null, None))
            }
            DaemonCommand::MountAll { slot_id } => {
                let report = m.mount_all_for_device(slot_id).map_err(|e| e.to_string())?;
                let warning = (!report.failed.is_empty()).then(|| {
                    report
                        .failed
                        .iter()
                        .map(|(id, reason)| format!("mount point {}: {}", id, reason))
                        .collect::<Vec<_>>()
                        .join("; ")
                });
                Ok((to_value(&report)?, warning))
            }
            DaemonCommand::Unmount { mount_id } => {
                let outcome = m.unmount(mount_id).map_err(|e| e.to_string())?;
                let warning = degraded_warning(mount_id, &outcome);
                Ok((to_value(&outcome)?, warning))
            }
            DaemonCommand::UnmountAll { slot_id } => {
                let release = m
                    .unmount_all_for_device(slot_id)
                    .map_err(|e| e.to_string())?;
                let warnings: Vec<String> = release
                    .outcomes
                    .iter()
                    .filter_map(|(id, outcome)| degraded_warning(*id, outcome))
                    .collect();
                let warning = (!warnings.is_empty()).then(|| warnings.join("; "));
                Ok((to_value(&release)?, warning))
            }
            DaemonCommand::NotifyRemoved { slot_id } => {
                m.notify_removed(slot_id).map_err(|e| e.to_string())?;
                Ok((serde_json::Value::Null, None))
            }
            DaemonCommand::ListMounts => data(&m.get_mount_list()),
            DaemonCommand::ListDevices => data(&m.get_block_device_list()),
            DaemonCommand::VolumeLabel { mount_id } => {
                data(&m.volume_label(mount_id).map_err(|e| e.to_string())?)
            }
            DaemonCommand::VolumeStats { mount_id } => {
                let stats = m.volume_stats(mount_id).map_err(|e| e.to_string())?;
                data(&SpaceReport::from(stats))
            }
            DaemonCommand::Lookup { name } => {
                data(&m.mount_id_by_name(&name).map_err(|e| e.to_string())?)
            }
            DaemonCommand::Stat { mount_id, path } => {
                data(&m.stat(mount_id, &path).map_err(|e| e.to_string())?)
            }
            DaemonCommand::Shutdown => Ok((serde_json::Value::Null, None)),
        }
    }

    /// Releases every connected drive before exit.
    fn release_all(&self) {
        for slot_id in 0..MAX_DEVICES {
            let connected = self
                .manager
                .get_block_device_list()
                .get(slot_id)
                .is_some_and(|d| d.connected);
            if !connected {
                continue;
            }
            match self.manager.unmount_all_for_device(slot_id) {
                Ok(release) => info!(
                    "released slot {} ({} mount point(s))",
                    slot_id,
                    release.outcomes.len()
                ),
                Err(e) => warn!("failed to release slot {}: {}", slot_id, e),
            }
        }
    }
}

/// Byte totals of a volume as reported to clients.
#[derive(Serialize)]
struct SpaceReport {
    block_size: u64,
    total_bytes: u64,
    used_bytes: u64,
    free_bytes: u64,
}

impl From<VolumeStats> for SpaceReport {
    fn from(stats: VolumeStats) -> Self {
        Self {
            block_size: stats.block_size,
            total_bytes: stats.total_bytes(),
            used_bytes: stats.used_bytes(),
            free_bytes: stats.free_bytes(),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn data<T: Serialize>(value: &T) -> Result<(serde_json::Value, Option<String>), String> {
    Ok((to_value(value)?, None))
}

fn degraded_warning(mount_id: usize, outcome: &UnmountOutcome) -> Option<String> {
    match outcome {
        UnmountOutcome::Degraded { stage, error } => {
            let stage = match stage {
                UnmountStage::Flush => "cache flush",
                UnmountStage::Unmount => "unmount",
                UnmountStage::Unregister => "unregister",
            };
            Some(format!(
                "mount point {}: {} failed ({}); cached writes may have been lost",
                mount_id, stage, error
            ))
        }
        UnmountOutcome::Forced => Some(format!(
            "mount point {}: drive was already gone; cached writes may have been lost",
            mount_id
        )),
        UnmountOutcome::Clean => None,
    }
}
