//! Protocol types for daemon session communication.
//!
//! A long-lived `usbmount-cli daemon` process owns the registries and reads
//! one JSON request per line on stdin, answering with one JSON response per
//! line on stdout:
//!
//! ```text
//! {"id":1,"cmd":"attach_image","slot_id":0,"path":"/tmp/disk.img"}
//! {"id":1,"success":true,"data":null}
//! {"id":2,"cmd":"poll","slot_id":0,"timeout_ms":1000}
//! {"id":2,"success":true,"data":"connected"}
//! ```

use serde::{Deserialize, Serialize};

fn root_path() -> String {
    "/".to_string()
}

/// Request sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    /// Echoed back in the response.
    pub id: u64,
    #[serde(flatten)]
    pub cmd: DaemonCommand,
}

/// Command types for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonCommand {
    /// Plug a disk image into a slot.
    AttachImage { slot_id: usize, path: String },
    /// Wait for the drive in a slot; the configured timeout applies when
    /// `timeout_ms` is absent.
    Poll {
        slot_id: usize,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Scan { slot_id: usize },
    Mount { mount_id: usize },
    /// Mount every available partition of a connected drive.
    MountAll { slot_id: usize },
    Unmount { mount_id: usize },
    /// Prepare a device for safe removal.
    UnmountAll { slot_id: usize },
    /// The drive in a slot was pulled.
    NotifyRemoved { slot_id: usize },
    ListMounts,
    ListDevices,
    VolumeLabel { mount_id: usize },
    /// Used, free and total bytes of a mounted partition.
    VolumeStats { mount_id: usize },
    /// Mount point id for a name such as `sda1` or `/sda1/`.
    Lookup { name: String },
    Stat {
        mount_id: usize,
        #[serde(default = "root_path")]
        path: String,
    },
    /// Shutdown the daemon.
    Shutdown,
}

/// Response from the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Command-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Set when the operation succeeded but the driver complained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Error message if success is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn success(id: u64, data: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            data,
            warning: None,
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: serde_json::Value::Null,
            warning: None,
            error: Some(message.into()),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requests() {
        let req: DaemonRequest =
            serde_json::from_str(r#"{"id":3,"cmd":"mount","mount_id":5}"#).unwrap();
        assert_eq!(req.id, 3);
        assert_eq!(req.cmd, DaemonCommand::Mount { mount_id: 5 });

        let req: DaemonRequest =
            serde_json::from_str(r#"{"id":4,"cmd":"poll","slot_id":1}"#).unwrap();
        assert_eq!(
            req.cmd,
            DaemonCommand::Poll {
                slot_id: 1,
                timeout_ms: None
            }
        );

        let req: DaemonRequest =
            serde_json::from_str(r#"{"id":5,"cmd":"stat","mount_id":0}"#).unwrap();
        assert_eq!(
            req.cmd,
            DaemonCommand::Stat {
                mount_id: 0,
                path: "/".to_string()
            }
        );

        let req: DaemonRequest =
            serde_json::from_str(r#"{"id":6,"cmd":"lookup","name":"/sdb2/"}"#).unwrap();
        assert_eq!(
            req.cmd,
            DaemonCommand::Lookup {
                name: "/sdb2/".to_string()
            }
        );

        let req: DaemonRequest =
            serde_json::from_str(r#"{"id":7,"cmd":"mount_all","slot_id":1}"#).unwrap();
        assert_eq!(req.cmd, DaemonCommand::MountAll { slot_id: 1 });
        let req: DaemonRequest =
            serde_json::from_str(r#"{"id":8,"cmd":"volume_stats","mount_id":4}"#).unwrap();
        assert_eq!(req.cmd, DaemonCommand::VolumeStats { mount_id: 4 });
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"id":1,"cmd":"format"}"#).is_err());
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"id":1,"cmd":"mount"}"#).is_err());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = serde_json::to_string(&DaemonResponse::success(7, serde_json::json!(true)))
            .unwrap();
        assert_eq!(json, r#"{"id":7,"success":true,"data":true}"#);

        let resp = DaemonResponse::failure(8, "mount point 2 is not available");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["error"], "mount point 2 is not available");
        assert!(value["data"].is_null());
    }
}
