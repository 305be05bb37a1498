//! Request bodies for the Firecracker control API.
//!
//! Machine sizing reuses `firepilot_models`; the other bodies are spelled
//! out here, including fields the generated models lack
//! (e.g. `metrics_flush_interval_ms`).

use serde::{Deserialize, Serialize};

pub use firepilot_models::models::MachineConfiguration;

/// Body for `PUT /metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Host path Firecracker appends metrics records to.
    pub metrics_path: String,
    /// How often Firecracker writes a record on its own.
    pub metrics_flush_interval_ms: u64,
}

/// Body for `PUT /boot-source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

/// Body for `PUT /drives/{drive_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image on host
    pub path_on_host: String,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

/// Body for `PUT /network-interfaces/{iface_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Network interface ID
    pub iface_id: String,
    /// Host device name (tap device)
    pub host_dev_name: String,
    /// Guest MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// Body for `PUT /mmds/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsConfig {
    /// Interfaces the metadata service answers on.
    pub network_interfaces: Vec<String>,
    /// Protocol version, `V1` or `V2`.
    pub version: String,
}

/// Instance action kinds understood by `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    InstanceStart,
    FlushMetrics,
}

/// Body for `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAction {
    pub action_type: ActionType,
}

/// Machine sizing body with SMT disabled.
pub fn machine_configuration(vcpu_count: u32, mem_size_mib: u32) -> MachineConfiguration {
    let mut config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
    config.smt = Some(false);
    config
}
