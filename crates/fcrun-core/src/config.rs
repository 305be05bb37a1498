//! Run configuration types.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of vCPUs.
pub const DEFAULT_VCPUS: u32 = 2;

/// Default guest memory in MiB.
pub const DEFAULT_MEM_MIB: u32 = 2048;

/// Default total run timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default JSON key a structured completion line must contain.
pub const DEFAULT_MARKER_KEY: &str = "workspace_files_delta";

/// Default guest network interface id.
pub const DEFAULT_IFACE_ID: &str = "eth0";

/// Default guest MAC address.
pub const DEFAULT_GUEST_MAC: &str = "02:FC:00:00:00:01";

/// Default MMDS protocol version.
pub const DEFAULT_MMDS_VERSION: &str = "V2";

/// Kernel command line for every run.
pub const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off systemd.unit=fc-task.service";

/// Configuration for a single microVM run.
///
/// Zero numbers and empty strings mean "use the default"; defaults are
/// filled in once by [`RunConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Path to the Firecracker binary (required).
    pub firecracker_bin: PathBuf,
    /// Path to the guest kernel image (required).
    pub kernel_image: PathBuf,
    /// Path to the guest rootfs image (required). Never modified; each run boots a copy.
    pub rootfs: PathBuf,
    /// vCPU count (default: 2).
    pub vcpus: u32,
    /// Memory in MiB (default: 2048).
    pub mem_mib: u32,
    /// Hard limit for the whole run in seconds (default: 120).
    pub timeout_secs: u64,
    /// Prefix a structured completion line must start with.
    pub marker_prefix: Option<String>,
    /// Key a structured completion line must contain (default: `workspace_files_delta`).
    pub marker_json_key: String,
    /// Keep the run directory after the run for debugging.
    pub keep_run_dir: bool,
    /// Copy the raw metrics text into the receipt.
    pub include_raw_metrics: bool,
    /// Guest networking.
    pub network: NetworkConfig,
    /// Guest metadata service.
    pub mmds: MmdsConfig,
}

/// Tap-backed guest network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Create a tap device and attach it to the guest.
    pub enabled: bool,
    /// Guest interface id (default: `eth0`).
    pub iface_id: String,
    /// Host tap device name (default: `tap` + random suffix).
    pub tap_name: String,
    /// Guest MAC address (default: `02:FC:00:00:00:01`).
    pub guest_mac: String,
}

/// Guest metadata service (MMDS).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmdsConfig {
    /// Configure MMDS on the guest interface.
    pub enabled: bool,
    /// Protocol version (default: `V2`).
    pub version: String,
    /// Document served to the guest, forwarded verbatim.
    pub data: Option<serde_json::Value>,
}

impl RunConfig {
    /// Create a new config builder.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Check required fields and return the configuration with defaults applied.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] if the Firecracker binary, kernel
    /// or rootfs path is missing.
    pub fn validate(mut self) -> Result<Self, CoreError> {
        let mut missing = Vec::new();
        if self.firecracker_bin.as_os_str().is_empty() {
            missing.push("firecracker_bin");
        }
        if self.kernel_image.as_os_str().is_empty() {
            missing.push("kernel_image");
        }
        if self.rootfs.as_os_str().is_empty() {
            missing.push("rootfs");
        }
        if !missing.is_empty() {
            return Err(CoreError::Validation(format!(
                "missing required config: {}",
                missing.join(", ")
            )));
        }

        if self.vcpus == 0 {
            self.vcpus = DEFAULT_VCPUS;
        }
        if self.mem_mib == 0 {
            self.mem_mib = DEFAULT_MEM_MIB;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
        if self.marker_json_key.is_empty() {
            self.marker_json_key = DEFAULT_MARKER_KEY.to_string();
        }
        self.marker_prefix = self.marker_prefix.filter(|p| !p.is_empty());

        if self.network.enabled {
            if self.network.iface_id.is_empty() {
                self.network.iface_id = DEFAULT_IFACE_ID.to_string();
            }
            if self.network.tap_name.is_empty() {
                self.network.tap_name = fcrun_vm::generate_tap_name();
            }
            if self.network.guest_mac.is_empty() {
                self.network.guest_mac = DEFAULT_GUEST_MAC.to_string();
            }
        }
        if self.mmds.enabled && self.mmds.version.is_empty() {
            self.mmds.version = DEFAULT_MMDS_VERSION.to_string();
        }

        Ok(self)
    }

    /// Total run timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Interface id MMDS binds to.
    pub fn mmds_iface_id(&self) -> &str {
        if self.network.iface_id.is_empty() {
            DEFAULT_IFACE_ID
        } else {
            &self.network.iface_id
        }
    }
}

/// Builder for RunConfig.
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Set the Firecracker binary path.
    pub fn firecracker(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firecracker_bin = path.into();
        self
    }

    /// Set the kernel path.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_image = path.into();
        self
    }

    /// Set the rootfs path.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.rootfs = path.into();
        self
    }

    /// Set vCPU count.
    pub fn vcpus(mut self, count: u32) -> Self {
        self.config.vcpus = count;
        self
    }

    /// Set memory in MiB.
    pub fn mem_mib(mut self, mib: u32) -> Self {
        self.config.mem_mib = mib;
        self
    }

    /// Set the total run timeout in seconds.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    /// Require structured completion lines to start with `prefix`.
    pub fn marker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.marker_prefix = Some(prefix.into());
        self
    }

    /// Require structured completion lines to contain `key`.
    pub fn marker_json_key(mut self, key: impl Into<String>) -> Self {
        self.config.marker_json_key = key.into();
        self
    }

    /// Keep the run directory after the run.
    pub fn keep_run_dir(mut self, keep: bool) -> Self {
        self.config.keep_run_dir = keep;
        self
    }

    /// Include raw metrics text in the receipt.
    pub fn include_raw_metrics(mut self, include: bool) -> Self {
        self.config.include_raw_metrics = include;
        self
    }

    /// Attach a tap device with default interface id, name and MAC.
    pub fn with_tap(mut self) -> Self {
        self.config.network.enabled = true;
        self
    }

    /// Attach a tap device with full options.
    pub fn with_network_config(mut self, network: NetworkConfig) -> Self {
        self.config.network = network;
        self
    }

    /// Enable MMDS and serve `data` to the guest.
    pub fn with_mmds(mut self, data: serde_json::Value) -> Self {
        self.config.mmds.enabled = true;
        self.config.mmds.data = Some(data);
        self
    }

    /// Set the MMDS protocol version.
    pub fn mmds_version(mut self, version: impl Into<String>) -> Self {
        self.config.mmds.version = version.into();
        self
    }

    /// Build the configuration, validating required fields and applying defaults.
    pub fn build(self) -> Result<RunConfig, CoreError> {
        self.config.validate()
    }
}
