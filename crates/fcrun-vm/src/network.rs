//! Host-side tap devices for guest networking.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use uuid::Uuid;

/// Host network operations needed to give a guest a tap device.
///
/// The default implementation is [`IpRouteNetwork`]; tests and callers
/// without `CAP_NET_ADMIN` can plug in their own.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create tap device `name` and bring it up.
    ///
    /// If the device was created but could not be brought up, it is removed
    /// again before the error is returned.
    async fn create_tap(&self, name: &str) -> Result<()>;

    /// Remove tap device `name`. Errors are ignored; the device may already be gone.
    async fn delete_tap(&self, name: &str);
}

/// Generate a per-run tap name: `tap` followed by 10 random hex characters.
///
/// Fits within the kernel's 15 character interface name limit.
pub fn generate_tap_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("tap{}", &suffix[..10])
}

/// [`HostNetwork`] backed by iproute2's `ip` command.
#[derive(Debug, Clone)]
pub struct IpRouteNetwork {
    ip_cmd: PathBuf,
}

impl Default for IpRouteNetwork {
    fn default() -> Self {
        Self {
            ip_cmd: PathBuf::from("ip"),
        }
    }
}

impl IpRouteNetwork {
    /// Use `ip` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `ip` binary.
    pub fn with_command(ip_cmd: impl Into<PathBuf>) -> Self {
        Self {
            ip_cmd: ip_cmd.into(),
        }
    }

    async fn ip(&self, device: &str, args: &[&str]) -> Result<()> {
        tracing::trace!(cmd = %self.ip_cmd.display(), ?args, "Running ip");
        let output = Command::new(&self.ip_cmd)
            .args(args)
            .output()
            .await
            .map_err(|e| VmError::Network {
                device: device.to_string(),
                message: format!("failed to run {}: {e}", self.ip_cmd.display()),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(VmError::Network {
            device: device.to_string(),
            message: format!(
                "`ip {}` failed (code {:?}): {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            ),
        })
    }
}

#[async_trait]
impl HostNetwork for IpRouteNetwork {
    async fn create_tap(&self, name: &str) -> Result<()> {
        tracing::debug!(device = %name, "Creating tap device");
        self.ip(name, &["tuntap", "add", "dev", name, "mode", "tap"])
            .await?;

        if let Err(e) = self.ip(name, &["link", "set", "dev", name, "up"]).await {
            tracing::warn!(device = %name, error = %e, "Failed to bring tap up, removing it");
            self.delete_tap(name).await;
            return Err(e);
        }

        tracing::info!(device = %name, "Tap device up");
        Ok(())
    }

    async fn delete_tap(&self, name: &str) {
        match self.ip(name, &["link", "del", "dev", name]).await {
            Ok(()) => tracing::debug!(device = %name, "Tap device removed"),
            Err(e) => tracing::debug!(device = %name, error = %e, "Tap removal failed (ignored)"),
        }
    }
}
