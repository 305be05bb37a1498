//! Firecracker process supervision.

use crate::error::{Result, VmError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Interval between liveness checks while waiting for a graceful exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running hypervisor process whose stdout and stderr go to a log file.
///
/// The process is killed if the handle is dropped without calling
/// [`stop`](Self::stop).
#[derive(Debug)]
pub struct Hypervisor {
    binary: PathBuf,
    pid: Option<u32>,
    child: Option<Child>,
}

impl Hypervisor {
    /// Start `binary --api-sock <api_socket>`, sending both output streams to `log_path`.
    ///
    /// The log file is created (or truncated) first.
    ///
    /// # Errors
    /// Returns an error if the log file cannot be created or the binary fails to spawn.
    pub fn spawn(binary: &Path, api_socket: &Path, log_path: &Path) -> Result<Self> {
        let stdout = File::create(log_path)?;
        let stderr = stdout.try_clone()?;

        let child = Command::new(binary)
            .arg("--api-sock")
            .arg(api_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VmError::Spawn {
                binary: binary.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(
            binary = %binary.display(),
            pid = ?pid,
            socket = %api_socket.display(),
            log = %log_path.display(),
            "Hypervisor process started"
        );

        Ok(Self {
            binary: binary.to_path_buf(),
            pid,
            child: Some(child),
        })
    }

    /// OS process id, if the process was started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Path of the binary this process runs.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Whether the process is still alive. Reaps it if it has exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// The process is always reaped before this returns. Calling `stop` on an
    /// already stopped process is a no-op that returns `Ok(None)`.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        if let Some(status) = child.try_wait()? {
            tracing::debug!(pid = ?self.pid, %status, "Hypervisor already exited");
            return Ok(Some(status));
        }

        if let Some(pid) = self.pid {
            tracing::debug!(pid, grace_ms = grace.as_millis() as u64, "Sending SIGTERM to hypervisor");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM not delivered");
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait()? {
                tracing::info!(pid = ?self.pid, %status, "Hypervisor exited");
                return Ok(Some(status));
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        tracing::warn!(pid = ?self.pid, "Hypervisor ignored SIGTERM, killing");
        child
            .kill()
            .await
            .map_err(|e| VmError::Stop(format!("kill failed: {e}")))?;
        let status = child.wait().await?;
        Ok(Some(status))
    }
}
