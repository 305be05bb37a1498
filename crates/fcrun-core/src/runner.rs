//! Drives one microVM from boot to receipt.
//!
//! ```text
//! Init → DirectoryReady → ProcessStarted → SocketReady → Configured
//!      → (NetworkAttached) → Started → Completed | TimedOut → Stopped → Finalized
//! ```
//!
//! A failure before `Started` returns [`CoreError::Setup`]. From `Started`
//! on, the run always produces a [`Receipt`]; a guest that never reports
//! completion is recorded in it rather than returned as an error.

use crate::cleanup::{CleanupStack, Release};
use crate::config::{RunConfig, BOOT_ARGS};
use crate::error::{CoreError, Result};
use crate::metrics::parse_metrics;
use crate::receipt::{Receipt, RunRecord};
use crate::rundir::{RunDir, RunId};
use crate::tail::{CompletionMatcher, LogFollower};
use chrono::Utc;
use fcrun_vm::{
    wait_for_socket, ApiClient, Deadline, Drive, FileAdvanced, HostNetwork, Hypervisor,
    IpRouteNetwork, MmdsConfig, NetworkInterface, VmError,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How long the API socket may take to accept connections after spawn.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for the hypervisor to exit after the guest finished.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Budget for the final `FlushMetrics` request.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the flushed record to reach the metrics file.
pub const METRICS_ADVANCE_TIMEOUT: Duration = Duration::from_secs(2);

const ROOT_DRIVE_ID: &str = "rootfs";

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    DirectoryReady,
    ProcessStarted,
    SocketReady,
    Configured,
    NetworkAttached,
    Started,
    Completed,
    TimedOut,
    Stopped,
    Finalized,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::DirectoryReady => "directory_ready",
            Self::ProcessStarted => "process_started",
            Self::SocketReady => "socket_ready",
            Self::Configured => "configured",
            Self::NetworkAttached => "network_attached",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Stopped => "stopped",
            Self::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Runs microVMs, one per call.
///
/// A `Runner` holds no per-run state and can be shared across concurrent runs.
pub struct Runner {
    run_root: PathBuf,
    network: Arc<dyn HostNetwork>,
    socket_timeout: Duration,
}

impl Default for Runner {
    fn default() -> Self {
        Self {
            run_root: std::env::temp_dir(),
            network: Arc::new(IpRouteNetwork::new()),
            socket_timeout: SOCKET_TIMEOUT,
        }
    }
}

impl Runner {
    /// Runner placing run directories under the system temp directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place run directories under `root` instead.
    pub fn with_run_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.run_root = root.into();
        self
    }

    /// Use a different host network implementation for tap devices.
    pub fn with_network(mut self, network: Arc<dyn HostNetwork>) -> Self {
        self.network = network;
        self
    }

    /// Override how long to wait for the API socket.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Boot, wait for the guest to finish, and return the receipt.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for an incomplete configuration and
    /// [`CoreError::Setup`] if anything before the guest start fails. In both
    /// cases nothing is left behind on the host.
    pub async fn run(&self, config: RunConfig) -> Result<Receipt> {
        self.run_with_cancel(config, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but `cancel` ends the run early as if its deadline had passed.
    pub async fn run_with_cancel(
        &self,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Result<Receipt> {
        let config = config.validate()?;
        let mut run = Run::new(self, config, cancel);
        tracing::info!(
            run_id = %run.id,
            vcpus = run.config.vcpus,
            mem_mib = run.config.mem_mib,
            timeout_secs = run.config.timeout_secs,
            "Starting run"
        );

        let result = run.execute().await;
        run.cleanup.release_all().await;

        match &result {
            Ok(receipt) => tracing::info!(
                run_id = %run.id,
                exit_code = receipt.exit_code,
                duration_ms = receipt.duration_ms,
                "Run finished"
            ),
            Err(e) => tracing::error!(run_id = %run.id, error = %e, "Run failed"),
        }
        result
    }
}

/// State of a single run in progress.
struct Run<'a> {
    runner: &'a Runner,
    config: RunConfig,
    id: RunId,
    deadline: Deadline,
    state: RunState,
    cleanup: CleanupStack,
    started: Instant,
}

impl<'a> Run<'a> {
    fn new(runner: &'a Runner, config: RunConfig, cancel: CancellationToken) -> Self {
        Self {
            runner,
            deadline: Deadline::with_cancel(config.timeout(), cancel),
            config,
            id: RunId::new(),
            state: RunState::Init,
            cleanup: CleanupStack::new(),
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RunState) {
        tracing::info!(
            run_id = %self.id,
            from = %self.state,
            to = %next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Run state changed"
        );
        self.state = next;
    }

    fn fail(&self, source: impl Into<VmError>) -> CoreError {
        CoreError::Setup {
            state: self.state,
            source: source.into(),
        }
    }

    async fn execute(&mut self) -> Result<Receipt> {
        let dir = RunDir::create(&self.runner.run_root, self.id)
            .await
            .map_err(|e| self.fail(e))?;
        self.cleanup.push(Release::RunDir {
            path: dir.path().to_path_buf(),
            keep: self.config.keep_run_dir,
        });
        self.advance(RunState::DirectoryReady);

        let rootfs = dir
            .copy_rootfs(&self.config.rootfs)
            .await
            .map_err(|e| self.fail(e))?;
        let socket = dir.api_socket();
        let log_path = dir.log_path();
        let vm = Hypervisor::spawn(&self.config.firecracker_bin, &socket, &log_path)
            .map_err(|e| self.fail(e))?;
        self.cleanup.push(Release::Process(vm));
        self.advance(RunState::ProcessStarted);

        wait_for_socket(&self.deadline, &socket, self.runner.socket_timeout)
            .await
            .map_err(|e| self.fail(e))?;
        self.advance(RunState::SocketReady);

        let api = ApiClient::new(&socket, &self.deadline);
        self.configure(&api, &dir, &rootfs)
            .await
            .map_err(|e| self.fail(e))?;
        self.advance(RunState::Configured);

        if self.config.network.enabled {
            self.attach_network(&api).await.map_err(|e| self.fail(e))?;
            self.advance(RunState::NetworkAttached);
        }
        if self.config.mmds.enabled {
            self.configure_mmds(&api).await.map_err(|e| self.fail(e))?;
        }

        // Follow from the current end before booting so no early line is missed.
        let matcher = CompletionMatcher::new(
            self.config.marker_prefix.as_deref(),
            Some(self.config.marker_json_key.as_str()),
        );
        let follower = LogFollower::open(&log_path, matcher)
            .await
            .map_err(|e| self.fail(e))?;

        let started_at = Utc::now();
        api.start_instance().await.map_err(|e| self.fail(e))?;
        self.advance(RunState::Started);

        let completion = match follower.wait(&self.deadline).await {
            Ok(done) => {
                self.advance(RunState::Completed);
                flush_metrics(&socket, &dir.metrics_path()).await;
                Ok(done)
            }
            Err(e) => {
                tracing::warn!(run_id = %self.id, error = %e, "Guest did not report completion");
                self.advance(RunState::TimedOut);
                Err(e.to_string())
            }
        };

        if let Some(vm) = self.cleanup.process_mut() {
            if let Err(e) = vm.stop(STOP_GRACE).await {
                tracing::warn!(run_id = %self.id, error = %e, "Failed to stop hypervisor");
            }
        }
        let ended_at = Utc::now();
        self.advance(RunState::Stopped);

        let metrics_raw = match tokio::fs::read_to_string(dir.metrics_path()).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(run_id = %self.id, error = %e, "Failed to read metrics");
                String::new()
            }
        };
        let metrics = parse_metrics(&metrics_raw);
        tracing::debug!(run_id = %self.id, ?metrics, "Metrics aggregated");

        let run_id = self.id.to_string();
        let receipt = RunRecord {
            run_id: &run_id,
            config: &self.config,
            started_at,
            ended_at,
            log_path: &log_path,
            completion,
            metrics,
            metrics_raw,
        }
        .into_receipt();
        self.advance(RunState::Finalized);
        Ok(receipt)
    }

    /// Pre-boot configuration common to every run.
    async fn configure(&self, api: &ApiClient, dir: &RunDir, rootfs: &Path) -> fcrun_vm::Result<()> {
        api.configure_metrics(&dir.metrics_path()).await?;
        api.configure_machine(self.config.vcpus, self.config.mem_mib)
            .await?;
        api.configure_boot_source(&self.config.kernel_image, BOOT_ARGS)
            .await?;
        api.attach_drive(&Drive {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: rootfs.to_string_lossy().to_string(),
            is_root_device: true,
            is_read_only: false,
        })
        .await
    }

    async fn attach_network(&mut self, api: &ApiClient) -> fcrun_vm::Result<()> {
        let network = &self.config.network;
        let host = Arc::clone(&self.runner.network);
        host.create_tap(&network.tap_name).await?;
        self.cleanup.push(Release::Tap {
            name: network.tap_name.clone(),
            network: host,
        });

        api.attach_network_interface(&NetworkInterface {
            iface_id: network.iface_id.clone(),
            host_dev_name: network.tap_name.clone(),
            guest_mac: Some(network.guest_mac.clone()),
        })
        .await
    }

    async fn configure_mmds(&self, api: &ApiClient) -> fcrun_vm::Result<()> {
        api.configure_mmds(&MmdsConfig {
            network_interfaces: vec![self.config.mmds_iface_id().to_string()],
            version: self.config.mmds.version.clone(),
        })
        .await?;
        if let Some(data) = &self.config.mmds.data {
            api.put_mmds_data(data).await?;
        }
        Ok(())
    }
}

/// Ask for a final metrics record and give it a moment to land. Failures are logged only.
///
/// Firecracker writes the record before answering the request, so the file
/// is observed before the flush is sent.
async fn flush_metrics(socket: &Path, metrics_path: &Path) {
    let deadline = Deadline::after(FLUSH_TIMEOUT + METRICS_ADVANCE_TIMEOUT);
    let progress = FileAdvanced::observe(metrics_path).await;
    let api = ApiClient::new(socket, &deadline).with_request_timeout(FLUSH_TIMEOUT);
    if let Err(e) = api.flush_metrics().await {
        tracing::warn!(error = %e, "Metrics flush failed");
    }
    if let Err(e) = progress.wait(&deadline, METRICS_ADVANCE_TIMEOUT).await {
        tracing::debug!(error = %e, "Metrics file did not advance");
    }
}
