//! Client for the Firecracker control API.
//!
//! Every call is a single JSON `PUT` over the API unix socket. There are no
//! retries: callers wait for the socket with
//! [`wait_for_socket`](crate::wait::wait_for_socket) before the first call,
//! and the pre-boot endpoints must be called in order (metrics, machine
//! config, boot source, drives, network, MMDS, then `InstanceStart`).

use crate::error::{Result, VmError};
use crate::models::{
    machine_configuration, ActionType, BootSource, Drive, InstanceAction, MetricsConfig,
    MmdsConfig, NetworkInterface,
};
use crate::wait::Deadline;
use hyper::body::HttpBody;
use hyper::client::Client;
use hyper::{Body, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timeout for an individual API request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of response bytes kept in error messages.
pub const MAX_ERROR_BODY: usize = 4096;

/// How often Firecracker flushes metrics on its own.
const METRICS_FLUSH_INTERVAL_MS: u64 = 200;

/// Firecracker API client bound to one socket and one deadline.
pub struct ApiClient {
    socket_path: PathBuf,
    client: Client<UnixConnector, Body>,
    deadline: Deadline,
    request_timeout: Duration,
}

impl ApiClient {
    /// Create a client for the API socket at `socket_path`.
    ///
    /// Requests fail with [`VmError::Cancelled`] once `deadline` fires.
    pub fn new(socket_path: impl Into<PathBuf>, deadline: &Deadline) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
            deadline: deadline.clone(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Path to the Firecracker API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serialize `body` and `PUT` it to `path`.
    ///
    /// # Errors
    /// Returns [`VmError::Api`] with the status and the first
    /// [`MAX_ERROR_BODY`] bytes of the response on a non-2xx answer, and
    /// [`VmError::Transport`] if the socket exchange itself fails.
    pub async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let start = std::time::Instant::now();
        self.deadline.check()?;

        let body = serde_json::to_string(body)
            .map_err(|e| VmError::Config(format!("failed to serialize {path} body: {e}")))?;
        tracing::debug!(path, socket = %self.socket_path.display(), "Sending API request");
        tracing::trace!(path, body = %body, "API request body");

        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body))
            .map_err(|e| VmError::Config(format!("failed to build {path} request: {e}")))?;

        let send = tokio::time::timeout(self.request_timeout, self.client.request(request));
        let response = tokio::select! {
            outcome = send => match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::error!(path, error = %e, "API request failed");
                    return Err(VmError::Transport {
                        path: path.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(VmError::Transport {
                        path: path.to_string(),
                        message: format!("no response within {:?}", self.request_timeout),
                    });
                }
            },
            err = self.deadline.expired() => return Err(err),
        };

        let status = response.status();
        if !status.is_success() {
            let body = read_snippet(response.into_body(), MAX_ERROR_BODY).await;
            tracing::error!(path, status = %status, body = %body, "API request rejected");
            return Err(VmError::Api {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            path,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "API request succeeded"
        );
        Ok(())
    }

    /// `PUT /metrics`: point Firecracker at the metrics file.
    pub async fn configure_metrics(&self, metrics_path: &Path) -> Result<()> {
        self.put(
            "/metrics",
            &MetricsConfig {
                metrics_path: metrics_path.to_string_lossy().to_string(),
                metrics_flush_interval_ms: METRICS_FLUSH_INTERVAL_MS,
            },
        )
        .await
    }

    /// `PUT /machine-config`: vCPU count and memory, SMT disabled.
    pub async fn configure_machine(&self, vcpu_count: u32, mem_size_mib: u32) -> Result<()> {
        self.put(
            "/machine-config",
            &machine_configuration(vcpu_count, mem_size_mib),
        )
        .await
    }

    /// `PUT /boot-source`: kernel image and command line.
    pub async fn configure_boot_source(&self, kernel_path: &Path, boot_args: &str) -> Result<()> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_path.to_string_lossy().to_string(),
                boot_args: boot_args.to_string(),
            },
        )
        .await
    }

    /// `PUT /drives/{drive_id}`.
    pub async fn attach_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    /// `PUT /network-interfaces/{iface_id}`.
    pub async fn attach_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    /// `PUT /mmds/config`.
    pub async fn configure_mmds(&self, config: &MmdsConfig) -> Result<()> {
        self.put("/mmds/config", config).await
    }

    /// `PUT /mmds`: replace the metadata document with `data`, verbatim.
    pub async fn put_mmds_data(&self, data: &serde_json::Value) -> Result<()> {
        self.put("/mmds", data).await
    }

    /// `PUT /actions {InstanceStart}`: boot the guest.
    pub async fn start_instance(&self) -> Result<()> {
        self.action(ActionType::InstanceStart).await
    }

    /// `PUT /actions {FlushMetrics}`: ask Firecracker to write a metrics record now.
    pub async fn flush_metrics(&self) -> Result<()> {
        self.action(ActionType::FlushMetrics).await
    }

    async fn action(&self, action_type: ActionType) -> Result<()> {
        self.put("/actions", &InstanceAction { action_type }).await
    }
}

/// Read at most `max` bytes of a response body, lossily decoded.
async fn read_snippet(mut body: Body, max: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < max {
        match body.data().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(max - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Some(Err(e)) => {
                tracing::trace!(error = %e, "Error reading response body");
                break;
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
