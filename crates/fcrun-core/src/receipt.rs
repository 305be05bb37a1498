//! The structured record returned for every run that reached `Started`.

use crate::config::RunConfig;
use crate::metrics::MetricsAggregate;
use crate::tail::GuestDone;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Exit code for a guest that did not report completion in time.
pub const EXIT_CODE_INCOMPLETE: i32 = 124;

/// Wait error recorded when the guest stopped without a completion line.
pub const MARKER_NOT_OBSERVED: &str = "guest completion marker not observed";

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    /// 0 on completion, [`EXIT_CODE_INCOMPLETE`] otherwise.
    pub exit_code: i32,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    pub firecracker_bin: PathBuf,
    pub vcpus: u32,
    pub mem_mib: u32,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub metrics_lines: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_files_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_bytes_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_raw: Option<String>,
    /// Console log of the run. Only readable afterwards if the run directory was kept.
    pub firecracker_log_path: PathBuf,
}

impl Receipt {
    /// Whether the guest reported completion.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything a run observed, gathered before the receipt is built.
#[derive(Debug)]
pub(crate) struct RunRecord<'a> {
    pub run_id: &'a str,
    pub config: &'a RunConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub log_path: &'a Path,
    pub completion: Result<GuestDone, String>,
    pub metrics: MetricsAggregate,
    pub metrics_raw: String,
}

impl RunRecord<'_> {
    pub(crate) fn into_receipt(self) -> Receipt {
        let (exit_code, done, wait_err) = match self.completion {
            Ok(done) if done.seen_marker => (0, Some(done), None),
            Ok(_) => (EXIT_CODE_INCOMPLETE, None, Some(MARKER_NOT_OBSERVED.to_string())),
            Err(e) => (EXIT_CODE_INCOMPLETE, None, Some(e)),
        };

        Receipt {
            run_id: self.run_id.to_string(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: (self.ended_at - self.started_at).num_milliseconds(),
            exit_code,
            kernel: self.config.kernel_image.clone(),
            rootfs: self.config.rootfs.clone(),
            firecracker_bin: self.config.firecracker_bin.clone(),
            vcpus: self.config.vcpus,
            mem_mib: self.config.mem_mib,
            net_rx_bytes: self.metrics.net_rx_bytes,
            net_tx_bytes: self.metrics.net_tx_bytes,
            block_read_bytes: self.metrics.block_read_bytes,
            block_write_bytes: self.metrics.block_write_bytes,
            metrics_lines: self.metrics.lines,
            workspace_files_delta: done.map(|d| d.files_delta),
            workspace_bytes_delta: done.map(|d| d.bytes_delta),
            wait_err,
            metrics_raw: self.config.include_raw_metrics.then_some(self.metrics_raw),
            firecracker_log_path: self.log_path.to_path_buf(),
        }
    }
}
