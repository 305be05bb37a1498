//! # fcrun-core
//!
//! Run-once orchestration of Firecracker microVMs.
//!
//! A [`Runner`] takes a [`RunConfig`], boots a fresh microVM on a private
//! copy of the rootfs, watches the guest console for a completion line,
//! collects device metrics and returns a [`Receipt`]. Every host resource
//! the run acquires (run directory, hypervisor process, tap device) is
//! released before `run` returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    fcrun-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │     Runner      │────▶│  CleanupStack            │    │
//! │  │   - run()       │     │  (dir, process, tap)     │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │     │          │                                         │
//! │     │          ▼                                         │
//! │     │   ┌─────────────────┐    ┌─────────────────────┐   │
//! │     │   │  ApiClient      │───▶│ Firecracker API     │   │
//! │     │   │  (fcrun-vm)     │    │ (unix socket)       │   │
//! │     │   └─────────────────┘    └─────────────────────┘   │
//! │     ▼                                                    │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  LogFollower    │◀────│  firecracker.log         │    │
//! │  │  parse_metrics  │◀────│  metrics.log             │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use fcrun_core::{RunConfig, Runner};
//!
//! # async fn example() -> fcrun_core::Result<()> {
//! let config = RunConfig::builder()
//!     .firecracker("/usr/local/bin/firecracker")
//!     .kernel("/path/to/vmlinux")
//!     .rootfs("/path/to/rootfs.ext4")
//!     .marker_prefix("RESULT:")
//!     .timeout_secs(60)
//!     .build()?;
//!
//! let receipt = Runner::new().run(config).await?;
//! println!("exit code {}", receipt.exit_code);
//! # Ok(())
//! # }
//! ```

mod cleanup;
mod config;
mod error;
mod metrics;
mod receipt;
mod rundir;
mod runner;
mod tail;

pub use cleanup::CLEANUP_GRACE;
pub use config::{
    MmdsConfig, NetworkConfig, RunConfig, RunConfigBuilder, BOOT_ARGS, DEFAULT_GUEST_MAC,
    DEFAULT_IFACE_ID, DEFAULT_MARKER_KEY, DEFAULT_MEM_MIB, DEFAULT_MMDS_VERSION,
    DEFAULT_TIMEOUT_SECS, DEFAULT_VCPUS,
};
pub use error::{CoreError, Result};
pub use metrics::{parse_metrics, MetricsAggregate};
pub use receipt::{Receipt, EXIT_CODE_INCOMPLETE, MARKER_NOT_OBSERVED};
pub use rundir::{RunDir, RunId};
pub use runner::{
    RunState, Runner, FLUSH_TIMEOUT, METRICS_ADVANCE_TIMEOUT, SOCKET_TIMEOUT, STOP_GRACE,
};
pub use tail::{
    await_completion, CompletionMatcher, GuestDone, LogFollower, BYTES_DELTA_FIELD,
    FILES_DELTA_FIELD, SHUTDOWN_PHRASES,
};
