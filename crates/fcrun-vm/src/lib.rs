//! # fcrun-vm
//!
//! Firecracker-facing layer for fcrun: everything that touches the
//! hypervisor process, its API socket, or the host network.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fcrun_vm::{wait_for_socket, ApiClient, Deadline, Hypervisor};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn example() -> fcrun_vm::Result<()> {
//! let deadline = Deadline::after(Duration::from_secs(30));
//! let sock = Path::new("/tmp/run-1/fc.sock");
//!
//! let mut vm = Hypervisor::spawn(
//!     Path::new("/usr/local/bin/firecracker"),
//!     sock,
//!     Path::new("/tmp/run-1/firecracker.log"),
//! )?;
//! wait_for_socket(&deadline, sock, Duration::from_secs(5)).await?;
//!
//! let api = ApiClient::new(sock, &deadline);
//! api.configure_machine(2, 2048).await?;
//! api.configure_boot_source(Path::new("/path/to/vmlinux"), "console=ttyS0").await?;
//! api.start_instance().await?;
//!
//! vm.stop(Duration::from_secs(2)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Control API**: typed `PUT` helpers over the API unix socket
//! - **Process Supervision**: spawn with log redirection, SIGTERM then SIGKILL
//! - **Bounded Waits**: one deadline shared by every polling loop in a run
//! - **Tap Devices**: create and remove host tap devices via iproute2

mod api;
mod error;
mod models;
mod network;
mod process;
mod wait;

pub use api::{ApiClient, MAX_ERROR_BODY, REQUEST_TIMEOUT};
pub use error::{Result, VmError};
pub use models::{
    machine_configuration, ActionType, BootSource, Drive, InstanceAction, MachineConfiguration,
    MetricsConfig, MmdsConfig, NetworkInterface,
};
pub use network::{generate_tap_name, HostNetwork, IpRouteNetwork};
pub use process::Hypervisor;
pub use wait::{
    wait_for_file_advance, wait_for_socket, Deadline, FileAdvanced, Probe, SocketReady, Waiter,
    POLL_INTERVAL,
};
