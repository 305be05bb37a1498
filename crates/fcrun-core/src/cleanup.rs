//! Release actions for everything a run acquires.
//!
//! Each resource is pushed right after it is acquired. [`CleanupStack::release_all`]
//! pops them in reverse order; whatever is still on the stack when it is
//! dropped (e.g. the run future was aborted) is released synchronously on a
//! best-effort basis.

use fcrun_vm::{HostNetwork, Hypervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Grace period between SIGTERM and SIGKILL during cleanup.
pub const CLEANUP_GRACE: Duration = Duration::from_millis(500);

/// One acquired resource and how to give it back.
pub(crate) enum Release {
    /// Remove the run directory, unless it is being kept for debugging.
    RunDir { path: PathBuf, keep: bool },
    /// Stop and reap the hypervisor.
    Process(Hypervisor),
    /// Delete a host tap device.
    Tap {
        name: String,
        network: Arc<dyn HostNetwork>,
    },
}

impl Release {
    fn describe(&self) -> &'static str {
        match self {
            Release::RunDir { .. } => "run directory",
            Release::Process(_) => "hypervisor process",
            Release::Tap { .. } => "tap device",
        }
    }

    async fn run(self) {
        match self {
            Release::RunDir { path, keep: true } => {
                tracing::info!(path = %path.display(), "Keeping run directory");
            }
            Release::RunDir { path, keep: false } => {
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove run directory");
                }
            }
            Release::Process(mut vm) => {
                if let Err(e) = vm.stop(CLEANUP_GRACE).await {
                    tracing::warn!(pid = ?vm.pid(), error = %e, "Failed to stop hypervisor");
                }
            }
            Release::Tap { name, network } => network.delete_tap(&name).await,
        }
    }

    /// Synchronous fallback used from `Drop`.
    fn run_blocking(self) {
        match self {
            Release::RunDir { keep: true, .. } => {}
            Release::RunDir { path, keep: false } => {
                let _ = std::fs::remove_dir_all(path);
            }
            // kill_on_drop sends SIGKILL and tokio reaps in the background.
            Release::Process(vm) => drop(vm),
            Release::Tap { name, network } => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { network.delete_tap(&name).await });
                }
                Err(_) => tracing::warn!(device = %name, "No runtime to remove tap device"),
            },
        }
    }
}

/// Stack of release actions for a single run.
#[derive(Default)]
pub(crate) struct CleanupStack {
    actions: Vec<Release>,
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, release: Release) {
        tracing::trace!(resource = release.describe(), "Registered cleanup");
        self.actions.push(release);
    }

    /// The registered hypervisor, for stopping it before the run finishes.
    pub(crate) fn process_mut(&mut self) -> Option<&mut Hypervisor> {
        self.actions.iter_mut().find_map(|action| match action {
            Release::Process(vm) => Some(vm),
            _ => None,
        })
    }

    /// Run every registered action, most recent first.
    pub(crate) async fn release_all(&mut self) {
        while let Some(action) = self.actions.pop() {
            tracing::debug!(resource = action.describe(), "Releasing");
            action.run().await;
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        tracing::warn!(pending = self.actions.len(), "Run dropped before cleanup, releasing");
        while let Some(action) = self.actions.pop() {
            action.run_blocking();
        }
    }
}
