//! Per-run working directory.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for a run, rendered as `run-<hex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0.simple())
    }
}

/// Directory holding one run's socket, logs and rootfs copy.
///
/// Removal is owned by the run's cleanup stack, not by this type.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create `<root>/<id>` with an empty metrics file.
    ///
    /// Firecracker opens the metrics path without creating it.
    pub async fn create(root: &Path, id: RunId) -> io::Result<Self> {
        let path = root.join(id.to_string());
        tokio::fs::create_dir_all(&path).await?;
        let dir = Self { path };
        tokio::fs::File::create(dir.metrics_path()).await?;
        tracing::debug!(path = %dir.path.display(), "Run directory created");
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Firecracker API socket.
    pub fn api_socket(&self) -> PathBuf {
        self.path.join("fc.sock")
    }

    /// Hypervisor stdout/stderr, including the guest console.
    pub fn log_path(&self) -> PathBuf {
        self.path.join("firecracker.log")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.path.join("metrics.log")
    }

    /// Writable copy of the rootfs the guest boots from.
    pub fn rootfs_path(&self) -> PathBuf {
        self.path.join("rootfs.ext4")
    }

    /// Copy `source` into the run directory, keeping its permissions, and sync it to disk.
    pub async fn copy_rootfs(&self, source: &Path) -> io::Result<PathBuf> {
        let target = self.rootfs_path();
        let started = std::time::Instant::now();
        let bytes = tokio::fs::copy(source, &target).await?;

        let file = tokio::fs::File::open(&target).await?;
        file.sync_all().await?;

        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rootfs copied"
        );
        Ok(target)
    }
}
