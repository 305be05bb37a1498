//! Bounded polling shared by every waiter in a run.
//!
//! A run has exactly one [`Deadline`]. Every wait loop checks it on each
//! iteration, so once it expires (or the caller cancels) all waiters unblock
//! with [`VmError::Cancelled`]. A waiter may additionally carry its own,
//! shorter limit which produces [`VmError::Timeout`] instead.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval between probe attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout for a single connection attempt against the API socket.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(200);

/// Point in time after which a run must stop waiting, plus a caller-side cancel switch.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    /// Deadline `timeout` from now, cancellable only by expiry.
    pub fn after(timeout: Duration) -> Self {
        Self::with_cancel(timeout, CancellationToken::new())
    }

    /// Deadline `timeout` from now that also fires when `cancel` is triggered.
    pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            at: Instant::now() + timeout,
            cancel,
        }
    }

    /// The instant this deadline expires.
    pub fn at(&self) -> Instant {
        self.at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed or the run was cancelled.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.at
    }

    /// Return an error if the deadline has passed or the run was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_done() {
            return Err(self.expiry_error());
        }
        Ok(())
    }

    /// Resolve once the deadline passes or the run is cancelled.
    pub async fn expired(&self) -> VmError {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.at) => {}
        }
        self.expiry_error()
    }

    /// Sleep for `period`, waking early if the deadline fires first.
    pub async fn sleep(&self, period: Duration) -> Result<()> {
        let wake = (Instant::now() + period).min(self.at);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(wake) => {}
        }
        self.check()
    }

    fn expiry_error(&self) -> VmError {
        if self.cancel.is_cancelled() {
            VmError::Cancelled("run cancelled".into())
        } else {
            VmError::Cancelled("run deadline exceeded".into())
        }
    }
}

/// One observation step of a polling loop.
#[async_trait]
pub trait Probe: Send {
    /// Value produced once the awaited condition holds.
    type Output: Send;

    /// Check the condition once. `None` means "not yet".
    async fn probe(&mut self) -> Option<Self::Output>;
}

/// Bounded polling loop parameterized by a probe, an interval and a deadline.
#[derive(Debug, Clone)]
pub struct Waiter {
    deadline: Deadline,
    interval: Duration,
    limit: Option<Duration>,
    what: String,
}

impl Waiter {
    /// Create a waiter bounded only by the run deadline.
    pub fn new(deadline: &Deadline, what: impl Into<String>) -> Self {
        Self {
            deadline: deadline.clone(),
            interval: POLL_INTERVAL,
            limit: None,
            what: what.into(),
        }
    }

    /// Set the sleep between probe attempts.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up with [`VmError::Timeout`] after `limit`, even if the run deadline is further out.
    pub fn limit(mut self, limit: Duration) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Poll `probe` until it yields a value, the limit elapses or the deadline fires.
    pub async fn until<P: Probe>(self, probe: &mut P) -> Result<P::Output> {
        let started = Instant::now();
        let limit_at = self.limit.map(|limit| started + limit);
        let mut attempts = 0u32;

        loop {
            self.deadline.check()?;
            attempts += 1;

            if let Some(value) = probe.probe().await {
                tracing::trace!(
                    what = %self.what,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Wait satisfied"
                );
                return Ok(value);
            }

            let mut pause = self.interval;
            if let Some(limit_at) = limit_at {
                let now = Instant::now();
                if now >= limit_at {
                    return Err(VmError::Timeout {
                        what: self.what,
                        elapsed: started.elapsed(),
                    });
                }
                pause = pause.min(limit_at - now);
            }
            self.deadline.sleep(pause).await?;
        }
    }
}

/// Succeeds once the socket file exists and accepts a connection.
#[derive(Debug)]
pub struct SocketReady {
    path: PathBuf,
}

impl SocketReady {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Probe for SocketReady {
    type Output = ();

    async fn probe(&mut self) -> Option<()> {
        tokio::fs::metadata(&self.path).await.ok()?;
        match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, UnixStream::connect(&self.path)).await
        {
            Ok(Ok(_stream)) => Some(()),
            Ok(Err(e)) => {
                tracing::trace!(path = %self.path.display(), error = %e, "Socket not accepting yet");
                None
            }
            Err(_) => None,
        }
    }
}

/// Succeeds once a file grows or its modification time moves past the first observation.
#[derive(Debug)]
pub struct FileAdvanced {
    path: PathBuf,
    baseline: Option<(u64, SystemTime)>,
}

impl FileAdvanced {
    /// Probe whose baseline is taken on its first poll.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            baseline: None,
        }
    }

    /// Probe whose baseline is the file as it is right now.
    ///
    /// Use this when the write being waited for may land before polling starts.
    pub async fn observe(path: impl Into<PathBuf>) -> Self {
        let mut probe = Self::new(path);
        probe.baseline = probe.stat().await;
        probe
    }

    /// Poll until the file moves past the baseline, for at most `limit`.
    pub async fn wait(mut self, deadline: &Deadline, limit: Duration) -> Result<()> {
        tracing::debug!(path = %self.path.display(), limit_ms = limit.as_millis() as u64, "Waiting for file to advance");
        Waiter::new(deadline, format!("waiting for {} to advance", self.path.display()))
            .limit(limit)
            .until(&mut self)
            .await
    }

    async fn stat(&self) -> Option<(u64, SystemTime)> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        Some((meta.len(), meta.modified().ok()?))
    }
}

#[async_trait]
impl Probe for FileAdvanced {
    type Output = ();

    async fn probe(&mut self) -> Option<()> {
        let (size, modified) = self.stat().await?;

        match self.baseline {
            None => {
                self.baseline = Some((size, modified));
                None
            }
            Some((size0, modified0)) if size > size0 || modified > modified0 => Some(()),
            Some(_) => None,
        }
    }
}

/// Wait until the API socket at `path` accepts connections, for at most `limit`.
pub async fn wait_for_socket(deadline: &Deadline, path: &Path, limit: Duration) -> Result<()> {
    tracing::debug!(path = %path.display(), limit_ms = limit.as_millis() as u64, "Waiting for API socket");
    Waiter::new(deadline, format!("waiting for unix socket {}", path.display()))
        .limit(limit)
        .until(&mut SocketReady::new(path))
        .await
}

/// Wait until the file at `path` advances in size or modification time, for at most `limit`.
pub async fn wait_for_file_advance(deadline: &Deadline, path: &Path, limit: Duration) -> Result<()> {
    FileAdvanced::new(path).wait(deadline, limit).await
}
