//! Guest completion detection from the console log.
//!
//! The guest has no channel back to the host other than its serial console,
//! which Firecracker writes to the run's log file. Completion is either one
//! of the generic shutdown phrases or a structured marker line carrying the
//! workspace deltas as JSON:
//!
//! ```text
//! RESULT: {"workspace_files_delta":3,"workspace_bytes_delta":120}
//! ```

use async_trait::async_trait;
use fcrun_vm::{Deadline, Probe, Waiter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// Console phrases that mean the guest shut down on its own.
pub const SHUTDOWN_PHRASES: [&str; 2] = ["System halted", "Powering off."];

/// JSON field holding the change in workspace file count.
pub const FILES_DELTA_FIELD: &str = "workspace_files_delta";

/// JSON field holding the change in workspace size in bytes.
pub const BYTES_DELTA_FIELD: &str = "workspace_bytes_delta";

/// What the guest reported when it finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDone {
    /// A completion line was observed.
    pub seen_marker: bool,
    pub files_delta: i64,
    pub bytes_delta: i64,
}

/// Decides whether a single console line signals completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionMatcher {
    prefix: Option<String>,
    key: Option<String>,
}

impl CompletionMatcher {
    /// Matcher for marker lines starting with `prefix` and containing `key`.
    ///
    /// Without a prefix a marker line must start with `{`. Empty strings are
    /// treated as absent.
    pub fn new(prefix: Option<&str>, key: Option<&str>) -> Self {
        let owned = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            prefix: owned(prefix),
            key: owned(key),
        }
    }

    /// Check one line. Shutdown phrases win over structured markers.
    pub fn match_line(&self, line: &str) -> Option<GuestDone> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if SHUTDOWN_PHRASES.iter().any(|phrase| line.contains(phrase)) {
            return Some(GuestDone {
                seen_marker: true,
                ..GuestDone::default()
            });
        }

        let candidate = match &self.prefix {
            Some(prefix) => line.strip_prefix(prefix.as_str())?.trim(),
            None if line.starts_with('{') => line,
            None => return None,
        };
        if let Some(key) = &self.key {
            if !candidate.contains(key.as_str()) {
                return None;
            }
        }

        let value: Value = serde_json::from_str(candidate).ok()?;
        let object = value.as_object()?;
        Some(GuestDone {
            seen_marker: true,
            files_delta: delta(object.get(FILES_DELTA_FIELD)?)?,
            bytes_delta: delta(object.get(BYTES_DELTA_FIELD)?)?,
        })
    }
}

/// Integer delta; floats are truncated toward zero.
fn delta(value: &Value) -> Option<i64> {
    if let Some(v) = value.as_i64() {
        return Some(v);
    }
    let f = value.as_f64()?;
    if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f.trunc() as i64)
    } else {
        None
    }
}

/// Follows a growing log file from the position it had when opened.
///
/// Incomplete trailing lines are buffered until their newline arrives.
pub struct LogFollower {
    reader: BufReader<File>,
    partial: Vec<u8>,
    matcher: CompletionMatcher,
}

impl LogFollower {
    /// Open `path` and seek to its current end.
    pub async fn open(path: &Path, matcher: CompletionMatcher) -> fcrun_vm::Result<Self> {
        let mut file = File::open(path).await?;
        let offset = file.seek(SeekFrom::End(0)).await?;
        tracing::debug!(path = %path.display(), offset, "Following console log");
        Ok(Self {
            reader: BufReader::new(file),
            partial: Vec::new(),
            matcher,
        })
    }

    /// Poll until a completion line appears or `deadline` fires.
    pub async fn wait(mut self, deadline: &Deadline) -> fcrun_vm::Result<GuestDone> {
        Waiter::new(deadline, "waiting for guest completion")
            .until(&mut self)
            .await
    }
}

#[async_trait]
impl Probe for LogFollower {
    type Output = GuestDone;

    async fn probe(&mut self) -> Option<GuestDone> {
        loop {
            match self.reader.read_until(b'\n', &mut self.partial).await {
                Ok(0) => return None,
                Ok(_) if !self.partial.ends_with(b"\n") => return None,
                Ok(_) => {
                    let line = std::mem::take(&mut self.partial);
                    let line = String::from_utf8_lossy(&line);
                    if let Some(done) = self.matcher.match_line(&line) {
                        tracing::info!(
                            files_delta = done.files_delta,
                            bytes_delta = done.bytes_delta,
                            "Guest completion observed"
                        );
                        return Some(done);
                    }
                }
                Err(e) => {
                    tracing::trace!(error = %e, "Console log read failed, retrying");
                    return None;
                }
            }
        }
    }
}

/// Wait for a completion line appended to `log_path` after this call.
pub async fn await_completion(
    log_path: &Path,
    marker_prefix: Option<&str>,
    marker_key: Option<&str>,
    deadline: &Deadline,
) -> fcrun_vm::Result<GuestDone> {
    LogFollower::open(log_path, CompletionMatcher::new(marker_prefix, marker_key))
        .await?
        .wait(deadline)
        .await
}
