//! Configuration for `fc-run`.
//!
//! Everything is read from environment variables; unset or empty variables
//! fall back to the library defaults.

use anyhow::Context;
use fcrun_core::{NetworkConfig, RunConfig};
use std::path::PathBuf;
use std::str::FromStr;

/// Load the run configuration from the process environment.
///
/// | Variable | Default |
/// |----------|---------|
/// | `FCRUN_FIRECRACKER` | required |
/// | `FCRUN_KERNEL` | required |
/// | `FCRUN_ROOTFS` | required |
/// | `FCRUN_VCPUS` | `2` |
/// | `FCRUN_MEM_MIB` | `2048` |
/// | `FCRUN_TIMEOUT_SECS` | `120` |
/// | `FCRUN_MARKER_PREFIX` | none |
/// | `FCRUN_MARKER_KEY` | `workspace_files_delta` |
/// | `FCRUN_KEEP_RUN_DIR` | `false` |
/// | `FCRUN_RAW_METRICS` | `false` |
/// | `FCRUN_TAP` | `false` |
/// | `FCRUN_GUEST_MAC` | `02:FC:00:00:00:01` |
/// | `FCRUN_MMDS_DATA` | none (path to a JSON file; enables MMDS) |
pub fn from_env() -> anyhow::Result<RunConfig> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Build the configuration from an arbitrary variable source.
pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<RunConfig> {
    let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());
    let flag = |key: &str| var(key).is_some_and(|v| is_truthy(&v));

    let mut config = RunConfig {
        firecracker_bin: var("FCRUN_FIRECRACKER").map(PathBuf::from).unwrap_or_default(),
        kernel_image: var("FCRUN_KERNEL").map(PathBuf::from).unwrap_or_default(),
        rootfs: var("FCRUN_ROOTFS").map(PathBuf::from).unwrap_or_default(),
        vcpus: number(var("FCRUN_VCPUS"), "FCRUN_VCPUS"),
        mem_mib: number(var("FCRUN_MEM_MIB"), "FCRUN_MEM_MIB"),
        timeout_secs: number(var("FCRUN_TIMEOUT_SECS"), "FCRUN_TIMEOUT_SECS"),
        marker_prefix: var("FCRUN_MARKER_PREFIX"),
        marker_json_key: var("FCRUN_MARKER_KEY").unwrap_or_default(),
        keep_run_dir: flag("FCRUN_KEEP_RUN_DIR"),
        include_raw_metrics: flag("FCRUN_RAW_METRICS"),
        network: NetworkConfig {
            enabled: flag("FCRUN_TAP"),
            guest_mac: var("FCRUN_GUEST_MAC").unwrap_or_default(),
            ..NetworkConfig::default()
        },
        ..RunConfig::default()
    };

    if let Some(path) = var("FCRUN_MMDS_DATA") {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read MMDS data from {path}"))?;
        let data: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON in MMDS data file {path}"))?;
        config.mmds.enabled = true;
        config.mmds.data = Some(data);
    }

    Ok(config)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a number, falling back to zero ("use the default") when it is missing or malformed.
fn number<T: FromStr + Default>(value: Option<String>, key: &str) -> T {
    match value {
        Some(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "Ignoring malformed number");
            T::default()
        }),
        None => T::default(),
    }
}
