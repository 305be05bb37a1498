//! Aggregation of Firecracker's line-delimited JSON metrics.
//!
//! Each line is one JSON object. Network devices appear under keys named
//! `net_<iface>` and block devices under `block_<drive>`; the bare `net` and
//! `block` keys hold totals and only count when no per-device key exists in
//! the same record. Counters are summed across all lines and devices, and
//! anything that does not parse is skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device I/O totals extracted from a metrics file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsAggregate {
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    /// Non-empty lines seen, whether or not they parsed.
    pub lines: usize,
}

/// Sum device counters over every record in `raw`.
pub fn parse_metrics(raw: &str) -> MetricsAggregate {
    let mut agg = MetricsAggregate::default();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        agg.lines += 1;

        let record: Map<String, Value> = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::trace!(error = %e, "Skipping unparsable metrics line");
                continue;
            }
        };

        for device in devices(&record, "net") {
            agg.net_rx_bytes = agg.net_rx_bytes.saturating_add(counter(device, "rx_bytes_count"));
            agg.net_tx_bytes = agg.net_tx_bytes.saturating_add(counter(device, "tx_bytes_count"));
        }
        for device in devices(&record, "block") {
            agg.block_read_bytes = agg.block_read_bytes.saturating_add(counter(device, "read_bytes"));
            agg.block_write_bytes = agg.block_write_bytes.saturating_add(counter(device, "write_bytes"));
        }
    }

    agg
}

/// Per-device objects of one family: every `<family>_<name>` key, or the
/// bare `<family>` aggregate when no per-device key is present.
///
/// A per-device key whose value is not an object still suppresses the
/// bare aggregate; it just contributes nothing itself.
fn devices<'a>(record: &'a Map<String, Value>, family: &str) -> Vec<&'a Map<String, Value>> {
    let per_device: Vec<&Value> = record
        .iter()
        .filter(|(key, _)| {
            key.strip_prefix(family)
                .is_some_and(|rest| rest.starts_with('_'))
        })
        .map(|(_, value)| value)
        .collect();
    let selected = if per_device.is_empty() {
        record.get(family).into_iter().collect()
    } else {
        per_device
    };
    selected.into_iter().filter_map(Value::as_object).collect()
}

/// Read a non-negative integral counter; anything else counts as zero.
fn counter(device: &Map<String, Value>, field: &str) -> u64 {
    let Some(Value::Number(n)) = device.get(field) else {
        return 0;
    };
    if let Some(v) = n.as_u64() {
        return v;
    }
    match n.as_f64() {
        // 2^64 is the first float past u64::MAX.
        Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f < 18_446_744_073_709_551_616.0 => {
            f as u64
        }
        _ => 0,
    }
}
