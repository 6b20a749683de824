//! Gateway metrics collection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;

/// Metrics as reported by `MessageGateway::metrics()`.
pub type MetricsMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of gateway metrics at a point in time.
pub struct MetricsSnapshot {
    /// Number of dispatches issued.
    pub total_requests: u64,
    /// Number of dispatches that succeeded.
    pub successful_requests: u64,
    /// Number of dispatches that failed or were rejected.
    pub failed_requests: u64,
    /// Number of transitions of the circuit breaker into OPEN.
    pub circuit_breaker_open_transitions: u64,
}

impl MetricsSnapshot {
    /// `successful / total`, or 1.0 before the first request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

/// Thread-safe gateway metrics collector.
pub struct GatewayMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    circuit_breaker_open_transitions: AtomicU64,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl GatewayMetrics {
    /// Creates a new collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            circuit_breaker_open_transitions: AtomicU64::new(0),
        }
    }

    pub fn inc_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_successful_requests(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_requests(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_open_transitions(&self) {
        self.circuit_breaker_open_transitions
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            circuit_breaker_open_transitions: self
                .circuit_breaker_open_transitions
                .load(Ordering::Relaxed),
        }
    }

    /// Base entries shared by every gateway's metrics map.
    pub fn to_map(&self, communication_type: &str) -> MetricsMap {
        let snapshot = self.snapshot();
        let mut map = MetricsMap::new();
        map.insert("total_requests".into(), snapshot.total_requests.into());
        map.insert(
            "successful_requests".into(),
            snapshot.successful_requests.into(),
        );
        map.insert("failed_requests".into(), snapshot.failed_requests.into());
        map.insert("success_rate".into(), snapshot.success_rate().into());
        map.insert("communication_type".into(), communication_type.into());
        map
    }
}

/// Renders a metrics map in the Prometheus text exposition format.
///
/// Numeric entries become gauges named `sd_gateway_<key>`; string entries are
/// emitted as an info series carrying the value as a label.
pub fn to_prometheus(gateway: &str, metrics: &MetricsMap) -> String {
    let mut output = String::new();
    for (key, value) in metrics {
        let name = format!("sd_gateway_{}", key.replace(['-', '.'], "_"));
        match value {
            Value::Number(n) => {
                output.push_str(&format!("# TYPE {name} gauge\n"));
                output.push_str(&format!("{name}{{gateway=\"{gateway}\"}} {n}\n"));
            }
            Value::String(s) => {
                output.push_str(&format!("# TYPE {name}_info gauge\n"));
                output.push_str(&format!(
                    "{name}_info{{gateway=\"{gateway}\",value=\"{s}\"}} 1\n"
                ));
            }
            Value::Bool(b) => {
                output.push_str(&format!("# TYPE {name} gauge\n"));
                output.push_str(&format!(
                    "{name}{{gateway=\"{gateway}\"}} {}\n",
                    u8::from(*b)
                ));
            }
            _ => {}
        }
    }
    output
}
