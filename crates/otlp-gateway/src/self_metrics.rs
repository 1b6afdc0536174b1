// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The gateway's own counters, reported periodically as an OTLP metrics record.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::warn;

use crate::codec::{DecodeError, Encoding, ExportRequest, UnknownFields};
use crate::exporter::EgressOutcome;
use crate::pipeline::Record;
use crate::signal::{PerSignal, SignalKind};

/// Lock-free counters shared by receivers and exporters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    received: PerSignal<AtomicU64>,
    rejected: AtomicU64,
    export_success: AtomicU64,
    export_fatal: AtomicU64,
    export_retryable: AtomicU64,
    export_dropped: AtomicU64,
}

impl GatewayStats {
    pub fn record_received(&self, kind: SignalKind) {
        self.received.get(kind).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &EgressOutcome) {
        let counter = match outcome {
            EgressOutcome::Success => &self.export_success,
            EgressOutcome::Fatal(_) => &self.export_fatal,
            EgressOutcome::Retryable(_) => &self.export_retryable,
            EgressOutcome::LoggedWarning(_) => &self.export_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self, kind: SignalKind) -> u64 {
        self.received.get(kind).load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn gauges(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("received_logs", self.received(SignalKind::Logs)),
            ("received_metrics", self.received(SignalKind::Metrics)),
            ("received_traces", self.received(SignalKind::Traces)),
            ("rejected_requests", self.rejected()),
            ("export_success", self.export_success.load(Ordering::Relaxed)),
            ("export_fatal", self.export_fatal.load(Ordering::Relaxed)),
            ("export_retryable", self.export_retryable.load(Ordering::Relaxed)),
            ("export_dropped", self.export_dropped.load(Ordering::Relaxed)),
        ]
    }
}

/// Resource usage of the gateway process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    pub resident_bytes: u64,
    pub user_cpu_seconds: f64,
}

impl ProcessUsage {
    #[cfg(unix)]
    pub fn current() -> Self {
        use nix::sys::resource::{getrusage, UsageWho};

        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => {
                let user_time = usage.user_time();
                // ru_maxrss is in kilobytes except on Apple platforms
                let max_rss = u64::try_from(usage.max_rss()).unwrap_or_default();
                let resident_bytes = if cfg!(target_vendor = "apple") {
                    max_rss
                } else {
                    max_rss.saturating_mul(1024)
                };
                ProcessUsage {
                    resident_bytes,
                    user_cpu_seconds: user_time.tv_sec() as f64
                        + user_time.tv_usec() as f64 / 1_000_000.0,
                }
            }
            Err(e) => {
                warn!("Failed to read process resource usage: {}", e);
                ProcessUsage::default()
            }
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        ProcessUsage::default()
    }
}

pub struct MetricsSnapshot {
    pub stats: Arc<GatewayStats>,
    pub metric_name_prefix: String,
    pub service_name: String,
    pub service_version: String,
    pub host_name: String,
    pub pid: u32,
    pub runtime_name: String,
    pub runtime_version: String,
    pub start_time_unix_nano: u64,
}

impl MetricsSnapshot {
    pub fn new(stats: Arc<GatewayStats>, metric_name_prefix: impl Into<String>) -> Self {
        MetricsSnapshot {
            stats,
            metric_name_prefix: metric_name_prefix.into(),
            service_name: env!("CARGO_PKG_NAME").to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            host_name: get_hostname(),
            pid: std::process::id(),
            runtime_name: "rust".to_string(),
            runtime_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            start_time_unix_nano: now_unix_nano(),
        }
    }

    /// Builds the current snapshot and checks it against the metrics schema
    /// with unknown fields rejected.
    pub fn record(&self) -> Result<Record, DecodeError> {
        let body = self
            .to_json(now_unix_nano(), ProcessUsage::current())
            .to_string();
        let request = ExportRequest::decode(
            SignalKind::Metrics,
            body.as_bytes(),
            Encoding::Json,
            UnknownFields::Reject,
        )?;
        Ok(request.into_record())
    }

    fn to_json(&self, time_unix_nano: u64, usage: ProcessUsage) -> Value {
        let time_unix_nano = time_unix_nano.to_string();
        let start_time_unix_nano = self.start_time_unix_nano.to_string();
        let pid_attribute = json!({"key": "process.pid", "value": {"intValue": self.pid}});

        let mut metrics: Vec<Value> = self
            .stats
            .gauges()
            .into_iter()
            .map(|(name, value)| {
                json!({
                    "name": format!("{}{name}", self.metric_name_prefix),
                    "unit": "1",
                    "gauge": {
                        "dataPoints": [{
                            "timeUnixNano": time_unix_nano,
                            "asDouble": value as f64,
                        }]
                    }
                })
            })
            .collect();

        metrics.push(json!({
            "name": format!("{}process_memory_usage", self.metric_name_prefix),
            "unit": "By",
            "gauge": {
                "dataPoints": [{
                    "attributes": [
                        string_attribute("type", "resident"),
                        pid_attribute,
                    ],
                    "startTimeUnixNano": start_time_unix_nano,
                    "timeUnixNano": time_unix_nano,
                    "asInt": usage.resident_bytes,
                }]
            }
        }));
        metrics.push(json!({
            "name": format!("{}process_cpu_time", self.metric_name_prefix),
            "unit": "s",
            "sum": {
                "aggregationTemporality": 2,
                "isMonotonic": true,
                "dataPoints": [{
                    "attributes": [
                        string_attribute("state", "user"),
                        pid_attribute,
                    ],
                    "startTimeUnixNano": start_time_unix_nano,
                    "timeUnixNano": time_unix_nano,
                    "asDouble": usage.user_cpu_seconds,
                }]
            }
        }));

        json!({
            "resourceMetrics": [{
                "resource": {
                    "attributes": [
                        string_attribute("service.name", &self.service_name),
                        string_attribute("service.version", &self.service_version),
                        string_attribute("host.name", &self.host_name),
                        pid_attribute,
                        string_attribute("process.runtime.name", &self.runtime_name),
                        string_attribute("process.runtime.version", &self.runtime_version),
                    ]
                },
                "scopeMetrics": [{
                    "scope": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "metrics": metrics,
                }]
            }]
        })
    }
}

fn string_attribute(key: &str, value: &str) -> Value {
    json!({"key": key, "value": {"stringValue": value}})
}

fn now_unix_nano() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

/// HOSTNAME from the environment, then the system hostname, then "unknown".
fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(hostname) => {
                if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
                    return hostname.to_string();
                }
            }
            Err(e) => warn!("Failed to get system hostname: {}", e),
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
