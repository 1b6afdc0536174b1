// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The three OTLP signal kinds and a per-kind lookup table.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const LOGS_PATH: &str = "/v1/logs";
pub const METRICS_PATH: &str = "/v1/metrics";
pub const TRACES_PATH: &str = "/v1/traces";

/// Telemetry category carried by an export request.
///
/// Serializes as the record type tag used in pipeline events
/// (`opentelemetry_logs`, `opentelemetry_metrics`, `opentelemetry_traces`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "opentelemetry_logs")]
    Logs,
    #[serde(rename = "opentelemetry_metrics")]
    Metrics,
    #[serde(rename = "opentelemetry_traces")]
    Traces,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Logs, SignalKind::Metrics, SignalKind::Traces];

    /// HTTP path of the signal, identical on the receiving and exporting side.
    pub fn path(self) -> &'static str {
        match self {
            SignalKind::Logs => LOGS_PATH,
            SignalKind::Metrics => METRICS_PATH,
            SignalKind::Traces => TRACES_PATH,
        }
    }

    pub fn record_type(self) -> &'static str {
        match self {
            SignalKind::Logs => "opentelemetry_logs",
            SignalKind::Metrics => "opentelemetry_metrics",
            SignalKind::Traces => "opentelemetry_traces",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Logs => "logs",
            SignalKind::Metrics => "metrics",
            SignalKind::Traces => "traces",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.path() == path)
    }

    pub fn from_record_type(record_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.record_type() == record_type)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per signal kind, filled in completely at construction.
///
/// Used for things that are built once per kind and then only read, such as
/// exporter clients and endpoint URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerSignal<T> {
    pub logs: T,
    pub metrics: T,
    pub traces: T,
}

impl<T> PerSignal<T> {
    pub fn from_fn(mut f: impl FnMut(SignalKind) -> T) -> Self {
        PerSignal {
            logs: f(SignalKind::Logs),
            metrics: f(SignalKind::Metrics),
            traces: f(SignalKind::Traces),
        }
    }

    pub fn try_from_fn<E>(mut f: impl FnMut(SignalKind) -> Result<T, E>) -> Result<Self, E> {
        Ok(PerSignal {
            logs: f(SignalKind::Logs)?,
            metrics: f(SignalKind::Metrics)?,
            traces: f(SignalKind::Traces)?,
        })
    }

    pub fn get(&self, kind: SignalKind) -> &T {
        match kind {
            SignalKind::Logs => &self.logs,
            SignalKind::Metrics => &self.metrics,
            SignalKind::Traces => &self.traces,
        }
    }
}
