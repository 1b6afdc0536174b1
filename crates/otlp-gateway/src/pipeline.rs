// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hand-off points between the gateway and the event pipeline that owns
//! buffering, routing and retries.
//!
//! Receivers push decoded records into a [`RecordSink`]; the pipeline later
//! asks a [`RecordExporter`] to deliver each record to the remote collector.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::exporter::ExportError;
use crate::signal::SignalKind;

/// Unit of work exchanged with the pipeline: the signal kind and the
/// canonical JSON text of one export request.
///
/// Serialized form: `{"type": "opentelemetry_logs", "message": "{...}"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub message: String,
}

impl Record {
    pub fn new(kind: SignalKind, message: impl Into<String>) -> Self {
        Record {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("pipeline is closed")]
    Closed,
    #[error("pipeline rejected record: {0}")]
    Rejected(String),
}

/// Receives every successfully decoded ingress record.
#[async_trait]
pub trait RecordSink {
    async fn emit(&self, record: Record) -> Result<(), SinkError>;
}

#[async_trait]
impl RecordSink for Sender<Record> {
    async fn emit(&self, record: Record) -> Result<(), SinkError> {
        self.send(record).await.map_err(|_| SinkError::Closed)
    }
}

/// Delivers one record to the remote collector.
///
/// `Ok(())` covers both a successful delivery and a failure that was only
/// logged; every other failure is returned so the pipeline can decide whether
/// to retry.
#[async_trait]
pub trait RecordExporter {
    async fn export(&self, record: &Record) -> Result<(), ExportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_record_serializes_as_pipeline_event() {
        let record = Record::new(SignalKind::Traces, "{\"resourceSpans\":[]}");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "opentelemetry_traces",
                "message": "{\"resourceSpans\":[]}"
            })
        );
        let parsed: Record = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_rejects_unknown_type() {
        let parsed = serde_json::from_str::<Record>(r#"{"type":"profiles","message":"{}"}"#);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_and_reports_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.emit(Record::new(SignalKind::Logs, "{}")).await.unwrap();
        assert_eq!(rx.recv().await, Some(Record::new(SignalKind::Logs, "{}")));

        drop(rx);
        let err = tx.emit(Record::new(SignalKind::Logs, "{}")).await.unwrap_err();
        assert!(matches!(err, SinkError::Closed));
    }
}
