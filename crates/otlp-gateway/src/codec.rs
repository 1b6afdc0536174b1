// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion between OTLP export requests and their wire forms.
//!
//! Every request can be read from and written to both the binary protobuf
//! encoding and the OTLP JSON encoding. The encoding is always chosen by the
//! caller (from the negotiated content type); the body is never sniffed.

use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::Record;
use crate::signal::SignalKind;

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Protobuf,
    Json,
}

impl Encoding {
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Protobuf => PROTOBUF_CONTENT_TYPE,
            Encoding::Json => JSON_CONTENT_TYPE,
        }
    }
}

/// How the JSON decoder treats fields it does not know.
///
/// Client payloads are decoded with `Ignore` so that newer protocol revisions
/// keep working; internally generated payloads use `Reject` to catch typos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFields {
    Ignore,
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown field `{0}`")]
    UnknownField(String),
}

/// Decoded export request of one signal kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportRequest {
    Logs(ExportLogsServiceRequest),
    Metrics(ExportMetricsServiceRequest),
    Traces(ExportTraceServiceRequest),
}

impl ExportRequest {
    pub fn decode(
        kind: SignalKind,
        bytes: &[u8],
        encoding: Encoding,
        unknown_fields: UnknownFields,
    ) -> Result<Self, DecodeError> {
        match encoding {
            Encoding::Protobuf => Ok(match kind {
                SignalKind::Logs => ExportRequest::Logs(ExportLogsServiceRequest::decode(bytes)?),
                SignalKind::Metrics => {
                    ExportRequest::Metrics(ExportMetricsServiceRequest::decode(bytes)?)
                }
                SignalKind::Traces => {
                    ExportRequest::Traces(ExportTraceServiceRequest::decode(bytes)?)
                }
            }),
            Encoding::Json => {
                let mut input: Value = serde_json::from_slice(bytes)?;
                normalize_json(&mut input, None);
                let request = match kind {
                    SignalKind::Logs => {
                        ExportRequest::Logs(ExportLogsServiceRequest::deserialize(&input)?)
                    }
                    SignalKind::Metrics => {
                        ExportRequest::Metrics(ExportMetricsServiceRequest::deserialize(&input)?)
                    }
                    SignalKind::Traces => {
                        ExportRequest::Traces(ExportTraceServiceRequest::deserialize(&input)?)
                    }
                };
                if unknown_fields == UnknownFields::Reject {
                    let canonical = request.to_json_value()?;
                    if let Some(path) = first_unknown_field(&input, &canonical, "") {
                        return Err(DecodeError::UnknownField(path));
                    }
                }
                Ok(request)
            }
        }
    }

    /// Parses the JSON message of a pipeline record, ignoring unknown fields.
    pub fn from_record(record: &Record) -> Result<Self, DecodeError> {
        Self::decode(
            record.kind,
            record.message.as_bytes(),
            Encoding::Json,
            UnknownFields::Ignore,
        )
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            ExportRequest::Logs(_) => SignalKind::Logs,
            ExportRequest::Metrics(_) => SignalKind::Metrics,
            ExportRequest::Traces(_) => SignalKind::Traces,
        }
    }

    pub fn encode(&self, encoding: Encoding) -> Vec<u8> {
        match (encoding, self) {
            (Encoding::Protobuf, ExportRequest::Logs(request)) => request.encode_to_vec(),
            (Encoding::Protobuf, ExportRequest::Metrics(request)) => request.encode_to_vec(),
            (Encoding::Protobuf, ExportRequest::Traces(request)) => request.encode_to_vec(),
            (Encoding::Json, _) => self.to_json().into_bytes(),
        }
    }

    /// Canonical OTLP JSON text of the request, as handed to the pipeline.
    pub fn to_json(&self) -> String {
        match self {
            ExportRequest::Logs(request) => json_text(request),
            ExportRequest::Metrics(request) => json_text(request),
            ExportRequest::Traces(request) => json_text(request),
        }
    }

    pub fn into_record(self) -> Record {
        Record::new(self.kind(), self.to_json())
    }

    /// Number of log records, metrics or spans carried by the request.
    pub fn item_count(&self) -> usize {
        match self {
            ExportRequest::Logs(request) => request
                .resource_logs
                .iter()
                .flat_map(|rl| &rl.scope_logs)
                .map(|sl| sl.log_records.len())
                .sum(),
            ExportRequest::Metrics(request) => request
                .resource_metrics
                .iter()
                .flat_map(|rm| &rm.scope_metrics)
                .map(|sm| sm.metrics.len())
                .sum(),
            ExportRequest::Traces(request) => request
                .resource_spans
                .iter()
                .flat_map(|rs| &rs.scope_spans)
                .map(|ss| ss.spans.len())
                .sum(),
        }
    }

    fn to_json_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ExportRequest::Logs(request) => serde_json::to_value(request),
            ExportRequest::Metrics(request) => serde_json::to_value(request),
            ExportRequest::Traces(request) => serde_json::to_value(request),
        }
    }
}

// Generated OTLP types only have string map keys, so serialization cannot fail.
#[allow(clippy::expect_used)]
fn json_text<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).expect("OTLP message serializes to JSON")
}

const TIME_FIELDS: [&str; 4] = [
    "timeUnixNano",
    "observedTimeUnixNano",
    "startTimeUnixNano",
    "endTimeUnixNano",
];

/// JSON shape the generated types expect for 64-bit timestamps below a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeForm {
    String,
    Number,
}

fn time_form(key: &str) -> Option<TimeForm> {
    match key {
        "logRecords" | "spans" | "events" | "gauge" | "sum" | "histogram" => Some(TimeForm::String),
        "exponentialHistogram" | "summary" | "exemplars" => Some(TimeForm::Number),
        _ => None,
    }
}

/// Rewrites client JSON into the shape the generated serde types accept.
///
/// OTLP/JSON allows 64-bit integers as either numbers or decimal strings, and
/// treats `null` like an absent field. Null-valued keys are dropped, and
/// timestamps and `asInt` values are converted to the form their message
/// type deserializes.
fn normalize_json(value: &mut Value, form: Option<TimeForm>) {
    match value {
        Value::Object(fields) => {
            fields.retain(|_, field| !field.is_null());
            for (key, field) in fields.iter_mut() {
                if TIME_FIELDS.contains(&key.as_str()) {
                    match (form, &*field) {
                        (Some(TimeForm::String), Value::Number(n)) => {
                            *field = Value::String(n.to_string());
                        }
                        (Some(TimeForm::Number), Value::String(s)) => {
                            if let Ok(n) = s.parse::<u64>() {
                                *field = Value::from(n);
                            }
                        }
                        _ => {}
                    }
                } else if key == "asInt" {
                    if let Some(n) = field.as_str().and_then(|s| s.parse::<i64>().ok()) {
                        *field = Value::from(n);
                    }
                } else {
                    normalize_json(field, time_form(key).or(form));
                }
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| normalize_json(item, form)),
        _ => {}
    }
}

/// Walks `input` alongside the re-serialized `canonical` form and returns the
/// path of the first object key that the schema did not keep.
fn first_unknown_field(input: &Value, canonical: &Value, path: &str) -> Option<String> {
    match (input, canonical) {
        (Value::Object(fields), Value::Object(known)) => fields.iter().find_map(|(key, value)| {
            let field_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            match known.get(key) {
                Some(known_value) => first_unknown_field(value, known_value, &field_path),
                None => Some(field_path),
            }
        }),
        (Value::Array(items), Value::Array(known)) => items
            .iter()
            .zip(known)
            .enumerate()
            .find_map(|(i, (item, known_item))| {
                first_unknown_field(item, known_item, &format!("{path}[{i}]"))
            }),
        _ => None,
    }
}
