// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Export responses carrying the protocol's partial-success acknowledgement.

use opentelemetry_proto::tonic::collector::{
    logs::v1::{ExportLogsPartialSuccess, ExportLogsServiceResponse},
    metrics::v1::{ExportMetricsPartialSuccess, ExportMetricsServiceResponse},
    trace::v1::{ExportTracePartialSuccess, ExportTraceServiceResponse},
};
use prost::Message;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::codec::{DecodeError, Encoding};
use crate::signal::SignalKind;

/// Rejected item count and reason. The default means everything was accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialSuccess {
    pub rejected: i64,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportResponse {
    Logs(ExportLogsServiceResponse),
    Metrics(ExportMetricsServiceResponse),
    Traces(ExportTraceServiceResponse),
}

pub fn logs_response(partial: PartialSuccess) -> ExportLogsServiceResponse {
    ExportLogsServiceResponse {
        partial_success: Some(ExportLogsPartialSuccess {
            rejected_log_records: partial.rejected,
            error_message: partial.error_message,
        }),
    }
}

pub fn metrics_response(partial: PartialSuccess) -> ExportMetricsServiceResponse {
    ExportMetricsServiceResponse {
        partial_success: Some(ExportMetricsPartialSuccess {
            rejected_data_points: partial.rejected,
            error_message: partial.error_message,
        }),
    }
}

pub fn traces_response(partial: PartialSuccess) -> ExportTraceServiceResponse {
    ExportTraceServiceResponse {
        partial_success: Some(ExportTracePartialSuccess {
            rejected_spans: partial.rejected,
            error_message: partial.error_message,
        }),
    }
}

/// JSON name of the rejected counter, which differs per signal.
fn rejected_field(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::Logs => "rejectedLogRecords",
        SignalKind::Metrics => "rejectedDataPoints",
        SignalKind::Traces => "rejectedSpans",
    }
}

impl ExportResponse {
    pub fn build(kind: SignalKind, partial: PartialSuccess) -> Self {
        match kind {
            SignalKind::Logs => ExportResponse::Logs(logs_response(partial)),
            SignalKind::Metrics => ExportResponse::Metrics(metrics_response(partial)),
            SignalKind::Traces => ExportResponse::Traces(traces_response(partial)),
        }
    }

    pub fn accepted(kind: SignalKind) -> Self {
        Self::build(kind, PartialSuccess::default())
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            ExportResponse::Logs(_) => SignalKind::Logs,
            ExportResponse::Metrics(_) => SignalKind::Metrics,
            ExportResponse::Traces(_) => SignalKind::Traces,
        }
    }

    /// A missing partial-success field reads as full acceptance.
    pub fn partial_success(&self) -> PartialSuccess {
        match self {
            ExportResponse::Logs(response) => response
                .partial_success
                .as_ref()
                .map(|p| PartialSuccess {
                    rejected: p.rejected_log_records,
                    error_message: p.error_message.clone(),
                })
                .unwrap_or_default(),
            ExportResponse::Metrics(response) => response
                .partial_success
                .as_ref()
                .map(|p| PartialSuccess {
                    rejected: p.rejected_data_points,
                    error_message: p.error_message.clone(),
                })
                .unwrap_or_default(),
            ExportResponse::Traces(response) => response
                .partial_success
                .as_ref()
                .map(|p| PartialSuccess {
                    rejected: p.rejected_spans,
                    error_message: p.error_message.clone(),
                })
                .unwrap_or_default(),
        }
    }

    pub fn encode(&self, encoding: Encoding) -> Vec<u8> {
        match (encoding, self) {
            (Encoding::Protobuf, ExportResponse::Logs(response)) => response.encode_to_vec(),
            (Encoding::Protobuf, ExportResponse::Metrics(response)) => response.encode_to_vec(),
            (Encoding::Protobuf, ExportResponse::Traces(response)) => response.encode_to_vec(),
            (Encoding::Json, _) => self.to_json_value().to_string().into_bytes(),
        }
    }

    pub fn decode(kind: SignalKind, bytes: &[u8], encoding: Encoding) -> Result<Self, DecodeError> {
        match encoding {
            Encoding::Protobuf => Ok(match kind {
                SignalKind::Logs => ExportResponse::Logs(ExportLogsServiceResponse::decode(bytes)?),
                SignalKind::Metrics => {
                    ExportResponse::Metrics(ExportMetricsServiceResponse::decode(bytes)?)
                }
                SignalKind::Traces => {
                    ExportResponse::Traces(ExportTraceServiceResponse::decode(bytes)?)
                }
            }),
            Encoding::Json => {
                let response: JsonResponse = serde_json::from_slice(bytes)?;
                let Some(partial) = response.partial_success else {
                    return Ok(match kind {
                        SignalKind::Logs => ExportResponse::Logs(Default::default()),
                        SignalKind::Metrics => ExportResponse::Metrics(Default::default()),
                        SignalKind::Traces => ExportResponse::Traces(Default::default()),
                    });
                };
                let rejected = match kind {
                    SignalKind::Logs => partial.rejected_log_records,
                    SignalKind::Metrics => partial.rejected_data_points,
                    SignalKind::Traces => partial.rejected_spans,
                };
                let rejected = match rejected {
                    None => 0,
                    Some(JsonInt::Number(n)) => n,
                    Some(JsonInt::Text(text)) => text.parse().map_err(|_| {
                        <serde_json::Error as serde::de::Error>::custom(format!(
                            "invalid {}: {text:?}",
                            rejected_field(kind)
                        ))
                    })?,
                };
                Ok(Self::build(
                    kind,
                    PartialSuccess {
                        rejected,
                        error_message: partial.error_message,
                    },
                ))
            }
        }
    }

    /// Proto3 JSON mapping: int64 as a string, default values omitted.
    fn to_json_value(&self) -> Value {
        let Some(partial) = self.has_partial_success().then(|| self.partial_success()) else {
            return json!({});
        };
        let mut fields = Map::new();
        if partial.rejected != 0 {
            fields.insert(
                rejected_field(self.kind()).to_string(),
                Value::String(partial.rejected.to_string()),
            );
        }
        if !partial.error_message.is_empty() {
            fields.insert(
                "errorMessage".to_string(),
                Value::String(partial.error_message),
            );
        }
        json!({ "partialSuccess": fields })
    }

    fn has_partial_success(&self) -> bool {
        match self {
            ExportResponse::Logs(response) => response.partial_success.is_some(),
            ExportResponse::Metrics(response) => response.partial_success.is_some(),
            ExportResponse::Traces(response) => response.partial_success.is_some(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonResponse {
    #[serde(default)]
    partial_success: Option<JsonPartialSuccess>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonPartialSuccess {
    #[serde(default)]
    rejected_log_records: Option<JsonInt>,
    #[serde(default)]
    rejected_data_points: Option<JsonInt>,
    #[serde(default)]
    rejected_spans: Option<JsonInt>,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonInt {
    Number(i64),
    Text(String),
}
