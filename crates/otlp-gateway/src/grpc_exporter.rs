// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::{
    logs::v1::logs_service_client::LogsServiceClient,
    metrics::v1::metrics_service_client::MetricsServiceClient,
    trace::v1::trace_service_client::TraceServiceClient,
};
use tonic::codec::CompressionEncoding;
use tonic::transport::Channel;

use crate::codec::ExportRequest;
use crate::config::{Compression, GrpcExporterConfig};
use crate::exporter::{classify_grpc_status, EgressOutcome, ExportError};
use crate::pipeline::{Record, RecordExporter};
use crate::self_metrics::GatewayStats;

#[derive(Debug, thiserror::Error)]
pub enum GrpcExporterError {
    #[error("invalid gRPC endpoint {endpoint:?}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        source: tonic::codegen::http::uri::InvalidUri,
    },
}

/// Sends records over unary OTLP export calls, one client per signal kind.
///
/// The channel connects lazily, so a collector that is down at start-up only
/// shows up as retryable failures on the first calls.
pub struct GrpcExporter {
    pub config: Arc<GrpcExporterConfig>,
    uri: String,
    logs: LogsServiceClient<Channel>,
    metrics: MetricsServiceClient<Channel>,
    traces: TraceServiceClient<Channel>,
    stats: Arc<GatewayStats>,
}

impl GrpcExporter {
    /// Must be called from within a tokio runtime.
    pub fn new(config: Arc<GrpcExporterConfig>) -> Result<Self, GrpcExporterError> {
        let uri = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            format!("http://{}", config.endpoint)
        };
        let channel = Channel::from_shared(uri.clone())
            .map_err(|source| GrpcExporterError::InvalidEndpoint {
                endpoint: config.endpoint.clone(),
                source,
            })?
            .timeout(config.timeout)
            .http2_keep_alive_interval(config.keepalive_time)
            .keep_alive_timeout(config.keepalive_timeout)
            .keep_alive_while_idle(true)
            .connect_lazy();

        let mut logs = LogsServiceClient::new(channel.clone())
            .accept_compressed(CompressionEncoding::Gzip);
        let mut metrics = MetricsServiceClient::new(channel.clone())
            .accept_compressed(CompressionEncoding::Gzip);
        let mut traces =
            TraceServiceClient::new(channel).accept_compressed(CompressionEncoding::Gzip);
        if config.compress == Compression::Gzip {
            logs = logs.send_compressed(CompressionEncoding::Gzip);
            metrics = metrics.send_compressed(CompressionEncoding::Gzip);
            traces = traces.send_compressed(CompressionEncoding::Gzip);
        }

        Ok(GrpcExporter {
            config,
            uri,
            logs,
            metrics,
            traces,
            stats: Arc::new(GatewayStats::default()),
        })
    }

    pub fn with_stats(mut self, stats: Arc<GatewayStats>) -> Self {
        self.stats = stats;
        self
    }

    pub async fn send(&self, record: &Record) -> EgressOutcome {
        let request = match ExportRequest::from_record(record) {
            Ok(request) => request,
            Err(e) => return EgressOutcome::Fatal(format!("malformed {} record: {e}", record.kind)),
        };
        let result = match request {
            ExportRequest::Logs(message) => self
                .logs
                .clone()
                .export(self.request(message))
                .await
                .map(|_| ()),
            ExportRequest::Metrics(message) => self
                .metrics
                .clone()
                .export(self.request(message))
                .await
                .map(|_| ()),
            ExportRequest::Traces(message) => self
                .traces
                .clone()
                .export(self.request(message))
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => EgressOutcome::Success,
            Err(status) => classify_grpc_status(&status, &self.uri),
        }
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.config.timeout);
        request
    }
}

#[async_trait]
impl RecordExporter for GrpcExporter {
    async fn export(&self, record: &Record) -> Result<(), ExportError> {
        let outcome = self.send(record).await;
        self.stats.record_outcome(&outcome);
        outcome.into_result()
    }
}
