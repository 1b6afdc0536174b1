// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::helpers::{fixture, spawn_grpc_receiver, FailingSink, RecordingSink};
use opentelemetry_proto::tonic::collector::logs::v1::{
    logs_service_client::LogsServiceClient,
    logs_service_server::{LogsService, LogsServiceServer},
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use otlp_gateway::codec::{Encoding, ExportRequest, UnknownFields};
use otlp_gateway::config::{Compression, GrpcExporterConfig};
use otlp_gateway::exporter::ExportError;
use otlp_gateway::grpc_exporter::GrpcExporter;
use otlp_gateway::pipeline::{Record, RecordExporter};
use otlp_gateway::signal::SignalKind;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codec::CompressionEncoding;
use tonic::{Code, Request, Response, Status};

fn logs_request() -> ExportLogsServiceRequest {
    match ExportRequest::decode(
        SignalKind::Logs,
        fixture("logs.json").as_bytes(),
        Encoding::Json,
        UnknownFields::Ignore,
    )
    .unwrap()
    {
        ExportRequest::Logs(request) => request,
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn test_grpc_logs_are_forwarded() {
    let sink = Arc::new(RecordingSink::default());
    let server = spawn_grpc_receiver(sink.clone()).await;

    let mut client = LogsServiceClient::connect(server.url("")).await.unwrap();
    let response = client.export(logs_request()).await.unwrap().into_inner();

    let partial = response.partial_success.unwrap();
    assert_eq!(partial.rejected_log_records, 0);
    assert_eq!(partial.error_message, "");

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, SignalKind::Logs);
    assert_eq!(
        ExportRequest::from_record(&records[0]).unwrap(),
        ExportRequest::Logs(logs_request())
    );
    assert_eq!(server.stats.received(SignalKind::Logs), 1);
}

#[tokio::test]
async fn test_grpc_accepts_gzip() {
    let sink = Arc::new(RecordingSink::default());
    let server = spawn_grpc_receiver(sink.clone()).await;

    let mut client = MetricsServiceClient::connect(server.url(""))
        .await
        .unwrap()
        .send_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Gzip);
    let request = match ExportRequest::decode(
        SignalKind::Metrics,
        fixture("metrics.json").as_bytes(),
        Encoding::Json,
        UnknownFields::Ignore,
    )
    .unwrap()
    {
        ExportRequest::Metrics(request) => request,
        other => panic!("unexpected request {other:?}"),
    };
    client.export(request).await.unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, SignalKind::Metrics);
}

#[tokio::test]
async fn test_grpc_sink_failure_is_internal() {
    let server = spawn_grpc_receiver(Arc::new(FailingSink)).await;

    let mut client = LogsServiceClient::connect(server.url("")).await.unwrap();
    let status = client.export(logs_request()).await.unwrap_err();

    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("buffer full"));
}

/// Collector stub answering every logs export with a fixed status, after an
/// optional delay.
struct StubCollector {
    status: Option<Code>,
    delay: Duration,
    received: Arc<Mutex<Vec<ExportLogsServiceRequest>>>,
}

#[tonic::async_trait]
impl LogsService for StubCollector {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        self.received.lock().unwrap().push(request.into_inner());
        tokio::time::sleep(self.delay).await;
        match self.status {
            Some(code) => Err(Status::new(code, "stub failure")),
            None => Ok(Response::new(ExportLogsServiceResponse::default())),
        }
    }
}

async fn spawn_collector(
    status: Option<Code>,
) -> (String, Arc<Mutex<Vec<ExportLogsServiceRequest>>>) {
    spawn_delayed_collector(status, Duration::ZERO).await
}

async fn spawn_delayed_collector(
    status: Option<Code>,
    delay: Duration,
) -> (String, Arc<Mutex<Vec<ExportLogsServiceRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let collector = StubCollector {
        status,
        delay,
        received: received.clone(),
    };
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(
                LogsServiceServer::new(collector).accept_compressed(CompressionEncoding::Gzip),
            )
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    (addr.to_string(), received)
}

fn exporter(endpoint: String, compress: Compression) -> GrpcExporter {
    GrpcExporter::new(Arc::new(GrpcExporterConfig {
        endpoint,
        compress,
        ..Default::default()
    }))
    .unwrap()
}

fn logs_record() -> Record {
    ExportRequest::Logs(logs_request()).into_record()
}

#[tokio::test]
async fn test_grpc_exporter_delivers_records() {
    let (endpoint, received) = spawn_collector(None).await;

    exporter(endpoint, Compression::Gzip)
        .export(&logs_record())
        .await
        .unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], logs_request());
}

#[tokio::test]
async fn test_grpc_exporter_unavailable_is_retryable() {
    let (endpoint, _) = spawn_collector(Some(Code::Unavailable)).await;

    let err = exporter(endpoint, Compression::Text)
        .export(&logs_record())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(err.to_string().contains("Unavailable"));
}

#[tokio::test]
async fn test_grpc_exporter_invalid_argument_is_unrecoverable() {
    let (endpoint, _) = spawn_collector(Some(Code::InvalidArgument)).await;

    let err = exporter(endpoint.clone(), Compression::Text)
        .export(&logs_record())
        .await
        .unwrap_err();

    assert!(matches!(err, ExportError::Unrecoverable(_)));
    assert!(err.to_string().contains(&endpoint));
}

#[tokio::test]
async fn test_grpc_exporter_deadline_is_retryable() {
    let (endpoint, _) = spawn_delayed_collector(None, Duration::from_secs(5)).await;
    let exporter = GrpcExporter::new(Arc::new(GrpcExporterConfig {
        endpoint,
        timeout: Duration::from_millis(200),
        ..Default::default()
    }))
    .unwrap();

    let started = Instant::now();
    let err = exporter.export(&logs_record()).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.is_retryable());
    let message = err.to_string();
    assert!(
        message.contains("Cancelled") || message.contains("DeadlineExceeded"),
        "unexpected error: {message}"
    );
}
