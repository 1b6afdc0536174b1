// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::http;
use opentelemetry_proto::tonic::collector::{
    logs::v1::{
        logs_service_server::{LogsService, LogsServiceServer},
        ExportLogsServiceRequest, ExportLogsServiceResponse,
    },
    metrics::v1::{
        metrics_service_server::{MetricsService, MetricsServiceServer},
        ExportMetricsServiceRequest, ExportMetricsServiceResponse,
    },
    trace::v1::{
        trace_service_server::{TraceService, TraceServiceServer},
        ExportTraceServiceRequest, ExportTraceServiceResponse,
    },
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::{Code, Request, Response, Status};
use tower::{Layer, Service};
use tracing::{debug, error, info};

use crate::codec::ExportRequest;
use crate::config::GrpcReceiverConfig;
use crate::http_receiver::ReceiverError;
use crate::pipeline::RecordSink;
use crate::response::{logs_response, metrics_response, traces_response, PartialSuccess};
use crate::self_metrics::GatewayStats;

/// Implements the three OTLP collector services on top of one sink.
#[derive(Clone)]
pub struct OtlpGrpcService {
    pub sink: Arc<dyn RecordSink + Send + Sync>,
    pub stats: Arc<GatewayStats>,
}

impl OtlpGrpcService {
    async fn forward(&self, request: ExportRequest) -> Result<(), Status> {
        let kind = request.kind();
        self.sink
            .emit(request.into_record())
            .await
            .map_err(|e| Status::internal(format!("failed to forward {kind}: {e}")))?;
        self.stats.record_received(kind);
        debug!("Accepted {kind} export call");
        Ok(())
    }
}

#[tonic::async_trait]
impl LogsService for OtlpGrpcService {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        self.forward(ExportRequest::Logs(request.into_inner())).await?;
        Ok(Response::new(logs_response(PartialSuccess::default())))
    }
}

#[tonic::async_trait]
impl MetricsService for OtlpGrpcService {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        self.forward(ExportRequest::Metrics(request.into_inner())).await?;
        Ok(Response::new(metrics_response(PartialSuccess::default())))
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpcService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.forward(ExportRequest::Traces(request.into_inner())).await?;
        Ok(Response::new(traces_response(PartialSuccess::default())))
    }
}

/// Logs the method path and status of every call that fails.
#[derive(Debug, Clone, Default)]
pub struct ExportErrorLogLayer;

impl<S> Layer<S> for ExportErrorLogLayer {
    type Service = ExportErrorLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ExportErrorLog { inner }
    }
}

#[derive(Debug, Clone)]
pub struct ExportErrorLog<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for ExportErrorLog<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = req.uri().path().to_string();
        let future = self.inner.call(req);
        Box::pin(async move {
            let response = future.await?;
            // unary failures are sent trailers-only, so the status is in the headers
            if let Some(status) = Status::from_header_map(response.headers()) {
                if status.code() != Code::Ok {
                    error!("[{method}] Error: {:?} {}", status.code(), status.message());
                }
            }
            Ok(response)
        })
    }
}

pub struct GrpcReceiver {
    pub config: Arc<GrpcReceiverConfig>,
    pub sink: Arc<dyn RecordSink + Send + Sync>,
    pub stats: Arc<GatewayStats>,
}

impl GrpcReceiver {
    pub fn new(config: Arc<GrpcReceiverConfig>, sink: Arc<dyn RecordSink + Send + Sync>) -> Self {
        GrpcReceiver {
            config,
            sink,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<GatewayStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Binds the configured address and serves until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ReceiverError> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ReceiverError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("OTLP gRPC receiver listening on {addr}");
        self.serve(listener, cancel).await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError> {
        let service = OtlpGrpcService {
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        };

        tonic::transport::Server::builder()
            .layer(ExportErrorLogLayer)
            .add_service(
                LogsServiceServer::new(service.clone())
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip),
            )
            .add_service(
                MetricsServiceServer::new(service.clone())
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip),
            )
            .add_service(
                TraceServiceServer::new(service)
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip),
            )
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                cancel.cancelled().await;
                debug!("OTLP gRPC receiver shutting down");
            })
            .await?;

        Ok(())
    }
}
