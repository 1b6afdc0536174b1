// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::http::{self, HeaderMap};
use hyper::{Method, Request, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::{
    Encoding, ExportRequest, UnknownFields, JSON_CONTENT_TYPE, PROTOBUF_CONTENT_TYPE,
};
use crate::compression::gunzip;
use crate::config::HttpReceiverConfig;
use crate::http_utils::{
    create_http_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};
use crate::pipeline::RecordSink;
use crate::response::ExportResponse;
use crate::self_metrics::GatewayStats;
use crate::signal::SignalKind;

pub const UNSUPPORTED_MEDIA_TYPE_MESSAGE: &str =
    "415 unsupported media type, supported: [application/json, application/x-protobuf]";

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("server error: {0}")]
    Io(#[from] io::Error),
    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Protobuf,
    Json,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Other,
}

/// What a request says about its body, read from headers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentNegotiation {
    pub content_type: ContentType,
    pub content_encoding: ContentEncoding,
}

impl ContentNegotiation {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let content_type = match media_type(headers.get(header::CONTENT_TYPE)).as_deref() {
            Some(PROTOBUF_CONTENT_TYPE) => ContentType::Protobuf,
            Some(JSON_CONTENT_TYPE) => ContentType::Json,
            _ => ContentType::Other,
        };
        let content_encoding = match headers.get(header::CONTENT_ENCODING) {
            None => ContentEncoding::Identity,
            Some(value) => match media_type(Some(value)).as_deref() {
                Some("gzip") => ContentEncoding::Gzip,
                _ => ContentEncoding::Other,
            },
        };
        ContentNegotiation {
            content_type,
            content_encoding,
        }
    }

    /// `None` when the content type is not one the codec understands.
    pub fn encoding(&self) -> Option<Encoding> {
        match self.content_type {
            ContentType::Protobuf => Some(Encoding::Protobuf),
            ContentType::Json => Some(Encoding::Json),
            ContentType::Other => None,
        }
    }
}

/// Lower-cased header value without parameters (`application/json; charset=utf-8` -> `application/json`).
fn media_type(value: Option<&HeaderValue>) -> Option<String> {
    let value = value?.to_str().ok()?;
    value
        .split(';')
        .next()
        .map(|media_type| media_type.trim().to_ascii_lowercase())
}

/// Per-request logic of the OTLP/HTTP endpoints. Holds no per-request state
/// and is shared by every connection.
pub struct OtlpHttpHandler {
    pub config: Arc<HttpReceiverConfig>,
    pub sink: Arc<dyn RecordSink + Send + Sync>,
    pub stats: Arc<GatewayStats>,
}

impl OtlpHttpHandler {
    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let Some(kind) = SignalKind::from_path(req.uri().path()) else {
            return create_http_response(StatusCode::NOT_FOUND, None, Bytes::new());
        };
        if req.method() != Method::POST {
            return create_http_response(StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
        }

        let (parts, body) = req.into_parts();
        let negotiation = ContentNegotiation::from_headers(&parts.headers);
        let Some(encoding) = negotiation.encoding() else {
            debug!(
                "Rejecting {kind} request with content-type {:?}",
                parts.headers.get(header::CONTENT_TYPE)
            );
            self.stats.record_rejected();
            return create_http_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Some(&HeaderValue::from_static("text/plain")),
                UNSUPPORTED_MEDIA_TYPE_MESSAGE,
            );
        };
        let request_content_type = parts.headers.get(header::CONTENT_TYPE);
        if negotiation.content_encoding == ContentEncoding::Other {
            debug!(
                "Rejecting {kind} request with content-encoding {:?}",
                parts.headers.get(header::CONTENT_ENCODING)
            );
            self.stats.record_rejected();
            return create_http_response(
                StatusCode::BAD_REQUEST,
                request_content_type,
                Bytes::new(),
            );
        }

        let max_length = self.config.max_request_content_length;
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            max_length,
            &format!("Error processing {kind}"),
        ) {
            self.stats.record_rejected();
            return response;
        }

        let body = match Limited::new(body, max_length).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                self.stats.record_rejected();
                return log_and_create_http_response(
                    &format!("Error processing {kind}: Payload too large"),
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                self.stats.record_rejected();
                return log_and_create_http_response(
                    &format!("Error reading {kind} request body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let body = if negotiation.content_encoding == ContentEncoding::Gzip {
            match gunzip(&body, max_length) {
                Ok(decompressed) => Bytes::from(decompressed),
                Err(e) => {
                    debug!("Failed to decompress {kind} request: {e}");
                    self.stats.record_rejected();
                    return create_http_response(
                        StatusCode::BAD_REQUEST,
                        request_content_type,
                        Bytes::new(),
                    );
                }
            }
        } else {
            body
        };

        let request =
            match ExportRequest::decode(kind, &body, encoding, UnknownFields::Ignore) {
                Ok(request) => request,
                Err(e) => {
                    debug!("Failed to decode {kind} request: {e}");
                    self.stats.record_rejected();
                    return create_http_response(
                        StatusCode::BAD_REQUEST,
                        request_content_type,
                        Bytes::new(),
                    );
                }
            };

        if let Err(e) = self.sink.emit(request.into_record()).await {
            return log_and_create_http_response(
                &format!("Error forwarding {kind} to the pipeline: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
        self.stats.record_received(kind);
        debug!("Accepted {kind} export request");

        create_http_response(
            StatusCode::OK,
            Some(&HeaderValue::from_static(encoding.content_type())),
            ExportResponse::accepted(kind).encode(encoding),
        )
    }
}

pub struct HttpReceiver {
    pub config: Arc<HttpReceiverConfig>,
    pub sink: Arc<dyn RecordSink + Send + Sync>,
    pub stats: Arc<GatewayStats>,
}

impl HttpReceiver {
    pub fn new(config: Arc<HttpReceiverConfig>, sink: Arc<dyn RecordSink + Send + Sync>) -> Self {
        HttpReceiver {
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
        info!("OTLP HTTP receiver listening on {addr}");
        self.serve(listener, cancel).await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError> {
        let handler = Arc::new(OtlpHttpHandler {
            config: self.config.clone(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        });
        let service = service_fn(move |req: Request<Incoming>| {
            // called for each http request
            let handler = handler.clone();
            async move { handler.handle(req).await }
        });

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("OTLP HTTP receiver shutting down");
                    joinset.shutdown().await;
                    return Ok(());
                }
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Record, SinkError};
    use async_trait::async_trait;
    use http_body_util::Full;
    use tokio::sync::mpsc;

    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn emit(&self, _record: Record) -> Result<(), SinkError> {
            Err(SinkError::Rejected("buffer full".to_string()))
        }
    }

    fn handler(sink: Arc<dyn RecordSink + Send + Sync>, max: usize) -> OtlpHttpHandler {
        OtlpHttpHandler {
            config: Arc::new(HttpReceiverConfig {
                max_request_content_length: max,
                ..Default::default()
            }),
            sink,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    fn request(method: Method, path: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    #[test]
    fn test_negotiation_ignores_parameters_and_case() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Application/JSON; charset=utf-8"),
        );
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let negotiation = ContentNegotiation::from_headers(&headers);
        assert_eq!(negotiation.encoding(), Some(Encoding::Json));
        assert_eq!(negotiation.content_encoding, ContentEncoding::Gzip);
    }

    #[test]
    fn test_negotiation_without_headers() {
        let negotiation = ContentNegotiation::from_headers(&HeaderMap::new());
        assert_eq!(negotiation.content_type, ContentType::Other);
        assert_eq!(negotiation.content_encoding, ContentEncoding::Identity);
        assert_eq!(negotiation.encoding(), None);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (tx, _rx) = mpsc::channel(1);
        let response = handler(Arc::new(tx), 1024)
            .handle(request(Method::POST, "/v1/profiles", b"{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_on_signal_path_is_not_allowed() {
        let (tx, _rx) = mpsc::channel(1);
        let response = handler(Arc::new(tx), 1024)
            .handle(request(Method::GET, "/v1/logs", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_body_over_limit_is_too_large() {
        let (tx, mut rx) = mpsc::channel(1);
        let response = handler(Arc::new(tx), 4)
            .handle(request(Method::POST, "/v1/logs", br#"{"resourceLogs":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_failure_is_internal_error() {
        let handler = handler(Arc::new(FailingSink), 1024);
        let response = handler
            .handle(request(Method::POST, "/v1/traces", br#"{"resourceSpans":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["message"].as_str().unwrap().contains("buffer full"));
        assert_eq!(handler.stats.received(SignalKind::Traces), 0);
    }

    #[tokio::test]
    async fn test_accepted_request_counts() {
        let (tx, mut rx) = mpsc::channel(1);
        let handler = handler(Arc::new(tx), 1024);
        let response = handler
            .handle(request(Method::POST, "/v1/metrics", br#"{"resourceMetrics":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            HeaderValue::from_static(JSON_CONTENT_TYPE)
        );
        assert_eq!(rx.recv().await.unwrap().kind, SignalKind::Metrics);
        assert_eq!(handler.stats.received(SignalKind::Metrics), 1);
    }
}
