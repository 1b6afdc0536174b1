// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use otlp_gateway::config::{GrpcReceiverConfig, HttpReceiverConfig};
use otlp_gateway::grpc_receiver::GrpcReceiver;
use otlp_gateway::http_receiver::HttpReceiver;
use otlp_gateway::pipeline::{Record, RecordSink, SinkError};
use otlp_gateway::self_metrics::GatewayStats;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Keeps every record it is handed.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<Record>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn emit(&self, record: Record) -> Result<(), SinkError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

pub struct FailingSink;

#[async_trait]
impl RecordSink for FailingSink {
    async fn emit(&self, _record: Record) -> Result<(), SinkError> {
        Err(SinkError::Rejected("buffer full".to_string()))
    }
}

/// A running receiver; dropping it stops the server.
pub struct TestServer {
    pub addr: SocketAddr,
    pub stats: Arc<GatewayStats>,
    cancel: CancellationToken,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn spawn_http_receiver(
    sink: Arc<dyn RecordSink + Send + Sync>,
    config: HttpReceiverConfig,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(GatewayStats::default());
    let receiver = HttpReceiver::new(Arc::new(config), sink).with_stats(stats.clone());
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move { receiver.serve(listener, token).await.unwrap() });
    TestServer {
        addr,
        stats,
        cancel,
    }
}

pub async fn spawn_grpc_receiver(sink: Arc<dyn RecordSink + Send + Sync>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(GatewayStats::default());
    let receiver = GrpcReceiver::new(Arc::new(GrpcReceiverConfig::default()), sink)
        .with_stats(stats.clone());
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move { receiver.serve(listener, token).await.unwrap() });
    TestServer {
        addr,
        stats,
        cancel,
    }
}

/// Plain client that ignores any proxy configured in the environment.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn fixture(name: &str) -> String {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read {path}: {e}"))
}
