// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::codec::{Encoding, ExportRequest, PROTOBUF_CONTENT_TYPE};
use crate::compression::gzip;
use crate::config::{Compression, HttpExporterConfig, TlsVersion, TransportConfig};
use crate::exporter::{classify_http_status, EgressOutcome, ExportError};
use crate::pipeline::{Record, RecordExporter};
use crate::self_metrics::GatewayStats;
use crate::signal::PerSignal;

#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("encrypted private keys are not supported, provide the key unencrypted")]
    EncryptedPrivateKey,
    #[error("failed to build HTTP client: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// Posts records as protobuf to `{endpoint}/v1/{logs,metrics,traces}`.
pub struct HttpExporter {
    pub config: Arc<HttpExporterConfig>,
    clients: PerSignal<reqwest::Client>,
    urls: PerSignal<String>,
    stats: Arc<GatewayStats>,
}

impl HttpExporter {
    pub fn new(config: Arc<HttpExporterConfig>) -> Result<Self, ClientBuildError> {
        // one connection pool per signal kind
        let clients = PerSignal::try_from_fn(|_| build_client(&config))?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let urls = PerSignal::from_fn(|kind| format!("{endpoint}{}", kind.path()));
        Ok(HttpExporter {
            config,
            clients,
            urls,
            stats: Arc::new(GatewayStats::default()),
        })
    }

    pub fn with_stats(mut self, stats: Arc<GatewayStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn urls(&self) -> &PerSignal<String> {
        &self.urls
    }

    /// Sends one record and classifies what happened.
    pub async fn send(&self, record: &Record) -> EgressOutcome {
        let kind = record.kind;
        let url = self.urls.get(kind);

        let request = match ExportRequest::from_record(record) {
            Ok(request) => request,
            Err(e) => return EgressOutcome::Fatal(format!("malformed {kind} record: {e}")),
        };
        let mut builder = self
            .clients
            .get(kind)
            .post(url)
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE);
        let body = request.encode(Encoding::Protobuf);
        let body = match self.config.compress {
            Compression::Gzip => match gzip(&body) {
                Ok(compressed) => {
                    builder = builder.header(CONTENT_ENCODING, "gzip");
                    compressed
                }
                Err(e) => {
                    return EgressOutcome::Fatal(format!("failed to compress {kind} record: {e}"))
                }
            },
            Compression::Text => body,
        };

        let response = match builder.body(body).send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return EgressOutcome::Fatal(format!("invalid request to '{url}': {e}"));
            }
            Err(e) => {
                return EgressOutcome::Retryable(format!("failed to send {kind} to '{url}': {e}"));
            }
        };

        let status = response.status().as_u16();
        // drain the body so the connection goes back to the pool
        if let Err(e) = response.bytes().await {
            debug!("Failed to read response body from '{url}': {e}");
        }
        classify_http_status(status, &self.config, url)
    }
}

#[async_trait]
impl RecordExporter for HttpExporter {
    async fn export(&self, record: &Record) -> Result<(), ExportError> {
        let outcome = self.send(record).await;
        self.stats.record_outcome(&outcome);
        outcome.into_result()
    }
}

/// Builds a reqwest client with the exporter's proxy, timeouts and TLS settings.
pub fn build_client(config: &HttpExporterConfig) -> Result<reqwest::Client, ClientBuildError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .timeout(config.read_timeout + config.write_timeout);

    builder = match config.proxy.as_deref() {
        Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
        None => builder.no_proxy(),
    };

    if config.transport.is_tls() {
        builder = apply_tls(builder, &config.transport)?;
    }
    Ok(builder.build()?)
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    transport: &TransportConfig,
) -> Result<reqwest::ClientBuilder, ClientBuildError> {
    if let (Some(cert_path), Some(key_path)) = (&transport.cert_path, &transport.private_key_path)
    {
        let mut pem = read_file(cert_path)?;
        let key = read_file(key_path)?;
        if is_encrypted_key(&key) {
            return Err(ClientBuildError::EncryptedPrivateKey);
        }
        if transport.private_key_passphrase.is_some() {
            warn!("Private key is not encrypted, ignoring the configured passphrase");
        }
        pem.push(b'\n');
        pem.extend_from_slice(&key);
        builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
    }
    if let Some(ca_path) = &transport.ca_path {
        let ca = reqwest::Certificate::from_pem(&read_file(ca_path)?)?;
        builder = builder.add_root_certificate(ca);
    }
    if let Some(min) = transport.min_version {
        builder = builder.min_tls_version(tls_version(min));
    }
    if let Some(max) = transport.max_version {
        builder = builder.max_tls_version(tls_version(max));
    }
    if transport.insecure {
        warn!("TLS certificate verification is disabled for the HTTP exporter");
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder)
}

fn tls_version(version: TlsVersion) -> reqwest::tls::Version {
    match version {
        TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
        TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ClientBuildError> {
    std::fs::read(path).map_err(|source| ClientBuildError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn is_encrypted_key(pem: &[u8]) -> bool {
    let pem = String::from_utf8_lossy(pem);
    pem.contains("ENCRYPTED PRIVATE KEY") || pem.contains("Proc-Type: 4,ENCRYPTED")
}
