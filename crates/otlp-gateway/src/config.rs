// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 4318;
pub const DEFAULT_GRPC_PORT: u16 = 4317;
pub const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1024 * 1024; // 10MB in Bytes
pub const DEFAULT_HTTP_ENDPOINT: &str = "http://127.0.0.1:4318";
pub const DEFAULT_GRPC_ENDPOINT: &str = "127.0.0.1:4317";
pub const DEFAULT_RETRYABLE_RESPONSE_CODES: [u16; 4] = [429, 502, 503, 504];
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_METRIC_NAME_PREFIX: &str = "otlp_gateway_";

const ENV_PREFIX: &str = "OTLP_GATEWAY_";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
    #[error("unknown exporter {0:?}, expected \"http\" or \"grpc\"")]
    UnknownExporter(String),
    #[error("at least one receiver must be enabled")]
    NoReceiver,
    #[error("{0} port must not be 0")]
    ZeroPort(&'static str),
    #[error("unsupported TLS version {0:?}, supported: [TLSv1_2, TLSv1_3]")]
    UnsupportedTlsVersion(String),
    #[error("TLS min_version is greater than max_version")]
    TlsVersionRange,
    #[error("TLS cert_path and private_key_path must be set together")]
    IncompleteClientIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    Text,
    Gzip,
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Compression::Text),
            "gzip" => Ok(Compression::Gzip),
            other => Err(ConfigError::InvalidValue {
                name: "compress".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLSv1_2" => Ok(TlsVersion::Tls12),
            "TLSv1_3" => Ok(TlsVersion::Tls13),
            other => Err(ConfigError::UnsupportedTlsVersion(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tls,
}

/// Client TLS settings of the HTTP exporter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    /// `None` means plain TCP.
    pub protocol: Option<TransportProtocol>,
    pub cert_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub private_key_passphrase: Option<String>,
    pub ca_path: Option<PathBuf>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    /// Skip server certificate verification.
    pub insecure: bool,
}

impl TransportConfig {
    pub fn is_tls(&self) -> bool {
        self.protocol == Some(TransportProtocol::Tls)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(ConfigError::TlsVersionRange);
            }
        }
        if self.is_tls() && self.cert_path.is_some() != self.private_key_path.is_some() {
            return Err(ConfigError::IncompleteClientIdentity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReceiverConfig {
    pub bind: String,
    pub port: u16,
    pub max_request_content_length: usize,
}

impl HttpReceiverConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for HttpReceiverConfig {
    fn default() -> Self {
        HttpReceiverConfig {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_HTTP_PORT,
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcReceiverConfig {
    pub bind: String,
    pub port: u16,
}

impl GrpcReceiverConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for GrpcReceiverConfig {
    fn default() -> Self {
        GrpcReceiverConfig {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_GRPC_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpExporterConfig {
    /// Base URL; the signal path (`/v1/logs`, ...) is appended per request.
    pub endpoint: String,
    pub proxy: Option<String>,
    /// Treat non-retryable error responses other than 400 as unrecoverable
    /// instead of logging and dropping the record.
    pub error_response_as_unrecoverable: bool,
    pub retryable_response_codes: Vec<u16>,
    pub compress: Compression,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub connect_timeout: Duration,
    pub transport: TransportConfig,
}

impl Default for HttpExporterConfig {
    fn default() -> Self {
        HttpExporterConfig {
            endpoint: DEFAULT_HTTP_ENDPOINT.to_string(),
            proxy: None,
            error_response_as_unrecoverable: true,
            retryable_response_codes: DEFAULT_RETRYABLE_RESPONSE_CODES.to_vec(),
            compress: Compression::Text,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcExporterConfig {
    /// `host:port`, or a full `http://` URI.
    pub endpoint: String,
    pub compress: Compression,
    pub timeout: Duration,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for GrpcExporterConfig {
    fn default() -> Self {
        GrpcExporterConfig {
            endpoint: DEFAULT_GRPC_ENDPOINT.to_string(),
            compress: Compression::Text,
            timeout: Duration::from_secs(60),
            keepalive_time: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterConfig {
    Http(HttpExporterConfig),
    Grpc(GrpcExporterConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub http_receiver: Option<HttpReceiverConfig>,
    pub grpc_receiver: Option<GrpcReceiverConfig>,
    pub exporter: ExporterConfig,
    /// how often to emit the gateway's own metrics, `None` disables them
    pub metrics_interval: Option<Duration>,
    pub metric_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_receiver: Some(HttpReceiverConfig::default()),
            grpc_receiver: Some(GrpcReceiverConfig::default()),
            exporter: ExporterConfig::Http(HttpExporterConfig::default()),
            metrics_interval: Some(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS)),
            metric_name_prefix: DEFAULT_METRIC_NAME_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Reads `OTLP_GATEWAY_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Config, ConfigError> {
        let http_receiver = if env_parse("HTTP_ENABLED")?.unwrap_or(true) {
            let defaults = HttpReceiverConfig::default();
            Some(HttpReceiverConfig {
                bind: env_string("HTTP_BIND").unwrap_or(defaults.bind),
                port: env_parse("HTTP_PORT")?.unwrap_or(defaults.port),
                max_request_content_length: env_parse("MAX_REQUEST_CONTENT_LENGTH")?
                    .unwrap_or(defaults.max_request_content_length),
            })
        } else {
            None
        };

        let grpc_receiver = if env_parse("GRPC_ENABLED")?.unwrap_or(true) {
            let defaults = GrpcReceiverConfig::default();
            Some(GrpcReceiverConfig {
                bind: env_string("GRPC_BIND").unwrap_or(defaults.bind),
                port: env_parse("GRPC_PORT")?.unwrap_or(defaults.port),
            })
        } else {
            None
        };

        let exporter = match env_string("EXPORTER").as_deref().unwrap_or("http") {
            "http" => ExporterConfig::Http(http_exporter_from_env()?),
            "grpc" => ExporterConfig::Grpc(grpc_exporter_from_env()?),
            other => return Err(ConfigError::UnknownExporter(other.to_string())),
        };

        let metrics_interval_secs: u64 =
            env_parse("METRICS_INTERVAL_SECS")?.unwrap_or(DEFAULT_METRICS_INTERVAL_SECS);

        let config = Config {
            http_receiver,
            grpc_receiver,
            exporter,
            metrics_interval: (metrics_interval_secs > 0)
                .then(|| Duration::from_secs(metrics_interval_secs)),
            metric_name_prefix: env_string("METRICS_PREFIX")
                .unwrap_or_else(|| DEFAULT_METRIC_NAME_PREFIX.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_receiver.is_none() && self.grpc_receiver.is_none() {
            return Err(ConfigError::NoReceiver);
        }
        if self.http_receiver.as_ref().is_some_and(|c| c.port == 0) {
            return Err(ConfigError::ZeroPort("HTTP receiver"));
        }
        if self.grpc_receiver.as_ref().is_some_and(|c| c.port == 0) {
            return Err(ConfigError::ZeroPort("gRPC receiver"));
        }
        if let ExporterConfig::Http(http) = &self.exporter {
            http.transport.validate()?;
        }
        Ok(())
    }
}

fn http_exporter_from_env() -> Result<HttpExporterConfig, ConfigError> {
    let defaults = HttpExporterConfig::default();
    let transport = TransportConfig {
        protocol: env_parse::<bool>("TLS")?
            .unwrap_or(false)
            .then_some(TransportProtocol::Tls),
        cert_path: env_string("TLS_CERT_PATH").map(PathBuf::from),
        private_key_path: env_string("TLS_PRIVATE_KEY_PATH").map(PathBuf::from),
        private_key_passphrase: env_string("TLS_PRIVATE_KEY_PASSPHRASE"),
        ca_path: env_string("TLS_CA_PATH").map(PathBuf::from),
        min_version: env_parse("TLS_MIN_VERSION")?,
        max_version: env_parse("TLS_MAX_VERSION")?,
        insecure: env_parse("TLS_INSECURE")?.unwrap_or(false),
    };
    let retryable_response_codes = match env_string("RETRYABLE_RESPONSE_CODES") {
        Some(codes) => parse_status_codes(&codes)?,
        None => defaults.retryable_response_codes,
    };

    Ok(HttpExporterConfig {
        endpoint: env_string("HTTP_ENDPOINT").unwrap_or(defaults.endpoint),
        proxy: env_string("HTTP_PROXY")
            .or_else(|| env::var("HTTP_PROXY").ok())
            .or_else(|| env::var("http_proxy").ok()),
        error_response_as_unrecoverable: env_parse("ERROR_RESPONSE_AS_UNRECOVERABLE")?
            .unwrap_or(defaults.error_response_as_unrecoverable),
        retryable_response_codes,
        compress: env_parse("HTTP_COMPRESS")?.unwrap_or(defaults.compress),
        read_timeout: env_secs("READ_TIMEOUT_SECS")?.unwrap_or(defaults.read_timeout),
        write_timeout: env_secs("WRITE_TIMEOUT_SECS")?.unwrap_or(defaults.write_timeout),
        connect_timeout: env_secs("CONNECT_TIMEOUT_SECS")?.unwrap_or(defaults.connect_timeout),
        transport,
    })
}

fn grpc_exporter_from_env() -> Result<GrpcExporterConfig, ConfigError> {
    let defaults = GrpcExporterConfig::default();
    Ok(GrpcExporterConfig {
        endpoint: env_string("GRPC_ENDPOINT").unwrap_or(defaults.endpoint),
        compress: env_parse("GRPC_COMPRESS")?.unwrap_or(defaults.compress),
        timeout: env_secs("GRPC_TIMEOUT_SECS")?.unwrap_or(defaults.timeout),
        keepalive_time: env_secs("GRPC_KEEPALIVE_TIME_SECS")?.unwrap_or(defaults.keepalive_time),
        keepalive_timeout: env_secs("GRPC_KEEPALIVE_TIMEOUT_SECS")?
            .unwrap_or(defaults.keepalive_timeout),
    })
}

fn parse_status_codes(codes: &str) -> Result<Vec<u16>, ConfigError> {
    codes
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| {
            code.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                name: format!("{ENV_PREFIX}RETRYABLE_RESPONSE_CODES"),
                value: codes.to_string(),
            })
        })
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    env_string(name)
        .map(|value| {
            value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                name: format!("{ENV_PREFIX}{name}"),
                value,
            })
        })
        .transpose()
}

fn env_secs(name: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}
