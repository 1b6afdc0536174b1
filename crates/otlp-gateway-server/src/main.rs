// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use anyhow::Context;
use tokio::{
    sync::mpsc::{self, Receiver},
    task::JoinSet,
    time::{interval, sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use otlp_gateway::{
    config::{Config, ExporterConfig},
    grpc_exporter::GrpcExporter,
    grpc_receiver::GrpcReceiver,
    http_exporter::HttpExporter,
    http_receiver::HttpReceiver,
    pipeline::{Record, RecordExporter},
    self_metrics::{GatewayStats, MetricsSnapshot},
};

const RECORD_CHANNEL_BUFFER_SIZE: usize = 100;
const EXPORT_MAX_ATTEMPTS: u32 = 3;
const EXPORT_RETRY_BACKOFF_BASE_MS: u64 = 100;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("OTLP_GATEWAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,tower=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on OTLP gateway startup: {e}");
            return;
        }
    };

    if let Err(e) = run(config).await {
        error!("OTLP gateway stopped: {e:#}");
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let stats = Arc::new(GatewayStats::default());

    let exporter: Arc<dyn RecordExporter + Send + Sync> = match config.exporter {
        ExporterConfig::Http(http) => {
            info!("Exporting to {} over HTTP", http.endpoint);
            Arc::new(
                HttpExporter::new(Arc::new(http))
                    .context("failed to build the HTTP exporter")?
                    .with_stats(stats.clone()),
            )
        }
        ExporterConfig::Grpc(grpc) => {
            info!("Exporting to {} over gRPC", grpc.endpoint);
            Arc::new(
                GrpcExporter::new(Arc::new(grpc))
                    .context("failed to build the gRPC exporter")?
                    .with_stats(stats.clone()),
            )
        }
    };

    let (record_tx, record_rx) = mpsc::channel::<Record>(RECORD_CHANNEL_BUFFER_SIZE);
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if let Some(http) = config.http_receiver {
        let receiver =
            HttpReceiver::new(Arc::new(http), Arc::new(record_tx.clone())).with_stats(stats.clone());
        let cancel = shutdown.child_token();
        tasks.spawn(async move {
            if let Err(e) = receiver.start(cancel).await {
                error!("OTLP HTTP receiver failed: {e}");
            }
        });
    }

    if let Some(grpc) = config.grpc_receiver {
        let receiver =
            GrpcReceiver::new(Arc::new(grpc), Arc::new(record_tx.clone())).with_stats(stats.clone());
        let cancel = shutdown.child_token();
        tasks.spawn(async move {
            if let Err(e) = receiver.start(cancel).await {
                error!("OTLP gRPC receiver failed: {e}");
            }
        });
    }

    if let Some(period) = config.metrics_interval {
        let snapshot = MetricsSnapshot::new(stats.clone(), config.metric_name_prefix);
        let record_tx = record_tx.clone();
        let cancel = shutdown.child_token();
        tasks.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // discard first tick, which is instantaneous
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match snapshot.record() {
                    Ok(record) => {
                        if record_tx.send(record).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => error!("Failed to build the gateway metrics snapshot: {e}"),
                }
            }
        });
    }

    // receivers and the metrics task own the remaining senders
    drop(record_tx);
    let forwarder = tokio::spawn(forward_records(record_rx, exporter));

    wait_for_shutdown_signal().await;
    info!("Shutting down OTLP gateway");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    forwarder.await.context("record forwarder panicked")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => error!("Unable to listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {e}");
    }
}

/// Drains the record channel until every sender is gone.
async fn forward_records(
    mut rx: Receiver<Record>,
    exporter: Arc<dyn RecordExporter + Send + Sync>,
) {
    while let Some(record) = rx.recv().await {
        export_with_retry(exporter.as_ref(), &record).await;
    }
    debug!("Record forwarder stopped");
}

async fn export_with_retry(exporter: &(dyn RecordExporter + Send + Sync), record: &Record) {
    let mut attempts = 0;

    loop {
        attempts += 1;

        match exporter.export(record).await {
            Ok(()) => {
                debug!("Exported {} record", record.kind);
                return;
            }
            Err(e) if e.is_retryable() && attempts < EXPORT_MAX_ATTEMPTS => {
                let backoff_ms = EXPORT_RETRY_BACKOFF_BASE_MS * 2u64.pow(attempts - 1);
                debug!(
                    "Export attempt {attempts} for {} failed, retrying in {backoff_ms} ms: {e}",
                    record.kind
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => {
                error!(
                    "Dropping {} record after {attempts} attempt(s): {e}",
                    record.kind
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use otlp_gateway::exporter::ExportError;
    use otlp_gateway::signal::SignalKind;
    use std::sync::Mutex;

    /// Replays the given results, then succeeds.
    struct ScriptedExporter {
        results: Mutex<Vec<Result<(), ExportError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedExporter {
        fn new(mut results: Vec<Result<(), ExportError>>) -> Self {
            results.reverse();
            ScriptedExporter {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RecordExporter for ScriptedExporter {
        async fn export(&self, _record: &Record) -> Result<(), ExportError> {
            *self.calls.lock().unwrap() += 1;
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    fn record() -> Record {
        Record::new(SignalKind::Logs, "{\"resourceLogs\":[]}")
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let exporter = ScriptedExporter::new(vec![
            Err(ExportError::Retryable("503".to_string())),
            Err(ExportError::Retryable("503".to_string())),
        ]);
        export_with_retry(&exporter, &record()).await;
        assert_eq!(exporter.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let exporter = ScriptedExporter::new(vec![
            Err(ExportError::Retryable("503".to_string())),
            Err(ExportError::Retryable("503".to_string())),
            Err(ExportError::Retryable("503".to_string())),
            Err(ExportError::Retryable("503".to_string())),
        ]);
        export_with_retry(&exporter, &record()).await;
        assert_eq!(exporter.calls(), EXPORT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_unrecoverable_errors_are_not_retried() {
        let exporter = ScriptedExporter::new(vec![Err(ExportError::Unrecoverable(
            "400".to_string(),
        ))]);
        export_with_retry(&exporter, &record()).await;
        assert_eq!(exporter.calls(), 1);
    }

    #[tokio::test]
    async fn test_forwarder_drains_channel() {
        let exporter = Arc::new(ScriptedExporter::new(vec![]));
        let (tx, rx) = mpsc::channel(4);
        tx.send(record()).await.unwrap();
        tx.send(record()).await.unwrap();
        drop(tx);
        forward_records(rx, exporter.clone()).await;
        assert_eq!(exporter.calls(), 2);
    }
}
