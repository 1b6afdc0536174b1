// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP gateway core: receives OTLP export requests over HTTP and gRPC,
//! hands them to a pipeline as JSON records, and delivers records from the
//! pipeline to a remote collector over HTTP or gRPC.
//!
//! Ingress: [`http_receiver`], [`grpc_receiver`] -> [`codec`] -> [`pipeline::RecordSink`].
//! Egress: [`pipeline::RecordExporter`] -> [`http_exporter`] / [`grpc_exporter`],
//! with outcomes classified in [`exporter`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod codec;
pub mod compression;
pub mod config;
pub mod exporter;
pub mod grpc_exporter;
pub mod grpc_receiver;
pub mod http_exporter;
pub mod http_receiver;
pub mod http_utils;
pub mod pipeline;
pub mod response;
pub mod self_metrics;
pub mod signal;
