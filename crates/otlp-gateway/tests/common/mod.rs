// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared sinks, fixtures and server helpers for the integration tests

#![allow(dead_code)]

pub mod helpers;
