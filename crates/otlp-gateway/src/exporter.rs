// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outcome taxonomy shared by the HTTP and gRPC exporters.

use tonic::Code;
use tracing::error;

use crate::config::HttpExporterConfig;

/// Result of one delivery attempt to the remote collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressOutcome {
    Success,
    /// Never retry: the record or the request itself is at fault.
    Fatal(String),
    /// Transient failure, the whole record may be sent again later.
    Retryable(String),
    /// Logged at error level and dropped, the caller sees a success.
    LoggedWarning(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExportError {
    #[error("{0}")]
    Unrecoverable(String),
    #[error("{0}")]
    Retryable(String),
}

impl ExportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExportError::Retryable(_))
    }
}

impl EgressOutcome {
    /// Converts the outcome into what the pipeline sees. `LoggedWarning` is
    /// logged here, exactly once, and swallowed.
    pub fn into_result(self) -> Result<(), ExportError> {
        match self {
            EgressOutcome::Success => Ok(()),
            EgressOutcome::Fatal(reason) => Err(ExportError::Unrecoverable(reason)),
            EgressOutcome::Retryable(reason) => Err(ExportError::Retryable(reason)),
            EgressOutcome::LoggedWarning(reason) => {
                error!("{reason}");
                Ok(())
            }
        }
    }
}

pub fn classify_http_status(status: u16, config: &HttpExporterConfig, url: &str) -> EgressOutcome {
    if (200..300).contains(&status) {
        return EgressOutcome::Success;
    }
    if status == 400 {
        return EgressOutcome::Fatal(format!(
            "got unrecoverable error response from '{url}', response code is {status}"
        ));
    }
    if config.retryable_response_codes.contains(&status) {
        return EgressOutcome::Retryable(format!(
            "got retryable error response from '{url}', response code is {status}"
        ));
    }
    if config.error_response_as_unrecoverable {
        EgressOutcome::Fatal(format!(
            "got unrecoverable error response from '{url}', response code is {status}"
        ))
    } else {
        EgressOutcome::LoggedWarning(format!(
            "got error response from '{url}', response code is {status}"
        ))
    }
}

/// gRPC codes the OTLP protocol lists as retryable. Connection failures
/// surface as `Unavailable` and therefore retry as well.
const RETRYABLE_GRPC_CODES: [Code; 7] = [
    Code::Cancelled,
    Code::DeadlineExceeded,
    Code::ResourceExhausted,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unavailable,
    Code::DataLoss,
];

pub fn classify_grpc_status(status: &tonic::Status, endpoint: &str) -> EgressOutcome {
    let code = status.code();
    if code == Code::Ok {
        return EgressOutcome::Success;
    }
    if RETRYABLE_GRPC_CODES.contains(&code) {
        EgressOutcome::Retryable(format!(
            "got retryable error status from '{endpoint}', status is {code:?}: {}",
            status.message()
        ))
    } else {
        EgressOutcome::Fatal(format!(
            "got unrecoverable error status from '{endpoint}', status is {code:?}: {}",
            status.message()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplicate::duplicate_item;
    use tracing_test::traced_test;

    const URL: &str = "http://collector:4318/v1/logs";

    fn config(error_response_as_unrecoverable: bool) -> HttpExporterConfig {
        HttpExporterConfig {
            error_response_as_unrecoverable,
            ..Default::default()
        }
    }

    #[duplicate_item(
        test_name                               status  unrecoverable   expected;
        [test_http_200_is_success]              [200]   [true]          [EgressOutcome::Success];
        [test_http_202_is_success]              [202]   [true]          [EgressOutcome::Success];
        [test_http_400_is_fatal]                [400]   [false]         [EgressOutcome::Fatal(format!("got unrecoverable error response from '{URL}', response code is 400"))];
        [test_http_429_is_retryable]            [429]   [true]          [EgressOutcome::Retryable(format!("got retryable error response from '{URL}', response code is 429"))];
        [test_http_503_is_retryable]            [503]   [false]         [EgressOutcome::Retryable(format!("got retryable error response from '{URL}', response code is 503"))];
        [test_http_500_is_fatal_by_default]     [500]   [true]          [EgressOutcome::Fatal(format!("got unrecoverable error response from '{URL}', response code is 500"))];
        [test_http_500_is_logged_when_allowed]  [500]   [false]         [EgressOutcome::LoggedWarning(format!("got error response from '{URL}', response code is 500"))];
        [test_http_404_is_logged_when_allowed]  [404]   [false]         [EgressOutcome::LoggedWarning(format!("got error response from '{URL}', response code is 404"))];
    )]
    #[test]
    fn test_name() {
        assert_eq!(
            classify_http_status(status, &config(unrecoverable), URL),
            expected
        );
    }

    #[test]
    fn test_custom_retryable_codes() {
        let config = HttpExporterConfig {
            retryable_response_codes: vec![500],
            ..Default::default()
        };
        assert!(matches!(
            classify_http_status(500, &config, URL),
            EgressOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify_http_status(503, &config, URL),
            EgressOutcome::Fatal(_)
        ));
    }

    #[duplicate_item(
        test_name                           code                        retryable;
        [test_grpc_unavailable]             [Code::Unavailable]         [true];
        [test_grpc_deadline_exceeded]       [Code::DeadlineExceeded]    [true];
        [test_grpc_resource_exhausted]      [Code::ResourceExhausted]   [true];
        [test_grpc_invalid_argument]        [Code::InvalidArgument]     [false];
        [test_grpc_unimplemented]           [Code::Unimplemented]       [false];
        [test_grpc_internal]                [Code::Internal]            [false];
    )]
    #[test]
    fn test_name() {
        let outcome = classify_grpc_status(&tonic::Status::new(code, "boom"), "127.0.0.1:4317");
        let result = outcome.into_result();
        assert_eq!(result.unwrap_err().is_retryable(), retryable);
    }

    #[test]
    fn test_grpc_ok_is_success() {
        assert_eq!(
            classify_grpc_status(&tonic::Status::new(Code::Ok, ""), "127.0.0.1:4317"),
            EgressOutcome::Success
        );
    }

    #[test]
    #[traced_test]
    fn test_logged_warning_is_swallowed_and_logged() {
        let outcome = classify_http_status(500, &config(false), URL);
        assert_eq!(outcome.into_result(), Ok(()));
        assert!(logs_contain(
            "got error response from 'http://collector:4318/v1/logs', response code is 500"
        ));
    }

    #[test]
    fn test_fatal_and_retryable_propagate() {
        let fatal = EgressOutcome::Fatal("bad".to_string()).into_result();
        assert_eq!(fatal, Err(ExportError::Unrecoverable("bad".to_string())));
        assert!(!fatal.unwrap_err().is_retryable());

        let retry = EgressOutcome::Retryable("later".to_string()).into_result();
        assert!(retry.unwrap_err().is_retryable());
    }
}
