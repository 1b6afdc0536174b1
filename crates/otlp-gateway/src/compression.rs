// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("gzip stream is invalid: {0}")]
    Invalid(#[from] std::io::Error),
    #[error("decompressed body exceeds {0} bytes")]
    TooLarge(usize),
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflates a gzip body, failing once the output would exceed `limit` bytes.
pub fn gunzip(bytes: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
    let mut decompressed = Vec::new();
    GzDecoder::new(bytes)
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut decompressed)?;
    if decompressed.len() > limit {
        return Err(CompressionError::TooLarge(limit));
    }
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let body = br#"{"resourceLogs":[]}"#;
        let compressed = gzip(body).unwrap();
        assert_ne!(compressed.as_slice(), body.as_slice());
        assert_eq!(gunzip(&compressed, 1024).unwrap(), body);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        assert!(matches!(
            gunzip(b"not gzip at all", 1024),
            Err(CompressionError::Invalid(_))
        ));
    }

    #[test]
    fn test_gunzip_enforces_limit() {
        let compressed = gzip(&vec![b'a'; 4096]).unwrap();
        assert!(matches!(
            gunzip(&compressed, 4095),
            Err(CompressionError::TooLarge(4095))
        ));
        assert_eq!(gunzip(&compressed, 4096).unwrap().len(), 4096);
    }

    #[test]
    fn test_gunzip_without_effective_limit() {
        let compressed = gzip(&vec![b'a'; 4096]).unwrap();
        assert_eq!(gunzip(&compressed, usize::MAX).unwrap().len(), 4096);
    }
}
