// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Swarm Wire Codec
//
// JSON encode/decode for every domain object that crosses the ISL:
// - SwarmMessage envelopes and MessageAck frames
// - HealthSummary payloads, with an optional LZ4 pass behind a 1-byte marker
// - SwarmConfig distribution payloads
//
// With `validate` enabled, decoded objects re-run their constructor
// invariants so a corrupted or hostile payload never becomes a live domain
// value. Decode failures are errors; a partially decoded object is never
// returned.

use serde::Serialize;
use tracing::debug;

use crate::domain::config::SwarmConfig;
use crate::domain::health::HealthSummary;
use crate::domain::message::{MessageAck, SwarmMessage};

/// Marker byte prefixed to health payloads: plain JSON follows.
const MARKER_PLAIN: u8 = 0;
/// Marker byte prefixed to health payloads: LZ4 block (size-prepended)
/// follows.
const MARKER_LZ4: u8 = 1;

/// Per-call size accounting for the stats sink.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PayloadSizes {
    pub original_bytes: usize,
    pub encoded_bytes: usize,
    pub ratio: f64,
}

#[derive(Debug, Clone)]
pub struct SwarmSerializer {
    validate: bool,
}

impl SwarmSerializer {
    pub fn new(validate: bool) -> Self {
        Self { validate }
    }

    pub fn validating(&self) -> bool {
        self.validate
    }

    /// Encode a health summary, optionally compressing the JSON body.
    /// The first byte records whether compression was applied; the LZ4 pass
    /// is kept only when it actually shrinks the body.
    pub fn serialize_health(
        &self,
        summary: &HealthSummary,
        compress: bool,
    ) -> Result<Vec<u8>, CodecError> {
        if self.validate {
            summary
                .validate()
                .map_err(|e| CodecError::Validation(e.to_string()))?;
        }
        let body = serde_json::to_vec(summary).map_err(CodecError::Encode)?;
        if compress {
            let packed = lz4_flex::compress_prepend_size(&body);
            if packed.len() < body.len() {
                debug!(
                    original = body.len(),
                    compressed = packed.len(),
                    "health payload compressed"
                );
                let mut framed = Vec::with_capacity(packed.len() + 1);
                framed.push(MARKER_LZ4);
                framed.extend_from_slice(&packed);
                return Ok(framed);
            }
        }
        let mut framed = Vec::with_capacity(body.len() + 1);
        framed.push(MARKER_PLAIN);
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    pub fn deserialize_health(&self, raw: &[u8]) -> Result<HealthSummary, CodecError> {
        let (marker, body) = raw.split_first().ok_or(CodecError::Empty)?;
        let json = match *marker {
            MARKER_PLAIN => body.to_vec(),
            MARKER_LZ4 => lz4_flex::decompress_size_prepended(body)
                .map_err(|e| CodecError::Decompress(e.to_string()))?,
            other => return Err(CodecError::UnknownMarker(other)),
        };
        let summary: HealthSummary =
            serde_json::from_slice(&json).map_err(CodecError::Decode)?;
        if self.validate {
            summary
                .validate()
                .map_err(|e| CodecError::Validation(e.to_string()))?;
        }
        Ok(summary)
    }

    pub fn serialize_config(&self, config: &SwarmConfig) -> Result<Vec<u8>, CodecError> {
        if self.validate {
            config
                .validate()
                .map_err(|e| CodecError::Validation(e.to_string()))?;
        }
        serde_json::to_vec(config).map_err(CodecError::Encode)
    }

    pub fn deserialize_config(&self, raw: &[u8]) -> Result<SwarmConfig, CodecError> {
        let config: SwarmConfig = serde_json::from_slice(raw).map_err(CodecError::Decode)?;
        if self.validate {
            config
                .validate()
                .map_err(|e| CodecError::Validation(e.to_string()))?;
        }
        Ok(config)
    }

    pub fn encode_envelope(&self, message: &SwarmMessage) -> Result<Vec<u8>, CodecError> {
        if self.validate {
            message
                .validate()
                .map_err(|e| CodecError::Validation(e.to_string()))?;
        }
        serde_json::to_vec(message).map_err(CodecError::Encode)
    }

    pub fn decode_envelope(&self, raw: &[u8]) -> Result<SwarmMessage, CodecError> {
        let message: SwarmMessage =
            serde_json::from_slice(raw).map_err(CodecError::Decode)?;
        if self.validate {
            message
                .validate()
                .map_err(|e| CodecError::Validation(e.to_string()))?;
        }
        Ok(message)
    }

    pub fn encode_ack(&self, ack: &MessageAck) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(ack).map_err(CodecError::Encode)
    }

    pub fn decode_ack(&self, raw: &[u8]) -> Result<MessageAck, CodecError> {
        serde_json::from_slice(raw).map_err(CodecError::Decode)
    }

    pub fn payload_sizes(original_bytes: usize, encoded_bytes: usize) -> PayloadSizes {
        let ratio = if original_bytes == 0 {
            1.0
        } else {
            encoded_bytes as f64 / original_bytes as f64
        };
        PayloadSizes {
            original_bytes,
            encoded_bytes,
            ratio,
        }
    }
}

impl Default for SwarmSerializer {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to decompress payload: {0}")]
    Decompress(String),

    #[error("decoded value failed validation: {0}")]
    Validation(String),

    #[error("payload is empty")]
    Empty,

    #[error("unknown compression marker byte {0}")]
    UnknownMarker(u8),
}
