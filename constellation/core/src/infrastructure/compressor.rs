// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lossy Health-State Compressor
//!
//! Encodes a [`HealthSummary`] into a compact binary frame for the ISL:
//!
//! ```text
//! byte 0   version (currently 1)
//! byte 1   flags: bit0 = LZ4 pass applied, bit1 = delta-encoded body
//! byte 2+  body (LZ4 block with prepended size when bit0 is set)
//! ```
//!
//! Full body: `risk` quantized to u8 over `[0,1]`, `recurrence` quantized to
//! u16 over `[0,10]`, timestamp as i64 milliseconds, then the 32-element
//! signature quantized to u8 over `[-1,1]` (reconstruction error < 0.01).
//!
//! Delta body: the scalar fields as above, then a 4-byte changed-element
//! bitmask and only the signature bytes that differ from the reference's
//! quantized grid. The encoder picks delta only when it is no larger than
//! the full body; decoding a delta frame requires the same reference.
//!
//! Out-of-range inputs are clamped, never rejected: this codec sits behind
//! validated domain types and its job is bandwidth, not policing.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::health::{HealthSummary, SIGNATURE_DIMENSIONS};

pub const FRAME_VERSION: u8 = 1;
const FLAG_LZ4: u8 = 0b0000_0001;
const FLAG_DELTA: u8 = 0b0000_0010;

const HEADER_LEN: usize = 2;
/// risk (1) + recurrence (2) + timestamp (8)
const SCALARS_LEN: usize = 11;
const FULL_BODY_LEN: usize = SCALARS_LEN + SIGNATURE_DIMENSIONS;
const MASK_LEN: usize = 4;
const MIN_FRAME_LEN: usize = 4;

const RECURRENCE_SCALE: f64 = 6553.5;

/// Cumulative codec accounting for the stats sink.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CompressionStats {
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    /// Full-frame-equivalent input bytes (what the link would carry with no
    /// delta or secondary pass).
    pub bytes_in: u64,
    /// Bytes actually emitted.
    pub bytes_out: u64,
    pub delta_frames: u64,
    pub lz4_frames: u64,
}

impl CompressionStats {
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }

    pub fn average_encoded_size(&self) -> f64 {
        if self.frames_encoded == 0 {
            0.0
        } else {
            self.bytes_out as f64 / self.frames_encoded as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "frames_encoded": self.frames_encoded,
            "frames_decoded": self.frames_decoded,
            "bytes_in": self.bytes_in,
            "bytes_out": self.bytes_out,
            "delta_frames": self.delta_frames,
            "lz4_frames": self.lz4_frames,
            "ratio": self.ratio(),
            "average_encoded_size": self.average_encoded_size(),
        })
    }
}

#[derive(Debug)]
pub struct StateCompressor {
    use_secondary: bool,
    reference: Option<[u8; SIGNATURE_DIMENSIONS]>,
    stats: CompressionStats,
}

impl StateCompressor {
    pub fn new(use_secondary: bool) -> Self {
        Self {
            use_secondary,
            reference: None,
            stats: CompressionStats::default(),
        }
    }

    /// Install the delta reference. Encoder and decoder must agree on it;
    /// it is the caller's job to only set references both sides have seen.
    pub fn set_reference(&mut self, summary: &HealthSummary) {
        self.reference = Some(quantize_signature(&summary.anomaly_signature));
    }

    pub fn clear_reference(&mut self) {
        self.reference = None;
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    pub fn compress(&mut self, summary: &HealthSummary) -> Result<Vec<u8>, CompressError> {
        let signature_q = quantize_signature(&summary.anomaly_signature);

        let mut body = Vec::with_capacity(FULL_BODY_LEN);
        push_scalars(&mut body, summary);

        let mut flags = 0u8;
        match self.reference {
            Some(reference) => {
                let mut mask = 0u32;
                let mut changed = Vec::new();
                for (i, (new_q, ref_q)) in
                    signature_q.iter().zip(reference.iter()).enumerate()
                {
                    if new_q != ref_q {
                        mask |= 1 << i;
                        changed.push(*new_q);
                    }
                }
                if MASK_LEN + changed.len() <= SIGNATURE_DIMENSIONS {
                    flags |= FLAG_DELTA;
                    body.extend_from_slice(&mask.to_le_bytes());
                    body.extend_from_slice(&changed);
                } else {
                    body.extend_from_slice(&signature_q);
                }
            }
            None => body.extend_from_slice(&signature_q),
        }

        if self.use_secondary {
            let packed = lz4_flex::compress_prepend_size(&body);
            if packed.len() < body.len() {
                flags |= FLAG_LZ4;
                body = packed;
            }
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.push(FRAME_VERSION);
        frame.push(flags);
        frame.extend_from_slice(&body);

        self.stats.frames_encoded += 1;
        self.stats.bytes_in += (HEADER_LEN + FULL_BODY_LEN) as u64;
        self.stats.bytes_out += frame.len() as u64;
        if flags & FLAG_DELTA != 0 {
            self.stats.delta_frames += 1;
        }
        if flags & FLAG_LZ4 != 0 {
            self.stats.lz4_frames += 1;
        }
        Ok(frame)
    }

    pub fn decompress(&mut self, raw: &[u8]) -> Result<HealthSummary, CompressError> {
        if raw.len() < MIN_FRAME_LEN {
            return Err(CompressError::TooShort(raw.len()));
        }
        let version = raw[0];
        if version != FRAME_VERSION {
            return Err(CompressError::UnsupportedVersion(version));
        }
        let flags = raw[1];

        let body: Vec<u8> = if flags & FLAG_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(&raw[HEADER_LEN..])
                .map_err(|e| CompressError::Lz4(e.to_string()))?
        } else {
            raw[HEADER_LEN..].to_vec()
        };

        if body.len() < SCALARS_LEN {
            return Err(CompressError::TruncatedFrame);
        }
        let (risk_score, recurrence_score, timestamp) = read_scalars(&body)?;

        let signature_q: [u8; SIGNATURE_DIMENSIONS] = if flags & FLAG_DELTA != 0 {
            let reference = self.reference.ok_or(CompressError::MissingReference)?;
            if body.len() < SCALARS_LEN + MASK_LEN {
                return Err(CompressError::TruncatedFrame);
            }
            let mask = u32::from_le_bytes(
                body[SCALARS_LEN..SCALARS_LEN + MASK_LEN]
                    .try_into()
                    .map_err(|_| CompressError::TruncatedFrame)?,
            );
            let changed = &body[SCALARS_LEN + MASK_LEN..];
            if changed.len() != mask.count_ones() as usize {
                return Err(CompressError::TruncatedFrame);
            }
            let mut grid = reference;
            let mut next = 0usize;
            for (i, slot) in grid.iter_mut().enumerate() {
                if mask & (1 << i) != 0 {
                    *slot = changed[next];
                    next += 1;
                }
            }
            grid
        } else {
            if body.len() != FULL_BODY_LEN {
                return Err(CompressError::TruncatedFrame);
            }
            body[SCALARS_LEN..]
                .try_into()
                .map_err(|_| CompressError::TruncatedFrame)?
        };

        let anomaly_signature = signature_q
            .iter()
            .map(|&q| (f32::from(q) / 255.0) * 2.0 - 1.0)
            .collect();

        self.stats.frames_decoded += 1;
        Ok(HealthSummary {
            anomaly_signature,
            risk_score,
            recurrence_score,
            timestamp,
        })
    }
}

fn quantize_signature(signature: &[f32]) -> [u8; SIGNATURE_DIMENSIONS] {
    let mut out = [0u8; SIGNATURE_DIMENSIONS];
    for (slot, &v) in out.iter_mut().zip(signature.iter()) {
        *slot = ((v.clamp(-1.0, 1.0) + 1.0) / 2.0 * 255.0).round() as u8;
    }
    out
}

fn push_scalars(body: &mut Vec<u8>, summary: &HealthSummary) {
    let risk_q = (summary.risk_score.clamp(0.0, 1.0) * 255.0).round() as u8;
    let recurrence_q =
        (summary.recurrence_score.clamp(0.0, 10.0) * RECURRENCE_SCALE).round() as u16;
    body.push(risk_q);
    body.extend_from_slice(&recurrence_q.to_le_bytes());
    body.extend_from_slice(&summary.timestamp.timestamp_millis().to_le_bytes());
}

fn read_scalars(body: &[u8]) -> Result<(f64, f64, DateTime<Utc>), CompressError> {
    let risk_score = f64::from(body[0]) / 255.0;
    let recurrence_q = u16::from_le_bytes(
        body[1..3].try_into().map_err(|_| CompressError::TruncatedFrame)?,
    );
    let recurrence_score = f64::from(recurrence_q) / RECURRENCE_SCALE;
    let millis = i64::from_le_bytes(
        body[3..11].try_into().map_err(|_| CompressError::TruncatedFrame)?,
    );
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(CompressError::InvalidTimestamp(millis))?;
    Ok((risk_score, recurrence_score, timestamp))
}

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("frame of {0} bytes is shorter than the 4-byte minimum")]
    TooShort(usize),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("frame body is truncated")]
    TruncatedFrame,

    #[error("delta frame received without a reference summary")]
    MissingReference,

    #[error("secondary decompression failed: {0}")]
    Lz4(String),

    #[error("frame carries an unrepresentable timestamp ({0} ms)")]
    InvalidTimestamp(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(risk: f64, recurrence: f64, signature: Vec<f32>) -> HealthSummary {
        HealthSummary::new(signature, risk, recurrence).unwrap()
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        let mut compressor = StateCompressor::new(true);
        let original = summary(0.53, 3.14, vec![0.1; 32]);
        let frame = compressor.compress(&original).unwrap();
        let back = compressor.decompress(&frame).unwrap();

        assert!((back.risk_score - 0.53).abs() < 0.02);
        assert!((back.recurrence_score - 3.14).abs() < 0.02);
        for (a, b) in back
            .anomaly_signature
            .iter()
            .zip(original.anomaly_signature.iter())
        {
            assert!((a - b).abs() < 0.01);
        }
        assert_eq!(
            back.timestamp.timestamp_millis(),
            original.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn test_varied_signature_round_trip() {
        let mut compressor = StateCompressor::new(true);
        let signature: Vec<f32> = (0..32).map(|i| (i as f32 / 16.0) - 1.0).collect();
        let original = summary(0.99, 9.9, signature);
        let frame = compressor.compress(&original).unwrap();
        let back = compressor.decompress(&frame).unwrap();
        for (a, b) in back
            .anomaly_signature
            .iter()
            .zip(original.anomaly_signature.iter())
        {
            assert!((a - b).abs() < 0.01);
        }
    }

    #[test]
    fn test_out_of_range_inputs_clamp() {
        let mut compressor = StateCompressor::new(false);
        let original = summary(1.0, 10.0, vec![4.0; 32]);
        let frame = compressor.compress(&original).unwrap();
        let back = compressor.decompress(&frame).unwrap();
        assert_eq!(back.risk_score, 1.0);
        for v in &back.anomaly_signature {
            assert_eq!(*v, 1.0);
        }
    }

    #[test]
    fn test_rejects_short_frames() {
        let mut compressor = StateCompressor::new(true);
        assert!(matches!(
            compressor.decompress(&[]).unwrap_err(),
            CompressError::TooShort(0)
        ));
        assert!(matches!(
            compressor.decompress(&[1, 0, 5]).unwrap_err(),
            CompressError::TooShort(3)
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut compressor = StateCompressor::new(true);
        let original = summary(0.5, 1.0, vec![0.0; 32]);
        let mut frame = compressor.compress(&original).unwrap();
        frame[0] = 7;
        assert!(matches!(
            compressor.decompress(&frame).unwrap_err(),
            CompressError::UnsupportedVersion(7)
        ));
    }

    #[test]
    fn test_rejects_truncated_body() {
        let mut compressor = StateCompressor::new(false);
        let original = summary(0.5, 1.0, vec![0.0; 32]);
        let frame = compressor.compress(&original).unwrap();
        assert!(matches!(
            compressor.decompress(&frame[..frame.len() - 5]).unwrap_err(),
            CompressError::TruncatedFrame
        ));
    }

    #[test]
    fn test_delta_frame_is_smaller_and_recovers() {
        let mut encoder = StateCompressor::new(false);
        let mut decoder = StateCompressor::new(false);

        let reference = summary(0.5, 1.0, vec![0.2; 32]);
        encoder.set_reference(&reference);
        decoder.set_reference(&reference);

        let mut drifted_signature = vec![0.2f32; 32];
        drifted_signature[3] = 0.9;
        drifted_signature[17] = -0.4;
        let drifted = summary(0.55, 1.2, drifted_signature);

        let full = StateCompressor::new(false).compress(&drifted).unwrap();
        let delta = encoder.compress(&drifted).unwrap();
        assert!(delta.len() < full.len());
        assert_eq!(delta[1] & FLAG_DELTA, FLAG_DELTA);

        let back = decoder.decompress(&delta).unwrap();
        for (a, b) in back
            .anomaly_signature
            .iter()
            .zip(drifted.anomaly_signature.iter())
        {
            assert!((a - b).abs() < 0.01);
        }
        assert_eq!(encoder.stats().delta_frames, 1);
    }

    #[test]
    fn test_delta_requires_reference_to_decode() {
        let mut encoder = StateCompressor::new(false);
        let reference = summary(0.5, 1.0, vec![0.2; 32]);
        encoder.set_reference(&reference);

        let mut drifted_signature = vec![0.2f32; 32];
        drifted_signature[0] = 0.3;
        let delta = encoder
            .compress(&summary(0.5, 1.0, drifted_signature))
            .unwrap();

        let mut decoder = StateCompressor::new(false);
        assert!(matches!(
            decoder.decompress(&delta).unwrap_err(),
            CompressError::MissingReference
        ));
    }

    #[test]
    fn test_delta_falls_back_to_full_when_everything_changed() {
        let mut encoder = StateCompressor::new(false);
        encoder.set_reference(&summary(0.5, 1.0, vec![-1.0; 32]));
        let changed = summary(0.5, 1.0, vec![1.0; 32]);
        let frame = encoder.compress(&changed).unwrap();
        assert_eq!(frame[1] & FLAG_DELTA, 0);
        assert_eq!(encoder.stats().delta_frames, 0);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut a = StateCompressor::new(true);
        let mut b = StateCompressor::new(true);
        let original = summary(0.42, 2.0, (0..32).map(|i| i as f32 / 32.0).collect());
        assert_eq!(a.compress(&original).unwrap(), b.compress(&original).unwrap());
    }

    #[test]
    fn test_steady_state_size_and_speed() {
        let mut compressor = StateCompressor::new(true);
        let started = std::time::Instant::now();
        for i in 0..100u32 {
            let original = summary(
                f64::from(i % 100) / 100.0,
                f64::from(i % 10),
                (0..32u32).map(|j| ((i + j) as f32 % 64.0) / 64.0).collect(),
            );
            let frame = compressor.compress(&original).unwrap();
            assert!(frame.len() < 100);
            compressor.decompress(&frame).unwrap();
        }
        // 200 codec operations; the 10ms-per-operation contract leaves two
        // orders of magnitude of headroom here.
        assert!(started.elapsed().as_millis() < 2000);
        assert!(compressor.stats().average_encoded_size() < 100.0);
    }
}
