// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HMAC-SHA256 signing for health broadcasts.
//!
//! Signatures are computed over a canonical JSON form (object keys sorted
//! recursively, compact separators) so that independently built payloads
//! with the same content verify identically. Verification is constant-time.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const MAC_LEN: usize = 32;

/// Signs and verifies broadcast payloads with a constellation-shared key.
#[derive(Clone)]
pub struct BroadcastSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for BroadcastSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("BroadcastSigner").finish_non_exhaustive()
    }
}

impl BroadcastSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, SignatureError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SignatureError::EmptyKey);
        }
        Ok(Self { key })
    }

    /// Returns the signature as 64 lowercase hex characters.
    pub fn sign(&self, payload: &Value) -> Result<String, SignatureError> {
        Ok(hex::encode(self.mac(payload)?))
    }

    /// Constant-time check of a hex signature against the payload.
    /// Malformed hex or a wrong-length digest verifies as false, not as
    /// an error; callers treat both the same way.
    pub fn verify(&self, payload: &Value, signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        if provided.len() != MAC_LEN {
            return false;
        }
        let Ok(expected) = self.mac(payload) else {
            return false;
        };
        expected.as_slice().ct_eq(&provided).into()
    }

    fn mac(&self, payload: &Value) -> Result<Vec<u8>, SignatureError> {
        let mut canonical = String::new();
        write_canonical(payload, &mut canonical)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| SignatureError::EmptyKey)?;
        mac.update(canonical.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), SignatureError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| *key);
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signing key must not be empty")]
    EmptyKey,

    #[error("payload could not be canonicalized: {0}")]
    Canonicalize(#[from] serde_json::Error),
}
