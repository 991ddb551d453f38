// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Health Broadcaster
//!
//! Periodically compresses, signs, and publishes this agent's
//! [`HealthSummary`] on `health/summary`. Two gates keep the ISL quiet:
//!
//! - **Congestion-adjusted cadence**: 30 s baseline, stretched to 60 s above
//!   70 % link utilization and 120 s above 85 % ([`congestion_interval`]).
//! - **Change suppression**: a SHA-256 hash of the health content is
//!   compared to the previous send; an unchanged state is skipped. The
//!   first broadcast always goes out.
//!
//! Payloads are HMAC-SHA256 signed over the canonical sorted-key JSON of
//! `{agent_id, constellation, compressed_health, timestamp}`; receivers
//! recompute the code and reject any mismatch in constant time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use aegis_constellation_core::domain::config::SwarmConfig;
use aegis_constellation_core::domain::health::HealthSummary;
use aegis_constellation_core::domain::message::{topics, QoSLevel};
use aegis_constellation_core::infrastructure::compressor::StateCompressor;
use aegis_constellation_core::infrastructure::signature::{BroadcastSigner, SignatureError};

use crate::bus::SwarmMessageBus;
use crate::governor::{
    BandwidthGovernor, MessagePriority, CONGESTION_THRESHOLD, CRITICAL_THRESHOLD,
};
use crate::registry::SwarmRegistry;

pub const BASE_BROADCAST_INTERVAL_S: u64 = 30;

/// Collaborator seam for the onboard health pipeline (§6): the broadcaster
/// pulls, it is never pushed to.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Latest local health snapshot, or `None` when the pipeline has not
    /// produced one yet.
    async fn current_health(&self) -> Option<HealthSummary>;
}

/// Broadcast cadence as a pure function of link utilization, so the policy
/// is testable without a governor.
pub fn congestion_interval(utilization: f64) -> Duration {
    let secs = if utilization > CRITICAL_THRESHOLD {
        BASE_BROADCAST_INTERVAL_S * 4
    } else if utilization >= CONGESTION_THRESHOLD {
        BASE_BROADCAST_INTERVAL_S * 2
    } else {
        BASE_BROADCAST_INTERVAL_S
    };
    Duration::from_secs(secs)
}

/// What happened to one broadcast cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Published and acknowledged.
    Sent,
    /// Health state unchanged since the last send.
    Skipped,
    /// Refused admission by the bandwidth governor.
    Shed,
    /// Published but no subscriber acknowledged in time.
    Unacknowledged,
}

/// Cumulative broadcast accounting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastMetrics {
    pub total_broadcasts: u64,
    pub successful_broadcasts: u64,
    pub failed_broadcasts: u64,
    pub skipped_broadcasts: u64,
    /// Rolling mean publish latency over successful sends.
    pub average_latency_ms: f64,
}

impl BroadcastMetrics {
    /// Successes over attempts that actually reached the link.
    pub fn delivery_rate(&self) -> f64 {
        let attempted = self.total_broadcasts - self.skipped_broadcasts;
        if attempted == 0 {
            0.0
        } else {
            self.successful_broadcasts as f64 / attempted as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_broadcasts": self.total_broadcasts,
            "successful_broadcasts": self.successful_broadcasts,
            "failed_broadcasts": self.failed_broadcasts,
            "skipped_broadcasts": self.skipped_broadcasts,
            "average_latency_ms": self.average_latency_ms,
            "delivery_rate": self.delivery_rate(),
        })
    }
}

/// Periodic signed health publisher for one agent.
pub struct HealthBroadcaster {
    config: Arc<SwarmConfig>,
    bus: Arc<SwarmMessageBus>,
    governor: Arc<BandwidthGovernor>,
    registry: Arc<SwarmRegistry>,
    compressor: Mutex<StateCompressor>,
    signer: Option<BroadcastSigner>,
    last_state_hash: Mutex<Option<[u8; 32]>>,
    metrics: Mutex<BroadcastMetrics>,
}

impl HealthBroadcaster {
    pub fn new(
        config: Arc<SwarmConfig>,
        bus: Arc<SwarmMessageBus>,
        governor: Arc<BandwidthGovernor>,
        registry: Arc<SwarmRegistry>,
        compressor: StateCompressor,
        signing_key: Option<Vec<u8>>,
    ) -> Result<Self, SignatureError> {
        let signer = signing_key.map(BroadcastSigner::new).transpose()?;
        Ok(Self {
            config,
            bus,
            governor,
            registry,
            compressor: Mutex::new(compressor),
            signer,
            last_state_hash: Mutex::new(None),
            metrics: Mutex::new(BroadcastMetrics::default()),
        })
    }

    /// Compress, sign, and publish one health snapshot, applying change
    /// suppression and governor admission.
    pub async fn broadcast_once(
        &self,
        health: &HealthSummary,
    ) -> anyhow::Result<BroadcastOutcome> {
        self.metrics.lock().total_broadcasts += 1;

        let hash = state_hash(health);
        {
            let last = self.last_state_hash.lock();
            if *last == Some(hash) {
                drop(last);
                self.metrics.lock().skipped_broadcasts += 1;
                metrics::counter!("swarm_health_broadcasts_skipped_total").increment(1);
                tracing::debug!(agent = %self.config.agent_id, "health unchanged, broadcast skipped");
                return Ok(BroadcastOutcome::Skipped);
            }
        }

        let frame = self.compressor.lock().compress(health)?;
        let mut payload = serde_json::json!({
            "agent_id": self.config.agent_id.satellite_serial,
            "constellation": self.config.constellation_id,
            "compressed_health": hex::encode(&frame),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(signer) = &self.signer {
            let signature = signer.sign(&payload)?;
            payload["signature"] = Value::String(signature);
        }
        let wire = serde_json::to_vec(&payload)?;

        if !self
            .governor
            .acquire_broadcast(wire.len(), MessagePriority::High)
        {
            self.metrics.lock().failed_broadcasts += 1;
            tracing::debug!(
                agent = %self.config.agent_id,
                bytes = wire.len(),
                "health broadcast shed by governor"
            );
            return Ok(BroadcastOutcome::Shed);
        }

        let started = tokio::time::Instant::now();
        let acked = self
            .bus
            .publish(topics::HEALTH_SUMMARY, wire, QoSLevel::Ack)
            .await?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        if acked {
            *self.last_state_hash.lock() = Some(hash);
            self.registry
                .record_heartbeat(&self.config.agent_id, Some(health.clone()));
            let mut metrics = self.metrics.lock();
            metrics.successful_broadcasts += 1;
            let n = metrics.successful_broadcasts as f64;
            metrics.average_latency_ms += (latency_ms - metrics.average_latency_ms) / n;
            drop(metrics);
            metrics::counter!("swarm_health_broadcasts_total").increment(1);
            tracing::debug!(agent = %self.config.agent_id, latency_ms, "health broadcast sent");
            Ok(BroadcastOutcome::Sent)
        } else {
            self.metrics.lock().failed_broadcasts += 1;
            tracing::warn!(agent = %self.config.agent_id, "health broadcast unacknowledged");
            Ok(BroadcastOutcome::Unacknowledged)
        }
    }

    /// Verifies the signature on a received broadcast payload.
    ///
    /// The signature field is removed, the code recomputed over the
    /// remaining fields, and compared in constant time. A signed payload
    /// with no key configured cannot be checked and is accepted; a missing
    /// signature with a key configured is rejected.
    pub fn verify_signature(payload: &Value, key: Option<&[u8]>) -> bool {
        let Some(key) = key else {
            return true;
        };
        let Value::Object(fields) = payload else {
            return false;
        };
        let Some(Value::String(signature)) = fields.get("signature") else {
            return false;
        };
        let Ok(signer) = BroadcastSigner::new(key.to_vec()) else {
            return false;
        };
        let mut unsigned = fields.clone();
        unsigned.remove("signature");
        signer.verify(&Value::Object(unsigned), signature)
    }

    /// Repeating broadcast task. Sleeps the congestion-adjusted interval
    /// between cycles; cancellation is checked only between cycles, so an
    /// in-flight publish always completes before the task exits.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, source: Arc<dyn HealthSource>) {
        tracing::info!(agent = %self.config.agent_id, "health broadcaster started");
        loop {
            if let Some(health) = source.current_health().await {
                if let Err(e) = self.broadcast_once(&health).await {
                    tracing::warn!(agent = %self.config.agent_id, error = %e, "health broadcast failed");
                }
            }
            let interval = congestion_interval(self.governor.get_global_utilization());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!(agent = %self.config.agent_id, "health broadcaster stopped");
    }

    pub fn get_metrics(&self) -> BroadcastMetrics {
        *self.metrics.lock()
    }

    pub fn compression_stats(
        &self,
    ) -> aegis_constellation_core::infrastructure::compressor::CompressionStats {
        self.compressor.lock().stats()
    }
}

/// Content hash for change suppression. The timestamp is deliberately
/// excluded; a snapshot that only moved its clock is not news.
fn state_hash(health: &HealthSummary) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(health.risk_score.to_le_bytes());
    hasher.update(health.recurrence_score.to_le_bytes());
    for v in &health.anomaly_signature {
        hasher.update(v.to_le_bytes());
    }
    hasher.finalize().into()
}
