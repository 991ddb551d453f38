// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Intent Broadcaster
//!
//! Announces planned actions on `intent/plan` so peers can detect conflicts
//! before anything moves. Every outbound intent is scored against the
//! currently active intent set (own and observed, 300 s TTL); the maximum
//! pairwise score is stamped on the message and returned to the caller,
//! who decides whether to proceed.
//!
//! Pairwise scoring combines three factors:
//!
//! - geometric overlap: linear falloff from 1.0 at 0° angular separation to
//!   0.0 at 180° (wrapped); a missing `target_angle` counts as full overlap
//! - temporal overlap: 0.1 for disjoint windows up to 1.0 for full overlap
//! - action type: same type weighs fully, differing types carry a flat 0.2
//!
//! If either intent carries `Safety` priority the score is halved, so
//! safety actions are never vetoed by lower-priority plans.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use aegis_constellation_core::domain::intent::{IntentMessage, IntentPriority};
use aegis_constellation_core::domain::message::{topics, QoSLevel};

use crate::bus::SwarmMessageBus;
use crate::governor::{BandwidthGovernor, MessagePriority};
use crate::registry::SwarmRegistry;

/// Stored intents older than this no longer participate in scoring.
pub const INTENT_TTL_S: i64 = 300;
/// Scores above this line count as detected conflicts.
pub const CONFLICT_THRESHOLD: f64 = 0.7;
/// Cadence for re-announcing the node's own active intent.
const REANNOUNCE_INTERVAL_S: u64 = 60;

const CROSS_ACTION_FACTOR: f64 = 0.2;
const SAFETY_DAMPING: f64 = 0.5;

/// Pairwise conflict score in `[0, 1]`.
pub fn conflict_between(a: &IntentMessage, b: &IntentMessage) -> f64 {
    let temporal = temporal_multiplier(a, b);
    let base = if a.action_type == b.action_type {
        geometric_overlap(a, b) * temporal
    } else {
        CROSS_ACTION_FACTOR * temporal
    };
    let damped = if a.priority == IntentPriority::Safety || b.priority == IntentPriority::Safety {
        base * SAFETY_DAMPING
    } else {
        base
    };
    damped.clamp(0.0, 1.0)
}

/// Linear falloff over angular separation, wrapped to `[0°, 180°]`.
fn geometric_overlap(a: &IntentMessage, b: &IntentMessage) -> f64 {
    match (a.target_angle(), b.target_angle()) {
        (Some(angle_a), Some(angle_b)) => {
            let mut diff = (angle_a - angle_b).abs() % 360.0;
            if diff > 180.0 {
                diff = 360.0 - diff;
            }
            1.0 - diff / 180.0
        }
        // No geometry supplied: assume full overlap, the conservative read.
        _ => 1.0,
    }
}

/// 0.1 for disjoint windows, 1.0 for full overlap of the shorter window,
/// interpolated linearly in between.
fn temporal_multiplier(a: &IntentMessage, b: &IntentMessage) -> f64 {
    let start = a.starts_at().max(b.starts_at());
    let end = a.ends_at().min(b.ends_at());
    let overlap_ms = (end - start).num_milliseconds().max(0) as f64;
    let shorter_ms = (a.ends_at() - a.starts_at())
        .num_milliseconds()
        .min((b.ends_at() - b.starts_at()).num_milliseconds()) as f64;
    let fraction = if shorter_ms <= 0.0 {
        0.0
    } else {
        (overlap_ms / shorter_ms).clamp(0.0, 1.0)
    };
    0.1 + 0.9 * fraction
}

/// Cumulative intent accounting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IntentStats {
    pub total_published: u64,
    pub successful_broadcasts: u64,
    pub failed_broadcasts: u64,
    pub conflicts_detected: u64,
    /// Running mean over every scored publish.
    pub average_conflict_score: f64,
}

impl IntentStats {
    pub fn delivery_rate(&self) -> f64 {
        if self.total_published == 0 {
            0.0
        } else {
            self.successful_broadcasts as f64 / self.total_published as f64
        }
    }

    pub fn conflict_rate(&self) -> f64 {
        if self.total_published == 0 {
            0.0
        } else {
            self.conflicts_detected as f64 / self.total_published as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_published": self.total_published,
            "successful_broadcasts": self.successful_broadcasts,
            "failed_broadcasts": self.failed_broadcasts,
            "conflicts_detected": self.conflicts_detected,
            "average_conflict_score": self.average_conflict_score,
            "delivery_rate": self.delivery_rate(),
            "conflict_rate": self.conflict_rate(),
        })
    }
}

/// Intent announcement and conflict-detection service for one agent.
pub struct IntentBroadcaster {
    bus: Arc<SwarmMessageBus>,
    governor: Arc<BandwidthGovernor>,
    registry: Arc<SwarmRegistry>,
    intents: Mutex<Vec<IntentMessage>>,
    own_latest: Mutex<Option<IntentMessage>>,
    stats: Mutex<IntentStats>,
}

impl IntentBroadcaster {
    pub fn new(
        bus: Arc<SwarmMessageBus>,
        governor: Arc<BandwidthGovernor>,
        registry: Arc<SwarmRegistry>,
    ) -> Self {
        Self {
            bus,
            governor,
            registry,
            intents: Mutex::new(Vec::new()),
            own_latest: Mutex::new(None),
            stats: Mutex::new(IntentStats::default()),
        }
    }

    /// Maximum pairwise score against every stored, non-expired intent.
    /// An empty history scores 0.0.
    pub fn compute_conflict_score(&self, new_intent: &IntentMessage) -> f64 {
        let now = Utc::now();
        let mut intents = self.intents.lock();
        intents.retain(|intent| !is_expired(intent, now));
        intents
            .iter()
            .map(|stored| conflict_between(new_intent, stored))
            .fold(0.0, f64::max)
    }

    /// Scores, stamps, and publishes one intent; the intent is stored
    /// locally whether or not the link accepted it (it is still our plan).
    /// Returns the conflict score so the caller can veto execution.
    pub async fn broadcast_intent(&self, intent: IntentMessage) -> anyhow::Result<f64> {
        intent.validate()?;
        let score = self.compute_conflict_score(&intent);
        let stamped = intent.with_conflict_score(score);
        let wire = serde_json::to_vec(&stamped)?;

        {
            let mut stats = self.stats.lock();
            stats.total_published += 1;
            let n = stats.total_published as f64;
            stats.average_conflict_score += (score - stats.average_conflict_score) / n;
            if score > CONFLICT_THRESHOLD {
                stats.conflicts_detected += 1;
                metrics::counter!("swarm_intent_conflicts_total").increment(1);
                tracing::warn!(
                    action = %stamped.action_type,
                    score,
                    "intent conflicts with an active plan"
                );
            }
        }

        // Safety intents ride the critical class and bypass congestion
        // shedding.
        let priority = if stamped.priority == IntentPriority::Safety {
            MessagePriority::Critical
        } else {
            MessagePriority::Normal
        };

        let sent = if self.governor.acquire_broadcast(wire.len(), priority) {
            self.bus
                .publish(topics::INTENT_PLAN, wire, QoSLevel::Ack)
                .await?
        } else {
            tracing::debug!(action = %stamped.action_type, "intent broadcast shed by governor");
            false
        };

        {
            let mut stats = self.stats.lock();
            if sent {
                stats.successful_broadcasts += 1;
            } else {
                stats.failed_broadcasts += 1;
            }
        }

        self.store(stamped.clone());
        *self.own_latest.lock() = Some(stamped);
        Ok(score)
    }

    /// Stores a peer's announced intent for future scoring. An intent is
    /// also a proof of life, so the sender's heartbeat is refreshed.
    /// Exact duplicates (same sender, timestamp, action) are ignored.
    pub fn observe_remote(&self, intent: IntentMessage) {
        self.registry.record_heartbeat(&intent.sender, None);
        self.store(intent);
    }

    fn store(&self, intent: IntentMessage) {
        let mut intents = self.intents.lock();
        let duplicate = intents.iter().any(|stored| {
            stored.sender == intent.sender
                && stored.timestamp == intent.timestamp
                && stored.action_type == intent.action_type
        });
        if !duplicate {
            intents.push(intent);
        }
    }

    /// Currently active intents; expired entries are pruned on access.
    pub fn active_intents(&self) -> Vec<IntentMessage> {
        let now = Utc::now();
        let mut intents = self.intents.lock();
        intents.retain(|intent| !is_expired(intent, now));
        intents.clone()
    }

    /// Repeating task re-announcing this node's latest own intent while it
    /// stays unexpired, so late joiners can score against it.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("intent broadcaster started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(REANNOUNCE_INTERVAL_S)) => {}
            }
            let own = self.own_latest.lock().clone();
            let Some(intent) = own else { continue };
            if is_expired(&intent, Utc::now()) {
                continue;
            }
            if let Err(e) = self.reannounce(&intent).await {
                tracing::warn!(error = %e, "intent re-announcement failed");
            }
        }
        tracing::info!("intent broadcaster stopped");
    }

    /// Re-publishes an already-scored intent without touching the stats;
    /// re-announcements are repetition, not new plans.
    async fn reannounce(&self, intent: &IntentMessage) -> anyhow::Result<()> {
        let wire = serde_json::to_vec(intent)?;
        if self
            .governor
            .acquire_broadcast(wire.len(), MessagePriority::Normal)
        {
            self.bus
                .publish(topics::INTENT_PLAN, wire, QoSLevel::FireForget)
                .await?;
            tracing::debug!(action = %intent.action_type, "intent re-announced");
        }
        Ok(())
    }

    pub fn get_stats(&self) -> IntentStats {
        *self.stats.lock()
    }
}

fn is_expired(intent: &IntentMessage, now: chrono::DateTime<Utc>) -> bool {
    now.signed_duration_since(intent.timestamp) > ChronoDuration::seconds(INTENT_TTL_S)
}
