// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Registry
//!
//! Tracks which constellation members are reachable. Peers are never
//! deleted; a peer whose last heartbeat is older than 90 s is simply
//! considered dead until it is heard from again. Quorum is computed
//! against the currently reachable set, so it shrinks under partition
//! rather than wedging the swarm.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use aegis_constellation_core::domain::agent::{AgentId, SatelliteRole};
use aegis_constellation_core::domain::config::SwarmConfig;
use aegis_constellation_core::domain::health::HealthSummary;

/// A peer is dead once its heartbeat is at least this old.
pub const HEARTBEAT_TIMEOUT_S: i64 = 90;
/// Heartbeat cadence for a healthy peer relationship.
pub const BASE_HEARTBEAT_INTERVAL_S: u64 = 30;

/// Everything this agent knows about one constellation member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerState {
    pub agent_id: AgentId,
    pub role: SatelliteRole,
    pub last_heartbeat: DateTime<Utc>,
    pub health_summary: Option<HealthSummary>,
    pub heartbeat_failures: u32,
}

impl PeerState {
    pub fn new(agent_id: AgentId, role: SatelliteRole, now: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            role,
            last_heartbeat: now,
            health_summary: None,
            heartbeat_failures: 0,
        }
    }

    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat) < Duration::seconds(HEARTBEAT_TIMEOUT_S)
    }

    /// Backoff ladder for heartbeat scheduling: 30 s clean, 60 s after one
    /// failure, 120 s from the second failure on.
    pub fn next_heartbeat_interval(&self) -> std::time::Duration {
        let secs = match self.heartbeat_failures {
            0 => BASE_HEARTBEAT_INTERVAL_S,
            1 => BASE_HEARTBEAT_INTERVAL_S * 2,
            _ => BASE_HEARTBEAT_INTERVAL_S * 4,
        };
        std::time::Duration::from_secs(secs)
    }
}

/// Liveness table for one agent's view of the swarm.
pub struct SwarmRegistry {
    config: Arc<SwarmConfig>,
    peers: RwLock<HashMap<AgentId, PeerState>>,
}

impl SwarmRegistry {
    /// Seeds state for the local agent and every configured peer, all
    /// considered alive as of boot.
    pub fn new(config: Arc<SwarmConfig>) -> Self {
        let now = Utc::now();
        let mut peers = HashMap::new();
        peers.insert(
            config.agent_id.clone(),
            PeerState::new(config.agent_id.clone(), config.role, now),
        );
        for peer in &config.peers {
            peers.insert(
                peer.agent_id.clone(),
                PeerState::new(peer.agent_id.clone(), peer.role, now),
            );
        }
        tracing::info!(
            agent = %config.agent_id,
            peers = config.peer_count(),
            "swarm registry seeded"
        );
        Self {
            config,
            peers: RwLock::new(peers),
        }
    }

    pub fn record_heartbeat(&self, id: &AgentId, health: Option<HealthSummary>) {
        self.record_heartbeat_at(id, health, Utc::now());
    }

    /// A heartbeat from an agent not in the config is a legitimate first
    /// sighting (late-launched satellite); it gets a fresh entry.
    pub fn record_heartbeat_at(
        &self,
        id: &AgentId,
        health: Option<HealthSummary>,
        now: DateTime<Utc>,
    ) {
        let mut peers = self.peers.write();
        let state = peers.entry(id.clone()).or_insert_with(|| {
            tracing::info!(peer = %id, "first sighting of unconfigured peer");
            let role = self
                .config
                .peer_role(id)
                .unwrap_or(SatelliteRole::Standby);
            PeerState::new(id.clone(), role, now)
        });
        let was_dead = !state.is_alive(now);
        state.last_heartbeat = now;
        state.heartbeat_failures = 0;
        if health.is_some() {
            state.health_summary = health;
        }
        if was_dead {
            tracing::info!(peer = %id, "peer back from the dead");
            metrics::counter!("swarm_peer_revivals_total").increment(1);
        }
    }

    /// Registers a failed heartbeat exchange and returns the escalated
    /// interval the caller should wait before the next attempt.
    pub fn record_heartbeat_failure(&self, id: &AgentId) -> std::time::Duration {
        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(state) => {
                state.heartbeat_failures = state.heartbeat_failures.saturating_add(1);
                tracing::warn!(
                    peer = %id,
                    failures = state.heartbeat_failures,
                    "heartbeat failure recorded"
                );
                state.next_heartbeat_interval()
            }
            None => std::time::Duration::from_secs(BASE_HEARTBEAT_INTERVAL_S),
        }
    }

    pub fn is_alive(&self, id: &AgentId) -> bool {
        self.is_alive_at(id, Utc::now())
    }

    pub fn is_alive_at(&self, id: &AgentId, now: DateTime<Utc>) -> bool {
        self.peers
            .read()
            .get(id)
            .map(|state| state.is_alive(now))
            .unwrap_or(false)
    }

    pub fn get_alive_peers(&self) -> Vec<AgentId> {
        self.get_alive_peers_at(Utc::now())
    }

    pub fn get_alive_peers_at(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let peers = self.peers.read();
        let mut alive: Vec<AgentId> = peers
            .values()
            .filter(|state| state.is_alive(now))
            .map(|state| state.agent_id.clone())
            .collect();
        alive.sort_by(|a, b| a.satellite_serial.cmp(&b.satellite_serial));
        alive
    }

    /// Majority of the currently reachable set: `floor(alive / 2) + 1`.
    /// Recomputed per call, so a partition shrinks the quorum instead of
    /// freezing coordination.
    pub fn get_quorum_size(&self) -> usize {
        self.get_quorum_size_at(Utc::now())
    }

    pub fn get_quorum_size_at(&self, now: DateTime<Utc>) -> usize {
        let alive = self
            .peers
            .read()
            .values()
            .filter(|state| state.is_alive(now))
            .count();
        alive / 2 + 1
    }

    pub fn get_peer_state(&self, id: &AgentId) -> Option<PeerState> {
        self.peers.read().get(id).cloned()
    }

    pub fn get_peer_health(&self, id: &AgentId) -> Option<HealthSummary> {
        self.peers
            .read()
            .get(id)
            .and_then(|state| state.health_summary.clone())
    }

    /// Total tracked members, the local agent included.
    pub fn get_peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn get_registry_stats(&self) -> serde_json::Value {
        let now = Utc::now();
        let peers = self.peers.read();
        let total = peers.len();
        let alive = peers.values().filter(|state| state.is_alive(now)).count();
        let alive_percentage = if total == 0 {
            0.0
        } else {
            alive as f64 / total as f64 * 100.0
        };
        serde_json::json!({
            "total_peers": total,
            "alive_peers": alive,
            "dead_peers": total - alive,
            "alive_percentage": alive_percentage,
        })
    }
}
