// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Swarm Configuration Types
//!
//! Per-agent boot configuration for the constellation substrate:
//!
//! - Identity, role, and the configured peer set
//! - ISL bandwidth budget (drives the governor's global bucket)
//! - Feature toggles (schema validation, payload compression, link latency)
//!
//! A [`SwarmConfig`] is created once at boot and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, SatelliteRole};
use crate::domain::message::MAX_PAYLOAD_BYTES;

/// One configured peer entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub agent_id: AgentId,
    pub role: SatelliteRole,
}

/// Feature toggles and tunables for a single agent's swarm stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSettings {
    /// Re-run domain validation on decoded wire objects.
    #[serde(default = "default_true")]
    pub schema_validation: bool,

    /// Apply the secondary byte-compression pass to health frames.
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Upper payload bound enforced at publish. Never raised above the wire
    /// limit; deployments may lower it for tighter links.
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// Simulated one-way ISL propagation delay applied before dispatch.
    #[serde(default = "default_link_latency_ms")]
    pub link_latency_ms: u64,

    /// How long a QoS-1 publish waits for an acknowledgment.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_payload() -> usize {
    MAX_PAYLOAD_BYTES
}
fn default_link_latency_ms() -> u64 {
    50
}
fn default_ack_timeout_ms() -> u64 {
    1000
}
fn default_bandwidth_limit_kbps() -> u32 {
    10
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            schema_validation: true,
            compression: true,
            max_payload_bytes: default_max_payload(),
            link_latency_ms: default_link_latency_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

/// Per-agent swarm configuration.
///
/// # Invariants
///
/// - `constellation_id` equals `agent_id.constellation_id`.
/// - Every configured peer belongs to the same constellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub agent_id: AgentId,
    pub role: SatelliteRole,
    pub constellation_id: String,

    /// Peers this agent exchanges traffic with. The agent itself is not
    /// listed here.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// ISL bandwidth budget in kilobytes per second.
    #[serde(default = "default_bandwidth_limit_kbps")]
    pub bandwidth_limit_kbps: u32,

    #[serde(default)]
    pub settings: SwarmSettings,
}

impl SwarmConfig {
    pub fn new(
        agent_id: AgentId,
        role: SatelliteRole,
        constellation_id: impl Into<String>,
        peers: Vec<PeerConfig>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            agent_id,
            role,
            constellation_id: constellation_id.into(),
            peers,
            bandwidth_limit_kbps: default_bandwidth_limit_kbps(),
            settings: SwarmSettings::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the constellation-membership invariants. Also used by the
    /// serializer when schema validation is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.constellation_id != self.constellation_id {
            return Err(ConfigError::ConstellationMismatch {
                expected: self.constellation_id.clone(),
                got: self.agent_id.constellation_id.clone(),
            });
        }
        for peer in &self.peers {
            if peer.agent_id.constellation_id != self.constellation_id {
                return Err(ConfigError::PeerConstellationMismatch {
                    peer: peer.agent_id.to_string(),
                    expected: self.constellation_id.clone(),
                });
            }
            if peer.agent_id == self.agent_id {
                return Err(ConfigError::SelfInPeerSet);
            }
        }
        if self.bandwidth_limit_kbps == 0 {
            return Err(ConfigError::ZeroBandwidth);
        }
        Ok(())
    }

    /// Role of a configured peer, if present.
    pub fn peer_role(&self, id: &AgentId) -> Option<SatelliteRole> {
        self.peers
            .iter()
            .find(|p| &p.agent_id == id)
            .map(|p| p.role)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Global bandwidth budget in bytes per second.
    pub fn bandwidth_bytes_per_sec(&self) -> f64 {
        f64::from(self.bandwidth_limit_kbps) * 1000.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("agent constellation '{got}' does not match configured constellation '{expected}'")]
    ConstellationMismatch { expected: String, got: String },

    #[error("peer {peer} does not belong to constellation '{expected}'")]
    PeerConstellationMismatch { peer: String, expected: String },

    #[error("the local agent must not appear in its own peer set")]
    SelfInPeerSet,

    #[error("bandwidth_limit_kbps must be greater than zero")]
    ZeroBandwidth,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(serial: &str) -> PeerConfig {
        PeerConfig {
            agent_id: AgentId::derive("astra-1", serial),
            role: SatelliteRole::Backup,
        }
    }

    #[test]
    fn test_config_accepts_matching_constellation() {
        let config = SwarmConfig::new(
            AgentId::derive("astra-1", "SAT-001"),
            SatelliteRole::Primary,
            "astra-1",
            vec![peer("SAT-002"), peer("SAT-003")],
        )
        .unwrap();
        assert_eq!(config.peer_count(), 2);
        assert_eq!(config.bandwidth_limit_kbps, 10);
        assert_eq!(config.bandwidth_bytes_per_sec(), 10_000.0);
    }

    #[test]
    fn test_config_rejects_constellation_mismatch() {
        let err = SwarmConfig::new(
            AgentId::derive("astra-2", "SAT-001"),
            SatelliteRole::Primary,
            "astra-1",
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConstellationMismatch { .. }));
    }

    #[test]
    fn test_config_rejects_foreign_peer() {
        let foreign = PeerConfig {
            agent_id: AgentId::derive("astra-9", "SAT-100"),
            role: SatelliteRole::Standby,
        };
        let err = SwarmConfig::new(
            AgentId::derive("astra-1", "SAT-001"),
            SatelliteRole::Primary,
            "astra-1",
            vec![foreign],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PeerConstellationMismatch { .. }));
    }

    #[test]
    fn test_config_rejects_self_in_peer_set() {
        let me = AgentId::derive("astra-1", "SAT-001");
        let err = SwarmConfig::new(
            me.clone(),
            SatelliteRole::Primary,
            "astra-1",
            vec![PeerConfig {
                agent_id: me,
                role: SatelliteRole::Primary,
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SelfInPeerSet));
    }

    #[test]
    fn test_peer_role_lookup() {
        let config = SwarmConfig::new(
            AgentId::derive("astra-1", "SAT-001"),
            SatelliteRole::Primary,
            "astra-1",
            vec![peer("SAT-002")],
        )
        .unwrap();
        let known = AgentId::derive("astra-1", "SAT-002");
        let unknown = AgentId::derive("astra-1", "SAT-099");
        assert_eq!(config.peer_role(&known), Some(SatelliteRole::Backup));
        assert_eq!(config.peer_role(&unknown), None);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = SwarmSettings::default();
        assert!(settings.schema_validation);
        assert!(settings.compression);
        assert_eq!(settings.max_payload_bytes, MAX_PAYLOAD_BYTES);
        assert_eq!(settings.link_latency_ms, 50);
        assert_eq!(settings.ack_timeout_ms, 1000);
    }

    #[test]
    fn test_settings_deserialize_with_partial_fields() {
        let settings: SwarmSettings =
            serde_json::from_str(r#"{"link_latency_ms": 120}"#).unwrap();
        assert_eq!(settings.link_latency_ms, 120);
        assert!(settings.schema_validation);
    }
}
