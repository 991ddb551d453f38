// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Deterministic satellite identity.
///
/// Derived from `(constellation_id, satellite_serial)` via UUIDv5, so every
/// node in the constellation computes the same id for the same spacecraft
/// without any coordination. This is the identity key used in every routing
/// and liveness decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    pub uuid: Uuid,
    pub constellation_id: String,
    pub satellite_serial: String,
}

impl AgentId {
    /// Derive the identity for a spacecraft. Identical inputs always produce
    /// the identical uuid (UUIDv5 over a constellation-scoped namespace).
    pub fn derive(constellation_id: &str, satellite_serial: &str) -> Self {
        let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, constellation_id.as_bytes());
        let uuid = Uuid::new_v5(&namespace, satellite_serial.as_bytes());
        Self {
            uuid,
            constellation_id: constellation_id.to_string(),
            satellite_serial: satellite_serial.to_string(),
        }
    }

    /// Short display form for log lines.
    pub fn short(&self) -> &str {
        &self.satellite_serial
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.constellation_id, self.satellite_serial)
    }
}

/// Role a satellite plays within its constellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SatelliteRole {
    Primary,
    Backup,
    Standby,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = AgentId::derive("astra-1", "SAT-007");
        let b = AgentId::derive("astra-1", "SAT-007");
        assert_eq!(a, b);
        assert_eq!(a.uuid, b.uuid);
    }

    #[test]
    fn test_derive_differs_across_serials() {
        let a = AgentId::derive("astra-1", "SAT-007");
        let b = AgentId::derive("astra-1", "SAT-008");
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_derive_differs_across_constellations() {
        let a = AgentId::derive("astra-1", "SAT-007");
        let b = AgentId::derive("astra-2", "SAT-007");
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_display_form() {
        let id = AgentId::derive("astra-1", "SAT-007");
        assert_eq!(id.to_string(), "astra-1/SAT-007");
        assert_eq!(id.short(), "SAT-007");
    }
}
