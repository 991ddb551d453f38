// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Provides mod functionality for the system.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implements mod

pub mod agent;
pub mod config;
pub mod health;
pub mod intent;
pub mod message;

pub use agent::{AgentId, SatelliteRole};
pub use config::{ConfigError, PeerConfig, SwarmConfig, SwarmSettings};
pub use health::{HealthError, HealthSummary, SIGNATURE_DIMENSIONS};
pub use intent::{IntentError, IntentMessage, IntentPriority};
pub use message::{
    topics, AckStatus, MessageAck, MessageError, NackReason, QoSLevel, SubscriptionId,
    SwarmMessage, TopicFilter, MAX_PAYLOAD_BYTES,
};
