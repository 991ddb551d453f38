// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-constellation-swarm` — Inter-Satellite Coordination Crate
//!
//! Publish/subscribe messaging, bandwidth governance, reliable delivery,
//! peer liveness, and health/intent broadcasting for a constellation of
//! bandwidth-constrained satellites sharing an inter-satellite link (ISL).
//!
//! ## Crate Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bus`] | `SwarmMessageBus` topic dispatch with simulated link latency |
//! | [`governor`] | `BandwidthGovernor` token buckets and admission control |
//! | [`delivery`] | `ReliableDelivery` ack/retry/dedup layer |
//! | [`registry`] | `SwarmRegistry` peer liveness and quorum |
//! | [`health_broadcaster`] | Periodic compressed, signed health broadcasts |
//! | [`intent_broadcaster`] | Intent announcements with conflict scoring |
//! | [`node`] | `SwarmNode` per-agent wiring of all of the above |
//!
//! ## Key Concepts
//!
//! - **Topic**: two lowercase segments joined by `/` (`health/summary`).
//!   Subscriptions match exactly, by first-segment prefix (`health/*`), or
//!   everything (`*`).
//! - **QoS**: fire-and-forget (0), acknowledged (1), or reliable (2) — the
//!   reliable tier layers retries, TTL, and duplicate suppression on top of
//!   the bus in [`delivery`].
//! - **Admission**: every outbound frame passes the [`governor`] before it
//!   touches the link; under congestion, normal-priority traffic is shed
//!   first.
//! - **Swarm autonomy**: each `SwarmNode` owns its full component stack, so
//!   many simulated satellites coexist in one test process with no shared
//!   globals.
//!
//! ## Phase Notes
//!
//! ⚠️ The bus simulates ISL propagation with an in-process delay; radio
//! framing, link scheduling, and ground-segment consensus live outside this
//! crate.

pub mod bus;
pub mod delivery;
pub mod governor;
pub mod health_broadcaster;
pub mod intent_broadcaster;
pub mod node;
pub mod registry;

pub use bus::{BusMetrics, FnHandler, MessageHandler, SwarmMessageBus};
pub use delivery::{DeliveryOutcome, DeliveryStats, ReliableDelivery, SentMsg};
pub use governor::{
    admission_allowed, BandwidthGovernor, BandwidthStats, CongestionLevel, MessagePriority,
    TokenBucket,
};
pub use health_broadcaster::{BroadcastMetrics, BroadcastOutcome, HealthBroadcaster, HealthSource};
pub use intent_broadcaster::{conflict_between, IntentBroadcaster, IntentStats};
pub use node::SwarmNode;
pub use registry::{PeerState, SwarmRegistry};
