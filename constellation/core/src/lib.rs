// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `aegis-constellation-core` — Wire Types & Codecs
//!
//! Foundational crate for the inter-satellite communication substrate:
//! immutable wire types, the JSON wire codec, the lossy health-state
//! compressor, and keyed broadcast signing.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `AgentId`, `SwarmConfig`, `SwarmMessage`, `HealthSummary`, `IntentMessage` value types |
//! | [`infrastructure`] | Infrastructure | `SwarmSerializer`, `StateCompressor`, `BroadcastSigner` |
//!
//! Everything here is transport-agnostic: the swarm runtime crate
//! (`aegis-constellation-swarm`) composes these types into the bus,
//! governor, and broadcaster services.

pub mod domain;
pub mod infrastructure;

pub use domain::*;
