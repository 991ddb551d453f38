// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Bandwidth Governor
//!
//! Admission control for the shared ISL. A global token bucket models the
//! link budget (10 kB/s, 2 kB burst at the default config); per-peer buckets
//! hold each destination to its fair share. Every outbound frame must
//! acquire tokens from both buckets, all-or-nothing, before it is handed to
//! the bus.
//!
//! Under congestion the governor sheds low-priority traffic first: once
//! global utilization reaches 70 % no normal-priority frame is admitted,
//! while critical traffic is refused only by outright token exhaustion.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use aegis_constellation_core::domain::agent::AgentId;
use aegis_constellation_core::domain::config::SwarmConfig;

/// Default link budget for a 10 kbps configuration.
pub const DEFAULT_GLOBAL_RATE: f64 = 10_000.0;
pub const DEFAULT_GLOBAL_BURST: f64 = 2_000.0;

/// Utilization above which normal-priority traffic is shed.
pub const CONGESTION_THRESHOLD: f64 = 0.70;
/// Utilization above which the link is considered critically congested.
pub const CRITICAL_THRESHOLD: f64 = 0.85;

const BURST_RATIO: f64 = DEFAULT_GLOBAL_BURST / DEFAULT_GLOBAL_RATE;

/// Outbound traffic classes, highest first.
///
/// The allocation weights describe the intended share of the link budget
/// per class. They are reported to operators, not enforced as a hard
/// partition; enforcement is the congestion rule in [`admission_allowed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Critical,
    High,
    Normal,
}

impl MessagePriority {
    pub fn allocation(&self) -> f64 {
        match self {
            MessagePriority::Critical => 0.80,
            MessagePriority::High => 0.15,
            MessagePriority::Normal => 0.05,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Critical => "critical",
            MessagePriority::High => "high",
            MessagePriority::Normal => "normal",
        }
    }
}

/// Link congestion bands derived from global bucket utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Normal,
    Moderate,
    Critical,
}

impl CongestionLevel {
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization > CRITICAL_THRESHOLD {
            CongestionLevel::Critical
        } else if utilization >= CONGESTION_THRESHOLD {
            CongestionLevel::Moderate
        } else {
            CongestionLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionLevel::Normal => "normal",
            CongestionLevel::Moderate => "moderate",
            CongestionLevel::Critical => "critical",
        }
    }
}

/// The admission rule, kept as a pure function so policy changes are a
/// one-line diff and the rule is testable without buckets.
///
/// Normal traffic is denied from 70 % utilization; high and critical pass
/// the congestion check and are bounded only by token availability.
pub fn admission_allowed(utilization: f64, priority: MessagePriority) -> bool {
    match priority {
        MessagePriority::Critical | MessagePriority::High => true,
        MessagePriority::Normal => utilization < CONGESTION_THRESHOLD,
    }
}

/// Continuous-refill token bucket over monotonic time.
///
/// Starts full. Refill is computed lazily from elapsed time on every
/// operation, so there is no background task to schedule.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Refills, then reports the current balance.
    pub fn tokens_available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn has_capacity(&mut self, n: f64) -> bool {
        self.refill();
        self.tokens >= n
    }

    /// Unconditional withdrawal; callers check capacity first.
    fn consume(&mut self, n: f64) {
        self.tokens = (self.tokens - n).max(0.0);
    }

    /// All-or-nothing acquire. A request larger than the burst capacity can
    /// never succeed.
    pub fn acquire(&mut self, n: f64) -> bool {
        if self.has_capacity(n) {
            self.consume(n);
            true
        } else {
            false
        }
    }

    /// Fraction of burst capacity currently spoken for, in `[0, 1]`.
    pub fn utilization(&mut self) -> f64 {
        self.refill();
        (1.0 - self.tokens / self.burst).clamp(0.0, 1.0)
    }

    /// Rate update with proportional burst rescale; the balance is clamped
    /// to the new burst so a downscale takes effect immediately.
    pub fn set_rate(&mut self, rate: f64) {
        self.refill();
        let scale = rate / self.rate;
        self.rate = rate;
        self.burst *= scale;
        self.tokens = self.tokens.min(self.burst);
    }

    #[doc(hidden)]
    pub fn set_tokens(&mut self, tokens: f64) {
        self.refill();
        self.tokens = tokens.clamp(0.0, self.burst);
    }
}

/// Cumulative admission accounting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BandwidthStats {
    pub total_bytes_sent: u64,
    pub total_messages: u64,
    pub dropped_messages: u64,
    pub critical_messages: u64,
    pub high_messages: u64,
    pub normal_messages: u64,
}

impl BandwidthStats {
    pub fn average_message_size(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            self.total_bytes_sent as f64 / self.total_messages as f64
        }
    }

    pub fn drop_rate(&self) -> f64 {
        let attempts = self.total_messages + self.dropped_messages;
        if attempts == 0 {
            0.0
        } else {
            self.dropped_messages as f64 / attempts as f64
        }
    }
}

/// Shared admission gate for one agent's outbound traffic.
///
/// Lock order is global bucket, then peer table, then stats; every path
/// holds them in that order.
pub struct BandwidthGovernor {
    global: Mutex<TokenBucket>,
    peers: Mutex<HashMap<AgentId, TokenBucket>>,
    configured_peers: usize,
    stats: Mutex<BandwidthStats>,
}

impl BandwidthGovernor {
    /// The global budget scales linearly with the configured kbps limit;
    /// the default 10 kbps config yields the 10 kB/s / 2 kB burst budget.
    pub fn new(config: &SwarmConfig) -> Self {
        let rate = config.bandwidth_bytes_per_sec();
        Self {
            global: Mutex::new(TokenBucket::new(rate, rate * BURST_RATIO)),
            peers: Mutex::new(HashMap::new()),
            configured_peers: config.peer_count(),
            stats: Mutex::new(BandwidthStats::default()),
        }
    }

    /// Admits or refuses one outbound frame of `size` bytes to `peer`.
    ///
    /// Checks run in fixed order: peer fair-share capacity, the congestion
    /// rule, then the global budget. Tokens are consumed from both buckets
    /// only when every check passes, never partially. Refusal is an
    /// expected outcome, not an error; the frame is counted as dropped.
    pub fn acquire_tokens(&self, peer: &AgentId, size: usize, priority: MessagePriority) -> bool {
        let n = size as f64;
        let mut global = self.global.lock();
        let mut peers = self.peers.lock();

        let default_rate = self.fair_share_rate(global.rate());
        let bucket = peers
            .entry(peer.clone())
            .or_insert_with(|| TokenBucket::new(default_rate, default_rate * BURST_RATIO));

        if !bucket.has_capacity(n) {
            self.record_drop(size, priority, "peer_budget");
            return false;
        }

        let utilization = global.utilization();
        if !admission_allowed(utilization, priority) {
            tracing::debug!(
                peer = %peer,
                utilization,
                priority = priority.as_str(),
                "admission denied under congestion"
            );
            self.record_drop(size, priority, "congestion");
            return false;
        }

        if !global.acquire(n) {
            self.record_drop(size, priority, "global_budget");
            return false;
        }
        bucket.consume(n);
        self.record_sent(size, priority, utilization);
        true
    }

    /// Broadcast admission: charges only the global bucket, since a
    /// broadcast fans out to every reachable peer rather than one
    /// destination. Same congestion rule as [`Self::acquire_tokens`].
    pub fn acquire_broadcast(&self, size: usize, priority: MessagePriority) -> bool {
        let n = size as f64;
        let mut global = self.global.lock();

        let utilization = global.utilization();
        if !admission_allowed(utilization, priority) {
            self.record_drop(size, priority, "congestion");
            return false;
        }
        if !global.acquire(n) {
            self.record_drop(size, priority, "global_budget");
            return false;
        }
        self.record_sent(size, priority, utilization);
        true
    }

    fn record_sent(&self, size: usize, priority: MessagePriority, utilization: f64) {
        let mut stats = self.stats.lock();
        stats.total_bytes_sent += size as u64;
        stats.total_messages += 1;
        match priority {
            MessagePriority::Critical => stats.critical_messages += 1,
            MessagePriority::High => stats.high_messages += 1,
            MessagePriority::Normal => stats.normal_messages += 1,
        }
        metrics::counter!("swarm_bytes_sent_total").increment(size as u64);
        metrics::gauge!("swarm_link_utilization").set(utilization);
    }

    fn record_drop(&self, size: usize, priority: MessagePriority, reason: &'static str) {
        self.stats.lock().dropped_messages += 1;
        metrics::counter!(
            "swarm_messages_dropped_total",
            "priority" => priority.as_str(),
            "reason" => reason
        )
        .increment(1);
        tracing::debug!(size, priority = priority.as_str(), reason, "frame shed");
    }

    pub fn set_global_limit(&self, kbps: u32) {
        if kbps == 0 {
            tracing::warn!("ignoring request to set global bandwidth limit to zero");
            return;
        }
        self.global.lock().set_rate(f64::from(kbps) * 1000.0);
    }

    pub fn set_peer_limit(&self, peer: &AgentId, kbps: u32) {
        if kbps == 0 {
            tracing::warn!(peer = %peer, "ignoring request to set peer bandwidth limit to zero");
            return;
        }
        let rate = f64::from(kbps) * 1000.0;
        let mut peers = self.peers.lock();
        match peers.get_mut(peer) {
            Some(bucket) => bucket.set_rate(rate),
            None => {
                peers.insert(peer.clone(), TokenBucket::new(rate, rate * BURST_RATIO));
            }
        }
    }

    /// Equal split of the global rate across tracked peers; configured
    /// peers count until the first bucket exists so a cold governor still
    /// hands out sensible defaults.
    pub fn fair_share_per_peer(&self) -> f64 {
        let mut global = self.global.lock();
        let peers = self.peers.lock();
        let rate = global.rate();
        drop(global);
        let divisor = peers.len().max(self.configured_peers).max(1);
        rate / divisor as f64
    }

    fn fair_share_rate(&self, global_rate: f64) -> f64 {
        global_rate / self.configured_peers.max(1) as f64
    }

    pub fn get_global_utilization(&self) -> f64 {
        self.global.lock().utilization()
    }

    pub fn get_peer_utilization(&self, peer: &AgentId) -> Option<f64> {
        self.peers.lock().get_mut(peer).map(TokenBucket::utilization)
    }

    pub fn get_all_utilizations(&self) -> HashMap<String, f64> {
        self.peers
            .lock()
            .iter_mut()
            .map(|(peer, bucket)| (peer.to_string(), bucket.utilization()))
            .collect()
    }

    pub fn get_congestion_level(&self) -> CongestionLevel {
        CongestionLevel::from_utilization(self.get_global_utilization())
    }

    pub fn get_stats(&self) -> BandwidthStats {
        *self.stats.lock()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let stats = self.get_stats();
        let utilization = self.get_global_utilization();
        serde_json::json!({
            "total_bytes_sent": stats.total_bytes_sent,
            "total_messages": stats.total_messages,
            "dropped_messages": stats.dropped_messages,
            "drop_rate": stats.drop_rate(),
            "average_message_size": stats.average_message_size(),
            "global_utilization": utilization,
            "congestion_level": CongestionLevel::from_utilization(utilization).as_str(),
            "fair_share_bytes": self.fair_share_per_peer(),
            "priority_allocation": {
                "critical": MessagePriority::Critical.allocation(),
                "high": MessagePriority::High.allocation(),
                "normal": MessagePriority::Normal.allocation(),
            },
        })
    }

    #[doc(hidden)]
    pub fn force_global_tokens(&self, tokens: f64) {
        self.global.lock().set_tokens(tokens);
    }
}
