// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Reliable Delivery
//!
//! End-to-end at-least-once delivery layered on the bus. Outbound payloads
//! travel inside a [`ReliableEnvelope`] carrying a delivery sequence that
//! stays stable across retries; receivers acknowledge on
//! `topics::COORD_ACK` and suppress duplicates behind a bounded window,
//! re-acknowledging them so a lost ack cannot force redelivery to the
//! application.
//!
//! Retry schedule: the ack window for attempt `r` is `2^r` seconds, so the
//! four windows (1 + 2 + 4 + 8 s) tile the 15 s message TTL exactly. With
//! independent per-attempt loss probability p = 0.2 the four attempts give
//! a delivery probability of 1 − 0.2⁴ ≈ 99.84 %.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use aegis_constellation_core::domain::agent::AgentId;
use aegis_constellation_core::domain::message::{
    topics, AckStatus, MessageAck, NackReason, QoSLevel, SwarmMessage,
};

use crate::bus::{BusError, SwarmMessageBus};

pub const MAX_RETRIES: u32 = 3;
pub const MESSAGE_TTL_S: i64 = 15;
pub const DEDUP_WINDOW: usize = 1000;

/// Wire wrapper for reliable payloads. `seq` is the delivery sequence and
/// survives retries; the bus envelope sequence changes per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliableEnvelope {
    pub seq: u64,
    pub sender: AgentId,
    pub payload: Bytes,
}

/// Lifecycle of a pending reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Pending,
    Acked,
    NackCongestion,
    NackInvalid,
}

impl AckState {
    fn is_terminal(self) -> bool {
        matches!(self, AckState::Acked | AckState::NackInvalid)
    }
}

/// Final outcome of one reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    /// Receiver rejected the payload; retrying the same bytes is pointless.
    NackInvalid,
    /// TTL or retry budget exhausted without an ack.
    Expired,
}

/// Bookkeeping for one in-flight reliable message.
#[derive(Debug, Clone)]
pub struct SentMsg {
    pub seq: u64,
    pub topic: String,
    pub payload: Bytes,
    pub retries: u32,
    pub sent_at: DateTime<Utc>,
    pub state: AckState,
}

impl SentMsg {
    pub fn new(seq: u64, topic: impl Into<String>, payload: Bytes, sent_at: DateTime<Utc>) -> Self {
        Self {
            seq,
            topic: topic.into(),
            payload,
            retries: 0,
            sent_at,
            state: AckState::Pending,
        }
    }

    /// Exponential backoff ladder: 1, 2, 4, 8 seconds.
    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1u64 << self.retries.min(MAX_RETRIES))
    }

    /// TTL applies from first send, independently of the retry count.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.sent_at) > Duration::seconds(MESSAGE_TTL_S)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "seq": self.seq,
            "topic": self.topic,
            "payload_bytes": self.payload.len(),
            "retries": self.retries,
            "sent_at": self.sent_at.to_rfc3339(),
            "state": self.state,
        })
    }
}

/// Bounded sliding window of recently seen `(sender, sequence)` keys.
/// Oldest entries are evicted once the window is full, keeping memory flat
/// over arbitrarily long runs.
#[derive(Debug)]
pub struct SequenceWindow {
    capacity: usize,
    order: VecDeque<(Uuid, u64)>,
    seen: HashSet<(Uuid, u64)>,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::with_capacity(DEDUP_WINDOW)
    }
}

impl SequenceWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns true on first sighting, false for a duplicate still inside
    /// the window.
    pub fn observe(&mut self, key: (Uuid, u64)) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key);
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Cumulative delivery accounting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliveryStats {
    pub total_published: u64,
    pub successful_acks: u64,
    pub nack_congestion: u64,
    pub nack_invalid: u64,
    pub timeouts: u64,
    pub retries_performed: u64,
    pub duplicates_rejected: u64,
}

impl DeliveryStats {
    pub fn delivery_rate(&self) -> f64 {
        if self.total_published == 0 {
            0.0
        } else {
            self.successful_acks as f64 / self.total_published as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_published": self.total_published,
            "successful_acks": self.successful_acks,
            "nack_congestion": self.nack_congestion,
            "nack_invalid": self.nack_invalid,
            "timeouts": self.timeouts,
            "retries_performed": self.retries_performed,
            "duplicates_rejected": self.duplicates_rejected,
            "delivery_rate": self.delivery_rate(),
        })
    }
}

struct PendingEntry {
    msg: SentMsg,
    notify: Arc<Notify>,
}

/// At-least-once sender/receiver pair for one agent.
///
/// Pending entries are removed by the waiting publisher (or, for orphaned
/// waiters, by `cleanup_expired`); ack and nack handlers only mark state
/// and wake, so a late response can never race an expiry sweep into a
/// double count.
pub struct ReliableDelivery {
    bus: Arc<SwarmMessageBus>,
    agent_id: AgentId,
    next_seq: AtomicU64,
    pending: DashMap<u64, PendingEntry>,
    received: Mutex<SequenceWindow>,
    stats: Mutex<DeliveryStats>,
}

impl ReliableDelivery {
    pub fn new(bus: Arc<SwarmMessageBus>, agent_id: AgentId) -> Self {
        Self {
            bus,
            agent_id,
            next_seq: AtomicU64::new(0),
            pending: DashMap::new(),
            received: Mutex::new(SequenceWindow::default()),
            stats: Mutex::new(DeliveryStats::default()),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends `payload` with retries until acknowledged, terminally nacked,
    /// or expired. Resolves within the 15 s TTL in the worst case.
    pub async fn publish_reliable(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<DeliveryOutcome, BusError> {
        let payload = payload.into();
        let seq = self.next_sequence();
        let notify = Arc::new(Notify::new());
        let envelope = ReliableEnvelope {
            seq,
            sender: self.agent_id.clone(),
            payload: payload.clone(),
        };
        let wire = serde_json::to_vec(&envelope)?;

        self.pending.insert(
            seq,
            PendingEntry {
                msg: SentMsg::new(seq, topic, payload, Utc::now()),
                notify: notify.clone(),
            },
        );

        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(MESSAGE_TTL_S as u64);
        let mut first_attempt = true;

        loop {
            if let Err(e) = self
                .bus
                .publish(topic, wire.clone(), QoSLevel::Reliable)
                .await
            {
                self.pending.remove(&seq);
                return Err(e);
            }
            if first_attempt {
                self.stats.lock().total_published += 1;
                metrics::counter!("swarm_reliable_published_total").increment(1);
                first_attempt = false;
            }

            let (window, retries) = match self.pending.get(&seq) {
                Some(entry) => (entry.msg.retry_delay(), entry.msg.retries),
                None => return Ok(DeliveryOutcome::Expired),
            };

            let window_started = tokio::time::Instant::now();
            let _ = tokio::time::timeout(window, notify.notified()).await;

            let state = match self.pending.get(&seq) {
                Some(entry) => entry.msg.state,
                // Only the expiry sweep removes entries out from under us.
                None => return Ok(DeliveryOutcome::Expired),
            };

            match state {
                AckState::Acked => {
                    self.pending.remove(&seq);
                    tracing::debug!(topic, seq, retries, "reliable delivery acknowledged");
                    return Ok(DeliveryOutcome::Acknowledged);
                }
                AckState::NackInvalid => {
                    self.pending.remove(&seq);
                    tracing::warn!(topic, seq, "reliable delivery rejected as invalid");
                    return Ok(DeliveryOutcome::NackInvalid);
                }
                AckState::NackCongestion | AckState::Pending => {
                    if retries >= MAX_RETRIES || tokio::time::Instant::now() >= deadline {
                        self.pending.remove(&seq);
                        self.stats.lock().timeouts += 1;
                        metrics::counter!("swarm_reliable_expired_total").increment(1);
                        tracing::warn!(topic, seq, retries, "reliable delivery expired");
                        return Ok(DeliveryOutcome::Expired);
                    }
                    // A congestion nack wakes the window early; sleep out
                    // the remainder so retries stay paced.
                    if state == AckState::NackCongestion {
                        let elapsed = window_started.elapsed();
                        if elapsed < window {
                            tokio::time::sleep(window - elapsed).await;
                        }
                    }
                    // An ack or terminal nack can land during the pace-out
                    // sleep; settling wins over retransmission.
                    match self.pending.get_mut(&seq) {
                        None => return Ok(DeliveryOutcome::Expired),
                        Some(mut entry) => match entry.msg.state {
                            AckState::Acked => {
                                drop(entry);
                                self.pending.remove(&seq);
                                tracing::debug!(topic, seq, retries, "reliable delivery acknowledged");
                                return Ok(DeliveryOutcome::Acknowledged);
                            }
                            AckState::NackInvalid => {
                                drop(entry);
                                self.pending.remove(&seq);
                                tracing::warn!(topic, seq, "reliable delivery rejected as invalid");
                                return Ok(DeliveryOutcome::NackInvalid);
                            }
                            _ => {
                                entry.msg.retries += 1;
                                entry.msg.state = AckState::Pending;
                            }
                        },
                    }
                    self.stats.lock().retries_performed += 1;
                    metrics::counter!("swarm_reliable_retries_total").increment(1);
                    tracing::debug!(topic, seq, retry = retries + 1, "retrying reliable delivery");
                }
            }
        }
    }

    /// Marks `seq` acknowledged and wakes its publisher. Unknown or
    /// already-settled sequences are no-ops.
    pub fn handle_ack(&self, seq: u64) {
        if let Some(mut entry) = self.pending.get_mut(&seq) {
            if entry.msg.state.is_terminal() {
                return;
            }
            entry.msg.state = AckState::Acked;
            entry.notify.notify_one();
            drop(entry);
            self.stats.lock().successful_acks += 1;
            metrics::counter!("swarm_reliable_acked_total").increment(1);
        }
    }

    /// Congestion nacks leave the message retryable; invalid nacks settle
    /// it terminally.
    pub fn handle_nack(&self, seq: u64, reason: NackReason) {
        if let Some(mut entry) = self.pending.get_mut(&seq) {
            if entry.msg.state.is_terminal() {
                return;
            }
            entry.msg.state = match reason {
                NackReason::Congestion => AckState::NackCongestion,
                NackReason::Invalid => AckState::NackInvalid,
            };
            entry.notify.notify_one();
            drop(entry);
            let mut stats = self.stats.lock();
            match reason {
                NackReason::Congestion => stats.nack_congestion += 1,
                NackReason::Invalid => stats.nack_invalid += 1,
            }
        }
    }

    /// Routes a decoded `MessageAck` from `topics::COORD_ACK`. A nack with
    /// no stated reason is treated as congestion, the retryable kind.
    pub fn handle_ack_message(&self, ack: &MessageAck) {
        match ack.status {
            AckStatus::Ack => self.handle_ack(ack.sequence),
            AckStatus::Nack => {
                self.handle_nack(ack.sequence, ack.reason.unwrap_or(NackReason::Congestion))
            }
        }
    }

    /// Receiver-side entry point for an envelope delivered by the bus.
    ///
    /// Returns the inner payload on first sighting. Duplicates are
    /// re-acknowledged and suppressed; under `congested` the frame is
    /// nacked as retryable backpressure; an undecodable payload is dropped
    /// unacknowledged (there is no sequence to respond to).
    pub async fn receive(&self, message: &SwarmMessage, congested: bool) -> Option<Bytes> {
        let envelope: ReliableEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    sender = %message.sender,
                    error = %e,
                    "undecodable reliable envelope dropped"
                );
                return None;
            }
        };

        if congested {
            let nack = MessageAck::nack(envelope.seq, self.agent_id.clone(), NackReason::Congestion);
            self.send_ack(&nack).await;
            return None;
        }

        let first = self.mark_received(&envelope.sender, envelope.seq);
        let ack = MessageAck::ack(envelope.seq, self.agent_id.clone());
        self.send_ack(&ack).await;

        if first {
            Some(envelope.payload)
        } else {
            None
        }
    }

    async fn send_ack(&self, ack: &MessageAck) {
        if let Err(e) = self
            .bus
            .publish_json(topics::COORD_ACK, ack, QoSLevel::FireForget)
            .await
        {
            tracing::warn!(seq = ack.sequence, error = %e, "failed to publish ack");
        }
    }

    /// First sighting returns true; a duplicate inside the window returns
    /// false and is counted.
    pub fn mark_received(&self, sender: &AgentId, seq: u64) -> bool {
        let first = self.received.lock().observe((sender.uuid, seq));
        if !first {
            self.stats.lock().duplicates_rejected += 1;
            metrics::counter!("swarm_reliable_duplicates_total").increment(1);
        }
        first
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    /// Sweeps pending entries whose TTL has lapsed, waking any orphaned
    /// waiter. Returns the number of entries removed.
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.msg.is_expired(now))
            .map(|entry| *entry.key())
            .collect();
        for seq in &expired {
            if let Some((_, entry)) = self.pending.remove(seq) {
                entry.notify.notify_one();
                self.stats.lock().timeouts += 1;
                tracing::warn!(seq, topic = %entry.msg.topic, "expired pending message swept");
            }
        }
        expired.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get_stats(&self) -> DeliveryStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_constellation_core::domain::agent::SatelliteRole;
    use aegis_constellation_core::domain::config::SwarmConfig;
    use std::sync::atomic::AtomicU32;

    fn agent(serial: &str) -> AgentId {
        AgentId::derive("aegis-demo", serial)
    }

    fn delivery_on_fast_bus() -> Arc<ReliableDelivery> {
        let local = agent("sat-01");
        let config =
            SwarmConfig::new(local.clone(), SatelliteRole::Primary, "aegis-demo", Vec::new())
                .unwrap();
        let bus = Arc::new(SwarmMessageBus::new(Arc::new(config)).with_link_latency(0));
        Arc::new(ReliableDelivery::new(bus, local))
    }

    /// Wires a subscriber that answers each delivered envelope through
    /// `respond(attempt, delivery, seq)`.
    fn auto_responder<F>(delivery: &Arc<ReliableDelivery>, topic: &str, respond: F)
    where
        F: Fn(u32, &ReliableDelivery, u64) + Send + Sync + 'static,
    {
        let target = delivery.clone();
        let attempts = AtomicU32::new(0);
        delivery
            .bus
            .subscribe_fn(topic, move |message| {
                let envelope: ReliableEnvelope =
                    serde_json::from_slice(&message.payload).unwrap();
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                respond(attempt, &target, envelope.seq);
            })
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_ack_resolves() {
        let delivery = delivery_on_fast_bus();
        auto_responder(&delivery, "coord/task", |_, d, seq| d.handle_ack(seq));

        let outcome = delivery
            .publish_reliable("coord/task", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(delivery.pending_count(), 0);

        let stats = delivery.get_stats();
        assert_eq!(stats.successful_acks, 1);
        assert_eq!(stats.retries_performed, 0);
        assert!((stats.delivery_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_silent_window() {
        let delivery = delivery_on_fast_bus();
        auto_responder(&delivery, "coord/task", |attempt, d, seq| {
            if attempt >= 1 {
                d.handle_ack(seq);
            }
        });

        let started = tokio::time::Instant::now();
        let outcome = delivery
            .publish_reliable("coord/task", vec![1])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        // One silent 1 s window before the successful second attempt.
        assert!(started.elapsed() >= std::time::Duration::from_secs(1));
        assert_eq!(delivery.get_stats().retries_performed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_invalid_is_terminal() {
        let delivery = delivery_on_fast_bus();
        auto_responder(&delivery, "coord/task", |_, d, seq| {
            d.handle_nack(seq, NackReason::Invalid)
        });

        let outcome = delivery
            .publish_reliable("coord/task", vec![1])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::NackInvalid);
        assert_eq!(delivery.pending_count(), 0);

        let stats = delivery.get_stats();
        assert_eq!(stats.nack_invalid, 1);
        assert_eq!(stats.retries_performed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_congestion_nacks_retry_until_ack() {
        let delivery = delivery_on_fast_bus();
        auto_responder(&delivery, "coord/task", |attempt, d, seq| {
            if attempt < 2 {
                d.handle_nack(seq, NackReason::Congestion);
            } else {
                d.handle_ack(seq);
            }
        });

        let started = tokio::time::Instant::now();
        let outcome = delivery
            .publish_reliable("coord/task", vec![1])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        // Both nacked windows are paced out in full: 1 s + 2 s.
        assert!(started.elapsed() >= std::time::Duration::from_secs(3));

        let stats = delivery.get_stats();
        assert_eq!(stats.nack_congestion, 2);
        assert_eq!(stats.retries_performed, 2);
        assert_eq!(stats.successful_acks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_during_paceout_wins_over_retry() {
        let delivery = delivery_on_fast_bus();
        auto_responder(&delivery, "coord/task", |_, d, seq| {
            d.handle_nack(seq, NackReason::Congestion)
        });

        // The real ack arrives mid pace-out, after the congestion nack
        // woke the window early.
        let late_acker = delivery.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            late_acker.handle_ack(0);
        });

        let outcome = delivery
            .publish_reliable("coord/task", vec![1])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Acknowledged);
        assert_eq!(delivery.pending_count(), 0);

        let stats = delivery.get_stats();
        assert_eq!(stats.retries_performed, 0);
        assert_eq!(stats.successful_acks, 1);
        // The nacked first frame was never retransmitted.
        assert_eq!(delivery.bus.get_metrics().published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_expires_within_ttl() {
        let delivery = delivery_on_fast_bus();

        let started = tokio::time::Instant::now();
        let outcome = delivery
            .publish_reliable("coord/task", vec![1])
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Expired);
        // Four attempts with 1 + 2 + 4 + 8 s windows.
        assert_eq!(started.elapsed(), std::time::Duration::from_secs(15));
        assert_eq!(delivery.pending_count(), 0);

        let stats = delivery.get_stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.retries_performed, 3);
        assert_eq!(delivery.bus.get_metrics().published, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_acks_and_suppresses_duplicates() {
        let delivery = delivery_on_fast_bus();
        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = acks.clone();
        delivery
            .bus
            .subscribe_fn(topics::COORD_ACK, move |message| {
                let ack: MessageAck = serde_json::from_slice(&message.payload).unwrap();
                sink.lock().push(ack);
            })
            .unwrap();

        let remote = agent("sat-02");
        let envelope = ReliableEnvelope {
            seq: 4,
            sender: remote.clone(),
            payload: Bytes::from_static(b"telemetry"),
        };
        let message = SwarmMessage::new(
            "coord/task",
            serde_json::to_vec(&envelope).unwrap(),
            remote,
            QoSLevel::Reliable,
        )
        .unwrap();

        let payload = delivery.receive(&message, false).await;
        assert_eq!(payload.as_deref(), Some(b"telemetry".as_ref()));

        // The retransmission is re-acked but not redelivered.
        let duplicate = delivery.receive(&message, false).await;
        assert!(duplicate.is_none());
        assert_eq!(delivery.get_stats().duplicates_rejected, 1);

        let acks = acks.lock();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.status == AckStatus::Ack && a.sequence == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_under_congestion_nacks() {
        let delivery = delivery_on_fast_bus();
        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = acks.clone();
        delivery
            .bus
            .subscribe_fn(topics::COORD_ACK, move |message| {
                let ack: MessageAck = serde_json::from_slice(&message.payload).unwrap();
                sink.lock().push(ack);
            })
            .unwrap();

        let remote = agent("sat-02");
        let envelope = ReliableEnvelope {
            seq: 0,
            sender: remote.clone(),
            payload: Bytes::from_static(b"x"),
        };
        let message = SwarmMessage::new(
            "coord/task",
            serde_json::to_vec(&envelope).unwrap(),
            remote,
            QoSLevel::Reliable,
        )
        .unwrap();

        assert!(delivery.receive(&message, true).await.is_none());
        let acks = acks.lock();
        assert_eq!(acks[0].status, AckStatus::Nack);
        assert_eq!(acks[0].reason, Some(NackReason::Congestion));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_drops_undecodable_envelope() {
        let delivery = delivery_on_fast_bus();
        let remote = agent("sat-02");
        let message =
            SwarmMessage::new("coord/task", vec![0xFF, 0xFE], remote, QoSLevel::Reliable).unwrap();
        assert!(delivery.receive(&message, false).await.is_none());
        assert_eq!(delivery.bus.get_metrics().published, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sweeps_orphaned_entries() {
        let delivery = delivery_on_fast_bus();
        let stale_sent_at = Utc::now() - Duration::seconds(20);
        delivery.pending.insert(
            9,
            PendingEntry {
                msg: SentMsg::new(9, "coord/task", Bytes::from_static(b"x"), stale_sent_at),
                notify: Arc::new(Notify::new()),
            },
        );

        assert_eq!(delivery.cleanup_expired(), 1);
        assert_eq!(delivery.pending_count(), 0);
        assert_eq!(delivery.get_stats().timeouts, 1);
        assert_eq!(delivery.cleanup_expired(), 0);
    }

    #[test]
    fn test_retry_delay_ladder() {
        let mut msg = SentMsg::new(0, "coord/task", Bytes::from_static(b"x"), Utc::now());
        let mut delays = Vec::new();
        for _ in 0..4 {
            delays.push(msg.retry_delay().as_secs());
            msg.retries += 1;
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_ttl_boundary() {
        let sent_at = Utc::now();
        let msg = SentMsg::new(0, "coord/task", Bytes::from_static(b"x"), sent_at);
        assert!(!msg.is_expired(sent_at + Duration::seconds(15)));
        assert!(msg.is_expired(sent_at + Duration::seconds(16)));
    }

    #[test]
    fn test_sequence_window_stays_bounded() {
        let mut window = SequenceWindow::with_capacity(100);
        let sender = Uuid::new_v4();
        for seq in 0..150u64 {
            assert!(window.observe((sender, seq)));
        }
        assert_eq!(window.len(), 100);
        // Evicted keys are treated as new again.
        assert!(window.observe((sender, 0)));
        // Keys still inside the window stay suppressed.
        assert!(!window.observe((sender, 149)));
    }

    #[test]
    fn test_four_attempts_beat_design_loss_target() {
        let p: f64 = 0.2;
        let delivery_probability = 1.0 - p.powi((MAX_RETRIES + 1) as i32);
        assert!(delivery_probability > 0.998);
    }
}
