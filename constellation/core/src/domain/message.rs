// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Wire Envelope Types
//!
//! Defines the message envelope exchanged over the inter-satellite link:
//!
//! - [`SwarmMessage`] — immutable topic/payload envelope with QoS and a
//!   per-sender sequence number.
//! - [`QoSLevel`] — delivery guarantee tier (0 fire-and-forget,
//!   1 acknowledged, 2 acknowledged-and-deduplicated).
//! - [`TopicFilter`] — exact or trailing-wildcard subscription filter.
//! - [`MessageAck`] — acknowledgment/negative-acknowledgment envelope.
//!
//! Topic grammar is `segment/segment` where a segment is lowercase
//! alphanumeric plus `_` and `-`. Wildcards are only legal in subscription
//! filters, never on publish.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentId;

/// Hard upper bound on payload size, from the ISL frame budget.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024;

/// Well-known topics used by the substrate itself.
pub mod topics {
    /// Compressed, signed health broadcasts.
    pub const HEALTH_SUMMARY: &str = "health/summary";
    /// Planned-action intent announcements.
    pub const INTENT_PLAN: &str = "intent/plan";
    /// Reliable-delivery acknowledgments.
    pub const COORD_ACK: &str = "coord/ack";
    /// Configuration distribution.
    pub const CONTROL_CONFIG: &str = "control/config";
    /// Peer-set updates.
    pub const CONTROL_PEERS: &str = "control/peers";
}

/// Delivery guarantee tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoSLevel {
    FireForget,
    Ack,
    Reliable,
}

impl QoSLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            QoSLevel::FireForget => 0,
            QoSLevel::Ack => 1,
            QoSLevel::Reliable => 2,
        }
    }
}

impl TryFrom<u8> for QoSLevel {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoSLevel::FireForget),
            1 => Ok(QoSLevel::Ack),
            2 => Ok(QoSLevel::Reliable),
            other => Err(MessageError::InvalidQos(other)),
        }
    }
}

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Immutable wire envelope.
///
/// `sequence` is 0 until the bus assigns it at publish; assigned sequences
/// are strictly increasing per sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmMessage {
    pub topic: String,
    pub payload: Bytes,
    pub sender: AgentId,
    pub qos: QoSLevel,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl SwarmMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        sender: AgentId,
        qos: QoSLevel,
    ) -> Result<Self, MessageError> {
        let message = Self {
            topic: topic.into(),
            payload: payload.into(),
            sender,
            qos,
            sequence: 0,
            timestamp: Utc::now(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Re-check the envelope invariants. Used on decoded envelopes when
    /// schema validation is enabled, and by the bus before dispatch.
    pub fn validate(&self) -> Result<(), MessageError> {
        if !is_valid_topic(&self.topic) {
            return Err(MessageError::InvalidTopic(self.topic.clone()));
        }
        if self.payload.is_empty() {
            return Err(MessageError::EmptyPayload);
        }
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(MessageError::PayloadTooLarge(self.payload.len()));
        }
        Ok(())
    }

    /// Dedup key for receiver-side QoS-2 handling.
    pub fn dedup_key(&self) -> (uuid::Uuid, u64) {
        (self.sender.uuid, self.sequence)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Publish-side topic grammar: exactly `segment/segment`, no wildcards.
pub fn is_valid_topic(topic: &str) -> bool {
    match topic.split_once('/') {
        Some((first, second)) => is_valid_segment(first) && is_valid_segment(second),
        None => false,
    }
}

/// Subscription filter: exact topic, trailing wildcard, or match-all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicFilter {
    Exact(String),
    /// Matches every topic whose first segment equals the prefix
    /// (`health/*`).
    Prefix(String),
    /// Bare `*`, matches every topic.
    All,
}

impl TopicFilter {
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        if raw == "*" {
            return Ok(TopicFilter::All);
        }
        if let Some(prefix) = raw.strip_suffix("/*") {
            if is_valid_segment(prefix) {
                return Ok(TopicFilter::Prefix(prefix.to_string()));
            }
            return Err(MessageError::InvalidFilter(raw.to_string()));
        }
        if is_valid_topic(raw) {
            return Ok(TopicFilter::Exact(raw.to_string()));
        }
        Err(MessageError::InvalidFilter(raw.to_string()))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Exact(exact) => exact == topic,
            TopicFilter::Prefix(prefix) => topic
                .split_once('/')
                .map(|(first, _)| first == prefix)
                .unwrap_or(false),
            TopicFilter::All => true,
        }
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicFilter::Exact(exact) => write!(f, "{exact}"),
            TopicFilter::Prefix(prefix) => write!(f, "{prefix}/*"),
            TopicFilter::All => write!(f, "*"),
        }
    }
}

/// Why a receiver refused a reliable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    /// Receiver is congested; the sender may retry after backoff.
    Congestion,
    /// Payload failed validation; retrying the same bytes is pointless.
    Invalid,
}

/// Acknowledgment status carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ack,
    Nack,
}

/// Acknowledgment envelope published on [`topics::COORD_ACK`].
///
/// `sequence` refers to the reliable-delivery sequence of the original
/// message, not the bus envelope sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAck {
    pub sequence: u64,
    pub sender: AgentId,
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NackReason>,
    pub timestamp: DateTime<Utc>,
}

impl MessageAck {
    pub fn ack(sequence: u64, sender: AgentId) -> Self {
        Self {
            sequence,
            sender,
            status: AckStatus::Ack,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn nack(sequence: u64, sender: AgentId, reason: NackReason) -> Self {
        Self {
            sequence,
            sender,
            status: AckStatus::Nack,
            reason: Some(reason),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid topic '{0}': expected segment/segment with lowercase alphanumerics")]
    InvalidTopic(String),

    #[error("payload cannot be empty")]
    EmptyPayload,

    #[error("payload of {0} bytes exceeds the 10KB limit")]
    PayloadTooLarge(usize),

    #[error("QoS must be 0, 1, or 2, got {0}")]
    InvalidQos(u8),

    #[error("invalid topic filter '{0}'")]
    InvalidFilter(String),
}
