// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Message Bus
//!
//! Topic-based publish/subscribe over the simulated ISL. A publish
//! validates the envelope, assigns the per-sender sequence, suspends for
//! the configured link latency, then dispatches sequentially to every
//! matching subscriber, preserving publish order.
//!
//! Sync and async subscribers share one dispatch path: everything is a
//! [`MessageHandler`], and [`FnHandler`] adapts plain closures.
//!
//! The bus knows nothing about bandwidth or retries. Admission control
//! happens in the governor before a frame reaches `publish`; end-to-end
//! reliability is layered on top in [`crate::delivery`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use aegis_constellation_core::domain::config::SwarmConfig;
use aegis_constellation_core::domain::message::{
    MessageError, QoSLevel, SubscriptionId, SwarmMessage, TopicFilter,
};

use crate::delivery::SequenceWindow;

/// Subscriber callback seam. Implement directly for stateful services, or
/// go through [`FnHandler`] for closures.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: SwarmMessage);
}

/// Adapter turning a synchronous closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    callback: F,
}

impl<F> FnHandler<F>
where
    F: Fn(SwarmMessage) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(SwarmMessage) + Send + Sync,
{
    async fn handle(&self, message: SwarmMessage) {
        (self.callback)(message)
    }
}

struct Subscription {
    id: SubscriptionId,
    filter: TopicFilter,
    handler: Arc<dyn MessageHandler>,
}

/// Bus-level delivery accounting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BusMetrics {
    pub published: u64,
    /// Completed dispatch cycles (publishes and ingests that reached the
    /// subscriber loop).
    pub delivered: u64,
    pub acked: u64,
    pub dropped_duplicates: u64,
    pub rejected: u64,
}

impl BusMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "published": self.published,
            "delivered": self.delivered,
            "acked": self.acked,
            "dropped_duplicates": self.dropped_duplicates,
            "rejected": self.rejected,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One agent's view of the shared topic space.
pub struct SwarmMessageBus {
    config: Arc<SwarmConfig>,
    link_latency: Duration,
    ack_timeout: Duration,
    subscribers: RwLock<Vec<Subscription>>,
    next_subscription_id: AtomicU64,
    next_sequence: AtomicU64,
    pending_acks: DashMap<(Uuid, u64), Arc<Notify>>,
    ingest_window: Mutex<SequenceWindow>,
    metrics: Mutex<BusMetrics>,
}

impl SwarmMessageBus {
    pub fn new(config: Arc<SwarmConfig>) -> Self {
        let link_latency = Duration::from_millis(config.settings.link_latency_ms);
        let ack_timeout = Duration::from_millis(config.settings.ack_timeout_ms);
        Self {
            config,
            link_latency,
            ack_timeout,
            subscribers: RwLock::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
            pending_acks: DashMap::new(),
            ingest_window: Mutex::new(SequenceWindow::default()),
            metrics: Mutex::new(BusMetrics::default()),
        }
    }

    /// Test override for the simulated propagation delay.
    pub fn with_link_latency(mut self, ms: u64) -> Self {
        self.link_latency = Duration::from_millis(ms);
        self
    }

    pub fn agent_id(&self) -> &aegis_constellation_core::domain::agent::AgentId {
        &self.config.agent_id
    }

    pub fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, MessageError> {
        let parsed = TopicFilter::parse(filter)?;
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().push(Subscription {
            id,
            filter: parsed,
            handler,
        });
        tracing::debug!(filter, id = id.0, "subscription added");
        Ok(id)
    }

    pub fn subscribe_fn<F>(&self, filter: &str, callback: F) -> Result<SubscriptionId, MessageError>
    where
        F: Fn(SwarmMessage) + Send + Sync + 'static,
    {
        self.subscribe(filter, Arc::new(FnHandler::new(callback)))
    }

    /// Idempotent; returns whether the id was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    pub fn subscriptions(&self) -> Vec<(SubscriptionId, String)> {
        self.subscribers
            .read()
            .iter()
            .map(|s| (s.id, s.filter.to_string()))
            .collect()
    }

    /// Publishes as the local agent.
    ///
    /// Returns `Ok(true)` when the QoS tier is satisfied; for
    /// [`QoSLevel::Ack`] that means a subscriber acknowledged within
    /// `ack_timeout_ms`, and `Ok(false)` reports the missed deadline.
    /// Validation failures reject before anything touches the link.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoSLevel,
    ) -> Result<bool, BusError> {
        let mut message = SwarmMessage::new(topic, payload, self.config.agent_id.clone(), qos)
            .map_err(|e| self.reject(e))?;
        if message.payload.len() > self.config.settings.max_payload_bytes {
            return Err(self.reject(MessageError::PayloadTooLarge(message.payload.len())).into());
        }
        message.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);

        self.metrics.lock().published += 1;
        metrics::counter!("swarm_messages_published_total").increment(1);
        tracing::debug!(
            topic = %message.topic,
            seq = message.sequence,
            qos = message.qos.as_u8(),
            "publishing"
        );

        // Simulated ISL propagation.
        tokio::time::sleep(self.link_latency).await;

        // The waiter registers before dispatch so an ack fired from inside
        // a handler is not lost.
        let waiter = (message.qos == QoSLevel::Ack).then(|| {
            let notify = Arc::new(Notify::new());
            self.pending_acks.insert(message.dedup_key(), notify.clone());
            notify
        });

        self.dispatch(&message).await;

        match waiter {
            None => Ok(true),
            Some(notify) => {
                let acked = tokio::time::timeout(self.ack_timeout, notify.notified())
                    .await
                    .is_ok();
                self.pending_acks.remove(&message.dedup_key());
                if !acked {
                    tracing::debug!(
                        topic = %message.topic,
                        seq = message.sequence,
                        "ack deadline passed"
                    );
                }
                Ok(acked)
            }
        }
    }

    /// Serializes any `Serialize` payload to JSON bytes and publishes it.
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
        qos: QoSLevel,
    ) -> Result<bool, BusError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, qos).await
    }

    /// Entry point for envelopes that arrived from a remote agent, already
    /// decoded. No latency is added (the wire already paid it); a bounded
    /// `(sender, sequence)` window drops double-delivered frames.
    pub async fn ingest(&self, message: SwarmMessage) -> bool {
        if !self.ingest_window.lock().observe(message.dedup_key()) {
            self.metrics.lock().dropped_duplicates += 1;
            metrics::counter!("swarm_duplicates_dropped_total").increment(1);
            tracing::debug!(
                topic = %message.topic,
                sender = %message.sender,
                seq = message.sequence,
                "duplicate frame dropped"
            );
            return false;
        }
        self.dispatch(&message).await;
        true
    }

    /// Records a QoS-1 acknowledgment for `message` and wakes its waiting
    /// publisher. Idempotent; late or repeated acks are no-ops.
    pub fn acknowledge(&self, message: &SwarmMessage) {
        if let Some((_, notify)) = self.pending_acks.remove(&message.dedup_key()) {
            notify.notify_one();
            self.metrics.lock().acked += 1;
            metrics::counter!("swarm_messages_acked_total").increment(1);
        }
    }

    async fn dispatch(&self, message: &SwarmMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let subscribers = self.subscribers.read();
            subscribers
                .iter()
                .filter(|s| s.filter.matches(&message.topic))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in handlers {
            handler.handle(message.clone()).await;
        }
        self.metrics.lock().delivered += 1;
        metrics::counter!("swarm_messages_delivered_total").increment(1);
    }

    fn reject(&self, error: MessageError) -> MessageError {
        self.metrics.lock().rejected += 1;
        metrics::counter!("swarm_messages_rejected_total").increment(1);
        tracing::warn!(error = %error, "publish rejected");
        error
    }

    pub fn get_metrics(&self) -> BusMetrics {
        *self.metrics.lock()
    }
}
