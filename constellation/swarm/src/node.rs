// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Node
//!
//! Explicit per-agent assembly of the whole substrate: one bus, governor,
//! delivery layer, registry, codec set, and both broadcasters, constructed
//! together and owned by the hosting process. Nothing here is a process
//! singleton, so any number of simulated satellites coexist in one test
//! run with no shared state beyond the message payloads they exchange.
//!
//! Construction wires the substrate's own topics:
//!
//! - `coord/ack` feeds [`ReliableDelivery::handle_ack_message`]
//! - `health/summary` is verified, decompressed, and fed to the registry
//! - `intent/plan` is fed to the intent store (peer frames only)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use aegis_constellation_core::domain::agent::AgentId;
use aegis_constellation_core::domain::config::SwarmConfig;
use aegis_constellation_core::domain::intent::IntentMessage;
use aegis_constellation_core::domain::message::{topics, MessageError, SubscriptionId, SwarmMessage};
use aegis_constellation_core::infrastructure::compressor::StateCompressor;
use aegis_constellation_core::infrastructure::serializer::SwarmSerializer;

use crate::bus::{MessageHandler, SwarmMessageBus};
use crate::delivery::ReliableDelivery;
use crate::governor::{BandwidthGovernor, CongestionLevel};
use crate::health_broadcaster::{HealthBroadcaster, HealthSource};
use crate::intent_broadcaster::IntentBroadcaster;
use crate::registry::SwarmRegistry;

/// Cadence of the pending-table TTL sweep.
const CLEANUP_INTERVAL_S: u64 = 5;

/// One satellite's complete communication stack.
pub struct SwarmNode {
    config: Arc<SwarmConfig>,
    serializer: Arc<SwarmSerializer>,
    bus: Arc<SwarmMessageBus>,
    governor: Arc<BandwidthGovernor>,
    delivery: Arc<ReliableDelivery>,
    registry: Arc<SwarmRegistry>,
    health_broadcaster: Arc<HealthBroadcaster>,
    intent_broadcaster: Arc<IntentBroadcaster>,
    signing_key: Option<Vec<u8>>,
}

impl SwarmNode {
    pub fn new(config: SwarmConfig, signing_key: Option<Vec<u8>>) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let serializer = Arc::new(SwarmSerializer::new(config.settings.schema_validation));
        let bus = Arc::new(SwarmMessageBus::new(config.clone()));
        let governor = Arc::new(BandwidthGovernor::new(&config));
        let delivery = Arc::new(ReliableDelivery::new(
            bus.clone(),
            config.agent_id.clone(),
        ));
        let registry = Arc::new(SwarmRegistry::new(config.clone()));
        let health_broadcaster = Arc::new(HealthBroadcaster::new(
            config.clone(),
            bus.clone(),
            governor.clone(),
            registry.clone(),
            StateCompressor::new(config.settings.compression),
            signing_key.clone(),
        )?);
        let intent_broadcaster = Arc::new(IntentBroadcaster::new(
            bus.clone(),
            governor.clone(),
            registry.clone(),
        ));

        let node = Self {
            config,
            serializer,
            bus,
            governor,
            delivery,
            registry,
            health_broadcaster,
            intent_broadcaster,
            signing_key,
        };
        node.wire_substrate_topics()?;
        tracing::info!(agent = %node.config.agent_id, "swarm node assembled");
        Ok(node)
    }

    fn wire_substrate_topics(&self) -> Result<(), MessageError> {
        let delivery = self.delivery.clone();
        let serializer = self.serializer.clone();
        self.bus.subscribe_fn(topics::COORD_ACK, move |message| {
            match serializer.decode_ack(&message.payload) {
                Ok(ack) => delivery.handle_ack_message(&ack),
                Err(e) => tracing::warn!(error = %e, "undecodable ack frame dropped"),
            }
        })?;

        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let key = self.signing_key.clone();
        let constellation = self.config.constellation_id.clone();
        let decoder = parking_lot::Mutex::new(StateCompressor::new(
            self.config.settings.compression,
        ));
        self.bus
            .subscribe_fn(topics::HEALTH_SUMMARY, move |message| {
                match decode_health_broadcast(
                    &message.payload,
                    key.as_deref(),
                    &constellation,
                    &decoder,
                ) {
                    Ok((sender, health)) => {
                        registry.record_heartbeat(&sender, Some(health));
                        bus.acknowledge(&message);
                    }
                    Err(reason) => {
                        tracing::warn!(
                            sender = %message.sender,
                            reason,
                            "health broadcast rejected"
                        );
                        metrics::counter!("swarm_health_rejected_total").increment(1);
                    }
                }
            })?;

        let intents = self.intent_broadcaster.clone();
        let bus = self.bus.clone();
        let local = self.config.agent_id.clone();
        self.bus.subscribe_fn(topics::INTENT_PLAN, move |message| {
            match serde_json::from_slice::<IntentMessage>(&message.payload) {
                Ok(intent) if intent.validate().is_ok() => {
                    if intent.sender != local {
                        intents.observe_remote(intent);
                    }
                    bus.acknowledge(&message);
                }
                Ok(_) | Err(_) => {
                    tracing::warn!(sender = %message.sender, "invalid intent frame dropped");
                }
            }
        })?;
        Ok(())
    }

    /// Subscribes an application handler behind the reliable-delivery
    /// receiver: envelopes are acked, deduplicated, and nacked under
    /// critical congestion before `callback` sees a payload.
    pub fn subscribe_reliable<F>(
        &self,
        filter: &str,
        callback: F,
    ) -> Result<SubscriptionId, MessageError>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.bus.subscribe(
            filter,
            Arc::new(ReliableIngress {
                delivery: self.delivery.clone(),
                governor: self.governor.clone(),
                callback: Box::new(callback),
            }),
        )
    }

    /// Starts both periodic broadcasters plus the pending-table sweep and
    /// returns the token that cancels all of them. Cancellation is
    /// cooperative; in-flight publishes complete before the tasks exit.
    pub fn spawn_broadcasters(&self, health_source: Arc<dyn HealthSource>) -> CancellationToken {
        let cancel = CancellationToken::new();
        tokio::spawn(
            self.health_broadcaster
                .clone()
                .run(cancel.clone(), health_source),
        );
        tokio::spawn(self.intent_broadcaster.clone().run(cancel.clone()));

        let delivery = self.delivery.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(CLEANUP_INTERVAL_S)) => {
                        delivery.cleanup_expired();
                    }
                }
            }
        });
        cancel
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.config.agent_id
    }

    pub fn config(&self) -> &Arc<SwarmConfig> {
        &self.config
    }

    pub fn bus(&self) -> &Arc<SwarmMessageBus> {
        &self.bus
    }

    pub fn governor(&self) -> &Arc<BandwidthGovernor> {
        &self.governor
    }

    pub fn delivery(&self) -> &Arc<ReliableDelivery> {
        &self.delivery
    }

    pub fn registry(&self) -> &Arc<SwarmRegistry> {
        &self.registry
    }

    pub fn health_broadcaster(&self) -> &Arc<HealthBroadcaster> {
        &self.health_broadcaster
    }

    pub fn intent_broadcaster(&self) -> &Arc<IntentBroadcaster> {
        &self.intent_broadcaster
    }

    pub fn serializer(&self) -> &Arc<SwarmSerializer> {
        &self.serializer
    }

    /// One flat snapshot of every component's counters for the metrics/log
    /// sink.
    pub fn get_node_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "agent_id": self.config.agent_id.to_string(),
            "bus": self.bus.get_metrics().to_json(),
            "bandwidth": self.governor.to_json(),
            "delivery": self.delivery.get_stats().to_json(),
            "registry": self.registry.get_registry_stats(),
            "health_broadcasts": self.health_broadcaster.get_metrics().to_json(),
            "intents": self.intent_broadcaster.get_stats().to_json(),
            "compression": self.health_broadcaster.compression_stats().to_json(),
        })
    }
}

struct ReliableIngress {
    delivery: Arc<ReliableDelivery>,
    governor: Arc<BandwidthGovernor>,
    callback: Box<dyn Fn(Bytes) + Send + Sync>,
}

#[async_trait]
impl MessageHandler for ReliableIngress {
    async fn handle(&self, message: SwarmMessage) {
        let congested = self.governor.get_congestion_level() == CongestionLevel::Critical;
        if let Some(payload) = self.delivery.receive(&message, congested).await {
            (self.callback)(payload);
        }
    }
}

/// Parses, verifies, and decompresses a signed health broadcast. Returns a
/// static rejection reason instead of a partially decoded value on any
/// failure.
fn decode_health_broadcast(
    raw: &[u8],
    key: Option<&[u8]>,
    constellation: &str,
    decoder: &parking_lot::Mutex<StateCompressor>,
) -> Result<(AgentId, aegis_constellation_core::domain::health::HealthSummary), &'static str> {
    let payload: serde_json::Value = serde_json::from_slice(raw).map_err(|_| "not json")?;
    if !HealthBroadcaster::verify_signature(&payload, key) {
        return Err("bad signature");
    }
    let sender_constellation = payload["constellation"]
        .as_str()
        .ok_or("missing constellation")?;
    if sender_constellation != constellation {
        return Err("foreign constellation");
    }
    let serial = payload["agent_id"].as_str().ok_or("missing agent_id")?;
    let frame = payload["compressed_health"]
        .as_str()
        .ok_or("missing compressed_health")
        .and_then(|h| hex::decode(h).map_err(|_| "bad hex"))?;
    let health = decoder
        .lock()
        .decompress(&frame)
        .map_err(|_| "undecodable frame")?;
    Ok((AgentId::derive(constellation, serial), health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_constellation_core::domain::agent::SatelliteRole;
    use aegis_constellation_core::domain::config::PeerConfig;
    use aegis_constellation_core::domain::health::HealthSummary;
    use aegis_constellation_core::domain::message::QoSLevel;
    use parking_lot::Mutex;

    fn node(serial: &str, peers: &[&str], key: Option<&[u8]>) -> SwarmNode {
        let peers = peers
            .iter()
            .map(|s| PeerConfig {
                agent_id: AgentId::derive("aegis-demo", s),
                role: SatelliteRole::Backup,
            })
            .collect();
        let mut config = SwarmConfig::new(
            AgentId::derive("aegis-demo", serial),
            SatelliteRole::Primary,
            "aegis-demo",
            peers,
        )
        .unwrap();
        config.settings.link_latency_ms = 0;
        SwarmNode::new(config, key.map(<[u8]>::to_vec)).unwrap()
    }

    fn health(risk: f64) -> HealthSummary {
        HealthSummary::new(vec![0.2; 32], risk, 1.0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_health_broadcast_lands_in_registry() {
        let node = node("sat-01", &["sat-02"], Some(b"shared-key".as_slice()));
        node.health_broadcaster()
            .broadcast_once(&health(0.6))
            .await
            .unwrap();

        let snapshot = node.registry().get_peer_health(node.agent_id()).unwrap();
        assert!((snapshot.risk_score - 0.6).abs() < 0.02);
        assert_eq!(node.health_broadcaster().get_metrics().successful_broadcasts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingested_peer_health_heartbeats_the_peer() {
        let sender = node("sat-02", &["sat-01"], Some(b"shared-key".as_slice()));
        let receiver = node("sat-01", &["sat-02"], Some(b"shared-key".as_slice()));

        // Capture the signed frame off the sender's bus and replay it into
        // the receiver, the way a transport link would.
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        sender
            .bus()
            .subscribe_fn(topics::HEALTH_SUMMARY, move |m| sink.lock().push(m))
            .unwrap();
        sender
            .health_broadcaster()
            .broadcast_once(&health(0.9))
            .await
            .unwrap();

        let frame = frames.lock().pop().unwrap();
        assert!(receiver.bus().ingest(frame).await);

        let peer = AgentId::derive("aegis-demo", "sat-02");
        let snapshot = receiver.registry().get_peer_health(&peer).unwrap();
        assert!((snapshot.risk_score - 0.9).abs() < 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tampered_health_broadcast_is_rejected() {
        let sender = node("sat-02", &[], Some(b"shared-key".as_slice()));
        let receiver = node("sat-01", &["sat-02"], Some(b"shared-key".as_slice()));

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        sender
            .bus()
            .subscribe_fn(topics::HEALTH_SUMMARY, move |m| sink.lock().push(m))
            .unwrap();
        sender
            .health_broadcaster()
            .broadcast_once(&health(0.9))
            .await
            .unwrap();

        let mut frame = frames.lock().pop().unwrap();
        let mut payload: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        payload["agent_id"] = serde_json::Value::String("sat-99".into());
        frame.payload = serde_json::to_vec(&payload).unwrap().into();
        receiver.bus().ingest(frame).await;

        let impostor = AgentId::derive("aegis-demo", "sat-99");
        assert!(receiver.registry().get_peer_state(&impostor).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_intent_observed_own_ignored() {
        let node = node("sat-01", &["sat-02"], None);

        let intent = IntentMessage::new(
            "scan",
            serde_json::Map::new(),
            aegis_constellation_core::domain::intent::IntentPriority::Performance,
            AgentId::derive("aegis-demo", "sat-02"),
        )
        .unwrap();
        let frame = SwarmMessage::new(
            topics::INTENT_PLAN,
            serde_json::to_vec(&intent).unwrap(),
            intent.sender.clone(),
            QoSLevel::Ack,
        )
        .unwrap();
        node.bus().ingest(frame).await;
        assert_eq!(node.intent_broadcaster().active_intents().len(), 1);

        // A locally broadcast intent is stored by the broadcaster itself,
        // not doubled by the bus tap.
        let own = IntentMessage::new(
            "scan",
            serde_json::Map::new(),
            aegis_constellation_core::domain::intent::IntentPriority::Performance,
            node.agent_id().clone(),
        )
        .unwrap();
        node.intent_broadcaster().broadcast_intent(own).await.unwrap();
        assert_eq!(node.intent_broadcaster().active_intents().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_subscription_dedups_and_acks() {
        let node = node("sat-01", &["sat-02"], None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        node.subscribe_reliable("coord/task", move |payload| sink.lock().push(payload))
            .unwrap();

        let remote = AgentId::derive("aegis-demo", "sat-02");
        let envelope = crate::delivery::ReliableEnvelope {
            seq: 3,
            sender: remote.clone(),
            payload: Bytes::from_static(b"maneuver"),
        };
        let mut frame = SwarmMessage::new(
            "coord/task",
            serde_json::to_vec(&envelope).unwrap(),
            remote,
            QoSLevel::Reliable,
        )
        .unwrap();
        frame.sequence = 1;
        node.bus().ingest(frame.clone()).await;

        // Retransmission with a fresh bus sequence but the same delivery
        // sequence: acked again, delivered once.
        frame.sequence = 2;
        node.bus().ingest(frame).await;

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(node.delivery().get_stats().duplicates_rejected, 1);
        // Both attempts were answered with an ack frame.
        assert_eq!(node.bus().get_metrics().published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_broadcasters_cancels_cleanly() {
        struct Source;
        #[async_trait]
        impl HealthSource for Source {
            async fn current_health(&self) -> Option<HealthSummary> {
                Some(HealthSummary::new(vec![0.1; 32], 0.2, 0.5).unwrap())
            }
        }

        let node = node("sat-01", &[], None);
        let cancel = node.spawn_broadcasters(Arc::new(Source));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            node.health_broadcaster().get_metrics().successful_broadcasts,
            1
        );
        cancel.cancel();
        // Silence after cancellation: no further cycles fire.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(node.health_broadcaster().get_metrics().total_broadcasts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_stats_shape() {
        let node = node("sat-01", &["sat-02", "sat-03"], None);
        let stats = node.get_node_stats();
        assert_eq!(stats["agent_id"], "aegis-demo/sat-01");
        assert_eq!(stats["registry"]["total_peers"], 3);
        assert_eq!(stats["bus"]["published"], 0);
    }
}
