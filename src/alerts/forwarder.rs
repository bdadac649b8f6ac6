//! Optional cluster-wide alert fan-out.
//!
//! The forwarder is a pure observer: it subscribes to local `alert_fired`
//! telemetry and rebroadcasts serialized notifications on a shared topic.
//! Remote notifications are enqueued locally unless they originated on this
//! node, which prevents forwarding loops. The core is correct without it.

use super::queue::AlertQueue;
use super::types::Notification;
use crate::telemetry::{EventPayload, TelemetryHub};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const ALERT_TOPIC: &str = "beamlens/alerts";

/// Cluster pub/sub transport carrying opaque payloads on the alert topic.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Stream of payloads published by any node, including this one.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<u8>>;
}

/// In-process transport: every subscriber sees every publish. Backs the
/// tests and single-binary demos.
pub struct LoopbackTransport {
    bus: broadcast::Sender<Vec<u8>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        let (bus, _) = broadcast::channel(64);
        Arc::new(Self { bus })
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let _ = self.bus.send(payload);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(payload) = bus_rx.recv().await {
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        rx
    }
}

/// MQTT transport over rumqttc. One shared topic, at-least-once delivery.
pub struct MqttTransport {
    client: AsyncClient,
    inbound: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MqttTransport {
    pub fn connect(host: &str, port: u16, node: &str, cancel: CancellationToken) -> Arc<Self> {
        let mut options = MqttOptions::new(format!("beamlens-{node}"), host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 16);

        let subscribe_client = client.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(err) = subscribe_client.subscribe(ALERT_TOPIC, QoS::AtLeastOnce).await {
                tracing::warn!(error = %err, "mqtt subscribe failed");
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    polled = eventloop.poll() => match polled {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if tx.send(publish.payload.to_vec()).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "mqtt event loop error, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        Arc::new(Self {
            client,
            inbound: parking_lot::Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl ClusterTransport for MqttTransport {
    async fn publish(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .publish(ALERT_TOPIC, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        self.inbound.lock().take().unwrap_or_else(|| {
            // Single-subscriber transport; a second taker gets a dead channel.
            tracing::warn!("mqtt transport already subscribed");
            mpsc::unbounded_channel().1
        })
    }
}

pub struct ClusterForwarder;

impl ClusterForwarder {
    /// Spawn the forwarding task. Local alerts go out tagged with `node`;
    /// inbound alerts from other nodes land on the local queue.
    pub fn spawn(
        node: String,
        transport: Arc<dyn ClusterTransport>,
        telemetry: Arc<TelemetryHub>,
        queue: Arc<AlertQueue>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut events = telemetry.subscribe();
        let mut inbound = transport.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Ok(event) = event else { continue };
                        let EventPayload::AlertFired { notification } = event.payload else {
                            continue;
                        };
                        // Only alerts born on this node go out; rebroadcasting
                        // remote ones would loop them around the cluster.
                        if notification.node != node {
                            continue;
                        }
                        match serde_json::to_vec(&notification) {
                            Ok(payload) => {
                                if let Err(err) = transport.publish(payload).await {
                                    tracing::warn!(error = %err, "cluster publish failed");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "alert serialization failed");
                            }
                        }
                    }
                    payload = inbound.recv() => {
                        let Some(payload) = payload else { break };
                        let Ok(notification) = serde_json::from_slice::<Notification>(&payload)
                        else {
                            tracing::debug!("ignoring malformed cluster alert payload");
                            continue;
                        };
                        if notification.node == node {
                            continue;
                        }
                        queue.push(notification);
                    }
                }
            }
        })
    }
}
