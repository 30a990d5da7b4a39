//! MQTT control plane: a thin `rumqttc` wrapper plus the command dispatcher
//! (`SPEC_FULL.md` §4.4). Grounded on the teacher's `PlcMonitoringService`
//! event-publishing path, generalized from a single status channel to the
//! full command/reply envelope protocol.

pub mod dispatcher;

use crate::device::OutboundBatch;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub use dispatcher::{dispatch, CommandEnvelope};

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// The four subscribed command classes (§6). Which one a command
    /// arrived on determines its reply topic (`<topic>/reply`); all four
    /// route through the same verb table (§4.5).
    pub sub_gui_msg: String,
    pub sub_gui_cmd: String,
    pub sub_server_cmd: String,
    pub sub_general_cmd: String,
    pub pub_drv_data: String,
    pub pub_drv_data_struct: String,
    pub pub_modules_status: String,
    pub pub_drv_broadcast: String,
    pub keep_alive: Duration,
}

impl MqttConfig {
    fn sub_topics(&self) -> [&str; 4] {
        [
            self.sub_gui_msg.as_str(),
            self.sub_gui_cmd.as_str(),
            self.sub_server_cmd.as_str(),
            self.sub_general_cmd.as_str(),
        ]
    }
}

/// A decoded command paired with the topic it arrived on, so the
/// dispatcher can publish its one reply on `<topic>/reply` (§4.5, §7 open
/// question (iii)).
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub topic: String,
    pub envelope: CommandEnvelope,
}

/// Inbound command queue populated by the event loop pump, drained by the
/// dispatcher. Bounded so a runaway publisher cannot exhaust memory.
pub type InboundQueue = Arc<Mutex<std::collections::VecDeque<InboundCommand>>>;

#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    event_loop: Arc<Mutex<rumqttc::EventLoop>>,
    config: MqttConfig,
    inbound: InboundQueue,
}

#[derive(Debug, Serialize)]
struct StatusEntry<'a> {
    name: &'a str,
    connecting: bool,
}

/// Full driver status snapshot published by the device-manage loop on
/// `pub_drv_data_struct` (§4.4 table, "publish full driver status
/// snapshot"), distinct from the lightweight `(name, connecting)` pairs on
/// `pub_modules_status`.
#[derive(Debug, Serialize)]
pub struct DeviceStatusSnapshot {
    pub name: String,
    pub connecting: bool,
    pub loading: bool,
    pub link: bool,
    pub read: bool,
}

/// A recipe-check or recipe-download error broadcast on `pub_drv_broadcast`
/// (§4.6 step 4).
#[derive(Debug, Clone, Serialize)]
pub struct RecipeBroadcast {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub module: String,
    pub device: String,
    pub code: Option<i64>,
    pub result: i64,
}

impl MqttHandle {
    pub fn connect(config: MqttConfig) -> Self {
        // A random suffix keeps the broker from rejecting the session as a
        // duplicate client ID across a quick reconnect/restart cycle.
        let client_id = format!("{}-{}", config.client_id, uuid::Uuid::new_v4());
        let mut opts = MqttOptions::new(client_id, config.broker_host.clone(), config.broker_port);
        opts.set_keep_alive(config.keep_alive);
        let (client, event_loop) = AsyncClient::new(opts, 64);
        Self {
            client,
            event_loop: Arc::new(Mutex::new(event_loop)),
            config,
            inbound: Arc::new(Mutex::new(std::collections::VecDeque::new())),
        }
    }

    /// Subscribes all four recognized command classes (§6: `sub_gui_msg`,
    /// `sub_gui_cmd`, `sub_server_cmd`, `sub_general_cmd`).
    pub async fn subscribe_command_topics(&self) -> Result<(), rumqttc::ClientError> {
        for topic in self.config.sub_topics() {
            self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Drains whatever the event loop has queued and enqueues decoded
    /// command envelopes; malformed payloads are logged and dropped rather
    /// than stalling the pump.
    pub async fn poll_once(&self) {
        let notification = {
            let mut event_loop = self.event_loop.lock().await;
            match tokio::time::timeout(Duration::from_millis(15), event_loop.poll()).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    log::warn!("[MQTT] event loop error: {e}");
                    return;
                }
                Err(_) => return,
            }
        };
        if let Event::Incoming(Packet::Publish(publish)) = notification {
            let topic = publish.topic.clone();
            match serde_json::from_slice::<CommandEnvelope>(publish.payload.as_ref()) {
                Ok(envelope) => self.inbound.lock().await.push_back(InboundCommand { topic, envelope }),
                Err(e) => log::warn!("[MQTT] malformed command envelope on {topic}: {e}"),
            }
        }
    }

    pub async fn next_command(&self) -> Option<InboundCommand> {
        self.inbound.lock().await.pop_front()
    }

    /// `pub_modules_status` — lightweight per-device `(name, connecting)`
    /// pairs (§4.4 status-broadcast loop, 2.0s default).
    pub async fn publish_status(&self, statuses: &[(String, bool)]) {
        let entries: Vec<StatusEntry> = statuses.iter().map(|(n, c)| StatusEntry { name: n, connecting: *c }).collect();
        let Ok(payload) = serde_json::to_vec(&entries) else { return };
        if let Err(e) = self.client.publish(&self.config.pub_modules_status, QoS::AtLeastOnce, false, payload).await {
            log::warn!("[MQTT] status publish failed: {e}");
        }
    }

    /// `pub_drv_data_struct` — full driver status snapshot published by the
    /// device-manage loop (§4.4).
    pub async fn publish_full_status(&self, snapshot: &[DeviceStatusSnapshot]) {
        let Ok(payload) = serde_json::to_vec(snapshot) else { return };
        if let Err(e) = self.client.publish(&self.config.pub_drv_data_struct, QoS::AtLeastOnce, false, payload).await {
            log::warn!("[MQTT] full status publish failed: {e}");
        }
    }

    /// `pub_drv_broadcast` — recipe check/download error broadcasts
    /// (§4.6 step 4).
    pub async fn publish_broadcast(&self, broadcast: &RecipeBroadcast) {
        let Ok(payload) = serde_json::to_vec(broadcast) else { return };
        if let Err(e) = self.client.publish(&self.config.pub_drv_broadcast, QoS::AtLeastOnce, false, payload).await {
            log::warn!("[MQTT] broadcast publish failed: {e}");
        }
    }

    /// One reply per command, published on `<source_topic>/reply` (§4.5,
    /// §7).
    pub async fn publish_reply(&self, source_topic: &str, payload: Vec<u8>) {
        let reply_topic = format!("{source_topic}/reply");
        if let Err(e) = self.client.publish(&reply_topic, QoS::AtLeastOnce, false, payload).await {
            log::warn!("[MQTT] reply publish failed on {reply_topic}: {e}");
        }
    }

    pub async fn publish_outbound(&self, batch: &OutboundBatch) {
        let topic = format!(
            "{}/{}/{}_{}_{}",
            self.config.pub_drv_data, batch.device, batch.module.block_id, batch.module.index, batch.module.category
        );
        let Ok(payload) = serde_json::to_vec(&batch.entries) else { return };
        if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            log::warn!("[MQTT] outbound publish failed: {e}");
        }
    }
}

/// Drains the outbound-batch channel and publishes each one; runs
/// alongside the scheduler loops rather than as one of its five periods,
/// since it is driven by batch arrival, not a fixed clock.
pub async fn spawn_outbound_publisher(mqtt: MqttHandle, mut outbound_rx: mpsc::UnboundedReceiver<OutboundBatch>) {
    while let Some(batch) = outbound_rx.recv().await {
        mqtt.publish_outbound(&batch).await;
    }
}
