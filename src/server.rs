//! Process-wide wiring: builds the device map, the MQTT handle and the
//! recipe table from `DriverConfig`, then spawns the scheduler loops.
//! Grounded on the teacher's `AppState`/service-locator pattern in
//! `src-tauri/src/lib.rs`, generalized from a Tauri-managed state struct to
//! a plain owned struct driving `tokio::spawn`.

use crate::config::DriverConfig;
use crate::device::{Device, OutboundBatch};
use crate::mqtt::{dispatch, MqttHandle};
use crate::recipe::{RecipeConfig, RecipeRequestModule, RecipeTable};
use crate::scheduler::{self, DeviceMap, SchedulerPeriods};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

pub struct DistributionServer {
    pub devices: DeviceMap,
    pub mqtt: MqttHandle,
    pub recipe_table: RecipeTable,
    pub recipe_config: RecipeConfig,
    pub recipe_triggers: Vec<RecipeRequestModule>,
    pub periods: SchedulerPeriods,
    outbound_tx: mpsc::UnboundedSender<OutboundBatch>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DistributionServer {
    pub async fn bootstrap(config: DriverConfig) -> crate::error::DriverResult<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<OutboundBatch>();
        let mut devices = BTreeMap::new();
        for device_config in &config.devices {
            let transport = device_config.transport.build();
            let mut device = Device::new(
                device_config.name.clone(),
                transport,
                PathBuf::from(&device_config.catalog_path),
                outbound_tx.clone(),
            );
            device.load().await?;
            device.desired.link = device_config.link;
            device.desired.read = device_config.read;
            devices.insert(device_config.name.clone(), device);
        }

        let mqtt = MqttHandle::connect(config.mqtt.into_mqtt_config());
        mqtt.subscribe_command_topics()
            .await
            .map_err(|e| crate::error::DriverError::transport_fatal("mqtt", e.to_string()))?;

        let (recipe_config, recipe_triggers) = config.recipe.map(|r| r.into_recipe_config()).unwrap_or_default();
        let (shutdown_tx, _) = broadcast::channel(8);

        let server = Self {
            devices: Arc::new(Mutex::new(devices)),
            mqtt,
            recipe_table: Arc::new(Mutex::new(BTreeMap::new())),
            recipe_config,
            recipe_triggers,
            periods: SchedulerPeriods::default(),
            outbound_tx,
            shutdown_tx,
        };
        server.spawn_background_tasks(outbound_rx);
        Ok(server)
    }

    fn spawn_background_tasks(&self, outbound_rx: mpsc::UnboundedReceiver<OutboundBatch>) {
        let devices = self.devices.clone();
        tokio::spawn(scheduler::spawn_read_loop(
            devices.clone(),
            self.periods.read,
            self.shutdown_tx.subscribe(),
            self.outbound_tx.clone(),
        ));
        tokio::spawn(scheduler::spawn_manage_loop(
            devices.clone(),
            self.mqtt.clone(),
            self.periods.manage,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(scheduler::spawn_safety_clear_loop(devices.clone(), self.periods.safety_clear, self.shutdown_tx.subscribe()));
        tokio::spawn(scheduler::spawn_status_broadcast_loop(
            devices.clone(),
            self.mqtt.clone(),
            self.periods.status_broadcast,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(scheduler::spawn_mqtt_pump(self.mqtt.clone(), self.periods.mqtt_pump, self.shutdown_tx.subscribe()));
        tokio::spawn(crate::mqtt::spawn_outbound_publisher(self.mqtt.clone(), outbound_rx));

        let (recipe_status_tx, recipe_status_rx) = mpsc::unbounded_channel();
        tokio::spawn(crate::recipe::spawn_recipe_loop(
            devices.clone(),
            self.recipe_table.clone(),
            self.recipe_triggers.clone(),
            self.recipe_config.clone(),
            self.mqtt.clone(),
            self.periods.recipe_request,
            self.shutdown_tx.subscribe(),
            recipe_status_tx,
        ));
        tokio::spawn(crate::recipe::spawn_status_publisher(recipe_status_rx, self.outbound_tx.clone(), "recipe".into()));

        let mqtt = self.mqtt.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let recipe_config = self.recipe_config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
                }
                while let Some(inbound) = mqtt.next_command().await {
                    let reply = dispatch(inbound.envelope, &devices, &recipe_config).await;
                    if let Ok(payload) = serde_json::to_vec(&reply) {
                        mqtt.publish_reply(&inbound.topic, payload).await;
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
