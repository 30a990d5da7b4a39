//! Startup configuration (`SPEC_FULL.md` §6), loaded with the `config`
//! crate the teacher already depends on rather than hand-rolling a JSON
//! reader with environment overlay.

use crate::error::{DriverError, DriverResult};
use crate::mqtt::MqttConfig;
use crate::recipe::RecipeConfig;
use crate::transport::opcua::OpcUaConfig;
use crate::transport::s7::S7Config;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub name: String,
    pub catalog_path: String,
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub link: bool,
    #[serde(default = "default_true")]
    pub read: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Opcua {
        endpoint_url: String,
    },
    S7 {
        address: String,
        rack: u16,
        slot: u16,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub devices: Vec<DeviceConfig>,
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub recipe: Option<RecipeSettings>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttSettings {
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    pub client_id: String,
    /// The four subscribed command classes (§6): which one a command
    /// arrived on is carried alongside the envelope so the dispatcher can
    /// reply on `<topic>/reply`, but all four feed the same verb table.
    #[serde(default = "default_sub_gui_msg")]
    pub sub_gui_msg: String,
    #[serde(default = "default_sub_gui_cmd")]
    pub sub_gui_cmd: String,
    #[serde(default = "default_sub_server_cmd")]
    pub sub_server_cmd: String,
    #[serde(default = "default_sub_general_cmd")]
    pub sub_general_cmd: String,
    #[serde(default = "default_pub_drv_data")]
    pub pub_drv_data: String,
    #[serde(default = "default_pub_drv_data_struct")]
    pub pub_drv_data_struct: String,
    #[serde(default = "default_pub_modules_status")]
    pub pub_modules_status: String,
    #[serde(default = "default_pub_drv_broadcast")]
    pub pub_drv_broadcast: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeSettings {
    pub fetch_url_template: String,
    #[serde(default = "default_recipe_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default)]
    pub recipe_monitor_info: RecipeMonitorInfo,
}

/// Mirrors `recipe_monitor_info.{recipe_request,single_module}` (§6). Only
/// `recipe_request` drives the HTTP-fetch orchestrator (§4.6); the
/// `single_module` list gates the MQTT `write_recipe` command (§4.5)
/// directly against whichever module a plain write targets, so it carries
/// no separate wiring of its own here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeMonitorInfo {
    #[serde(default)]
    pub recipe_request: Vec<RecipeRequestModuleSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeRequestModuleSettings {
    pub device: String,
    pub block_id: i64,
    pub index: i64,
    pub category: String,
    pub request_code: String,
    pub id_code: String,
    pub result_code: String,
    #[serde(default)]
    pub is_mc: bool,
    #[serde(default)]
    pub multi_flow: bool,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_recipe_write_timeout_secs() -> u64 {
    8
}
fn default_sub_gui_msg() -> String {
    "driver/gui-msg".into()
}
fn default_sub_gui_cmd() -> String {
    "driver/gui-cmd".into()
}
fn default_sub_server_cmd() -> String {
    "driver/server-cmd".into()
}
fn default_sub_general_cmd() -> String {
    "driver/general-cmd".into()
}
fn default_pub_drv_data() -> String {
    "driver/drv-data".into()
}
fn default_pub_drv_data_struct() -> String {
    "driver/drv-data-struct".into()
}
fn default_pub_modules_status() -> String {
    "driver/modules-status".into()
}
fn default_pub_drv_broadcast() -> String {
    "driver/drv-broadcast".into()
}

impl MqttSettings {
    pub fn into_mqtt_config(self) -> MqttConfig {
        MqttConfig {
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            client_id: self.client_id,
            sub_gui_msg: self.sub_gui_msg,
            sub_gui_cmd: self.sub_gui_cmd,
            sub_server_cmd: self.sub_server_cmd,
            sub_general_cmd: self.sub_general_cmd,
            pub_drv_data: self.pub_drv_data,
            pub_drv_data_struct: self.pub_drv_data_struct,
            pub_modules_status: self.pub_modules_status,
            pub_drv_broadcast: self.pub_drv_broadcast,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }
}

impl RecipeSettings {
    pub fn into_recipe_config(self) -> (RecipeConfig, Vec<crate::recipe::RecipeRequestModule>) {
        let mut config = RecipeConfig::default();
        config.fetch_url_template = self.fetch_url_template;
        config.write_timeout = Duration::from_secs(self.write_timeout_secs);
        let triggers = self
            .recipe_monitor_info
            .recipe_request
            .into_iter()
            .map(|m| crate::recipe::RecipeRequestModule {
                module: crate::model::descriptor::ModuleKey::new(m.block_id, m.index, m.category),
                device: m.device,
                request_code: m.request_code,
                id_code: m.id_code,
                result_code: m.result_code,
                is_mc: m.is_mc,
                multi_flow: m.multi_flow,
            })
            .collect();
        (config, triggers)
    }
}

impl TransportConfig {
    pub fn build(&self) -> Box<dyn crate::transport::Transport> {
        match self {
            TransportConfig::Opcua { endpoint_url } => {
                Box::new(crate::transport::opcua::OpcUaTransport::new(OpcUaConfig {
                    endpoint_url: endpoint_url.clone(),
                    ..OpcUaConfig::default()
                }))
            }
            TransportConfig::S7 { address, rack, slot } => {
                Box::new(crate::transport::s7::S7Transport::new(S7Config {
                    address: address.clone(),
                    rack: *rack,
                    slot: *slot,
                    exclusive_access: true,
                }))
            }
        }
    }
}

/// Loads `DriverConfig` from a JSON file, overlaying `DRIVER_*` environment
/// variables (e.g. `DRIVER_MQTT__BROKER_HOST`) the way the teacher's own
/// settings loader does for its database connection string.
pub fn load(path: impl AsRef<Path>) -> DriverResult<DriverConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(config::Environment::with_prefix("DRIVER").separator("__"));
    let settings = builder.build()?;
    settings
        .try_deserialize()
        .map_err(|e| DriverError::config(format!("invalid configuration: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> &'static str {
        r#"{
            "devices": [
                {"name": "plc-1", "catalogPath": "catalog.csv", "transport": {"kind": "opcua", "endpointUrl": "opc.tcp://localhost:4840"}}
            ],
            "mqtt": {
                "brokerHost": "localhost",
                "clientId": "driver-io"
            }
        }"#
    }

    #[test]
    fn loads_a_minimal_configuration_with_defaults_applied() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(sample_config().as_bytes()).unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.log_level, "info");
        assert!(config.devices[0].link);
    }

    #[test]
    fn rejects_an_unknown_transport_kind() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let bad = sample_config().replace("\"opcua\"", "\"profibus\"");
        file.write_all(bad.as_bytes()).unwrap();
        assert!(load(file.path()).is_err());
    }
}
