//! Recipe orchestrator (`SPEC_FULL.md` §4.6): per-tick scan of configured
//! request triggers, HTTP fetch, per-module writable/valid gating, fan-out
//! writes across devices, and `result`-code progress feedback. Grounded on
//! the teacher's task-execution state machine
//! (`domain::services::test_execution_service`) for the status-transition
//! shape, generalized from pass/fail to the recipe result codes in §7.

use crate::device::OutboundBatch;
use crate::model::descriptor::ModuleKey;
use crate::model::value::PlcValue;
use crate::mqtt::{MqttHandle, RecipeBroadcast};
use crate::scheduler::DeviceMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

/// `Idle(0) -> Requesting(1) -> Downloading(2) -> Done(3)`, or
/// `-> Error(1001..1009)` at any step (§9 open question (ii): error codes
/// are terminal, cleared back to `Idle` only by a fresh request).
pub type RecipeStatus = i64;

pub const STATUS_IDLE: RecipeStatus = 0;
pub const STATUS_REQUESTING: RecipeStatus = 1;
pub const STATUS_DOWNLOADING: RecipeStatus = 2;
pub const STATUS_DONE: RecipeStatus = 3;
pub const ERR_NULL_RESPONSE: RecipeStatus = 1001;
pub const ERR_RESULT_10000: RecipeStatus = 1002;
pub const ERR_RESULT_20001: RecipeStatus = 1003;
pub const ERR_RESULT_20002: RecipeStatus = 1004;
pub const ERR_NOT_WRITABLE: RecipeStatus = 1005;
pub const ERR_GATE_INVALID: RecipeStatus = 1006;
pub const ERR_HTTP: RecipeStatus = 1007;
pub const ERR_WRITE_TIMEOUT: RecipeStatus = 1008;
pub const ERR_RESULT_20003: RecipeStatus = 1009;

/// Maps the upstream HTTP `code` field to the status the device-side table
/// should carry (§4.6 step 4). `code==200` proceeds to the download phase;
/// any other non-enumerated code is passed through as-is and published as
/// a `RecipeDownloadError` broadcast by the caller.
pub fn map_result_code(code: Option<i64>) -> RecipeStatus {
    match code {
        None => ERR_NULL_RESPONSE,
        Some(10000) => ERR_RESULT_10000,
        Some(20001) => ERR_RESULT_20001,
        Some(20002) => ERR_RESULT_20002,
        Some(20003) => ERR_RESULT_20003,
        Some(200) => STATUS_DOWNLOADING,
        Some(other) => other,
    }
}

/// A `recipe_monitor_info.recipe_request[]` entry: one request trigger
/// watched every tick, identifying the device/module that carries the
/// `request`/`id`/`result` descriptors.
#[derive(Debug, Clone)]
pub struct RecipeRequestModule {
    pub module: ModuleKey,
    pub device: String,
    pub request_code: String,
    pub id_code: String,
    pub result_code: String,
    /// The designated "MC" request module: `list[0].value.Basic.Id` is
    /// zeroed before decode, and it alone receives the `write_recipe_id`
    /// echo (§4.6 step 5, step 7).
    pub is_mc: bool,
    /// Multi-flow recipes repeat the terminal `result=3` five times to
    /// tolerate a one-way loss (§4.6 step 7); single-flow writes it once.
    pub multi_flow: bool,
}

#[derive(Debug, Clone, Default)]
struct TransactionState {
    status: RecipeStatus,
    recipe_id: Option<String>,
}

pub type RecipeTable = Arc<Mutex<BTreeMap<ModuleKey, TransactionState>>>;

#[derive(Debug, Clone)]
pub struct RecipeConfig {
    pub fetch_url_template: String,
    pub write_timeout: Duration,
    /// The original's two spellings for the same gate, kept so a catalog
    /// built from either naming still gates correctly (§9 open question
    /// (iii)): canonical name checked first, typo'd fallback second.
    pub valid_codes: (&'static str, &'static str),
    pub writable_codes: (&'static str, &'static str),
    pub write_recipe_id_code: &'static str,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            fetch_url_template: "http://localhost/recipe/{recipeId}".into(),
            write_timeout: Duration::from_secs(8),
            valid_codes: ("Others_Recipe_valid", "Other_Reicpe_Valid"),
            writable_codes: ("Others_Recipe_writable", "Other_Reicpe_Writable"),
            write_recipe_id_code: "write_recipe_id",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecipeResponse {
    code: Option<i64>,
    #[serde(default)]
    data: Vec<ModulePayload>,
}

#[derive(Debug, Deserialize)]
struct ModulePayload {
    #[serde(rename = "blockId")]
    block_id: i64,
    index: i64,
    category: String,
    list: Vec<RecipeValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecipeValue {
    code: String,
    value: PlcValue,
}

/// Finds which device's catalog owns `module`, scanning every connected
/// device. A recipe payload module carries no device name of its own; this
/// core is the thing that knows where each module physically lives.
async fn resolve_device_for_module(devices: &DeviceMap, module: &ModuleKey) -> Option<String> {
    let guard = devices.lock().await;
    for (name, device) in guard.iter() {
        if device.owns_module(module).await {
            return Some(name.clone());
        }
    }
    None
}

/// Writes one scalar leaf value to a device through the codec, used for
/// the recipe loop's own bookkeeping writes (`result`, the `RecipeValid`
/// latch, the `write_recipe_id` echo) as opposed to the bulk recipe
/// payload itself.
async fn write_single(
    devices: &DeviceMap,
    device_name: &str,
    module: &ModuleKey,
    code: &str,
    value: PlcValue,
    timeout: Duration,
) -> Result<(), ()> {
    let mut guard = devices.lock().await;
    let Some(device) = guard.get_mut(device_name) else { return Err(()) };
    device.write(module, code, &value, timeout).await.map_err(|e| {
        log::warn!("[RECIPE] write {device_name} {module:?}.{code} failed: {e}");
    })
}

async fn write_result(devices: &DeviceMap, trigger: &RecipeRequestModule, status: RecipeStatus) {
    let _ = write_single(devices, &trigger.device, &trigger.module, &trigger.result_code, PlcValue::Int32(status as i32), Duration::from_millis(500)).await;
}

/// Looks up the module's writability gate, trying the canonical name
/// first and falling back to the original's misspelled variant (§9 open
/// question (iii)).
async fn module_is_writable(devices: &DeviceMap, device_name: &str, module: &ModuleKey, config: &RecipeConfig) -> bool {
    let guard = devices.lock().await;
    let Some(device) = guard.get(device_name) else { return false };
    let catalog = device.catalog();
    let catalog = catalog.lock().await;
    for code in [config.writable_codes.0, config.writable_codes.1] {
        if let Some(d) = catalog.get_by_address(module, code) {
            return matches!(d.value, Some(PlcValue::Bool(true)));
        }
    }
    false
}

/// Whether `module` carries a `RecipeValid` latch at all — used to decide
/// whether gating applies to this payload module in the first place (not
/// every module in a recipe necessarily exposes the latch).
async fn module_has_valid_latch(devices: &DeviceMap, device_name: &str, module: &ModuleKey, config: &RecipeConfig) -> bool {
    let guard = devices.lock().await;
    let Some(device) = guard.get(device_name) else { return false };
    let catalog = device.catalog();
    let catalog = catalog.lock().await;
    [config.valid_codes.0, config.valid_codes.1].iter().any(|c| catalog.get_by_address(module, c).is_some())
}

async fn set_recipe_valid(devices: &DeviceMap, device_name: &str, module: &ModuleKey, config: &RecipeConfig, value: bool) -> Result<(), ()> {
    let code = {
        let guard = devices.lock().await;
        let Some(device) = guard.get(device_name) else { return Err(()) };
        let catalog = device.catalog();
        let catalog = catalog.lock().await;
        [config.valid_codes.0, config.valid_codes.1]
            .into_iter()
            .find(|c| catalog.get_by_address(module, c).is_some())
    };
    let Some(code) = code else { return Err(()) };
    write_single(devices, device_name, module, code, PlcValue::Bool(value), Duration::from_millis(500)).await
}

/// If `module_payload` is the designated MC module, clears
/// `list[0].value.Basic.Id` to `0` before decode (§4.6 step 5). A
/// freshly-downloaded recipe must not echo back whatever module ID a
/// previous transaction left behind.
fn clear_mc_basic_id(payload: &mut ModulePayload) {
    let Some(first) = payload.list.first_mut() else { return };
    let PlcValue::Structure(root) = &mut first.value else { return };
    if let Some(PlcValue::Structure(basic)) = root.get_mut("Basic") {
        basic.insert("Id".to_string(), PlcValue::Int32(0));
    }
}

/// Runs one recipe transaction end to end: fetch, gate, decode, fan out
/// writes by device, restore gates, echo the recipe ID, report `result`.
async fn run_transaction(
    devices: DeviceMap,
    http: reqwest::Client,
    mqtt: MqttHandle,
    trigger: RecipeRequestModule,
    recipe_id: String,
    config: RecipeConfig,
) -> RecipeStatus {
    write_result(&devices, &trigger, STATUS_REQUESTING).await;

    let url = config.fetch_url_template.replace("{recipeId}", &recipe_id);
    let response = match http.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            log::warn!("[RECIPE] fetch failed for {}: {e}", trigger.device);
            write_result(&devices, &trigger, ERR_HTTP).await;
            publish_recipe_error(&mqtt, "RecipeDownloadError", &trigger, None, ERR_HTTP).await;
            return ERR_HTTP;
        }
    };
    let body: RecipeResponse = match response.json().await {
        Ok(b) => b,
        Err(e) => {
            log::warn!("[RECIPE] malformed response for {}: {e}", trigger.device);
            write_result(&devices, &trigger, ERR_HTTP).await;
            publish_recipe_error(&mqtt, "RecipeDownloadError", &trigger, None, ERR_HTTP).await;
            return ERR_HTTP;
        }
    };
    let status = map_result_code(body.code);
    if status != STATUS_DOWNLOADING {
        log::warn!("[RECIPE] {} check/download error, code={:?} -> result={status}", trigger.device, body.code);
        write_result(&devices, &trigger, status).await;
        let kind = if matches!(status, ERR_NULL_RESPONSE | ERR_RESULT_10000 | ERR_RESULT_20001 | ERR_RESULT_20002 | ERR_RESULT_20003) {
            "RecipeCheckError"
        } else {
            "RecipeDownloadError"
        };
        publish_recipe_error(&mqtt, kind, &trigger, body.code, status).await;
        return status;
    }
    write_result(&devices, &trigger, STATUS_DOWNLOADING).await;

    let mut per_device_targets: BTreeMap<String, Vec<(ModuleKey, RecipeValue)>> = BTreeMap::new();
    let mut gated_modules: Vec<(String, ModuleKey)> = Vec::new();

    for mut payload in body.data {
        let module = ModuleKey::new(payload.block_id, payload.index, payload.category.clone());
        if trigger.is_mc && module == trigger.module {
            clear_mc_basic_id(&mut payload);
        }
        let Some(device_name) = resolve_device_for_module(&devices, &module).await else {
            log::warn!("[RECIPE] no device owns module {module:?}, aborting transaction");
            write_result(&devices, &trigger, ERR_NOT_WRITABLE).await;
            return ERR_NOT_WRITABLE;
        };

        if module_has_valid_latch(&devices, &device_name, &module, &config).await {
            if !module_is_writable(&devices, &device_name, &module, &config).await {
                log::warn!("[RECIPE] module {module:?} on {device_name} is not writable, aborting transaction");
                write_result(&devices, &trigger, ERR_NOT_WRITABLE).await;
                return ERR_NOT_WRITABLE;
            }
            if set_recipe_valid(&devices, &device_name, &module, &config, true).await.is_err() {
                log::warn!("[RECIPE] module {module:?} on {device_name} has no valid latch, aborting transaction");
                write_result(&devices, &trigger, ERR_NOT_WRITABLE).await;
                return ERR_NOT_WRITABLE;
            }
            gated_modules.push((device_name.clone(), module.clone()));
        }

        for item in payload.list {
            per_device_targets.entry(device_name.clone()).or_default().push((module.clone(), item));
        }
    }

    // Merge per device into one big batch, then fan out concurrently
    // (§4.6 step 6): a slow device never delays another's write.
    let write_futs = per_device_targets.into_iter().map(|(device_name, items)| {
        let devices = devices.clone();
        let timeout = config.write_timeout;
        async move {
            use crate::codec::{decode_inbound, CodecReport};
            let mut targets = Vec::new();
            let mut report = CodecReport::default();
            {
                let guard = devices.lock().await;
                let Some(device) = guard.get(&device_name) else { return Err(device_name) };
                let catalog = device.catalog();
                let catalog = catalog.lock().await;
                for (module, item) in &items {
                    decode_inbound(&catalog, &module.format_code(&item.code), &item.value, &mut targets, &mut report);
                }
            }
            if !report.is_ok() {
                log::warn!("[RECIPE] decode errors on {device_name}: {}", report.errors.join("; "));
            }
            if targets.is_empty() {
                return Ok(());
            }
            let mut guard = devices.lock().await;
            let Some(device) = guard.get_mut(&device_name) else { return Err(device_name) };
            device.write_many(&targets, timeout).await.map_err(|e| {
                log::warn!("[RECIPE] write failed on {device_name}: {e}");
                device_name
            })
        }
    });

    let results = futures::future::join_all(write_futs).await;
    if results.iter().any(|r| r.is_err()) {
        write_result(&devices, &trigger, ERR_WRITE_TIMEOUT).await;
        return ERR_WRITE_TIMEOUT;
    }

    for (device_name, module) in &gated_modules {
        let _ = set_recipe_valid(&devices, device_name, module, &config, false).await;
    }

    if trigger.is_mc {
        let _ = write_single(&devices, &trigger.device, &trigger.module, config.write_recipe_id_code, PlcValue::String(recipe_id.clone()), Duration::from_millis(500)).await;
    }

    // Multi-flow recipes repeat the terminal status five times to
    // tolerate a one-way loss (§4.6 step 7); single-flow writes it once.
    let repeats = if trigger.multi_flow { 5 } else { 1 };
    for _ in 0..repeats {
        write_result(&devices, &trigger, STATUS_DONE).await;
    }
    STATUS_DONE
}

/// Publishes a `RecipeCheckError`/`RecipeDownloadError` broadcast on
/// `pub_drv_broadcast` (§4.6 step 4).
async fn publish_recipe_error(mqtt: &MqttHandle, kind: &'static str, trigger: &RecipeRequestModule, code: Option<i64>, result: RecipeStatus) {
    mqtt.publish_broadcast(&RecipeBroadcast {
        kind,
        module: format!("{}_{}_{}", trigger.module.block_id, trigger.module.index, trigger.module.category),
        device: trigger.device.clone(),
        code,
        result,
    })
    .await;
}

/// Recipe-request loop (0.5s default): scans every configured trigger for
/// a `request=true, result=0` transition, starts a transaction, and resets
/// `result=0` on the handshake's falling edge (§4.6 steps 1, 8).
pub async fn spawn_recipe_loop(
    devices: DeviceMap,
    table: RecipeTable,
    triggers: Vec<RecipeRequestModule>,
    config: RecipeConfig,
    mqtt: MqttHandle,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    status_tx: mpsc::UnboundedSender<(ModuleKey, RecipeStatus)>,
) {
    let http = reqwest::Client::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("[RECIPE] shutting down");
                return;
            }
            _ = tokio::time::sleep(period) => {}
        }

        let mut starts = Vec::new();
        for trigger in &triggers {
            let (request, result_i64) = {
                let guard = devices.lock().await;
                let Some(device) = guard.get(&trigger.device) else { continue };
                let request = device.cached_value(&trigger.module, &trigger.request_code).await;
                let result = device.cached_value(&trigger.module, &trigger.result_code).await;
                let result_i64 = match result {
                    Some(PlcValue::Int32(v)) => Some(v as i64),
                    Some(PlcValue::Int64(v)) => Some(v),
                    _ => None,
                };
                (request, result_i64)
            };

            let mut guard = table.lock().await;
            let entry = guard.entry(trigger.module.clone()).or_default();
            match (request, result_i64) {
                (Some(PlcValue::Bool(true)), Some(0)) if entry.status == STATUS_IDLE => {
                    drop(guard);
                    let id_value = {
                        let dguard = devices.lock().await;
                        match dguard.get(&trigger.device) {
                            Some(device) => device.cached_value(&trigger.module, &trigger.id_code).await,
                            None => None,
                        }
                    };
                    let Some(recipe_id) = (match id_value {
                        Some(PlcValue::String(s)) => Some(s),
                        Some(PlcValue::Int32(v)) => Some(v.to_string()),
                        Some(PlcValue::Int64(v)) => Some(v.to_string()),
                        _ => None,
                    }) else {
                        continue;
                    };
                    let mut guard = table.lock().await;
                    let entry = guard.entry(trigger.module.clone()).or_default();
                    entry.status = STATUS_REQUESTING;
                    entry.recipe_id = Some(recipe_id.clone());
                    starts.push((trigger.clone(), recipe_id));
                }
                (Some(PlcValue::Bool(false)), Some(r)) if r != STATUS_IDLE => {
                    entry.status = STATUS_IDLE;
                    entry.recipe_id = None;
                    drop(guard);
                    write_result(&devices, trigger, STATUS_IDLE).await;
                }
                _ => {}
            }
        }
        if starts.is_empty() {
            continue;
        }

        // Every pending transaction runs concurrently; a slow upstream for
        // one device never delays another's recipe.
        let futs = starts.into_iter().map(|(trigger, recipe_id)| {
            let devices = devices.clone();
            let http = http.clone();
            let config = config.clone();
            let mqtt = mqtt.clone();
            async move {
                let result = run_transaction(devices, http, mqtt, trigger.clone(), recipe_id, config).await;
                (trigger.module, result)
            }
        });
        for (module, result) in futures::future::join_all(futs).await {
            let mut guard = table.lock().await;
            if let Some(e) = guard.get_mut(&module) {
                e.status = result;
            }
            let _ = status_tx.send((module, result));
        }
    }
}

/// Publishes recipe result transitions onto `pub_drv_data` alongside scan
/// output, so recipe state is visible through the same outbound channel.
pub async fn spawn_status_publisher(
    mut status_rx: mpsc::UnboundedReceiver<(ModuleKey, RecipeStatus)>,
    outbound_tx: mpsc::UnboundedSender<OutboundBatch>,
    device_name: String,
) {
    use crate::codec::OutboundEntry;
    use crate::model::value::DataType;

    while let Some((module, status)) = status_rx.recv().await {
        let entry = OutboundEntry {
            code: "RecipeResult".into(),
            value: PlcValue::Int64(status),
            data_type: DataType::Int64,
            arr_len: 0,
            time: crate::device::now_ms(),
        };
        let _ = outbound_tx.send(OutboundBatch { device: device_name.clone(), module, entries: vec![entry] });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_200_advances_to_downloading() {
        assert_eq!(map_result_code(Some(200)), STATUS_DOWNLOADING);
    }

    #[test]
    fn absent_code_is_the_null_response_error() {
        assert_eq!(map_result_code(None), ERR_NULL_RESPONSE);
    }

    #[test]
    fn known_error_codes_map_to_distinct_results() {
        assert_eq!(map_result_code(Some(10000)), ERR_RESULT_10000);
        assert_eq!(map_result_code(Some(20001)), ERR_RESULT_20001);
        assert_eq!(map_result_code(Some(20002)), ERR_RESULT_20002);
        assert_eq!(map_result_code(Some(20003)), ERR_RESULT_20003);
    }

    #[test]
    fn an_unrecognized_code_passes_through_unchanged() {
        assert_eq!(map_result_code(Some(42)), 42);
    }

    #[test]
    fn clear_mc_basic_id_zeroes_the_nested_field() {
        use std::collections::BTreeMap as Map;
        let mut basic = Map::new();
        basic.insert("Id".to_string(), PlcValue::Int32(7));
        let mut root = Map::new();
        root.insert("Basic".to_string(), PlcValue::Structure(basic));
        let mut payload = ModulePayload {
            block_id: 0,
            index: 1,
            category: "MC".into(),
            list: vec![RecipeValue { code: "Root".into(), value: PlcValue::Structure(root) }],
        };
        clear_mc_basic_id(&mut payload);
        let PlcValue::Structure(root) = &payload.list[0].value else { panic!("expected structure") };
        let Some(PlcValue::Structure(basic)) = root.get("Basic") else { panic!("expected Basic") };
        assert_eq!(basic.get("Id"), Some(&PlcValue::Int32(0)));
    }
}
