//! Device session: binds one transport, one catalog, one safety-clear set,
//! one read-block plan and a subscription (`SPEC_FULL.md` §4.3).

use crate::codec::{decode_inbound, encode_outbound, CodecReport, OutboundEntry};
use crate::error::{DriverError, DriverResult};
use crate::model::catalog::VariableCatalog;
use crate::model::csv_loader::load_catalog;
use crate::model::descriptor::ModuleKey;
use crate::model::value::PlcValue;
use crate::transport::{read_timeout, ChangeCallback, ReadRef, Transport, WriteTarget};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unloaded,
    Loaded,
    Connecting,
    Connected,
}

/// Reconciled against `connecting` by the manage phase.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDesiredState {
    pub link: bool,
    pub read: bool,
}

impl Default for DeviceDesiredState {
    fn default() -> Self {
        Self { link: true, read: true }
    }
}

/// One batch of outbound entries for a single module, ready to publish on
/// `pub_drv_data`.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub device: String,
    pub module: ModuleKey,
    pub entries: Vec<OutboundEntry>,
}

pub struct Device {
    pub name: String,
    catalog: Arc<Mutex<VariableCatalog>>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
    catalog_csv_path: PathBuf,
    state: DeviceState,
    pub desired: DeviceDesiredState,
    failure_count: u32,
    last_success_ms: Option<i64>,
    /// Warm-up guard for safety-clear: "fewer than three successful reads"
    /// (§4.3 phase 4, §9 open question (iv)). Reset on reconnect.
    successful_reads: AtomicU32,
    outbound_tx: mpsc::UnboundedSender<OutboundBatch>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        catalog_csv_path: PathBuf,
        outbound_tx: mpsc::UnboundedSender<OutboundBatch>,
    ) -> Self {
        Self {
            name: name.into(),
            catalog: Arc::new(Mutex::new(VariableCatalog::new())),
            transport: Arc::new(Mutex::new(transport)),
            catalog_csv_path,
            state: DeviceState::Unloaded,
            desired: DeviceDesiredState::default(),
            failure_count: 0,
            last_success_ms: None,
            successful_reads: AtomicU32::new(0),
            outbound_tx,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn connecting(&self) -> bool {
        self.state == DeviceState::Connected
    }

    pub fn loading(&self) -> bool {
        self.state == DeviceState::Unloaded
    }

    pub fn catalog(&self) -> Arc<Mutex<VariableCatalog>> {
        self.catalog.clone()
    }

    /// Load phase: read the catalog CSV and derive the read-block /
    /// timed-clear-block views.
    pub async fn load(&mut self) -> DriverResult<()> {
        let catalog = load_catalog(&self.catalog_csv_path)?;
        *self.catalog.lock().await = catalog;
        self.state = DeviceState::Loaded;
        Ok(())
    }

    /// Reloads the catalog in place, used by `DEV_RECONNECT`.
    pub async fn reload_catalog(&mut self) -> DriverResult<()> {
        self.load().await
    }

    /// Connect phase: transport connect, then (OPC UA only) create a
    /// subscription over every `opcuaSubscribe = true` descriptor.
    pub async fn connect(&mut self) -> DriverResult<()> {
        self.state = DeviceState::Connecting;
        let ok = self.transport.lock().await.connect().await?;
        if !ok {
            self.state = DeviceState::Loaded;
            return Err(DriverError::transport_fatal(&self.name, "connect returned false"));
        }

        let subscribe_refs: Vec<ReadRef> = {
            let catalog = self.catalog.lock().await;
            catalog
                .iter()
                .filter(|(_, d)| d.opcua_subscribe)
                .map(|(_, d)| ReadRef {
                    flat_key: d.flat_key(),
                    node_id: d.node_id.clone(),
                    data_type: d.data_type,
                    array_dimensions: d.array_dimensions,
                })
                .collect()
        };

        if !subscribe_refs.is_empty() {
            let catalog = self.catalog.clone();
            let outbound_tx = self.outbound_tx.clone();
            let device_name = self.name.clone();
            let callback: ChangeCallback = Arc::new(move |node_id: String, value: PlcValue| {
                let catalog = catalog.clone();
                let outbound_tx = outbound_tx.clone();
                let device_name = device_name.clone();
                tokio::spawn(async move {
                    handle_subscription_change(catalog, outbound_tx, &device_name, &node_id, value).await;
                });
            });
            // Subscriptions are only meaningful for OPC UA; the S7
            // transport's default `subscribe` returns an error, which we
            // treat as "nothing to do" rather than a fatal connect failure.
            if let Err(e) = self.transport.lock().await.subscribe(&subscribe_refs, callback).await {
                log::debug!("[DEVICE] {}: subscriptions not established: {e}", self.name);
            }
        }

        self.state = DeviceState::Connected;
        self.successful_reads.store(0, Ordering::SeqCst);
        self.failure_count = 0;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.lock().await.disconnect().await;
        self.state = DeviceState::Loaded;
    }

    /// Scan phase: read the full read-block and emit every descriptor
    /// (`O2M_All`), grouped per module for publishing.
    pub async fn scan(&mut self, read_enabled: bool) -> DriverResult<Vec<OutboundBatch>> {
        if !self.connecting() || !read_enabled {
            return Ok(Vec::new());
        }
        let refs = {
            let catalog = self.catalog.lock().await;
            if catalog.read_block().is_empty() {
                return Ok(Vec::new());
            }
            self.build_read_refs(&catalog, catalog.read_block())
        };
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let timeout = Duration::from_millis(1_500);
        let values = match self.transport.lock().await.read_many(&refs, timeout).await {
            Ok(v) => v,
            Err(e) => {
                self.failure_count += 1;
                return Err(e);
            }
        };
        self.successful_reads.fetch_add(1, Ordering::SeqCst);
        self.last_success_ms = Some(now_ms());

        let now = now_ms();
        let mut per_module: BTreeMap<ModuleKey, Vec<OutboundEntry>> = BTreeMap::new();
        let mut report = CodecReport::default();
        {
            let mut catalog = self.catalog.lock().await;
            for (r, value) in refs.iter().zip(values.into_iter()) {
                let mut entries = Vec::new();
                encode_outbound(&mut catalog, &r.flat_key, &value, true, now, &mut entries, &mut report);
                if let Some(descriptor) = catalog.get(&r.flat_key) {
                    per_module.entry(descriptor.module.clone()).or_default().extend(entries);
                }
            }
        }
        for err in &report.errors {
            log::warn!("[DEVICE] {}: scan decode error: {err}", self.name);
        }

        Ok(per_module
            .into_iter()
            .map(|(module, entries)| OutboundBatch { device: self.name.clone(), module, entries })
            .collect())
    }

    /// Safety-clear phase: auto-clear latched booleans that have stayed
    /// `true` for at least `timedClearTime`.
    pub async fn safety_clear(&mut self) -> DriverResult<()> {
        if !self.connecting() {
            return Ok(());
        }
        let now = now_ms();
        let warm = self.successful_reads.load(Ordering::SeqCst) >= 3;
        let mut targets = Vec::new();

        {
            let mut catalog = self.catalog.lock().await;
            let keys = catalog.timed_clear_block().to_vec();
            for key in keys {
                let Some(descriptor) = catalog.get_mut(&key) else { continue };
                let is_true = matches!(descriptor.value, Some(PlcValue::Bool(true)));
                if !warm || !is_true {
                    descriptor.false_time_ms = Some(now);
                    continue;
                }
                let elapsed = now - descriptor.false_time_ms.unwrap_or(now);
                if elapsed >= descriptor.timed_clear_time_ms as i64 {
                    targets.push(WriteTarget {
                        flat_key: key.clone(),
                        node_id: descriptor.node_id.clone(),
                        data_type: descriptor.data_type,
                        value: PlcValue::Bool(false),
                    });
                }
            }
        }

        if targets.is_empty() {
            return Ok(());
        }
        self.transport
            .lock()
            .await
            .write_many(&targets, Duration::from_millis(200))
            .await?;

        let mut catalog = self.catalog.lock().await;
        for target in &targets {
            if let Some(descriptor) = catalog.get_mut(&target.flat_key) {
                descriptor.value = Some(PlcValue::Bool(false));
                descriptor.false_time_ms = Some(now);
            }
        }
        Ok(())
    }

    /// Manage phase: reconcile the desired `link` flag with the current
    /// connection state.
    pub async fn manage(&mut self) -> DriverResult<()> {
        match (self.desired.link, self.connecting()) {
            (true, false) if self.state != DeviceState::Unloaded => {
                if let Err(e) = self.connect().await {
                    log::warn!("[DEVICE] {}: connect attempt failed: {e}", self.name);
                }
            }
            (false, true) => {
                self.disconnect().await;
            }
            _ => {}
        }
        Ok(())
    }

    /// One-shot read of a supplied code list (`read_plc`/`read_plc_struct`).
    pub async fn read_once(&mut self, codes: &[String], module: &ModuleKey) -> DriverResult<Vec<OutboundEntry>> {
        let refs = {
            let catalog = self.catalog.lock().await;
            let flat_keys: Vec<String> = codes.iter().map(|c| module.format_code(c)).collect();
            self.build_read_refs(&catalog, &flat_keys)
        };
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = read_timeout(refs.len());
        let values = self.transport.lock().await.read_many(&refs, timeout).await?;

        let now = now_ms();
        let mut entries = Vec::new();
        let mut report = CodecReport::default();
        let mut catalog = self.catalog.lock().await;
        for (r, value) in refs.iter().zip(values.into_iter()) {
            encode_outbound(&mut catalog, &r.flat_key, &value, true, now, &mut entries, &mut report);
        }
        Ok(entries)
    }

    /// Parses an inbound write payload via the codec and issues it.
    pub async fn write(&mut self, module: &ModuleKey, code: &str, value: &PlcValue, timeout: Duration) -> DriverResult<()> {
        let mut targets = Vec::new();
        let mut report = CodecReport::default();
        {
            let catalog = self.catalog.lock().await;
            decode_inbound(&catalog, &module.format_code(code), value, &mut targets, &mut report);
        }
        if !report.is_ok() {
            return Err(DriverError::decode_mismatch(report.errors.join("; ")));
        }
        self.transport.lock().await.write_many(&targets, timeout).await?;

        let mut catalog = self.catalog.lock().await;
        for target in &targets {
            if let Some(descriptor) = catalog.get_mut(&target.flat_key) {
                descriptor.value = Some(target.value.clone());
            }
        }
        Ok(())
    }

    /// Reads a single descriptor's cached value without touching the
    /// transport, used by the recipe orchestrator's per-tick trigger scan
    /// (§4.6 step 1 reads `request`/`result` from the descriptor cache, not
    /// the PLC).
    pub async fn cached_value(&self, module: &ModuleKey, code: &str) -> Option<PlcValue> {
        let catalog = self.catalog.lock().await;
        catalog.get_by_address(module, code).and_then(|d| d.value.clone())
    }

    /// True if this device's catalog has at least one descriptor belonging
    /// to `module`, used to resolve which device owns a recipe payload
    /// module when fanning writes out by device (§4.6 step 6).
    pub async fn owns_module(&self, module: &ModuleKey) -> bool {
        let catalog = self.catalog.lock().await;
        !catalog.descriptors_for_module(module).is_empty()
    }

    /// Issues a batch of pre-built write targets directly (bypassing the
    /// codec, which the caller has already applied) and updates the cache
    /// on success. Used by the recipe orchestrator to fan a merged
    /// per-device batch out in one call (§4.6 step 6).
    pub async fn write_many(&mut self, targets: &[WriteTarget], timeout: Duration) -> DriverResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        self.transport.lock().await.write_many(targets, timeout).await?;
        let mut catalog = self.catalog.lock().await;
        for target in targets {
            if let Some(descriptor) = catalog.get_mut(&target.flat_key) {
                descriptor.value = Some(target.value.clone());
            }
        }
        Ok(())
    }

    fn build_read_refs(&self, catalog: &VariableCatalog, flat_keys: &[String]) -> Vec<ReadRef> {
        flat_keys
            .iter()
            .filter_map(|k| {
                catalog.get(k).map(|d| ReadRef {
                    flat_key: k.clone(),
                    node_id: d.node_id.clone(),
                    data_type: d.data_type,
                    array_dimensions: d.array_dimensions,
                })
            })
            .collect()
    }

    pub fn transport_handle(&self) -> Arc<Mutex<Box<dyn Transport>>> {
        self.transport.clone()
    }
}

async fn handle_subscription_change(
    catalog: Arc<Mutex<VariableCatalog>>,
    outbound_tx: mpsc::UnboundedSender<OutboundBatch>,
    device_name: &str,
    node_id: &str,
    value: PlcValue,
) {
    let mut catalog = catalog.lock().await;
    let Some(flat_key) = catalog.flat_key_for_node(node_id).map(|s| s.to_string()) else {
        return;
    };
    let module = match catalog.get(&flat_key) {
        Some(d) => d.module.clone(),
        None => return,
    };
    let mut entries = Vec::new();
    let mut report = CodecReport::default();
    encode_outbound(&mut catalog, &flat_key, &value, false, now_ms(), &mut entries, &mut report);
    for err in &report.errors {
        log::warn!("[DEVICE] {device_name}: subscription decode error: {err}");
    }
    if !entries.is_empty() {
        let _ = outbound_tx.send(OutboundBatch { device: device_name.to_string(), module, entries });
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
