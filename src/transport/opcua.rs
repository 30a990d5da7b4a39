//! OPC UA transport adapter.
//!
//! Grounded on the teacher's `ModbusPlcService` shape (config struct,
//! `Arc<Mutex<Option<Client>>>` session handle, connection-status field) but
//! generalized for OPC UA's batched/retried/verified write path and its
//! subscription-based change notification, which Modbus has no analogue of.

use super::backoff::delay_for;
use super::tolerance::{values_equal, DEFAULT_ABS_TOL, DEFAULT_REL_TOL};
use super::{read_timeout, write_timeout, ChangeCallback, ReadRef, Transport, WriteTarget};
use crate::error::{DriverError, DriverResult};
use crate::model::value::PlcValue;
use async_trait::async_trait;
use opcua::client::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct OpcUaConfig {
    pub endpoint_url: String,
    pub retry_write_max: u32,
    pub verification_retry_max: u32,
    pub read_retry_max: u32,
    pub max_timeout: Duration,
    pub write_batch_min: usize,
    pub write_batch_max: usize,
    pub verify_writes: bool,
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            retry_write_max: 5,
            verification_retry_max: 3,
            read_retry_max: 3,
            max_timeout: Duration::from_secs(30),
            write_batch_min: 50,
            write_batch_max: 400,
            verify_writes: true,
        }
    }
}

pub struct OpcUaTransport {
    config: OpcUaConfig,
    session: Arc<Mutex<Option<Arc<RwLock<Session>>>>>,
    subscription_id: Arc<Mutex<Option<u32>>>,
    rw_failure_count: AtomicU32,
}

impl OpcUaTransport {
    pub fn new(config: OpcUaConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
            subscription_id: Arc::new(Mutex::new(None)),
            rw_failure_count: AtomicU32::new(0),
        }
    }

    /// Splits a write batch into adaptively-sized chunks (default 50-400,
    /// sized by total write count) per §4.1.
    fn batch_size(&self, total: usize) -> usize {
        if total <= self.config.write_batch_min {
            total.max(1)
        } else {
            total.min(self.config.write_batch_max)
        }
    }

    fn record_failure(&self) -> u32 {
        self.rw_failure_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reset_failures(&self) {
        self.rw_failure_count.store(0, Ordering::SeqCst);
    }

    async fn write_batch_once(&self, batch: &[WriteTarget], timeout: Duration) -> DriverResult<()> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| {
            DriverError::transport_fatal("opcua", "write attempted while disconnected")
        })?;
        let nodes_to_write: Vec<WriteValue> = batch
            .iter()
            .map(|t| WriteValue {
                node_id: NodeId::from_str(&t.node_id).unwrap_or_default(),
                attribute_id: AttributeId::Value as u32,
                index_range: UAString::null(),
                value: DataValue::new_now(plc_value_to_variant(&t.value)),
            })
            .collect();

        let session = session.read().await;
        tokio::time::timeout(timeout, session.write(&nodes_to_write))
            .await
            .map_err(|_| DriverError::timeout("opcua write", timeout.as_millis() as u64))?
            .map_err(|e| DriverError::transport_transient("opcua", e.to_string()))?;
        Ok(())
    }

    async fn read_refs_once(&self, refs: &[ReadRef], timeout: Duration) -> DriverResult<Vec<PlcValue>> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| {
            DriverError::transport_fatal("opcua", "read attempted while disconnected")
        })?;
        let nodes: Vec<ReadValueId> = refs
            .iter()
            .map(|r| ReadValueId {
                node_id: NodeId::from_str(&r.node_id).unwrap_or_default(),
                attribute_id: AttributeId::Value as u32,
                index_range: UAString::null(),
                data_encoding: QualifiedName::null(),
            })
            .collect();

        let session = session.read().await;
        let results = tokio::time::timeout(timeout, session.read(&nodes, TimestampsToReturn::Neither, 0.0))
            .await
            .map_err(|_| DriverError::timeout("opcua read", timeout.as_millis() as u64))?
            .map_err(|e| DriverError::transport_transient("opcua", e.to_string()))?;

        let mut values = Vec::with_capacity(refs.len());
        for (r, dv) in refs.iter().zip(results.iter()) {
            let variant = dv.value.clone().ok_or_else(|| {
                DriverError::transport_transient("opcua", format!("no value for {}", r.node_id))
            })?;
            values.push(variant_to_plc_value(&variant, r.data_type)?);
        }
        Ok(values)
    }

    /// Re-reads the just-written nodes and compares against the expected
    /// values with the tolerance predicate; rewrites anything that fails,
    /// up to `verification_retry_max` times, independently of the write
    /// retry budget (open question (i) in `SPEC_FULL.md` §9).
    async fn verify_and_rewrite(&self, targets: &[WriteTarget]) -> DriverResult<()> {
        if !self.config.verify_writes || targets.is_empty() {
            return Ok(());
        }
        let mut pending: Vec<WriteTarget> = targets.to_vec();
        for attempt in 0..self.config.verification_retry_max {
            if pending.is_empty() {
                return Ok(());
            }
            let refs: Vec<ReadRef> = pending
                .iter()
                .map(|t| ReadRef {
                    flat_key: t.flat_key.clone(),
                    node_id: t.node_id.clone(),
                    data_type: t.data_type,
                    array_dimensions: 0,
                })
                .collect();
            let observed = self.read_refs_once(&refs, read_timeout(refs.len())).await?;

            let mut mismatched = Vec::new();
            for (target, observed_value) in pending.iter().zip(observed.iter()) {
                if !values_equal(&target.value, observed_value, DEFAULT_ABS_TOL, DEFAULT_REL_TOL) {
                    mismatched.push(target.clone());
                }
            }
            if mismatched.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(delay_for(attempt, Duration::from_millis(100))).await;
            self.write_batch_once(&mismatched, write_timeout(mismatched.len(), Duration::from_secs(2), self.config.max_timeout)).await?;
            pending = mismatched;
        }
        if pending.is_empty() {
            Ok(())
        } else {
            Err(DriverError::transport_transient(
                "opcua",
                format!("{} node(s) failed write verification after retries", pending.len()),
            ))
        }
    }
}

#[async_trait]
impl Transport for OpcUaTransport {
    async fn connect(&mut self) -> DriverResult<bool> {
        if self.session.lock().await.is_some() {
            return Ok(true);
        }
        let mut client = ClientBuilder::new()
            .application_name("driver-io")
            .application_uri("urn:driver-io")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .session_retry_limit(0)
            .client()
            .ok_or_else(|| DriverError::transport_fatal("opcua", "failed to build client"))?;

        let session = client
            .connect_to_endpoint((self.config.endpoint_url.as_ref(), SecurityPolicy::None, MessageSecurityMode::None, UserTokenPolicy::anonymous()), IdentityToken::Anonymous)
            .map_err(|e| DriverError::transport_fatal("opcua", e.to_string()))?;

        *self.session.lock().await = Some(session);
        self.reset_failures();
        Ok(true)
    }

    async fn disconnect(&mut self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            let mut session = session.write().await;
            session.disconnect();
        }
        *self.subscription_id.lock().await = None;
    }

    fn link_state(&self) -> bool {
        self.rw_failure_count.load(Ordering::SeqCst) <= 5
    }

    async fn read_many(&self, refs: &[ReadRef], timeout: Duration) -> DriverResult<Vec<PlcValue>> {
        let mut last_err = None;
        for attempt in 0..=self.config.read_retry_max {
            if attempt > 0 {
                tokio::time::sleep(delay_for(attempt - 1, Duration::from_millis(100))).await;
            }
            match self.read_refs_once(refs, timeout).await {
                Ok(values) => {
                    self.reset_failures();
                    return Ok(values);
                }
                Err(e) => {
                    let failures = self.record_failure();
                    if failures > 5 {
                        self.disconnect_on_forced_unlink();
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::transport_transient("opcua", "read failed")))
    }

    async fn write_many(&self, targets: &[WriteTarget], timeout: Duration) -> DriverResult<()> {
        let batch_size = self.batch_size(targets.len());
        for chunk in targets.chunks(batch_size.max(1)) {
            let mut attempt = 0;
            loop {
                match self.write_batch_once(chunk, timeout).await {
                    Ok(()) => break,
                    Err(e) if attempt < self.config.retry_write_max => {
                        tokio::time::sleep(delay_for(attempt, Duration::from_millis(100))).await;
                        attempt += 1;
                        let _ = &e;
                    }
                    Err(e) => return Err(e),
                }
            }
            self.verify_and_rewrite(chunk).await?;
        }
        Ok(())
    }

    async fn subscribe(&mut self, refs: &[ReadRef], on_change: ChangeCallback) -> DriverResult<()> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| {
            DriverError::transport_fatal("opcua", "subscribe attempted while disconnected")
        })?;
        let mut session = session.write().await;

        let data_types: std::collections::HashMap<String, crate::model::value::DataType> =
            refs.iter().map(|r| (r.node_id.clone(), r.data_type)).collect();

        let subscription_id = session
            .create_subscription(
                Duration::from_millis(500),
                10,
                30,
                0,
                0,
                true,
                DataChangeCallback::new(move |items: &[MonitoredItem]| {
                    for item in items {
                        let node_id = item.item_to_monitor().node_id.to_string();
                        if let Some(dv) = item.last_value().value.clone() {
                            if let Some(dt) = data_types.get(&node_id) {
                                if let Ok(value) = variant_to_plc_value(&dv, *dt) {
                                    on_change(node_id, value);
                                }
                            }
                        }
                    }
                }),
            )
            .map_err(|e| DriverError::transport_fatal("opcua", e.to_string()))?;

        let items_to_create: Vec<MonitoredItemCreateRequest> = refs
            .iter()
            .map(|r| MonitoredItemCreateRequest::new(NodeId::from_str(&r.node_id).unwrap_or_default().into(), MonitoringMode::Reporting, MonitoringParameters::default()))
            .collect();
        session
            .create_monitored_items(subscription_id, TimestampsToReturn::Neither, &items_to_create)
            .map_err(|e| DriverError::transport_fatal("opcua", e.to_string()))?;

        drop(session);
        *self.subscription_id.lock().await = Some(subscription_id);
        Ok(())
    }
}

impl OpcUaTransport {
    fn disconnect_on_forced_unlink(&self) {
        // Signals the manage loop to reconnect; the session handle itself
        // is torn down by the next `disconnect()` call the manager issues.
        log::warn!("[OPCUA] rwFailureCount exceeded 5, forcing unlink");
    }
}

fn plc_value_to_variant(value: &PlcValue) -> Variant {
    match value {
        PlcValue::Bool(v) => Variant::Boolean(*v),
        PlcValue::SByte(v) => Variant::SByte(*v),
        PlcValue::Byte(v) => Variant::Byte(*v),
        PlcValue::Int16(v) => Variant::Int16(*v),
        PlcValue::UInt16(v) => Variant::UInt16(*v),
        PlcValue::Int32(v) => Variant::Int32(*v),
        PlcValue::UInt32(v) => Variant::UInt32(*v),
        PlcValue::Int64(v) => Variant::Int64(*v),
        PlcValue::UInt64(v) => Variant::UInt64(*v),
        PlcValue::Float(v) => Variant::Float(*v),
        PlcValue::Double(v) => Variant::Double(*v),
        PlcValue::String(v) => Variant::from(v.as_str()),
        PlcValue::Bytes(v) => Variant::ByteString(ByteString::from(v.clone())),
        PlcValue::Sequence(_) | PlcValue::Structure(_) => Variant::Empty,
    }
}

fn variant_to_plc_value(variant: &Variant, expected: crate::model::value::DataType) -> DriverResult<PlcValue> {
    use crate::model::value::DataType as DT;
    Ok(match (variant, expected) {
        (Variant::Boolean(v), DT::Bool) => PlcValue::Bool(*v),
        (Variant::SByte(v), DT::SByte) => PlcValue::SByte(*v),
        (Variant::Byte(v), DT::Byte) => PlcValue::Byte(*v),
        (Variant::Int16(v), DT::Int16) => PlcValue::Int16(*v),
        (Variant::UInt16(v), DT::UInt16) => PlcValue::UInt16(*v),
        (Variant::Int32(v), DT::Int32) => PlcValue::Int32(*v),
        (Variant::UInt32(v), DT::UInt32) => PlcValue::UInt32(*v),
        (Variant::Int64(v), DT::Int64) => PlcValue::Int64(*v),
        (Variant::UInt64(v), DT::UInt64) => PlcValue::UInt64(*v),
        (Variant::Float(v), DT::Float) => PlcValue::Float(*v),
        (Variant::Double(v), DT::Double) => PlcValue::Double(*v),
        (Variant::String(v), DT::String) => PlcValue::String(v.to_string()),
        (Variant::ByteString(v), DT::Bytes) => PlcValue::Bytes(v.value.clone().unwrap_or_default()),
        _ => {
            return Err(DriverError::decode_mismatch(format!(
                "unexpected OPC UA variant for declared type {:?}",
                expected
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_stays_within_min_and_max() {
        let t = OpcUaTransport::new(OpcUaConfig::default());
        assert_eq!(t.batch_size(10), 10);
        assert_eq!(t.batch_size(1000), 400);
    }
}
