//! End-to-end exercise of a device session against an in-memory transport:
//! load -> connect -> scan -> write, without touching a real PLC.

use async_trait::async_trait;
use driver_io::device::Device;
use driver_io::error::DriverResult;
use driver_io::model::descriptor::ModuleKey;
use driver_io::model::value::{DataType, PlcValue};
use driver_io::transport::{ChangeCallback, ReadRef, Transport, WriteTarget};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A transport backed by an in-memory map, standing in for a real PLC so
/// the device session's phase logic can be exercised deterministically.
struct MemoryTransport {
    values: Arc<Mutex<HashMap<String, PlcValue>>>,
}

impl MemoryTransport {
    fn new(initial: HashMap<String, PlcValue>) -> Self {
        Self { values: Arc::new(Mutex::new(initial)) }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> DriverResult<bool> {
        Ok(true)
    }

    async fn disconnect(&mut self) {}

    fn link_state(&self) -> bool {
        true
    }

    async fn read_many(&self, refs: &[ReadRef], _timeout: Duration) -> DriverResult<Vec<PlcValue>> {
        let values = self.values.lock().await;
        Ok(refs.iter().map(|r| values.get(&r.node_id).cloned().unwrap_or(PlcValue::Int32(0))).collect())
    }

    async fn write_many(&self, targets: &[WriteTarget], _timeout: Duration) -> DriverResult<()> {
        let mut values = self.values.lock().await;
        for t in targets {
            values.insert(t.node_id.clone(), t.value.clone());
        }
        Ok(())
    }

    async fn subscribe(&mut self, _refs: &[ReadRef], _on_change: ChangeCallback) -> DriverResult<()> {
        Ok(())
    }
}

fn write_csv_fixture() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "path,name,NodeID,NodeClass,DataType,DataTypeString,DecimalPoint,ArrayDimensions,value,blockId,index,category,code,opcua_subscribe,read_enable,read_period,timed_clear,timed_clear_time,s7_db,s7_start,s7_bit,s7_size"
    )
    .unwrap();
    writeln!(
        file,
        "/MC/Basic/Id,Id,ns=3;s=Basic.Id,Variable,int32,int32,0,0,0,0,1,MC,Basic_Id,false,true,800,false,0,,,,"
    )
    .unwrap();
    writeln!(
        file,
        "/MC/Safety/Allow,Allow,ns=3;s=Safety.Allow,Variable,bool,bool,0,0,false,0,1,MC,Safety_Allow,false,true,800,true,100,,,,"
    )
    .unwrap();
    file
}

#[tokio::test]
async fn scan_reports_every_descriptor_in_the_read_block() {
    let csv = write_csv_fixture();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut initial = HashMap::new();
    initial.insert("ns=3;s=Basic.Id".to_string(), PlcValue::Int32(7));
    let transport = Box::new(MemoryTransport::new(initial));

    let mut device = Device::new("plc-1", transport, csv.path().to_path_buf(), tx);
    device.load().await.unwrap();
    device.connect().await.unwrap();

    let batches = device.scan(true).await.unwrap();
    let total_entries: usize = batches.iter().map(|b| b.entries.len()).sum();
    assert_eq!(total_entries, 2, "both Basic_Id and Safety_Allow should be emitted on the forced first scan");
}

#[tokio::test]
async fn write_then_read_back_round_trips_through_the_codec() {
    let csv = write_csv_fixture();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = Box::new(MemoryTransport::new(HashMap::new()));

    let mut device = Device::new("plc-1", transport, csv.path().to_path_buf(), tx);
    device.load().await.unwrap();
    device.connect().await.unwrap();

    let module = ModuleKey::new(0, 1, "MC");
    device.write(&module, "Basic_Id", &PlcValue::Int32(99), Duration::from_secs(1)).await.unwrap();

    let entries = device.read_once(&["Basic_Id".to_string()], &module).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, PlcValue::Int32(99));
    assert_eq!(entries[0].data_type, DataType::Int32);
}

#[tokio::test]
async fn safety_clear_does_nothing_before_three_successful_reads() {
    let csv = write_csv_fixture();
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut initial = HashMap::new();
    initial.insert("ns=3;s=Safety.Allow".to_string(), PlcValue::Bool(true));
    let transport = Box::new(MemoryTransport::new(initial));

    let mut device = Device::new("plc-1", transport, csv.path().to_path_buf(), tx);
    device.load().await.unwrap();
    device.connect().await.unwrap();

    // No scans yet: the warm-up guard must hold off clearing.
    device.safety_clear().await.unwrap();
    let catalog = device.catalog();
    let catalog = catalog.lock().await;
    let descriptor = catalog.get_by_address(&ModuleKey::new(0, 1, "MC"), "Safety_Allow").unwrap();
    assert_eq!(descriptor.value, None);
}
