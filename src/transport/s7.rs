//! S7 transport adapter.
//!
//! The `s7` crate's client is synchronous, so every call is dispatched via
//! `spawn_blocking`; a single exclusive lock around the client serializes
//! reads/writes the way §4.1 and §5 require for bit read-modify-write
//! safety. Encoding follows the declared byte order: floats are big-endian
//! IEEE 754, integers are big-endian at the declared width, strings write
//! `{len, actualLen, chars}`.

use super::{ReadRef, Transport, WriteTarget};
use crate::error::{DriverError, DriverResult};
use crate::model::value::{DataType, PlcValue};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct S7Config {
    pub address: String,
    pub rack: u16,
    pub slot: u16,
    /// Exclusive-lock reads/writes rather than assuming the underlying
    /// socket is safe for concurrent synchronous use.
    pub exclusive_access: bool,
}

pub struct S7Transport {
    config: S7Config,
    client: Arc<Mutex<Option<s7::client::Client<s7::tcp::Transport>>>>,
}

impl S7Transport {
    pub fn new(config: S7Config) -> Self {
        Self { config, client: Arc::new(Mutex::new(None)) }
    }

    async fn with_client<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut s7::client::Client<s7::tcp::Transport>) -> DriverResult<T> + Send + 'static,
    {
        let client_arc = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = client_arc.blocking_lock();
            let client = guard
                .as_mut()
                .ok_or_else(|| DriverError::transport_fatal("s7", "not connected"))?;
            f(client)
        })
        .await
        .map_err(|e| DriverError::transport_transient("s7", e.to_string()))?
    }
}

#[async_trait]
impl Transport for S7Transport {
    async fn connect(&mut self) -> DriverResult<bool> {
        if self.client.lock().await.is_some() {
            return Ok(true);
        }
        let address = self.config.address.clone();
        let rack = self.config.rack;
        let slot = self.config.slot;
        let client = tokio::task::spawn_blocking(move || {
            let transport = s7::tcp::Transport::connect(&address)
                .map_err(|e| DriverError::transport_fatal("s7", e.to_string()))?;
            s7::client::Client::new(transport, rack as i32, slot as i32)
                .map_err(|e| DriverError::transport_fatal("s7", e.to_string()))
        })
        .await
        .map_err(|e| DriverError::transport_fatal("s7", e.to_string()))??;

        *self.client.lock().await = Some(client);
        Ok(true)
    }

    async fn disconnect(&mut self) {
        *self.client.lock().await = None;
    }

    fn link_state(&self) -> bool {
        // Synchronous try_lock: if the client is present and not mid-call,
        // we consider the link up.
        self.client.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }

    async fn read_many(&self, refs: &[ReadRef], timeout: Duration) -> DriverResult<Vec<PlcValue>> {
        let refs = refs.to_vec();
        let s7_addrs = refs
            .iter()
            .map(|r| s7_address_for(r))
            .collect::<DriverResult<Vec<_>>>()?;

        let fut = self.with_client(move |client| {
            let mut values = Vec::with_capacity(s7_addrs.len());
            for ((addr, data_type), r) in s7_addrs.into_iter().zip(refs.iter()) {
                let size = addr.size as usize;
                let mut buf = vec![0u8; size];
                client
                    .ag_read(addr.db as i32, addr.start as i32, size as i32, &mut buf)
                    .map_err(|e| DriverError::transport_transient("s7", e.to_string()))?;
                values.push(decode_leaf(&buf, addr.bit, data_type).ok_or_else(|| {
                    DriverError::decode_mismatch(format!("cannot decode {} as {:?}", r.flat_key, data_type))
                })?);
            }
            Ok(values)
        });
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DriverError::timeout("s7 read", timeout.as_millis() as u64))?
    }

    async fn write_many(&self, targets: &[WriteTarget], timeout: Duration) -> DriverResult<()> {
        let targets = targets.to_vec();
        let fut = self.with_client(move |client| {
            for target in &targets {
                let addr = s7_address_from_node(&target.node_id)?;
                if target.data_type == DataType::Bool {
                    // Boolean writes read-modify-write the containing byte.
                    let mut byte = [0u8; 1];
                    client
                        .ag_read(addr.db as i32, addr.start as i32, 1, &mut byte)
                        .map_err(|e| DriverError::transport_transient("s7", e.to_string()))?;
                    let bit = addr.bit.unwrap_or(0);
                    let value = matches!(target.value, PlcValue::Bool(true));
                    if value {
                        byte[0] |= 1 << bit;
                    } else {
                        byte[0] &= !(1 << bit);
                    }
                    client
                        .ag_write(addr.db as i32, addr.start as i32, 1, &mut byte)
                        .map_err(|e| DriverError::transport_transient("s7", e.to_string()))?;
                } else {
                    let mut buf = encode_leaf(&target.value, addr.size as usize)?;
                    client
                        .ag_write(addr.db as i32, addr.start as i32, buf.len() as i32, &mut buf)
                        .map_err(|e| DriverError::transport_transient("s7", e.to_string()))?;
                }
            }
            Ok(())
        });
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DriverError::timeout("s7 write", timeout.as_millis() as u64))?
    }
}

struct S7Addr {
    db: u16,
    start: u32,
    bit: Option<u8>,
    size: u32,
}

fn s7_address_for(r: &ReadRef) -> DriverResult<(S7Addr, DataType)> {
    s7_address_from_node(&r.node_id).map(|a| (a, r.data_type))
}

/// S7 addresses are carried in the descriptor's `(db, start, bit, size)`
/// fields and surfaced to the transport layer through `node_id` encoded as
/// `"db:start:bit:size"` by the device session when it builds read refs.
fn s7_address_from_node(node_id: &str) -> DriverResult<S7Addr> {
    let parts: Vec<&str> = node_id.split(':').collect();
    if parts.len() != 4 {
        return Err(DriverError::decode_mismatch(format!("malformed S7 address '{node_id}'")));
    }
    Ok(S7Addr {
        db: parts[0].parse().map_err(|_| DriverError::decode_mismatch("bad db"))?,
        start: parts[1].parse().map_err(|_| DriverError::decode_mismatch("bad start"))?,
        bit: parts[2].parse().ok(),
        size: parts[3].parse().map_err(|_| DriverError::decode_mismatch("bad size"))?,
    })
}

fn decode_leaf(buf: &[u8], bit: Option<u8>, data_type: DataType) -> Option<PlcValue> {
    Some(match data_type {
        DataType::Bool => PlcValue::Bool((buf[0] >> bit.unwrap_or(0)) & 1 == 1),
        DataType::SByte => PlcValue::SByte(buf[0] as i8),
        DataType::Byte => PlcValue::Byte(buf[0]),
        DataType::Int16 => PlcValue::Int16(BigEndian::read_i16(buf)),
        DataType::UInt16 => PlcValue::UInt16(BigEndian::read_u16(buf)),
        DataType::Int32 => PlcValue::Int32(BigEndian::read_i32(buf)),
        DataType::UInt32 => PlcValue::UInt32(BigEndian::read_u32(buf)),
        DataType::Int64 => PlcValue::Int64(BigEndian::read_i64(buf)),
        DataType::UInt64 => PlcValue::UInt64(BigEndian::read_u64(buf)),
        DataType::Float => PlcValue::Float(BigEndian::read_f32(buf)),
        DataType::Double => PlcValue::Double(BigEndian::read_f64(buf)),
        DataType::String => {
            let actual_len = *buf.get(1)? as usize;
            let chars = buf.get(2..2 + actual_len)?;
            PlcValue::String(String::from_utf8_lossy(chars).into_owned())
        }
        DataType::Bytes => PlcValue::Bytes(buf.to_vec()),
        DataType::DateTime | DataType::Structure => return None,
    })
}

fn encode_leaf(value: &PlcValue, declared_size: usize) -> DriverResult<Vec<u8>> {
    let mut buf = vec![0u8; declared_size.max(1)];
    match value {
        PlcValue::SByte(v) => buf[0] = *v as u8,
        PlcValue::Byte(v) => buf[0] = *v,
        PlcValue::Int16(v) => BigEndian::write_i16(&mut buf, *v),
        PlcValue::UInt16(v) => BigEndian::write_u16(&mut buf, *v),
        PlcValue::Int32(v) => BigEndian::write_i32(&mut buf, *v),
        PlcValue::UInt32(v) => BigEndian::write_u32(&mut buf, *v),
        PlcValue::Int64(v) => BigEndian::write_i64(&mut buf, *v),
        PlcValue::UInt64(v) => BigEndian::write_u64(&mut buf, *v),
        PlcValue::Float(v) => BigEndian::write_f32(&mut buf, *v),
        PlcValue::Double(v) => BigEndian::write_f64(&mut buf, *v),
        PlcValue::String(s) => {
            let max_len = declared_size.saturating_sub(2);
            let actual_len = s.len().min(max_len);
            buf[0] = max_len as u8;
            buf[1] = actual_len as u8;
            buf[2..2 + actual_len].copy_from_slice(&s.as_bytes()[..actual_len]);
        }
        PlcValue::Bytes(b) => {
            let n = b.len().min(buf.len());
            buf[..n].copy_from_slice(&b[..n]);
        }
        PlcValue::Bool(_) => return Err(DriverError::decode_mismatch("bool writes use read-modify-write, not encode_leaf")),
        PlcValue::Sequence(_) | PlcValue::Structure(_) => {
            return Err(DriverError::decode_mismatch("cannot encode a structural value as an S7 leaf"))
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_float_big_endian() {
        let buf = encode_leaf(&PlcValue::Float(1.5), 4).unwrap();
        assert_eq!(BigEndian::read_f32(&buf), 1.5);
    }

    #[test]
    fn decodes_a_bit_within_a_byte() {
        let buf = [0b0000_0100];
        let v = decode_leaf(&buf, Some(2), DataType::Bool).unwrap();
        assert_eq!(v, PlcValue::Bool(true));
        let v = decode_leaf(&buf, Some(0), DataType::Bool).unwrap();
        assert_eq!(v, PlcValue::Bool(false));
    }

    #[test]
    fn parses_the_colon_separated_node_id_encoding() {
        let addr = s7_address_from_node("1:20:3:4").unwrap();
        assert_eq!(addr.db, 1);
        assert_eq!(addr.start, 20);
        assert_eq!(addr.bit, Some(3));
        assert_eq!(addr.size, 4);
    }
}
