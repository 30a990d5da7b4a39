//! Uniform transport abstraction over OPC UA and S7 (`SPEC_FULL.md` §4.1).
//!
//! The rest of the core only ever talks to `Box<dyn Transport>`; the two
//! concrete adapters hide the OPC UA and S7 client libraries entirely.

pub mod backoff;
pub mod opcua;
pub mod s7;
pub mod tolerance;

use crate::error::DriverResult;
use crate::model::value::{DataType, PlcValue};
use async_trait::async_trait;
use std::time::Duration;

/// A single node to read, addressed the way the transport needs it:
/// OPC UA by `node_id`, S7 by its `(db, start, bit, size)` descriptor
/// fields carried alongside.
#[derive(Debug, Clone)]
pub struct ReadRef {
    pub flat_key: String,
    pub node_id: String,
    pub data_type: DataType,
    pub array_dimensions: u32,
}

/// A single write, carrying enough addressing and typing information for
/// either transport to perform it without consulting the catalog again.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub flat_key: String,
    pub node_id: String,
    pub data_type: DataType,
    pub value: PlcValue,
}

/// Change notification delivered by a push-based subscription. Only the
/// OPC UA adapter produces these.
pub type ChangeCallback = std::sync::Arc<dyn Fn(String, PlcValue) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Idempotent: calling `connect` on an already-connected transport is a
    /// no-op success.
    async fn connect(&mut self) -> DriverResult<bool>;

    /// Idempotent.
    async fn disconnect(&mut self);

    /// Combines the underlying client's link state with the local failure
    /// counter (`rwFailureCount`).
    fn link_state(&self) -> bool;

    /// Bulk read. Partial success is not reported: either every node comes
    /// back or the whole call fails.
    async fn read_many(&self, refs: &[ReadRef], timeout: Duration) -> DriverResult<Vec<PlcValue>>;

    /// Bulk write.
    async fn write_many(&self, targets: &[WriteTarget], timeout: Duration) -> DriverResult<()>;

    /// Push-based change notification; the default returns an error since
    /// only OPC UA implements subscriptions (§4.1).
    async fn subscribe(&mut self, refs: &[ReadRef], on_change: ChangeCallback) -> DriverResult<()> {
        let _ = (refs, on_change);
        Err(crate::error::DriverError::transport_fatal(
            "transport",
            "subscriptions are not supported by this transport",
        ))
    }
}

/// Read timeout policy: base 0.2s plus 0.05s per node (§5).
pub fn read_timeout(node_count: usize) -> Duration {
    Duration::from_secs_f64(0.2 + 0.05 * node_count as f64)
}

/// Write timeout policy: `max(base, base + 0.01*count)`, clamped to
/// `max_timeout` (§4.1).
pub fn write_timeout(count: usize, base: Duration, max_timeout: Duration) -> Duration {
    let scaled = base.as_secs_f64() + 0.01 * count as f64;
    let scaled = scaled.max(base.as_secs_f64());
    Duration::from_secs_f64(scaled.min(max_timeout.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_timeout_is_clamped_to_max() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let t = write_timeout(10_000, base, max);
        assert_eq!(t, max);
    }

    #[test]
    fn write_timeout_scales_with_count_below_the_cap() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let t = write_timeout(10, base, max);
        assert!(t > base && t < max);
    }
}
