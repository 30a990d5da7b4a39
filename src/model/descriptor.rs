//! `ModuleKey` and `VariableDescriptor` — the catalog's unit of addressing.

use crate::model::value::{DataType, PlcValue};
use serde::{Deserialize, Serialize};

/// Logical address of a PLC module: `(blockId, index, category)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    pub block_id: i64,
    pub index: i64,
    pub category: String,
}

impl ModuleKey {
    pub fn new(block_id: i64, index: i64, category: impl Into<String>) -> Self {
        Self { block_id, index, category: category.into() }
    }

    /// `"{blockId}_{index}_{category}_{code}"`, the flat catalog key.
    pub fn format_code(&self, code: &str) -> String {
        format!("{}_{}_{}_{}", self.block_id, self.index, self.category, code)
    }
}

/// S7 addressing for a descriptor; absent (all-`None`) for OPC UA-only
/// variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S7Address {
    pub db: Option<u16>,
    pub start: Option<u32>,
    pub bit: Option<u8>,
    pub size: Option<u32>,
}

/// One row of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub module: ModuleKey,
    pub code: String,
    pub node_id: String,
    pub data_type: DataType,
    pub data_type_string: String,
    pub array_dimensions: u32,
    pub value: Option<PlcValue>,
    pub decimal_point: i32,
    pub s7: S7Address,
    pub read_enable: bool,
    pub opcua_subscribe: bool,
    pub timed_clear: bool,
    pub read_period_ms: u64,
    pub timed_clear_time_ms: u64,
    /// Timestamp (ms) of the most recent observation of `false`, used by
    /// the safety-clear phase. `None` until the first scan.
    pub false_time_ms: Option<i64>,
    /// Base OPC UA browse path of the module this descriptor belongs to;
    /// carried through for diagnostics only, never parsed by this core.
    pub base_path: Option<String>,
}

impl VariableDescriptor {
    pub fn flat_key(&self) -> String {
        self.module.format_code(&self.code)
    }

    pub fn is_structural(&self) -> bool {
        self.array_dimensions > 0 || self.data_type == DataType::Structure
    }

    /// Default decimal precision when undetermined, per the codec's
    /// normalization rule.
    pub fn effective_decimal_point(&self) -> i32 {
        if self.decimal_point > 0 { self.decimal_point } else { 3 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_code_matches_the_flat_key_convention() {
        let key = ModuleKey::new(1, 2, "MC");
        assert_eq!(key.format_code("Basic_Id"), "1_2_MC_Basic_Id");
    }

    #[test]
    fn timed_clear_descriptor_defaults_to_undetermined_false_time() {
        let descriptor = VariableDescriptor {
            module: ModuleKey::new(0, 1, "MC"),
            code: "Safety_AllowMove".into(),
            node_id: String::new(),
            data_type: DataType::Bool,
            data_type_string: "bool".into(),
            array_dimensions: 0,
            value: None,
            decimal_point: 0,
            s7: S7Address::default(),
            read_enable: true,
            opcua_subscribe: true,
            timed_clear: true,
            read_period_ms: 800,
            timed_clear_time_ms: 1000,
            false_time_ms: None,
            base_path: None,
        };
        assert!(descriptor.false_time_ms.is_none());
        assert_eq!(descriptor.effective_decimal_point(), 3);
    }
}
