//! The value codec: one bidirectional recursive walk shared by reading and
//! writing (`SPEC_FULL.md` §4.2), replacing the source's four near-duplicate
//! walkers (`datas_parse`, `datas_parse_o2m`, `datas_parse_m2o`,
//! `s7_datas_parse`) with a single function parameterized by direction.

use crate::model::catalog::VariableCatalog;
use crate::model::value::{DataType, PlcValue};
use crate::transport::WriteTarget;
use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;

/// One entry of the flat `{code, value, dataType, arrLen}` list emitted on
/// the PLC -> MQTT (O2M) direction.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OutboundEntry {
    pub code: String,
    pub value: PlcValue,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    #[serde(rename = "arrLen")]
    pub arr_len: u32,
    pub time: i64,
}

/// Errors collected during a walk. Siblings still get processed: one bad
/// branch does not abort the whole batch (§4.2, §7 `DecodeMismatch`).
#[derive(Debug, Default)]
pub struct CodecReport {
    pub errors: Vec<String>,
}

impl CodecReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// `roundHalfUp(value, decimalPoint)`, implemented via `rust_decimal` so the
/// `.5` boundary rounds the way the original Python `Decimal.quantize`
/// does rather than picking up binary floating-point rounding artifacts.
pub fn round_half_up(value: f64, decimal_point: i32) -> f64 {
    let Some(decimal) = Decimal::from_f64(value) else { return value };
    let scale = decimal_point.max(0) as u32;
    decimal
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(value)
}

fn normalize(value: PlcValue, decimal_point: i32) -> PlcValue {
    match value {
        PlcValue::Float(v) => PlcValue::Float(round_half_up(v as f64, decimal_point) as f32),
        PlcValue::Double(v) => PlcValue::Double(round_half_up(v, decimal_point)),
        other => other,
    }
}

/// Outbound (PLC -> MQTT) walk. `forced_emit` corresponds to `O2M_All`:
/// when set, every leaf is emitted regardless of whether the cached value
/// changed.
pub fn encode_outbound(
    catalog: &mut VariableCatalog,
    flat_key: &str,
    incoming: &PlcValue,
    forced_emit: bool,
    now_ms: i64,
    out: &mut Vec<OutboundEntry>,
    report: &mut CodecReport,
) {
    let Some(descriptor) = catalog.get(flat_key) else {
        report.errors.push(format!("no descriptor for {flat_key}"));
        return;
    };

    if descriptor.array_dimensions > 0 {
        let Some(items) = incoming.as_sequence() else {
            report.errors.push(format!("{flat_key}: expected an array of length {}", descriptor.array_dimensions));
            return;
        };
        if items.len() as u32 != descriptor.array_dimensions {
            report.errors.push(format!(
                "{flat_key}: array length mismatch, expected {} got {}",
                descriptor.array_dimensions,
                items.len()
            ));
            return;
        }
        for (i, item) in items.iter().enumerate() {
            let child_key = VariableCatalog::child_key(flat_key, &i.to_string());
            encode_outbound(catalog, &child_key, item, forced_emit, now_ms, out, report);
        }
        return;
    }

    if descriptor.data_type == DataType::Structure {
        let Some(map) = incoming.as_structure() else {
            report.errors.push(format!("{flat_key}: expected a structured value"));
            return;
        };
        for (key, item) in map {
            let child_key = VariableCatalog::child_key(flat_key, key);
            if catalog.get(&child_key).is_none() {
                report.errors.push(format!("{flat_key}: missing child descriptor for key '{key}'"));
                continue;
            }
            encode_outbound(catalog, &child_key, item, forced_emit, now_ms, out, report);
        }
        return;
    }

    // Leaf.
    let decimal_point = descriptor.effective_decimal_point();
    let normalized = normalize(incoming.clone(), decimal_point);
    let changed = descriptor.value.as_ref() != Some(&normalized);
    if forced_emit || changed {
        out.push(OutboundEntry {
            code: descriptor.code.clone(),
            value: normalized.clone(),
            data_type: descriptor.data_type,
            arr_len: descriptor.array_dimensions,
            time: now_ms,
        });
    }
    if let Some(descriptor) = catalog.get_mut(flat_key) {
        descriptor.value = Some(normalized);
    }
}

/// Inbound (MQTT -> PLC) walk. Enforces type compatibility (int -> float
/// widening allowed, everything else must match exactly) and appends one
/// `WriteTarget` per leaf.
pub fn decode_inbound(
    catalog: &VariableCatalog,
    flat_key: &str,
    incoming: &PlcValue,
    out: &mut Vec<WriteTarget>,
    report: &mut CodecReport,
) {
    let Some(descriptor) = catalog.get(flat_key) else {
        report.errors.push(format!("no descriptor for {flat_key}"));
        return;
    };

    if descriptor.array_dimensions > 0 {
        let Some(items) = incoming.as_sequence() else {
            report.errors.push(format!("{flat_key}: expected an array of length {}", descriptor.array_dimensions));
            return;
        };
        if items.len() as u32 != descriptor.array_dimensions {
            report.errors.push(format!(
                "{flat_key}: array length mismatch, expected {} got {}",
                descriptor.array_dimensions,
                items.len()
            ));
            return;
        }
        for (i, item) in items.iter().enumerate() {
            let child_key = VariableCatalog::child_key(flat_key, &i.to_string());
            decode_inbound(catalog, &child_key, item, out, report);
        }
        return;
    }

    if descriptor.data_type == DataType::Structure {
        let Some(map) = incoming.as_structure() else {
            report.errors.push(format!("{flat_key}: expected a structured value"));
            return;
        };
        for (key, item) in map {
            let child_key = VariableCatalog::child_key(flat_key, key);
            if catalog.get(&child_key).is_none() {
                report.errors.push(format!("{flat_key}: unknown key '{key}', ignoring"));
                continue;
            }
            decode_inbound(catalog, &child_key, item, out, report);
        }
        return;
    }

    // Leaf.
    if !incoming.is_compatible_with(descriptor.data_type) {
        report.errors.push(format!(
            "Write Data Type Error: {} expected {:?}, got {:?}",
            descriptor.code,
            descriptor.data_type,
            incoming.data_type()
        ));
        return;
    }
    out.push(WriteTarget {
        flat_key: flat_key.to_string(),
        node_id: descriptor.node_id.clone(),
        data_type: descriptor.data_type,
        value: incoming.clone(),
    });
}

/// Reconstructs a possibly-nested value for `flat_key` purely from cached
/// descriptor values — no transport round-trip. Backs the MQTT `read` and
/// `read_struct` verbs (§4.5), which answer from the cache rather than
/// forcing a PLC read; array elements missing from the cache abort the
/// whole reconstruction (an array is all-or-nothing), but a structure
/// simply omits a child that hasn't been read yet.
pub fn read_cached(catalog: &VariableCatalog, flat_key: &str) -> Option<PlcValue> {
    let descriptor = catalog.get(flat_key)?;
    if descriptor.array_dimensions > 0 {
        let mut items = Vec::with_capacity(descriptor.array_dimensions as usize);
        for i in 0..descriptor.array_dimensions {
            let child_key = VariableCatalog::child_key(flat_key, &i.to_string());
            items.push(read_cached(catalog, &child_key)?);
        }
        return Some(PlcValue::Sequence(items));
    }
    if descriptor.data_type == DataType::Structure {
        let mut map = std::collections::BTreeMap::new();
        for child in catalog.immediate_children(flat_key) {
            let child_flat_key = child.flat_key();
            let suffix = child_flat_key[flat_key.len() + 1..].to_string();
            if let Some(value) = read_cached(catalog, &child_flat_key) {
                map.insert(suffix, value);
            }
        }
        return Some(PlcValue::Structure(map));
    }
    descriptor.value.clone()
}

/// Emits one flat `OutboundEntry` per leaf under `flat_key`, sourced
/// entirely from cached values (`read`/`read_plc`'s per-leaf list shape).
pub fn emit_cached(catalog: &VariableCatalog, flat_key: &str, now_ms: i64, out: &mut Vec<OutboundEntry>, report: &mut CodecReport) {
    let Some(descriptor) = catalog.get(flat_key) else {
        report.errors.push(format!("no descriptor for {flat_key}"));
        return;
    };

    if descriptor.array_dimensions > 0 {
        for i in 0..descriptor.array_dimensions {
            let child_key = VariableCatalog::child_key(flat_key, &i.to_string());
            emit_cached(catalog, &child_key, now_ms, out, report);
        }
        return;
    }
    if descriptor.data_type == DataType::Structure {
        let children: Vec<String> = catalog.immediate_children(flat_key).into_iter().map(|d| d.flat_key()).collect();
        for child_key in children {
            emit_cached(catalog, &child_key, now_ms, out, report);
        }
        return;
    }
    let Some(value) = descriptor.value.clone() else { return };
    out.push(OutboundEntry {
        code: descriptor.code.clone(),
        value,
        data_type: descriptor.data_type,
        arr_len: descriptor.array_dimensions,
        time: now_ms,
    });
}

/// Emits a single `OutboundEntry` per top-level descriptor, carrying the
/// full reconstructed structured/array value rather than a flattened leaf
/// list (`read_struct`/`read_plc_struct`'s "one entry per top-level
/// descriptor" shape, §4.5).
pub fn emit_cached_structured(catalog: &VariableCatalog, flat_key: &str, now_ms: i64) -> Option<OutboundEntry> {
    let descriptor = catalog.get(flat_key)?;
    let value = read_cached(catalog, flat_key)?;
    Some(OutboundEntry {
        code: descriptor.code.clone(),
        value,
        data_type: descriptor.data_type,
        arr_len: descriptor.array_dimensions,
        time: now_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::{ModuleKey, S7Address, VariableDescriptor};
    use std::collections::BTreeMap;

    fn leaf(module: ModuleKey, code: &str, data_type: DataType, decimal_point: i32) -> VariableDescriptor {
        VariableDescriptor {
            module,
            code: code.into(),
            node_id: format!("ns=3;s={code}"),
            data_type,
            data_type_string: data_type.as_wire_str().into(),
            array_dimensions: 0,
            value: None,
            decimal_point,
            s7: S7Address::default(),
            read_enable: true,
            opcua_subscribe: false,
            timed_clear: false,
            read_period_ms: 800,
            timed_clear_time_ms: 0,
            false_time_ms: None,
            base_path: None,
        }
    }

    #[test]
    fn scalar_write_produces_one_target() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 1, "MC");
        catalog.insert(leaf(module.clone(), "Basic_Id", DataType::Int32, 0)).unwrap();

        let mut out = Vec::new();
        let mut report = CodecReport::default();
        decode_inbound(&catalog, &module.format_code("Basic_Id"), &PlcValue::Int32(42), &mut out, &mut report);

        assert!(report.is_ok());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, PlcValue::Int32(42));
        assert_eq!(out[0].node_id, "ns=3;s=Basic_Id");
    }

    #[test]
    fn type_mismatch_is_reported_and_produces_no_target() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 1, "MC");
        catalog.insert(leaf(module.clone(), "Basic_Id", DataType::Int32, 0)).unwrap();

        let mut out = Vec::new();
        let mut report = CodecReport::default();
        decode_inbound(
            &catalog,
            &module.format_code("Basic_Id"),
            &PlcValue::String("forty-two".into()),
            &mut out,
            &mut report,
        );

        assert!(out.is_empty());
        assert!(!report.is_ok());
        assert!(report.errors[0].contains("Write Data Type Error"));
    }

    #[test]
    fn outbound_subscription_change_rounds_to_decimal_point_and_emits() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 1, "MC");
        catalog.insert(leaf(module.clone(), "Temp", DataType::Float, 3)).unwrap();

        let mut out = Vec::new();
        let mut report = CodecReport::default();
        let key = module.format_code("Temp");
        encode_outbound(&mut catalog, &key, &PlcValue::Float(7.123456), false, 1_000, &mut out, &mut report);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, PlcValue::Float(7.123));
        assert_eq!(catalog.get(&key).unwrap().value, Some(PlcValue::Float(7.123)));
    }

    #[test]
    fn unchanged_value_is_not_re_emitted_unless_forced() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 1, "MC");
        catalog.insert(leaf(module.clone(), "Temp", DataType::Float, 3)).unwrap();
        let key = module.format_code("Temp");

        let mut report = CodecReport::default();
        let mut out = Vec::new();
        encode_outbound(&mut catalog, &key, &PlcValue::Float(1.0), false, 0, &mut out, &mut report);
        assert_eq!(out.len(), 1);

        let mut out2 = Vec::new();
        encode_outbound(&mut catalog, &key, &PlcValue::Float(1.0), false, 0, &mut out2, &mut report);
        assert!(out2.is_empty());

        let mut out3 = Vec::new();
        encode_outbound(&mut catalog, &key, &PlcValue::Float(1.0), true, 0, &mut out3, &mut report);
        assert_eq!(out3.len(), 1);
    }

    #[test]
    fn structure_walk_recurses_into_children_by_constructed_code() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 2, "MC");
        let mut root = leaf(module.clone(), "Basic", DataType::Structure, 0);
        root.array_dimensions = 0;
        catalog.insert(root).unwrap();
        catalog.insert(leaf(module.clone(), "Basic_Id", DataType::Int32, 0)).unwrap();

        let mut map = BTreeMap::new();
        map.insert("Id".to_string(), PlcValue::Int32(7));
        let mut out = Vec::new();
        let mut report = CodecReport::default();
        decode_inbound(&catalog, &module.format_code("Basic"), &PlcValue::Structure(map), &mut out, &mut report);

        assert!(report.is_ok());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].flat_key, module.format_code("Basic_Id"));
    }

    #[test]
    fn emit_cached_reads_flat_leaves_without_a_transport_round_trip() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 2, "MC");
        catalog.insert(leaf(module.clone(), "Basic", DataType::Structure, 0)).unwrap();
        catalog.insert(leaf(module.clone(), "Basic_Id", DataType::Int32, 0)).unwrap();
        catalog.insert(leaf(module.clone(), "Basic_Name", DataType::String, 0)).unwrap();

        // Seed the cache the way a prior scan would have.
        catalog.get_mut(&module.format_code("Basic_Id")).unwrap().value = Some(PlcValue::Int32(7));
        catalog.get_mut(&module.format_code("Basic_Name")).unwrap().value = Some(PlcValue::String("pump-1".into()));

        let mut out = Vec::new();
        let mut report = CodecReport::default();
        emit_cached(&catalog, &module.format_code("Basic"), 1_000, &mut out, &mut report);

        assert!(report.is_ok());
        let codes: Vec<&str> = out.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["Basic_Id", "Basic_Name"]);
    }

    #[test]
    fn emit_cached_structured_emits_one_entry_carrying_the_whole_subtree() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 2, "MC");
        catalog.insert(leaf(module.clone(), "Basic", DataType::Structure, 0)).unwrap();
        catalog.insert(leaf(module.clone(), "Basic_Id", DataType::Int32, 0)).unwrap();
        catalog.get_mut(&module.format_code("Basic_Id")).unwrap().value = Some(PlcValue::Int32(7));

        let entry = emit_cached_structured(&catalog, &module.format_code("Basic"), 1_000).unwrap();
        assert_eq!(entry.code, "Basic");
        assert_eq!(entry.data_type, DataType::Structure);
        let mut expected = BTreeMap::new();
        expected.insert("Id".to_string(), PlcValue::Int32(7));
        assert_eq!(entry.value, PlcValue::Structure(expected));
    }
}
