//! Catalog CSV loader: try UTF-8 -> UTF-8-BOM -> GBK, as the external
//! variable browser may emit any of the three depending on the operator's
//! locale (`SPEC_FULL.md` §4.3).

use crate::error::{DriverError, DriverResult};
use crate::model::catalog::VariableCatalog;
use crate::model::descriptor::{ModuleKey, S7Address, VariableDescriptor};
use crate::model::value::DataType;
use std::path::Path;

pub fn load_catalog(path: impl AsRef<Path>) -> DriverResult<VariableCatalog> {
    let bytes = std::fs::read(path.as_ref())?;
    let text = decode_catalog_bytes(&bytes)?;
    let mut catalog = VariableCatalog::new();
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    for record in reader.deserialize::<CsvRow>() {
        let row = record?;
        catalog.insert(row.into_descriptor()?)?;
    }
    catalog.rebuild_views();
    Ok(catalog)
}

/// Decodes catalog bytes trying UTF-8, then UTF-8 with a leading BOM
/// stripped, then GBK — the order the original variable browser's loader
/// used. The BOM must be stripped *before* the plain-UTF-8 attempt: bytes
/// `EF BB BF` are themselves valid UTF-8 (they decode to U+FEFF), so a
/// BOM-prefixed file would otherwise pass the first branch with the BOM
/// still attached to the first CSV header.
fn decode_catalog_bytes(bytes: &[u8]) -> DriverResult<String> {
    const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
    let bytes = bytes.strip_prefix(BOM).unwrap_or(bytes);
    if let Ok(s) = std::str::from_utf8(bytes) {
        return Ok(s.to_string());
    }
    let (decoded, _, had_errors) = encoding_rs::GBK.decode(bytes);
    if had_errors {
        return Err(DriverError::config("catalog CSV is neither UTF-8 nor GBK"));
    }
    Ok(decoded.into_owned())
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    #[allow(dead_code)]
    path: String,
    #[allow(dead_code)]
    name: String,
    #[serde(rename = "NodeID")]
    node_id: String,
    #[serde(rename = "NodeClass")]
    #[allow(dead_code)]
    node_class: String,
    #[serde(rename = "DataType")]
    data_type: String,
    #[serde(rename = "DataTypeString")]
    data_type_string: String,
    #[serde(rename = "DecimalPoint")]
    decimal_point: i32,
    #[serde(rename = "ArrayDimensions")]
    array_dimensions: u32,
    #[allow(dead_code)]
    value: String,
    #[serde(rename = "blockId")]
    block_id: i64,
    index: i64,
    category: String,
    code: String,
    opcua_subscribe: bool,
    read_enable: bool,
    read_period: u64,
    timed_clear: bool,
    timed_clear_time: u64,
    s7_db: Option<u16>,
    s7_start: Option<u32>,
    s7_bit: Option<u8>,
    s7_size: Option<u32>,
}

impl CsvRow {
    fn into_descriptor(self) -> DriverResult<VariableDescriptor> {
        let data_type = DataType::from_wire_str(&self.data_type).ok_or_else(|| {
            DriverError::config(format!("unknown dataType '{}' for code {}", self.data_type, self.code))
        })?;
        if self.timed_clear && data_type != DataType::Bool {
            return Err(DriverError::config(format!(
                "descriptor {} has timedClear=true but is not boolean-typed",
                self.code
            )));
        }
        Ok(VariableDescriptor {
            module: ModuleKey::new(self.block_id, self.index, self.category),
            code: self.code,
            node_id: self.node_id,
            data_type,
            data_type_string: self.data_type_string,
            array_dimensions: self.array_dimensions,
            value: None,
            decimal_point: self.decimal_point,
            s7: S7Address { db: self.s7_db, start: self.s7_start, bit: self.s7_bit, size: self.s7_size },
            read_enable: self.read_enable,
            opcua_subscribe: self.opcua_subscribe,
            timed_clear: self.timed_clear,
            read_period_ms: self.read_period,
            timed_clear_time_ms: self.timed_clear_time,
            false_time_ms: None,
            base_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_csv() -> &'static str {
        "path,name,NodeID,NodeClass,DataType,DataTypeString,DecimalPoint,ArrayDimensions,value,blockId,index,category,code,opcua_subscribe,read_enable,read_period,timed_clear,timed_clear_time,s7_db,s7_start,s7_bit,s7_size\n\
         /MC/Basic/Id,Id,ns=3;s=Basic.Id,Variable,int32,int32,0,0,0,0,1,MC,Basic_Id,true,true,800,false,0,,,, \n"
    }

    #[test]
    fn loads_a_well_formed_utf8_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_csv().as_bytes()).unwrap();
        let catalog = load_catalog(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        let descriptor = catalog.get_by_address(&ModuleKey::new(0, 1, "MC"), "Basic_Id").unwrap();
        assert_eq!(descriptor.data_type, DataType::Int32);
        assert!(descriptor.read_enable);
    }

    #[test]
    fn decodes_a_utf8_bom_prefixed_file() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(sample_csv().as_bytes());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let catalog = load_catalog(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        // A BOM left attached to the first header ("\u{FEFF}path") makes
        // the CSV reader fail to recognize that column by name, so this
        // lookup is the part of the test that would actually fail if the
        // BOM were not stripped before the header row is parsed.
        let descriptor = catalog.get_by_address(&ModuleKey::new(0, 1, "MC"), "Basic_Id").unwrap();
        assert_eq!(descriptor.data_type, DataType::Int32);
    }

    #[test]
    fn rejects_a_timed_clear_descriptor_that_is_not_boolean() {
        let bad = sample_csv().replace("int32,int32,0,0,0,0,1,MC,Basic_Id,true,true,800,false",
            "int32,int32,0,0,0,0,1,MC,Basic_Id,true,true,800,true");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bad.as_bytes()).unwrap();
        assert!(load_catalog(file.path()).is_err());
    }
}
