//! The flat `(blockId, index, category, code)` catalog.
//!
//! The source maintains both a tree and a list view; this catalog keeps the
//! list view only. Structure/array traversal is driven by constructing a
//! child's flat key from the parent's flat key plus a suffix, so the codec
//! walks this map directly instead of a tree (design note in `SPEC_FULL.md`
//! §9).

use crate::error::{DriverError, DriverResult};
use crate::model::descriptor::{ModuleKey, VariableDescriptor};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct VariableCatalog {
    by_flat_key: HashMap<String, VariableDescriptor>,
    by_node_id: HashMap<String, String>,
    /// Recomputed by `rebuild_views` whenever catalog flags change.
    read_block: Vec<String>,
    timed_clear_block: Vec<String>,
}

impl VariableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor. Returns an error if the flat key already
    /// exists — the composite key must be globally unique within one
    /// device catalog.
    pub fn insert(&mut self, descriptor: VariableDescriptor) -> DriverResult<()> {
        let key = descriptor.flat_key();
        if self.by_flat_key.contains_key(&key) {
            return Err(DriverError::config(format!(
                "duplicate catalog key: {key}"
            )));
        }
        if !descriptor.node_id.is_empty() {
            self.by_node_id.insert(descriptor.node_id.clone(), key.clone());
        }
        self.by_flat_key.insert(key, descriptor);
        Ok(())
    }

    pub fn get(&self, flat_key: &str) -> Option<&VariableDescriptor> {
        self.by_flat_key.get(flat_key)
    }

    pub fn get_mut(&mut self, flat_key: &str) -> Option<&mut VariableDescriptor> {
        self.by_flat_key.get_mut(flat_key)
    }

    /// Looks up a descriptor by its logical address, mirroring
    /// `(blockId, index, category, code)` lookup from the data model.
    pub fn get_by_address(&self, module: &ModuleKey, code: &str) -> Option<&VariableDescriptor> {
        self.by_flat_key.get(&module.format_code(code))
    }

    /// O(1) reverse lookup used by the OPC UA subscription callback, which
    /// only knows the node ID that changed.
    pub fn flat_key_for_node(&self, node_id: &str) -> Option<&str> {
        self.by_node_id.get(node_id).map(|s| s.as_str())
    }

    pub fn child_key(parent_flat_key: &str, suffix: &str) -> String {
        let suffix = suffix.strip_prefix('_').unwrap_or(suffix);
        format!("{parent_flat_key}_{suffix}")
    }

    pub fn module_keys(&self) -> Vec<ModuleKey> {
        let mut seen = Vec::new();
        for d in self.by_flat_key.values() {
            if !seen.contains(&d.module) {
                seen.push(d.module.clone());
            }
        }
        seen
    }

    pub fn descriptors_for_module(&self, module: &ModuleKey) -> Vec<&VariableDescriptor> {
        self.by_flat_key.values().filter(|d| &d.module == module).collect()
    }

    /// Direct children of a structure-typed descriptor, recovered by
    /// longest flat-key prefix match rather than a stored tree — the
    /// catalog keeps only the flat `(blockId,index,category,code)` map
    /// (§9 design note), so a cached structured read has to walk parentage
    /// back out of it. A candidate under `parent_flat_key + "_"` is a
    /// direct child only if no other descriptor under that same prefix is
    /// itself a closer ancestor of it.
    pub fn immediate_children(&self, parent_flat_key: &str) -> Vec<&VariableDescriptor> {
        let prefix = format!("{parent_flat_key}_");
        let mut children: Vec<&VariableDescriptor> = self
            .by_flat_key
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| {
                !self.by_flat_key.keys().any(|other| {
                    other.as_str() != parent_flat_key
                        && other.as_str() != key.as_str()
                        && other.starts_with(&prefix)
                        && key.starts_with(&format!("{other}_"))
                })
            })
            .map(|(_, d)| d)
            .collect();
        children.sort_by(|a, b| a.code.cmp(&b.code));
        children
    }

    /// Rebuilds the read-block (`readEnable = true`) and timed-clear-block
    /// (`timedClear = true`) views. Must be called after any change to
    /// those flags.
    pub fn rebuild_views(&mut self) {
        self.read_block = self
            .by_flat_key
            .iter()
            .filter(|(_, d)| d.read_enable)
            .map(|(k, _)| k.clone())
            .collect();
        self.timed_clear_block = self
            .by_flat_key
            .iter()
            .filter(|(_, d)| d.timed_clear)
            .map(|(k, _)| k.clone())
            .collect();
    }

    pub fn read_block(&self) -> &[String] {
        &self.read_block
    }

    pub fn timed_clear_block(&self) -> &[String] {
        &self.timed_clear_block
    }

    pub fn len(&self) -> usize {
        self.by_flat_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_flat_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VariableDescriptor)> {
        self.by_flat_key.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::S7Address;
    use crate::model::value::DataType;

    fn descriptor(module: ModuleKey, code: &str, read_enable: bool, timed_clear: bool) -> VariableDescriptor {
        VariableDescriptor {
            module,
            code: code.into(),
            node_id: String::new(),
            data_type: DataType::Bool,
            data_type_string: "bool".into(),
            array_dimensions: 0,
            value: None,
            decimal_point: 0,
            s7: S7Address::default(),
            read_enable,
            opcua_subscribe: false,
            timed_clear,
            read_period_ms: 800,
            timed_clear_time_ms: 1000,
            false_time_ms: None,
            base_path: None,
        }
    }

    #[test]
    fn duplicate_flat_keys_are_rejected() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 1, "MC");
        catalog.insert(descriptor(module.clone(), "Basic_Id", true, false)).unwrap();
        let err = catalog.insert(descriptor(module, "Basic_Id", true, false)).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn views_reflect_only_flagged_descriptors() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 1, "MC");
        catalog.insert(descriptor(module.clone(), "A", true, false)).unwrap();
        catalog.insert(descriptor(module.clone(), "B", false, true)).unwrap();
        catalog.rebuild_views();
        assert_eq!(catalog.read_block(), &["0_1_MC_A".to_string()]);
        assert_eq!(catalog.timed_clear_block(), &["0_1_MC_B".to_string()]);
    }

    #[test]
    fn child_key_strips_a_leading_underscore() {
        assert_eq!(VariableCatalog::child_key("0_1_MC_Basic", "_Id"), "0_1_MC_Basic_Id");
        assert_eq!(VariableCatalog::child_key("0_1_MC_Basic", "0"), "0_1_MC_Basic_0");
    }

    #[test]
    fn immediate_children_excludes_grandchildren() {
        let mut catalog = VariableCatalog::new();
        let module = ModuleKey::new(0, 2, "MC");
        catalog.insert(descriptor(module.clone(), "Basic", true, false)).unwrap();
        catalog.insert(descriptor(module.clone(), "Basic_Id", true, false)).unwrap();
        catalog.insert(descriptor(module.clone(), "Basic_Pos", true, false)).unwrap();
        catalog.insert(descriptor(module.clone(), "Basic_Pos_X", true, false)).unwrap();

        let children = catalog.immediate_children(&module.format_code("Basic"));
        let codes: Vec<&str> = children.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["Basic_Id", "Basic_Pos"]);

        let grandchildren = catalog.immediate_children(&module.format_code("Basic_Pos"));
        let codes: Vec<&str> = grandchildren.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["Basic_Pos_X"]);
    }
}
