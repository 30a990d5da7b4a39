//! Catalog data model: module keys, descriptors, the flat catalog and its
//! CSV loader, and the dynamic value variant shared by the codec.

pub mod catalog;
pub mod csv_loader;
pub mod descriptor;
pub mod value;

pub use catalog::VariableCatalog;
pub use descriptor::{ModuleKey, S7Address, VariableDescriptor};
pub use value::{DataType, PlcValue};
