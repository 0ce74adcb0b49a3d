//! 结构体布局编译（layout）：定义 → 展开序列 → 偏移表 → 索引路径查找。

use std::collections::HashMap;

use log::{debug, warn};
use thiserror::Error;

pub mod definitions;
pub mod expand;
pub mod lookup;
pub mod offsets;
pub mod primitive;

pub use definitions::{MemberDescriptor, StructDefinitions};
pub use expand::{expand, Boundary, ExpandedLayout, LayoutToken};
pub use lookup::{resolve_offset, LookupError};
pub use offsets::{compile_offsets, LeafOffset, OffsetTable};
pub use primitive::PrimitiveKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("definition error: unknown structure '{name}'")]
    UnknownStructure { name: String },

    #[error("definition error: malformed array '{member}' in '{structure}': {reason}")]
    MalformedArray {
        structure: String,
        member: String,
        reason: String,
    },

    #[error("definition error: STRING member '{member}' in '{structure}' must specify a capacity like STRING[n]")]
    MalformedString { structure: String, member: String },

    #[error("definition error: empty member in '{structure}'")]
    EmptyMember { structure: String },

    #[error("definition error: structure '{name}' contains itself ({chain})")]
    CyclicDefinition { name: String, chain: String },

    #[error("definition error: could not align member {position} of '{structure}'")]
    AlignmentFailure { structure: String, position: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledStruct {
    pub layout: ExpandedLayout,
    pub offsets: OffsetTable,
}

/// Compiled form of every loaded structure. Structures that failed keep their
/// error so lookups can report why they are unusable.
#[derive(Clone, Debug, Default)]
pub struct StructTable {
    compiled: HashMap<String, CompiledStruct>,
    failed: HashMap<String, DefinitionError>,
    order: Vec<String>,
}

impl StructTable {
    pub fn compile(definitions: &StructDefinitions) -> Self {
        let mut table = StructTable::default();
        for name in definitions.names() {
            table.order.push(name.to_string());
            match compile_one(definitions, name) {
                Ok(compiled) => {
                    debug!(
                        "struct {name}: {} leaves, layout [{}], offsets {:?}",
                        compiled.offsets.entries.len(),
                        compiled.layout,
                        compiled.offsets.raw_values()
                    );
                    table.compiled.insert(name.to_string(), compiled);
                }
                Err(err) => {
                    warn!("struct {name} is unusable: {err}");
                    table.failed.insert(name.to_string(), err);
                }
            }
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&CompiledStruct> {
        self.compiled.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.compiled.contains_key(name) || self.failed.contains_key(name)
    }

    /// Failures in definition order.
    pub fn errors(&self) -> impl Iterator<Item = (&str, &DefinitionError)> {
        self.order
            .iter()
            .filter_map(|name| self.failed.get(name).map(|err| (name.as_str(), err)))
    }

    pub fn resolve_offset(&self, name: &str, indices: &[usize]) -> Result<LeafOffset, LookupError> {
        if let Some(err) = self.failed.get(name) {
            return Err(LookupError::InvalidStructure {
                name: name.to_string(),
                source: err.clone(),
            });
        }
        let compiled = self
            .compiled
            .get(name)
            .ok_or_else(|| LookupError::UnknownStructure {
                name: name.to_string(),
            })?;
        resolve_offset(name, &compiled.layout, &compiled.offsets, indices)
    }
}

fn compile_one(definitions: &StructDefinitions, name: &str) -> Result<CompiledStruct, DefinitionError> {
    let layout = expand(definitions, name)?;
    let offsets = compile_offsets(name, &layout)?;
    Ok(CompiledStruct { layout, offsets })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_structs_survive_broken_siblings() {
        let mut defs = StructDefinitions::new();
        defs.insert("Good", vec!["DINT".to_string()]);
        defs.insert("Bad", vec!["STRING".to_string()]);
        defs.insert("UsesBad", vec!["INT".to_string(), "Bad".to_string()]);

        let table = StructTable::compile(&defs);
        assert!(table.get("Good").is_some());
        assert!(table.get("Bad").is_none());
        assert!(table.contains("Bad"));

        let failed: Vec<&str> = table.errors().map(|(name, _)| name).collect();
        assert_eq!(failed, vec!["Bad", "UsesBad"]);

        assert!(matches!(
            table.resolve_offset("UsesBad", &[1]),
            Err(LookupError::InvalidStructure { .. })
        ));
    }
}
