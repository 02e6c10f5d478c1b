//! Debug map in the layout Neo debuggers read: documents, per-method ranges,
//! slots and sequence points.

use crate::compiler::assembler::Assembly;
use crate::compiler::ast::{ContractDecl, SourceLocation};
use crate::compiler::convert::MethodBlock;
use crate::compiler::error::CompileError;
use crate::compiler::typeref::TypeRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMethod {
    pub id: String,
    pub name: String,
    /// Inclusive byte range, `start-end`.
    pub range: String,
    pub params: Vec<String>,
    #[serde(rename = "return")]
    pub return_type: String,
    pub variables: Vec<String>,
    #[serde(rename = "sequence-points")]
    pub sequence_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub id: String,
    pub name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub documents: Vec<String>,
    #[serde(rename = "static-variables")]
    pub static_variables: Vec<String>,
    pub methods: Vec<DebugMethod>,
    pub events: Vec<DebugEvent>,
}

impl DebugInfo {
    pub fn to_json(&self) -> Result<String, CompileError> {
        serde_json::to_string_pretty(self).map_err(|e| CompileError::internal(format!("debug info serialization: {}", e)))
    }

    fn document_index(&mut self, document: &str) -> usize {
        match self.documents.iter().position(|d| d == document) {
            Some(index) => index,
            None => {
                self.documents.push(document.to_string());
                self.documents.len() - 1
            }
        }
    }

    fn sequence_point(&mut self, offset: usize, location: &SourceLocation) -> String {
        let document = self.document_index(&location.document);
        format!(
            "{}[{}]{}:{}-{}:{}",
            offset, document, location.start_line, location.start_column, location.end_line, location.end_column
        )
    }
}

fn slot(name: &str, ty: &TypeRef, index: usize) -> String {
    format!("{},{},{}", name, debug_type(ty), index)
}

fn debug_type(ty: &TypeRef) -> String {
    ty.abi_type().map(|t| t.to_string()).unwrap_or_else(|| "Any".to_string())
}

pub fn build_debug_info(contract: &ContractDecl, blocks: &[MethodBlock], assembly: &Assembly) -> DebugInfo {
    let mut info = DebugInfo {
        static_variables: contract
            .static_fields
            .iter()
            .enumerate()
            .map(|(index, field)| slot(&field.name, &field.ty, index))
            .collect(),
        ..Default::default()
    };

    for block in blocks {
        let Some(layout) = assembly.layout_of(&block.name) else {
            log::warn!("method {} has no layout, left out of the debug map", block.name);
            continue;
        };
        let mut sequence_points = Vec::new();
        for (instruction, &offset) in block.instructions.iter().zip(&layout.instruction_offsets) {
            if let Some(location) = &instruction.location {
                sequence_points.push(info.sequence_point(offset, location));
            }
        }
        if sequence_points.is_empty() {
            if let Some(location) = &block.location {
                info.document_index(&location.document);
            }
        }
        info.methods.push(DebugMethod {
            id: format!("{}.{}", contract.name, block.name),
            name: format!("{},{}", contract.name, block.name),
            range: format!("{}-{}", layout.start, layout.end.saturating_sub(1)),
            params: block.params.iter().enumerate().map(|(i, p)| slot(&p.name, &p.ty, i)).collect(),
            return_type: debug_type(&block.return_type),
            variables: block.locals.iter().map(|l| slot(&l.name, &l.ty, l.index)).collect(),
            sequence_points,
        });
    }

    info.events = contract
        .events
        .iter()
        .map(|event| DebugEvent {
            id: format!("{}.{}", contract.name, event.name),
            name: format!("{},{}", contract.name, event.display_name.as_deref().unwrap_or(&event.name)),
            params: event.params.iter().enumerate().map(|(i, p)| slot(&p.name, &p.ty, i)).collect(),
        })
        .collect();
    info
}
