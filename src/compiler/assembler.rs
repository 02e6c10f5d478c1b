//! Links converted method blocks into one script.
//!
//! Blocks are laid out back to back in the order given. Every `CALL_L` is
//! patched with the distance to its callee's first byte and every `CALLT`
//! with the index of its deduplicated method token.

use crate::compiler::convert::MethodBlock;
use crate::compiler::emitter::CallTarget;
use crate::compiler::error::{CompileError, CompileResult};
use crate::compiler::jumps::instruction_offsets;
use crate::compiler::nef::{CompiledScript, NefError, MAX_TOKENS};
use crate::opcodes::OpCode;
use crate::types::MethodToken;
use std::collections::HashMap;

/// Insertion-ordered set of method tokens addressed by 16-bit index.
#[derive(Debug, Default, Clone)]
pub struct TokenTable {
    tokens: Vec<MethodToken>,
    index: HashMap<MethodToken, u16>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of `token`, adding it if this is its first use.
    pub fn intern(&mut self, token: &MethodToken) -> CompileResult<u16> {
        if let Some(&index) = self.index.get(token) {
            return Ok(index);
        }
        if self.tokens.len() >= MAX_TOKENS {
            return Err(CompileError::overflow(format!(
                "method token table is full ({} entries), cannot add {}",
                MAX_TOKENS, token
            )));
        }
        let index = self.tokens.len() as u16;
        self.tokens.push(token.clone());
        self.index.insert(token.clone(), index);
        Ok(index)
    }

    #[cfg(test)]
    pub fn get(&self, index: u16) -> Option<&MethodToken> {
        self.tokens.get(index as usize)
    }

    pub fn tokens(&self) -> &[MethodToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Where a method ended up in the linked script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodLayout {
    pub name: String,
    pub start: usize,
    /// Exclusive.
    pub end: usize,
    /// Absolute offset of each instruction of the block.
    pub instruction_offsets: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Assembly {
    pub script: Vec<u8>,
    pub tokens: Vec<MethodToken>,
    pub methods: Vec<MethodLayout>,
}

impl Assembly {
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.methods.iter().find(|m| m.name == name).map(|m| m.start)
    }

    pub fn offsets(&self) -> HashMap<String, usize> {
        self.methods.iter().map(|m| (m.name.clone(), m.start)).collect()
    }

    pub fn layout_of(&self, name: &str) -> Option<&MethodLayout> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Wraps the linked script in the container format.
    pub fn to_nef(&self, compiler: &str, source: &str) -> CompileResult<CompiledScript> {
        CompiledScript::new(compiler, source, self.script.clone(), self.tokens.clone()).map_err(|e| match e {
            NefError::EmptyScript => CompileError::unsupported("contract without any method body"),
            NefError::CompilerTooLong(_)
            | NefError::SourceTooLong(_)
            | NefError::TooManyTokens(_)
            | NefError::TokenMethodTooLong(_)
            | NefError::ScriptTooLarge(_) => CompileError::overflow(e.to_string()),
            NefError::ReservedTokenMethod(_) => CompileError::unsupported(e.to_string()),
            other => CompileError::internal(other.to_string()),
        })
    }
}

/// Concatenates `blocks` and patches call operands.
pub fn assemble(blocks: &[MethodBlock], tokens: &mut TokenTable) -> CompileResult<Assembly> {
    let mut starts: HashMap<&str, usize> = HashMap::new();
    let mut methods = Vec::with_capacity(blocks.len());
    let mut position = 0usize;
    for block in blocks {
        if starts.insert(block.name.as_str(), position).is_some() {
            return Err(CompileError::unsupported(format!("method '{}' is declared more than once", block.name))
                .at(block.location.as_ref()));
        }
        let offsets = instruction_offsets(&block.instructions);
        let size = offsets.last().copied().unwrap_or(0);
        methods.push(MethodLayout {
            name: block.name.clone(),
            start: position,
            end: position + size,
            instruction_offsets: offsets[..block.instructions.len()].iter().map(|o| position + o).collect(),
        });
        position += size;
    }

    let mut script = Vec::with_capacity(position);
    for (block, layout) in blocks.iter().zip(&methods) {
        for (instruction, &offset) in block.instructions.iter().zip(&layout.instruction_offsets) {
            let mut instruction = instruction.clone();
            match (&instruction.target, instruction.opcode) {
                (Some(CallTarget::Method(callee)), OpCode::CALL_L) => {
                    let start = *starts.get(callee.as_str()).ok_or_else(|| {
                        CompileError::unresolved(format!("method '{}'", callee)).at(instruction.location.as_ref())
                    })?;
                    let delta = i32::try_from(start as i64 - offset as i64).map_err(|_| {
                        CompileError::overflow(format!("call from offset {} to '{}' at {}", offset, callee, start))
                    })?;
                    instruction.operand = delta.to_le_bytes().to_vec();
                }
                (Some(CallTarget::Token(token)), OpCode::CALLT) => {
                    let index = tokens.intern(token).map_err(|e| e.at(instruction.location.as_ref()))?;
                    instruction.operand = index.to_le_bytes().to_vec();
                }
                (Some(target), opcode) => {
                    return Err(CompileError::internal(format!("{} cannot carry call target {:?}", opcode, target)));
                }
                (None, _) => {}
            }
            debug_assert_eq!(script.len(), offset);
            instruction.encode_into(&mut script);
        }
    }

    log::debug!(
        "assembled {} methods into {} bytes with {} method tokens",
        methods.len(),
        script.len(),
        tokens.len()
    );
    Ok(Assembly { script, tokens: tokens.tokens().to_vec(), methods })
}
