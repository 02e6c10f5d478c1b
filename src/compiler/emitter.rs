use crate::compiler::ast::SourceLocation;
use crate::compiler::error::{CompileError, CompileResult};
use crate::opcodes::{OpCode, OperandSize};
use crate::types::MethodToken;
use num_bigint::{BigInt, Sign};

/// Symbolic target patched by the assembler once every method has an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Method(String),
    Token(MethodToken),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Vec<u8>,
    pub target: Option<CallTarget>,
    pub location: Option<SourceLocation>,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Vec<u8>) -> Self {
        Self { opcode, operand, target: None, location: None }
    }

    pub fn size(&self) -> usize {
        1 + self.operand.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode.to_byte());
        out.extend_from_slice(&self.operand);
    }
}

/// Which slot family a load or store addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Local,
    Argument,
    Static,
}

impl SlotKind {
    /// Short form for index 0, long form taking an index byte.
    fn opcodes(self, store: bool) -> (OpCode, OpCode) {
        match (self, store) {
            (SlotKind::Local, false) => (OpCode::LDLOC0, OpCode::LDLOC),
            (SlotKind::Local, true) => (OpCode::STLOC0, OpCode::STLOC),
            (SlotKind::Argument, false) => (OpCode::LDARG0, OpCode::LDARG),
            (SlotKind::Argument, true) => (OpCode::STARG0, OpCode::STARG),
            (SlotKind::Static, false) => (OpCode::LDSFLD0, OpCode::LDSFLD),
            (SlotKind::Static, true) => (OpCode::STSFLD0, OpCode::STSFLD),
        }
    }
}

/// Instruction arena for one method body.
///
/// Offsets handed out by [`Emitter::emit`] are provisional: they assume every
/// branch is in short form and are recomputed by the jump resolver.
#[derive(Debug, Default)]
pub struct Emitter {
    instructions: Vec<Instruction>,
    size: usize,
    location: Option<SourceLocation>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    #[cfg(test)]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    pub fn last_opcode(&self) -> Option<OpCode> {
        self.instructions.last().map(|i| i.opcode)
    }

    /// Sets the location stamped on every instruction emitted from now on,
    /// returning the one it replaces.
    pub fn set_location(&mut self, location: Option<SourceLocation>) -> Option<SourceLocation> {
        std::mem::replace(&mut self.location, location)
    }

    pub fn emit(&mut self, opcode: OpCode, operand: Vec<u8>) -> CompileResult<usize> {
        validate_operand(opcode, &operand)?;
        let offset = self.size;
        let mut instruction = Instruction::new(opcode, operand);
        instruction.location = self.location.clone();
        self.size += instruction.size();
        self.instructions.push(instruction);
        Ok(offset)
    }

    pub fn emit_op(&mut self, opcode: OpCode) -> CompileResult<usize> {
        self.emit(opcode, Vec::new())
    }

    /// Emits an instruction whose operand the assembler fills in.
    pub fn emit_call(&mut self, opcode: OpCode, target: CallTarget) -> CompileResult<usize> {
        let width = match opcode {
            OpCode::CALL_L => 4,
            OpCode::CALLT => 2,
            other => return Err(CompileError::internal(format!("{} cannot carry a call target", other))),
        };
        let offset = self.emit(opcode, vec![0; width])?;
        if let Some(last) = self.instructions.last_mut() {
            last.target = Some(target);
        }
        Ok(offset)
    }

    /// Inserts an instruction ahead of everything emitted so far.
    pub fn prepend(&mut self, opcode: OpCode, operand: Vec<u8>) -> CompileResult<()> {
        validate_operand(opcode, &operand)?;
        let instruction = Instruction::new(opcode, operand);
        self.size += instruction.size();
        self.instructions.insert(0, instruction);
        Ok(())
    }

    /// Narrowest integer push for `value`.
    pub fn push_int(&mut self, value: &BigInt) -> CompileResult<usize> {
        if let Ok(small) = i64::try_from(value) {
            match small {
                -1 => return self.emit_op(OpCode::PUSHM1),
                0..=16 => {
                    let opcode = OpCode::from_byte(OpCode::PUSH0.to_byte() + small as u8)
                        .ok_or_else(|| CompileError::internal("PUSH0..PUSH16 table"))?;
                    return self.emit_op(opcode);
                }
                _ => {}
            }
        }
        let mut bytes = value.to_signed_bytes_le();
        let (opcode, width) = match bytes.len() {
            1 => (OpCode::PUSHINT8, 1),
            2 => (OpCode::PUSHINT16, 2),
            3..=4 => (OpCode::PUSHINT32, 4),
            5..=8 => (OpCode::PUSHINT64, 8),
            9..=16 => (OpCode::PUSHINT128, 16),
            17..=32 => (OpCode::PUSHINT256, 32),
            n => return Err(CompileError::overflow(format!("integer literal needs {} bytes, PUSHINT256 holds 32", n))),
        };
        let fill = if value.sign() == Sign::Minus { 0xff } else { 0x00 };
        bytes.resize(width, fill);
        self.emit(opcode, bytes)
    }

    pub fn push_i64(&mut self, value: i64) -> CompileResult<usize> {
        self.push_int(&BigInt::from(value))
    }

    pub fn push_bool(&mut self, value: bool) -> CompileResult<usize> {
        self.emit_op(if value { OpCode::PUSHT } else { OpCode::PUSHF })
    }

    pub fn push_null(&mut self) -> CompileResult<usize> {
        self.emit_op(OpCode::PUSHNULL)
    }

    pub fn push_data(&mut self, data: &[u8]) -> CompileResult<usize> {
        let mut operand = Vec::with_capacity(data.len() + 4);
        let opcode = if data.len() <= u8::MAX as usize {
            operand.push(data.len() as u8);
            OpCode::PUSHDATA1
        } else if data.len() <= u16::MAX as usize {
            operand.extend_from_slice(&(data.len() as u16).to_le_bytes());
            OpCode::PUSHDATA2
        } else {
            let len = u32::try_from(data.len())
                .map_err(|_| CompileError::overflow(format!("{} byte literal exceeds PUSHDATA4", data.len())))?;
            operand.extend_from_slice(&len.to_le_bytes());
            OpCode::PUSHDATA4
        };
        operand.extend_from_slice(data);
        self.emit(opcode, operand)
    }

    pub fn push_string(&mut self, text: &str) -> CompileResult<usize> {
        self.push_data(text.as_bytes())
    }

    pub fn load(&mut self, kind: SlotKind, index: usize) -> CompileResult<usize> {
        self.slot_access(kind, index, false)
    }

    pub fn store(&mut self, kind: SlotKind, index: usize) -> CompileResult<usize> {
        self.slot_access(kind, index, true)
    }

    fn slot_access(&mut self, kind: SlotKind, index: usize, store: bool) -> CompileResult<usize> {
        let (short_base, long) = kind.opcodes(store);
        if index <= 6 {
            let opcode = OpCode::from_byte(short_base.to_byte() + index as u8)
                .ok_or_else(|| CompileError::internal("slot opcode table"))?;
            return self.emit_op(opcode);
        }
        let index = u8::try_from(index)
            .map_err(|_| CompileError::overflow(format!("{:?} slot index {} exceeds 255", kind, index)))?;
        self.emit(long, vec![index])
    }
}

fn validate_operand(opcode: OpCode, operand: &[u8]) -> CompileResult<()> {
    let ok = match opcode.operand_size() {
        OperandSize::None => operand.is_empty(),
        OperandSize::Fixed(n) => operand.len() == n,
        OperandSize::Prefixed(prefix) => {
            operand.len() >= prefix && {
                let mut len = [0u8; 8];
                len[..prefix].copy_from_slice(&operand[..prefix]);
                u64::from_le_bytes(len) as usize == operand.len() - prefix
            }
        }
    };
    if ok {
        Ok(())
    } else {
        Err(CompileError::internal(format!(
            "operand of {} has {} bytes, layout is {:?}",
            opcode,
            operand.len(),
            opcode.operand_size()
        )))
    }
}
