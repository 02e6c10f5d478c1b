use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How the operand of an instruction is laid out after the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    None,
    /// Exactly `n` operand bytes.
    Fixed(usize),
    /// A little-endian length prefix of `n` bytes followed by that many bytes.
    Prefixed(usize),
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal $(=> $size:expr)?,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[allow(clippy::upper_case_acronyms, non_camel_case_types)]
        #[repr(u8)]
        pub enum OpCode {
            $($name = $byte,)*
        }

        impl OpCode {
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(OpCode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $(OpCode::$name => stringify!($name),)*
                }
            }

            pub fn operand_size(&self) -> OperandSize {
                match self {
                    $(OpCode::$name => opcodes!(@size $($size)?),)*
                }
            }
        }
    };
    (@size) => { OperandSize::None };
    (@size $size:expr) => { $size };
}

use OperandSize::{Fixed, Prefixed};

opcodes! {
    // Constants
    PUSHINT8 = 0x00 => Fixed(1),
    PUSHINT16 = 0x01 => Fixed(2),
    PUSHINT32 = 0x02 => Fixed(4),
    PUSHINT64 = 0x03 => Fixed(8),
    PUSHINT128 = 0x04 => Fixed(16),
    PUSHINT256 = 0x05 => Fixed(32),
    PUSHT = 0x08,
    PUSHF = 0x09,
    PUSHA = 0x0a => Fixed(4),
    PUSHNULL = 0x0b,
    PUSHDATA1 = 0x0c => Prefixed(1),
    PUSHDATA2 = 0x0d => Prefixed(2),
    PUSHDATA4 = 0x0e => Prefixed(4),
    PUSHM1 = 0x0f,
    PUSH0 = 0x10,
    PUSH1 = 0x11,
    PUSH2 = 0x12,
    PUSH3 = 0x13,
    PUSH4 = 0x14,
    PUSH5 = 0x15,
    PUSH6 = 0x16,
    PUSH7 = 0x17,
    PUSH8 = 0x18,
    PUSH9 = 0x19,
    PUSH10 = 0x1a,
    PUSH11 = 0x1b,
    PUSH12 = 0x1c,
    PUSH13 = 0x1d,
    PUSH14 = 0x1e,
    PUSH15 = 0x1f,
    PUSH16 = 0x20,

    // Flow control
    NOP = 0x21,
    JMP = 0x22 => Fixed(1),
    JMP_L = 0x23 => Fixed(4),
    JMPIF = 0x24 => Fixed(1),
    JMPIF_L = 0x25 => Fixed(4),
    JMPIFNOT = 0x26 => Fixed(1),
    JMPIFNOT_L = 0x27 => Fixed(4),
    JMPEQ = 0x28 => Fixed(1),
    JMPEQ_L = 0x29 => Fixed(4),
    JMPNE = 0x2a => Fixed(1),
    JMPNE_L = 0x2b => Fixed(4),
    JMPGT = 0x2c => Fixed(1),
    JMPGT_L = 0x2d => Fixed(4),
    JMPGE = 0x2e => Fixed(1),
    JMPGE_L = 0x2f => Fixed(4),
    JMPLT = 0x30 => Fixed(1),
    JMPLT_L = 0x31 => Fixed(4),
    JMPLE = 0x32 => Fixed(1),
    JMPLE_L = 0x33 => Fixed(4),
    CALL = 0x34 => Fixed(1),
    CALL_L = 0x35 => Fixed(4),
    CALLA = 0x36,
    CALLT = 0x37 => Fixed(2),
    ABORT = 0x38,
    ASSERT = 0x39,
    THROW = 0x3a,
    TRY = 0x3b => Fixed(2),
    TRY_L = 0x3c => Fixed(8),
    ENDTRY = 0x3d => Fixed(1),
    ENDTRY_L = 0x3e => Fixed(4),
    ENDFINALLY = 0x3f,
    RET = 0x40,
    SYSCALL = 0x41 => Fixed(4),

    // Stack
    DEPTH = 0x43,
    DROP = 0x45,
    NIP = 0x46,
    XDROP = 0x48,
    CLEAR = 0x49,
    DUP = 0x4a,
    OVER = 0x4b,
    PICK = 0x4d,
    TUCK = 0x4e,
    SWAP = 0x50,
    ROT = 0x51,
    ROLL = 0x52,
    REVERSE3 = 0x53,
    REVERSE4 = 0x54,
    REVERSEN = 0x55,

    // Slots
    INITSSLOT = 0x56 => Fixed(1),
    INITSLOT = 0x57 => Fixed(2),
    LDSFLD0 = 0x58,
    LDSFLD1 = 0x59,
    LDSFLD2 = 0x5a,
    LDSFLD3 = 0x5b,
    LDSFLD4 = 0x5c,
    LDSFLD5 = 0x5d,
    LDSFLD6 = 0x5e,
    LDSFLD = 0x5f => Fixed(1),
    STSFLD0 = 0x60,
    STSFLD1 = 0x61,
    STSFLD2 = 0x62,
    STSFLD3 = 0x63,
    STSFLD4 = 0x64,
    STSFLD5 = 0x65,
    STSFLD6 = 0x66,
    STSFLD = 0x67 => Fixed(1),
    LDLOC0 = 0x68,
    LDLOC1 = 0x69,
    LDLOC2 = 0x6a,
    LDLOC3 = 0x6b,
    LDLOC4 = 0x6c,
    LDLOC5 = 0x6d,
    LDLOC6 = 0x6e,
    LDLOC = 0x6f => Fixed(1),
    STLOC0 = 0x70,
    STLOC1 = 0x71,
    STLOC2 = 0x72,
    STLOC3 = 0x73,
    STLOC4 = 0x74,
    STLOC5 = 0x75,
    STLOC6 = 0x76,
    STLOC = 0x77 => Fixed(1),
    LDARG0 = 0x78,
    LDARG1 = 0x79,
    LDARG2 = 0x7a,
    LDARG3 = 0x7b,
    LDARG4 = 0x7c,
    LDARG5 = 0x7d,
    LDARG6 = 0x7e,
    LDARG = 0x7f => Fixed(1),
    STARG0 = 0x80,
    STARG1 = 0x81,
    STARG2 = 0x82,
    STARG3 = 0x83,
    STARG4 = 0x84,
    STARG5 = 0x85,
    STARG6 = 0x86,
    STARG = 0x87 => Fixed(1),

    // Splice
    NEWBUFFER = 0x88,
    MEMCPY = 0x89,
    CAT = 0x8b,
    SUBSTR = 0x8c,
    LEFT = 0x8d,
    RIGHT = 0x8e,

    // Bitwise logic
    INVERT = 0x90,
    AND = 0x91,
    OR = 0x92,
    XOR = 0x93,
    EQUAL = 0x97,
    NOTEQUAL = 0x98,

    // Arithmetic
    SIGN = 0x99,
    ABS = 0x9a,
    NEGATE = 0x9b,
    INC = 0x9c,
    DEC = 0x9d,
    ADD = 0x9e,
    SUB = 0x9f,
    MUL = 0xa0,
    DIV = 0xa1,
    MOD = 0xa2,
    POW = 0xa3,
    SQRT = 0xa4,
    MODMUL = 0xa5,
    MODPOW = 0xa6,
    SHL = 0xa8,
    SHR = 0xa9,
    NOT = 0xaa,
    BOOLAND = 0xab,
    BOOLOR = 0xac,
    NZ = 0xb1,
    NUMEQUAL = 0xb3,
    NUMNOTEQUAL = 0xb4,
    LT = 0xb5,
    LE = 0xb6,
    GT = 0xb7,
    GE = 0xb8,
    MIN = 0xb9,
    MAX = 0xba,
    WITHIN = 0xbb,

    // Compound types
    PACKMAP = 0xbe,
    PACKSTRUCT = 0xbf,
    PACK = 0xc0,
    UNPACK = 0xc1,
    NEWARRAY0 = 0xc2,
    NEWARRAY = 0xc3,
    NEWARRAY_T = 0xc4 => Fixed(1),
    NEWSTRUCT0 = 0xc5,
    NEWSTRUCT = 0xc6,
    NEWMAP = 0xc8,
    SIZE = 0xca,
    HASKEY = 0xcb,
    KEYS = 0xcc,
    VALUES = 0xcd,
    PICKITEM = 0xce,
    APPEND = 0xcf,
    SETITEM = 0xd0,
    REVERSEITEMS = 0xd1,
    REMOVE = 0xd2,
    CLEARITEMS = 0xd3,
    POPITEM = 0xd4,

    // Types
    ISNULL = 0xd8,
    ISTYPE = 0xd9 => Fixed(1),
    CONVERT = 0xdb => Fixed(1),

    // Extensions
    ABORTMSG = 0xe0,
    ASSERTMSG = 0xe1,
}

impl OpCode {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Long-form counterpart of a short branch, call or try instruction.
    pub fn long_form(self) -> Option<OpCode> {
        match self {
            OpCode::JMP => Some(OpCode::JMP_L),
            OpCode::JMPIF => Some(OpCode::JMPIF_L),
            OpCode::JMPIFNOT => Some(OpCode::JMPIFNOT_L),
            OpCode::JMPEQ => Some(OpCode::JMPEQ_L),
            OpCode::JMPNE => Some(OpCode::JMPNE_L),
            OpCode::JMPGT => Some(OpCode::JMPGT_L),
            OpCode::JMPGE => Some(OpCode::JMPGE_L),
            OpCode::JMPLT => Some(OpCode::JMPLT_L),
            OpCode::JMPLE => Some(OpCode::JMPLE_L),
            OpCode::CALL => Some(OpCode::CALL_L),
            OpCode::TRY => Some(OpCode::TRY_L),
            OpCode::ENDTRY => Some(OpCode::ENDTRY_L),
            _ => None,
        }
    }

    pub fn is_long_form(self) -> bool {
        matches!(
            self,
            OpCode::JMP_L
                | OpCode::JMPIF_L
                | OpCode::JMPIFNOT_L
                | OpCode::JMPEQ_L
                | OpCode::JMPNE_L
                | OpCode::JMPGT_L
                | OpCode::JMPGE_L
                | OpCode::JMPLT_L
                | OpCode::JMPLE_L
                | OpCode::CALL_L
                | OpCode::TRY_L
                | OpCode::ENDTRY_L
                | OpCode::PUSHA
        )
    }

    /// Number of relative-offset slots carried by the operand, and the width of each.
    pub fn offset_slots(self) -> Option<(usize, usize)> {
        match self {
            OpCode::TRY => Some((2, 1)),
            OpCode::TRY_L => Some((2, 4)),
            OpCode::PUSHA => Some((1, 4)),
            op if op.long_form().is_some() => Some((1, 1)),
            op if op.is_long_form() => Some((1, 4)),
            _ => None,
        }
    }

    /// Instructions after which execution never falls through.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            OpCode::RET
                | OpCode::THROW
                | OpCode::ABORT
                | OpCode::ABORTMSG
                | OpCode::JMP
                | OpCode::JMP_L
                | OpCode::ENDTRY
                | OpCode::ENDTRY_L
                | OpCode::ENDFINALLY
        )
    }

    /// Encoded size of the whole instruction for a fixed-width operand.
    pub fn fixed_size(self) -> Option<usize> {
        match self.operand_size() {
            OperandSize::None => Some(1),
            OperandSize::Fixed(n) => Some(1 + n),
            OperandSize::Prefixed(_) => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisassemblyError {
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },
    #[error("operand of {opcode} at offset {offset} runs past the end of the script")]
    Truncated { offset: usize, opcode: OpCode },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub offset: usize,
    pub opcode: OpCode,
    /// Operand bytes, including the length prefix for `PUSHDATA*`.
    pub operand: Vec<u8>,
}

impl DecodedInstruction {
    pub fn size(&self) -> usize {
        1 + self.operand.len()
    }

    /// Signed relative offsets carried by this instruction, in operand order.
    pub fn relative_offsets(&self) -> Vec<i64> {
        let Some((slots, width)) = self.opcode.offset_slots() else {
            return Vec::new();
        };
        (0..slots)
            .map(|slot| {
                let bytes = &self.operand[slot * width..(slot + 1) * width];
                match width {
                    1 => bytes[0] as i8 as i64,
                    _ => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
                }
            })
            .collect()
    }

    /// Absolute targets of the relative offsets. A zero `TRY` slot means "no handler".
    pub fn jump_targets(&self) -> Vec<Option<usize>> {
        let is_try = matches!(self.opcode, OpCode::TRY | OpCode::TRY_L);
        self.relative_offsets()
            .into_iter()
            .map(|delta| {
                if is_try && delta == 0 {
                    None
                } else {
                    usize::try_from(self.offset as i64 + delta).ok()
                }
            })
            .collect()
    }

    /// Payload of a `PUSHDATA*` instruction without its length prefix.
    pub fn push_data(&self) -> Option<&[u8]> {
        match self.opcode.operand_size() {
            OperandSize::Prefixed(prefix) => Some(&self.operand[prefix..]),
            _ => None,
        }
    }
}

impl DecodedInstruction {
    /// Operand rendered for listings: pushed text or bytes, jump targets, or raw hex.
    pub fn operand_text(&self) -> String {
        if let Some(data) = self.push_data() {
            return match std::str::from_utf8(data) {
                Ok(text) if !text.is_empty() && text.chars().all(|c| !c.is_control()) => format!("{:?}", text),
                _ => format!("0x{}", hex::encode(data)),
            };
        }
        if self.opcode.offset_slots().is_some() {
            let targets = self
                .jump_targets()
                .into_iter()
                .map(|t| t.map(|t| format!("{:04x}", t)).unwrap_or_else(|| "----".to_string()))
                .collect::<Vec<_>>();
            return format!("-> {}", targets.join(", "));
        }
        if self.operand.is_empty() {
            String::new()
        } else {
            format!("0x{}", hex::encode(&self.operand))
        }
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}: {}", self.offset, self.opcode)?;
        let operand = self.operand_text();
        if !operand.is_empty() {
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

/// Decodes a flat script into its instruction sequence.
pub fn disassemble(script: &[u8]) -> Result<Vec<DecodedInstruction>, DisassemblyError> {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < script.len() {
        let opcode = OpCode::from_byte(script[pc])
            .ok_or(DisassemblyError::UnknownOpcode { offset: pc, byte: script[pc] })?;
        let operand_len = match opcode.operand_size() {
            OperandSize::None => 0,
            OperandSize::Fixed(n) => n,
            OperandSize::Prefixed(prefix) => {
                let start = pc + 1;
                let header = script
                    .get(start..start + prefix)
                    .ok_or(DisassemblyError::Truncated { offset: pc, opcode })?;
                let mut len = [0u8; 8];
                len[..prefix].copy_from_slice(header);
                prefix + u64::from_le_bytes(len) as usize
            }
        };
        let operand = script
            .get(pc + 1..pc + 1 + operand_len)
            .ok_or(DisassemblyError::Truncated { offset: pc, opcode })?
            .to_vec();
        out.push(DecodedInstruction { offset: pc, opcode, operand });
        pc += 1 + operand_len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op.to_byte(), byte);
            }
        }
        assert_eq!(OpCode::from_byte(0x06), None);
        assert_eq!(OpCode::RET.to_byte(), 0x40);
        assert_eq!(OpCode::SYSCALL.to_byte(), 0x41);
    }

    #[test]
    fn test_long_forms_are_one_byte_apart() {
        for op in [OpCode::JMP, OpCode::JMPIFNOT, OpCode::JMPLE, OpCode::CALL, OpCode::TRY, OpCode::ENDTRY] {
            let long = op.long_form().unwrap();
            assert_eq!(long.to_byte(), op.to_byte() + 1);
            assert!(long.is_long_form());
        }
    }

    #[test]
    fn test_offset_slots() {
        assert_eq!(OpCode::JMP.offset_slots(), Some((1, 1)));
        assert_eq!(OpCode::JMPIF_L.offset_slots(), Some((1, 4)));
        assert_eq!(OpCode::TRY.offset_slots(), Some((2, 1)));
        assert_eq!(OpCode::TRY_L.offset_slots(), Some((2, 4)));
        assert_eq!(OpCode::ADD.offset_slots(), None);
    }

    #[test]
    fn test_disassemble_push_and_jump() {
        // PUSHDATA1 "hi", JMP +2, RET
        let script = hex::decode("0c026869220240").unwrap();
        let decoded = disassemble(&script).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].opcode, OpCode::PUSHDATA1);
        assert_eq!(decoded[0].push_data(), Some(&b"hi"[..]));
        assert_eq!(decoded[1].offset, 4);
        assert_eq!(decoded[1].jump_targets(), vec![Some(6)]);
        assert_eq!(decoded[2].opcode, OpCode::RET);
    }

    #[test]
    fn test_disassemble_rejects_truncated_operand() {
        let script = hex::decode("0240").unwrap();
        assert_eq!(
            disassemble(&script),
            Err(DisassemblyError::Truncated { offset: 0, opcode: OpCode::PUSHINT32 })
        );
    }

    #[test]
    fn test_display_listing() {
        let script = hex::decode("2606").unwrap();
        let decoded = disassemble(&script).unwrap();
        assert_eq!(decoded[0].to_string(), "0000: JMPIFNOT -> 0006");
    }
}
