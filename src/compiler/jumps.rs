use crate::compiler::emitter::Instruction;
use crate::compiler::error::{CompileError, CompileResult};
use std::fmt;

/// A branch destination inside one method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Relative-offset slot of `instruction` that must point at `label`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpFixup {
    pub instruction: usize,
    pub slot: usize,
    pub label: Label,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub passes: usize,
    pub widened: usize,
}

/// Labels and fixups of one method, resolved by bounded branch relaxation.
#[derive(Debug, Default)]
pub struct JumpResolver {
    /// Instruction index each label is bound to; `len` means "end of method".
    labels: Vec<Option<usize>>,
    fixups: Vec<JumpFixup>,
}

impl JumpResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    pub fn define_label(&mut self, label: Label, position: usize) -> CompileResult<()> {
        match self.labels.get_mut(label.0 as usize) {
            Some(slot @ None) => {
                *slot = Some(position);
                Ok(())
            }
            Some(Some(existing)) => Err(CompileError::internal(format!(
                "label {} defined twice (instructions {} and {})",
                label, existing, position
            ))),
            None => Err(CompileError::internal(format!("label {} was never allocated", label))),
        }
    }

    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Whether some label is bound to instruction index `position`.
    pub fn has_label_at(&self, position: usize) -> bool {
        self.labels.iter().any(|label| *label == Some(position))
    }

    pub fn record_fixup(&mut self, instruction: usize, slot: usize, label: Label) {
        self.fixups.push(JumpFixup { instruction, slot, label });
    }

    #[cfg(test)]
    pub fn fixups(&self) -> &[JumpFixup] {
        &self.fixups
    }

    /// Moves every label and fixup down by `by` instructions after a prepend.
    pub fn shift_positions(&mut self, by: usize) {
        for position in self.labels.iter_mut().flatten() {
            *position += by;
        }
        for fixup in &mut self.fixups {
            fixup.instruction += by;
        }
    }

    /// Chooses short or long form for every branch and writes the final deltas.
    ///
    /// Branches start short. Each pass recomputes offsets and widens any
    /// branch whose delta leaves `[-128, 127]`. Widening only grows code, so
    /// every pass but the last widens at least one instruction and the loop
    /// ends within `fixups + 1` passes.
    pub fn resolve_all(&self, instructions: &mut [Instruction]) -> CompileResult<ResolveStats> {
        let targets = self.checked_targets(instructions)?;

        for fixup in &self.fixups {
            let instruction = &mut instructions[fixup.instruction];
            if let Some((slots, width)) = instruction.opcode.offset_slots() {
                instruction.operand = vec![0; slots * width];
            }
        }

        let bound = self.fixups.len() + 1;
        let mut stats = ResolveStats::default();
        let offsets = loop {
            stats.passes += 1;
            if stats.passes > bound {
                return Err(CompileError::internal(format!(
                    "branch relaxation did not settle within {} passes",
                    bound
                )));
            }
            let offsets = instruction_offsets(instructions);
            let mut widened = 0;
            for (fixup, &target) in self.fixups.iter().zip(&targets) {
                let instruction = &mut instructions[fixup.instruction];
                let delta = offsets[target] as i64 - offsets[fixup.instruction] as i64;
                if instruction.opcode.is_long_form() || (-128..=127).contains(&delta) {
                    continue;
                }
                let long = instruction.opcode.long_form().ok_or_else(|| {
                    CompileError::internal(format!("{} has no long form", instruction.opcode))
                })?;
                let (slots, width) = long
                    .offset_slots()
                    .ok_or_else(|| CompileError::internal(format!("{} has no offset slots", long)))?;
                instruction.opcode = long;
                instruction.operand = vec![0; slots * width];
                widened += 1;
            }
            log::debug!("relaxation pass {}: {} branch(es) widened", stats.passes, widened);
            stats.widened += widened;
            if widened == 0 {
                break offsets;
            }
        };

        for (fixup, &target) in self.fixups.iter().zip(&targets) {
            let instruction = &mut instructions[fixup.instruction];
            let delta = offsets[target] as i64 - offsets[fixup.instruction] as i64;
            let (_, width) = instruction
                .opcode
                .offset_slots()
                .ok_or_else(|| CompileError::internal(format!("{} lost its offset slots", instruction.opcode)))?;
            let start = fixup.slot * width;
            if width == 1 {
                let short = i8::try_from(delta)
                    .map_err(|_| CompileError::internal(format!("short {} delta {}", instruction.opcode, delta)))?;
                instruction.operand[start] = short as u8;
            } else {
                let long = i32::try_from(delta).map_err(|_| {
                    CompileError::overflow(format!("branch delta {} does not fit a 32-bit offset", delta))
                })?;
                instruction.operand[start..start + 4].copy_from_slice(&long.to_le_bytes());
            }
        }
        Ok(stats)
    }

    /// Target instruction index per fixup, after checking every reference.
    fn checked_targets(&self, instructions: &[Instruction]) -> CompileResult<Vec<usize>> {
        self.fixups
            .iter()
            .map(|fixup| {
                let instruction = instructions.get(fixup.instruction).ok_or_else(|| {
                    CompileError::internal(format!("fixup for {} points past instruction {}", fixup.label, fixup.instruction))
                })?;
                match instruction.opcode.offset_slots() {
                    Some((slots, _)) if fixup.slot < slots => {}
                    _ => {
                        return Err(CompileError::internal(format!(
                            "{} at instruction {} has no offset slot {}",
                            instruction.opcode, fixup.instruction, fixup.slot
                        )))
                    }
                }
                let target = self.label_position(fixup.label).ok_or_else(|| {
                    CompileError::internal(format!(
                        "label {} used by {} at instruction {} (slot {}) is never defined",
                        fixup.label, instruction.opcode, fixup.instruction, fixup.slot
                    ))
                })?;
                if target > instructions.len() {
                    return Err(CompileError::internal(format!(
                        "label {} bound past the end of the method",
                        fixup.label
                    )));
                }
                Ok(target)
            })
            .collect()
    }
}

/// Byte offset of every instruction, plus the total size as the final entry.
pub fn instruction_offsets(instructions: &[Instruction]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut offset = 0;
    for instruction in instructions {
        offsets.push(offset);
        offset += instruction.size();
    }
    offsets.push(offset);
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::emitter::Emitter;
    use crate::opcodes::{disassemble, OpCode};

    fn encode(instructions: &[Instruction]) -> Vec<u8> {
        let mut out = Vec::new();
        for instruction in instructions {
            instruction.encode_into(&mut out);
        }
        out
    }

    fn jump(emitter: &mut Emitter, jumps: &mut JumpResolver, opcode: OpCode, label: Label) {
        let index = emitter.len();
        emitter.emit(opcode, vec![0]).unwrap();
        jumps.record_fixup(index, 0, label);
    }

    fn nops(emitter: &mut Emitter, count: usize) {
        for _ in 0..count {
            emitter.emit_op(OpCode::NOP).unwrap();
        }
    }

    /// Every decoded branch must land on the offset its label was bound to.
    fn assert_targets(instructions: &[Instruction], jumps: &JumpResolver) {
        let offsets = instruction_offsets(instructions);
        let decoded = disassemble(&encode(instructions)).unwrap();
        for fixup in jumps.fixups() {
            let target = jumps.label_position(fixup.label).unwrap();
            let branch = &decoded[fixup.instruction];
            assert_eq!(branch.jump_targets()[fixup.slot], Some(offsets[target]));
            let delta = branch.relative_offsets()[fixup.slot];
            assert_eq!(branch.opcode.is_long_form(), !(-128..=127).contains(&delta));
        }
    }

    #[test]
    fn test_short_forward_and_backward() {
        let mut emitter = Emitter::new();
        let mut jumps = JumpResolver::new();
        let top = jumps.new_label();
        let end = jumps.new_label();
        jumps.define_label(top, emitter.len()).unwrap();
        emitter.emit_op(OpCode::PUSHT).unwrap();
        jump(&mut emitter, &mut jumps, OpCode::JMPIFNOT, end);
        nops(&mut emitter, 3);
        jump(&mut emitter, &mut jumps, OpCode::JMP, top);
        jumps.define_label(end, emitter.len()).unwrap();
        emitter.emit_op(OpCode::RET).unwrap();

        let mut instructions = emitter.into_instructions();
        let stats = jumps.resolve_all(&mut instructions).unwrap();
        assert_eq!(stats, ResolveStats { passes: 1, widened: 0 });
        // PUSHT; JMPIFNOT +7; NOP x3; JMP -6; RET
        assert_eq!(hex::encode(encode(&instructions)), "08260721212122fa40");
        assert_targets(&instructions, &jumps);
    }

    #[test]
    fn test_range_boundaries() {
        for (body, long) in [(125, false), (126, true)] {
            let mut emitter = Emitter::new();
            let mut jumps = JumpResolver::new();
            let end = jumps.new_label();
            jump(&mut emitter, &mut jumps, OpCode::JMP, end);
            nops(&mut emitter, body);
            jumps.define_label(end, emitter.len()).unwrap();
            let mut instructions = emitter.into_instructions();
            jumps.resolve_all(&mut instructions).unwrap();
            assert_eq!(instructions[0].opcode.is_long_form(), long, "body {}", body);
            assert_targets(&instructions, &jumps);
        }

        let mut emitter = Emitter::new();
        let mut jumps = JumpResolver::new();
        let top = jumps.new_label();
        jumps.define_label(top, 0).unwrap();
        nops(&mut emitter, 128);
        jump(&mut emitter, &mut jumps, OpCode::JMP, top);
        let mut instructions = emitter.into_instructions();
        jumps.resolve_all(&mut instructions).unwrap();
        assert_eq!(instructions[128].opcode, OpCode::JMP);
        assert_eq!(instructions[128].operand, vec![0x80]);
    }

    #[test]
    fn test_cascading_relaxation_is_bounded() {
        let mut emitter = Emitter::new();
        let mut jumps = JumpResolver::new();
        let top = jumps.new_label();
        let end = jumps.new_label();
        jumps.define_label(top, 0).unwrap();
        nops(&mut emitter, 30);
        jump(&mut emitter, &mut jumps, OpCode::JMP, end);
        nops(&mut emitter, 90);
        for _ in 0..12 {
            jump(&mut emitter, &mut jumps, OpCode::JMPIF, top);
        }
        jumps.define_label(end, emitter.len()).unwrap();

        let mut instructions = emitter.into_instructions();
        let stats = jumps.resolve_all(&mut instructions).unwrap();
        // Backward branches widen, which widens the forward jump, which widens more backward branches.
        assert_eq!(stats.passes, 4);
        assert!(stats.passes <= jumps.fixups().len() + 1);
        assert_eq!(stats.widened, 11);
        assert_eq!(instructions[30].opcode, OpCode::JMP_L);
        let backward: Vec<_> = instructions[121..].iter().map(|i| i.opcode).collect();
        assert_eq!(&backward[..2], &[OpCode::JMPIF, OpCode::JMPIF]);
        assert!(backward[2..].iter().all(|op| *op == OpCode::JMPIF_L));
        assert_targets(&instructions, &jumps);
    }

    #[test]
    fn test_try_slots_widen_together() {
        let mut emitter = Emitter::new();
        let mut jumps = JumpResolver::new();
        let catch = jumps.new_label();
        emitter.emit(OpCode::TRY, vec![0, 0]).unwrap();
        jumps.record_fixup(0, 0, catch);
        nops(&mut emitter, 200);
        jumps.define_label(catch, emitter.len()).unwrap();
        emitter.emit_op(OpCode::RET).unwrap();

        let mut instructions = emitter.into_instructions();
        jumps.resolve_all(&mut instructions).unwrap();
        assert_eq!(instructions[0].opcode, OpCode::TRY_L);
        assert_eq!(instructions[0].operand, [209u32.to_le_bytes(), [0; 4]].concat());
        let decoded = disassemble(&encode(&instructions)).unwrap();
        assert_eq!(decoded[0].jump_targets(), vec![Some(209), None]);
    }

    #[test]
    fn test_undefined_label_is_internal() {
        let mut emitter = Emitter::new();
        let mut jumps = JumpResolver::new();
        let nowhere = jumps.new_label();
        jump(&mut emitter, &mut jumps, OpCode::JMP, nowhere);
        let mut instructions = emitter.into_instructions();
        let err = jumps.resolve_all(&mut instructions).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("never defined"));
    }

    #[test]
    fn test_double_definition_is_internal() {
        let mut jumps = JumpResolver::new();
        let label = jumps.new_label();
        jumps.define_label(label, 0).unwrap();
        assert!(jumps.define_label(label, 3).unwrap_err().is_internal());
    }

    #[test]
    fn test_shift_after_prepend() {
        let mut emitter = Emitter::new();
        let mut jumps = JumpResolver::new();
        let end = jumps.new_label();
        jump(&mut emitter, &mut jumps, OpCode::JMP, end);
        emitter.emit_op(OpCode::NOP).unwrap();
        jumps.define_label(end, emitter.len()).unwrap();
        emitter.prepend(OpCode::INITSLOT, vec![1, 0]).unwrap();
        jumps.shift_positions(1);

        let mut instructions = emitter.into_instructions();
        jumps.resolve_all(&mut instructions).unwrap();
        assert_eq!(hex::encode(encode(&instructions)), "570100220321");
    }
}
