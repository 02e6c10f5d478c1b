//! Lowering of method bodies into instruction sequences.
//!
//! One [`MethodConverter`] per method. It borrows the immutable
//! [`ContractContext`] and owns its emitter and jump resolver, so methods can
//! be converted independently of each other.

mod expr;
mod stmt;

use crate::compiler::ast::{
    CatchClause, ContractDecl, EventDecl, MethodDecl, ParamDecl, SourceLocation, Statement, StatementKind,
};
use crate::compiler::catalog::Catalog;
use crate::compiler::emitter::{Emitter, Instruction, SlotKind};
use crate::compiler::error::{CompileError, CompileResult};
use crate::compiler::jumps::{JumpResolver, Label, ResolveStats};
use crate::compiler::typeref::TypeRef;
use crate::opcodes::OpCode;
use std::collections::{BTreeSet, HashMap};

/// Read-only view of the contract shared by every method conversion.
pub struct ContractContext<'a> {
    pub methods: HashMap<&'a str, &'a MethodDecl>,
    pub events: HashMap<&'a str, &'a EventDecl>,
    pub statics: HashMap<&'a str, usize>,
    pub catalog: &'a Catalog,
}

impl<'a> ContractContext<'a> {
    pub fn new(contract: &'a ContractDecl, catalog: &'a Catalog) -> Self {
        Self {
            methods: contract.methods.iter().map(|m| (m.name.as_str(), m)).collect(),
            events: contract.events.iter().map(|e| (e.name.as_str(), e)).collect(),
            statics: contract
                .static_fields
                .iter()
                .enumerate()
                .map(|(index, field)| (field.name.as_str(), index))
                .collect(),
            catalog,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInfo {
    pub name: String,
    pub ty: TypeRef,
    pub index: usize,
}

/// Converted and branch-resolved body of one method.
#[derive(Debug, Clone)]
pub struct MethodBlock {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub return_type: TypeRef,
    pub instructions: Vec<Instruction>,
    /// Named locals; compiler temporaries are left out.
    pub locals: Vec<LocalInfo>,
    pub location: Option<SourceLocation>,
    pub stats: ResolveStats,
    pub raised_events: BTreeSet<String>,
}

/// Which part of a `try` statement code is currently emitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TryRegion {
    Body,
    Catch,
    Finally,
}

/// Exit stub placed after a try statement: `ENDTRY` one level further out.
struct Trampoline {
    label: Label,
    target: Label,
    target_depth: usize,
}

struct TryContext {
    id: usize,
    region: TryRegion,
    trampolines: Vec<Trampoline>,
}

struct Breakable {
    break_label: Label,
    /// `None` for `switch`, which `continue` passes through.
    continue_label: Option<Label>,
    try_depth: usize,
}

struct GotoTarget {
    label: Label,
    path: Vec<(usize, TryRegion)>,
}

pub struct MethodConverter<'a> {
    context: &'a ContractContext<'a>,
    method: &'a MethodDecl,
    emitter: Emitter,
    jumps: JumpResolver,
    params: HashMap<&'a str, usize>,
    scopes: Vec<HashMap<String, usize>>,
    locals: Vec<LocalInfo>,
    breakables: Vec<Breakable>,
    try_stack: Vec<TryContext>,
    next_try_id: usize,
    goto_targets: HashMap<String, GotoTarget>,
    return_slot: Option<usize>,
    epilogue: Option<Label>,
    static_slots: Option<usize>,
    raised_events: BTreeSet<String>,
}

/// Converts one method of the contract described by `context`.
#[cfg(test)]
pub fn convert(method: &MethodDecl, context: &ContractContext) -> CompileResult<MethodBlock> {
    MethodConverter::new(method, context).run()
}

impl<'a> MethodConverter<'a> {
    pub fn new(method: &'a MethodDecl, context: &'a ContractContext<'a>) -> Self {
        Self {
            context,
            method,
            emitter: Emitter::new(),
            jumps: JumpResolver::new(),
            params: method.params.iter().enumerate().map(|(i, p)| (p.name.as_str(), i)).collect(),
            scopes: vec![HashMap::new()],
            locals: Vec::new(),
            breakables: Vec::new(),
            try_stack: Vec::new(),
            next_try_id: 0,
            goto_targets: HashMap::new(),
            return_slot: None,
            epilogue: None,
            static_slots: None,
            raised_events: BTreeSet::new(),
        }
    }

    /// Makes the method open with `INITSSLOT count`, as `_initialize` does.
    pub fn with_static_slots(mut self, count: usize) -> Self {
        self.static_slots = Some(count);
        self
    }

    pub fn run(mut self) -> CompileResult<MethodBlock> {
        let method = self.method;
        if method.params.len() > u8::MAX as usize {
            return Err(CompileError::overflow(format!(
                "method {} declares {} parameters, at most 255 fit a slot frame",
                method.name,
                method.params.len()
            ))
            .at(method.location.as_ref()));
        }

        self.collect_goto_targets(&method.body, &mut Vec::new(), &mut 0)?;
        for stmt in &method.body {
            self.visit_statement(stmt)?;
        }
        if self.falls_through() {
            self.emitter.emit_op(OpCode::RET)?;
        }
        if let Some(epilogue) = self.epilogue {
            self.place_label(epilogue)?;
            if let Some(slot) = self.return_slot {
                self.emitter.load(SlotKind::Local, slot)?;
            }
            self.emitter.emit_op(OpCode::RET)?;
        }

        self.emit_prologue()?;
        let mut instructions = self.emitter.into_instructions();
        let stats = self.jumps.resolve_all(&mut instructions)?;
        log::debug!(
            "converted {}: {} instructions, {} locals, {} relaxation pass(es)",
            method.name,
            instructions.len(),
            self.locals.len(),
            stats.passes
        );

        Ok(MethodBlock {
            name: method.name.clone(),
            params: method.params.clone(),
            return_type: method.return_type.clone(),
            instructions,
            locals: self.locals.into_iter().filter(|l| !l.name.starts_with('$')).collect(),
            location: method.location.clone(),
            stats,
            raised_events: self.raised_events,
        })
    }

    /// `INITSSLOT` / `INITSLOT` are only known once the body is converted.
    fn emit_prologue(&mut self) -> CompileResult<()> {
        let locals = self.locals.len();
        let params = self.method.params.len();
        if locals > u8::MAX as usize {
            return Err(CompileError::overflow(format!(
                "method {} needs {} local slots, at most 255 fit a slot frame",
                self.method.name, locals
            ))
            .at(self.method.location.as_ref()));
        }
        let mut prepended = 0;
        if locals + params > 0 {
            self.emitter.prepend(OpCode::INITSLOT, vec![locals as u8, params as u8])?;
            prepended += 1;
        }
        if let Some(count) = self.static_slots.filter(|count| *count > 0) {
            let count = u8::try_from(count)
                .map_err(|_| CompileError::overflow(format!("{} static fields, at most 255 fit a slot frame", count)))?;
            self.emitter.prepend(OpCode::INITSSLOT, vec![count])?;
            prepended += 1;
        }
        self.jumps.shift_positions(prepended);
        Ok(())
    }

    // Labels and jumps

    fn new_label(&mut self) -> Label {
        self.jumps.new_label()
    }

    fn place_label(&mut self, label: Label) -> CompileResult<()> {
        self.jumps.define_label(label, self.emitter.len())
    }

    fn emit_jump(&mut self, opcode: OpCode, label: Label) -> CompileResult<()> {
        let index = self.emitter.len();
        self.emitter.emit(opcode, vec![0])?;
        self.jumps.record_fixup(index, 0, label);
        Ok(())
    }

    /// Whether control can reach the current end of the instruction stream.
    fn falls_through(&self) -> bool {
        match self.emitter.last_opcode() {
            Some(op) if op.is_terminator() => self.jumps.has_label_at(self.emitter.len()),
            _ => true,
        }
    }

    // Slots

    fn declare_local(&mut self, name: &str, ty: TypeRef) -> CompileResult<usize> {
        let index = self.locals.len();
        self.locals.push(LocalInfo { name: name.to_string(), ty, index });
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), index);
        }
        Ok(index)
    }

    /// Hidden local used for lowering; never visible to user code.
    fn alloc_temp(&mut self, purpose: &str) -> usize {
        let index = self.locals.len();
        self.locals.push(LocalInfo { name: format!("${}{}", purpose, index), ty: TypeRef::Object, index });
        index
    }

    fn resolve_variable(&self, name: &str) -> Option<(SlotKind, usize)> {
        if let Some(index) = self.scopes.iter().rev().find_map(|scope| scope.get(name)) {
            return Some((SlotKind::Local, *index));
        }
        if let Some(index) = self.params.get(name) {
            return Some((SlotKind::Argument, *index));
        }
        self.context.statics.get(name).map(|index| (SlotKind::Static, *index))
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // Try regions and structured exits

    fn try_path(&self) -> Vec<(usize, TryRegion)> {
        self.try_stack.iter().map(|t| (t.id, t.region)).collect()
    }

    /// Label to hand to the `ENDTRY` that leaves the context at `depth`,
    /// allocating trampolines for every further level still to leave.
    fn exit_label(&mut self, depth: usize, target_depth: usize, target: Label) -> Label {
        if depth == target_depth {
            return target;
        }
        let existing = self.try_stack[depth]
            .trampolines
            .iter()
            .find(|t| t.target == target)
            .map(|t| t.label);
        if let Some(label) = existing {
            return label;
        }
        let label = self.jumps.new_label();
        self.try_stack[depth].trampolines.push(Trampoline { label, target, target_depth });
        label
    }

    /// Transfers control to `target`, which sits `target_depth` try levels deep.
    /// Leaving try levels goes through `ENDTRY` so each finally block runs once.
    fn emit_exit(&mut self, target: Label, target_depth: usize, what: &str) -> CompileResult<()> {
        let depth = self.try_stack.len();
        if target_depth > depth {
            return Err(CompileError::internal(format!("{} targets a deeper try level", what)));
        }
        if target_depth == depth {
            return self.emit_jump(OpCode::JMP, target);
        }
        if self.try_stack[target_depth..].iter().any(|t| t.region == TryRegion::Finally) {
            return Err(CompileError::unsupported(format!("{} out of a finally block", what)));
        }
        let label = self.exit_label(depth - 1, target_depth, target);
        self.emit_jump(OpCode::ENDTRY, label)
    }

    /// Emits `TRY`, the protected body, catch and finally blocks, then the
    /// trampolines requested by exits from inside.
    fn visit_try(
        &mut self,
        body: &Statement,
        catch: Option<&CatchClause>,
        finally: Option<&Statement>,
    ) -> CompileResult<()> {
        if catch.is_none() && finally.is_none() {
            return Err(CompileError::unsupported("try without catch or finally"));
        }
        let catch_label = catch.map(|_| self.new_label());
        let finally_label = finally.map(|_| self.new_label());
        let end_label = self.new_label();

        let try_index = self.emitter.len();
        self.emitter.emit(OpCode::TRY, vec![0, 0])?;
        if let Some(label) = catch_label {
            self.jumps.record_fixup(try_index, 0, label);
        }
        if let Some(label) = finally_label {
            self.jumps.record_fixup(try_index, 1, label);
        }

        let id = self.next_try_id;
        self.next_try_id += 1;
        self.try_stack.push(TryContext { id, region: TryRegion::Body, trampolines: Vec::new() });

        self.visit_statement(body)?;
        if self.falls_through() {
            self.emit_jump(OpCode::ENDTRY, end_label)?;
        }

        if let (Some(clause), Some(label)) = (catch, catch_label) {
            self.set_region(TryRegion::Catch);
            self.place_label(label)?;
            self.push_scope();
            match &clause.variable {
                Some(name) => {
                    let slot = self.declare_local(name, TypeRef::Object)?;
                    self.emitter.store(SlotKind::Local, slot)?;
                }
                None => {
                    self.emitter.emit_op(OpCode::DROP)?;
                }
            }
            self.visit_statement(&clause.body)?;
            self.pop_scope();
            if self.falls_through() {
                self.emit_jump(OpCode::ENDTRY, end_label)?;
            }
        }

        if let (Some(block), Some(label)) = (finally, finally_label) {
            self.set_region(TryRegion::Finally);
            self.place_label(label)?;
            self.visit_statement(block)?;
            self.emitter.emit_op(OpCode::ENDFINALLY)?;
        }

        let context = self
            .try_stack
            .pop()
            .ok_or_else(|| CompileError::internal("try stack underflow"))?;
        for trampoline in context.trampolines {
            self.place_label(trampoline.label)?;
            self.emit_exit(trampoline.target, trampoline.target_depth, "exit")?;
        }
        self.place_label(end_label)
    }

    fn set_region(&mut self, region: TryRegion) {
        if let Some(context) = self.try_stack.last_mut() {
            context.region = region;
        }
    }

    /// Binds every `goto` label up front with the try regions enclosing it.
    fn collect_goto_targets(
        &mut self,
        statements: &[Statement],
        path: &mut Vec<(usize, TryRegion)>,
        next_id: &mut usize,
    ) -> CompileResult<()> {
        for stmt in statements {
            self.collect_in_statement(stmt, path, next_id)?;
        }
        Ok(())
    }

    fn collect_in_statement(
        &mut self,
        stmt: &Statement,
        path: &mut Vec<(usize, TryRegion)>,
        next_id: &mut usize,
    ) -> CompileResult<()> {
        match &stmt.kind {
            StatementKind::Block { statements } => self.collect_goto_targets(statements, path, next_id),
            StatementKind::If { then_branch, else_branch, .. } => {
                self.collect_in_statement(then_branch, path, next_id)?;
                match else_branch {
                    Some(branch) => self.collect_in_statement(branch, path, next_id),
                    None => Ok(()),
                }
            }
            StatementKind::While { body, .. }
            | StatementKind::DoWhile { body, .. }
            | StatementKind::ForEach { body, .. } => self.collect_in_statement(body, path, next_id),
            StatementKind::For { init, body, .. } => {
                self.collect_goto_targets(init, path, next_id)?;
                self.collect_in_statement(body, path, next_id)
            }
            StatementKind::Switch { sections, .. } => {
                for section in sections {
                    self.collect_goto_targets(&section.body, path, next_id)?;
                }
                Ok(())
            }
            StatementKind::Try { body, catch, finally } => {
                let id = *next_id;
                *next_id += 1;
                let regions = [
                    (TryRegion::Body, Some(body.as_ref())),
                    (TryRegion::Catch, catch.as_ref().map(|c| c.body.as_ref())),
                    (TryRegion::Finally, finally.as_deref()),
                ];
                for (region, block) in regions {
                    if let Some(block) = block {
                        path.push((id, region));
                        let result = self.collect_in_statement(block, path, next_id);
                        path.pop();
                        result?;
                    }
                }
                Ok(())
            }
            StatementKind::Labeled { label, body } => {
                if self.goto_targets.contains_key(label) {
                    return Err(CompileError::unsupported(format!("duplicate label '{}'", label))
                        .at(stmt.location.as_ref()));
                }
                let target = GotoTarget { label: self.jumps.new_label(), path: path.clone() };
                self.goto_targets.insert(label.clone(), target);
                self.collect_in_statement(body, path, next_id)
            }
            StatementKind::LocalDecl { .. }
            | StatementKind::Expression { .. }
            | StatementKind::Break
            | StatementKind::Continue
            | StatementKind::Return { .. }
            | StatementKind::Throw { .. }
            | StatementKind::Goto { .. }
            | StatementKind::Unsupported { .. } => Ok(()),
        }
    }
}
