use super::{Breakable, MethodConverter};
use crate::compiler::ast::{CaseLabel, Expression, Statement, StatementKind, SwitchSection};
use crate::compiler::emitter::SlotKind;
use crate::compiler::error::{CompileError, CompileResult};
use crate::compiler::jumps::Label;
use crate::compiler::typeref::TypeRef;
use crate::opcodes::OpCode;

impl<'a> MethodConverter<'a> {
    pub(super) fn visit_statement(&mut self, stmt: &Statement) -> CompileResult<()> {
        let location = stmt.location.as_ref();
        // Blocks and unlocated statements keep the enclosing statement's location.
        let scoped = location.is_some() && !matches!(stmt.kind, StatementKind::Block { .. });
        let outer = if scoped { Some(self.emitter.set_location(location.cloned())) } else { None };
        let result = self.visit_statement_kind(&stmt.kind).map_err(|e| e.at(location));
        if let Some(outer) = outer {
            self.emitter.set_location(outer);
        }
        result
    }

    fn visit_statement_kind(&mut self, kind: &StatementKind) -> CompileResult<()> {
        match kind {
            StatementKind::Block { statements } => {
                self.push_scope();
                let result = statements.iter().try_for_each(|s| self.visit_statement(s));
                self.pop_scope();
                result
            }
            StatementKind::LocalDecl { name, ty, init } => {
                // The initialiser cannot see the variable it declares.
                if let Some(init) = init {
                    self.visit_expression(init)?;
                }
                let slot = self.declare_local(name, ty.clone())?;
                if init.is_some() {
                    self.emitter.store(SlotKind::Local, slot)?;
                }
                Ok(())
            }
            StatementKind::Expression { expr } => self.visit_expression_discarded(expr),
            StatementKind::If { condition, then_branch, else_branch } => {
                self.visit_if(condition, then_branch, else_branch.as_deref())
            }
            StatementKind::While { condition, body } => self.visit_while(condition, body),
            StatementKind::DoWhile { body, condition } => self.visit_do_while(body, condition),
            StatementKind::For { init, condition, step, body } => self.visit_for(init, condition.as_ref(), step, body),
            StatementKind::ForEach { variable, ty, collection, body } => {
                self.visit_for_each(variable, ty, collection, body)
            }
            StatementKind::Switch { subject, sections } => self.visit_switch(subject, sections),
            StatementKind::Break => {
                let (label, depth) = self
                    .breakables
                    .last()
                    .map(|b| (b.break_label, b.try_depth))
                    .ok_or_else(|| CompileError::unsupported("break outside of a loop or switch"))?;
                self.emit_exit(label, depth, "break")
            }
            StatementKind::Continue => {
                let (label, depth) = self
                    .breakables
                    .iter()
                    .rev()
                    .find_map(|b| b.continue_label.map(|label| (label, b.try_depth)))
                    .ok_or_else(|| CompileError::unsupported("continue outside of a loop"))?;
                self.emit_exit(label, depth, "continue")
            }
            StatementKind::Return { value } => self.visit_return(value.as_ref()),
            StatementKind::Throw { value } => {
                self.visit_expression(value)?;
                self.emitter.emit_op(OpCode::THROW)?;
                Ok(())
            }
            StatementKind::Try { body, catch, finally } => self.visit_try(body, catch.as_ref(), finally.as_deref()),
            StatementKind::Goto { label } => self.visit_goto(label),
            StatementKind::Labeled { label, body } => {
                let target = self
                    .goto_targets
                    .get(label)
                    .map(|t| t.label)
                    .ok_or_else(|| CompileError::internal(format!("label '{}' missed by the label pre-pass", label)))?;
                self.place_label(target)?;
                self.visit_statement(body)
            }
            StatementKind::Unsupported { construct } => Err(CompileError::unsupported(construct.clone())),
        }
    }

    fn visit_if(&mut self, condition: &Expression, then_branch: &Statement, else_branch: Option<&Statement>) -> CompileResult<()> {
        let else_label = self.new_label();
        self.visit_expression(condition)?;
        self.emit_jump(OpCode::JMPIFNOT, else_label)?;
        self.visit_statement(then_branch)?;

        match else_branch {
            Some(else_branch) => {
                let end_label = self.new_label();
                if self.falls_through() {
                    self.emit_jump(OpCode::JMP, end_label)?;
                }
                self.place_label(else_label)?;
                self.visit_statement(else_branch)?;
                self.place_label(end_label)
            }
            None => self.place_label(else_label),
        }
    }

    fn visit_while(&mut self, condition: &Expression, body: &Statement) -> CompileResult<()> {
        let start = self.new_label();
        let end = self.new_label();
        self.place_label(start)?;
        self.visit_expression(condition)?;
        self.emit_jump(OpCode::JMPIFNOT, end)?;
        self.visit_loop_body(body, end, start)?;
        self.emit_jump(OpCode::JMP, start)?;
        self.place_label(end)
    }

    fn visit_do_while(&mut self, body: &Statement, condition: &Expression) -> CompileResult<()> {
        let start = self.new_label();
        let check = self.new_label();
        let end = self.new_label();
        self.place_label(start)?;
        self.visit_loop_body(body, end, check)?;
        self.place_label(check)?;
        self.visit_expression(condition)?;
        self.emit_jump(OpCode::JMPIF, start)?;
        self.place_label(end)
    }

    fn visit_for(
        &mut self,
        init: &[Statement],
        condition: Option<&Expression>,
        step: &[Expression],
        body: &Statement,
    ) -> CompileResult<()> {
        self.push_scope();
        let result = (|| {
            for stmt in init {
                self.visit_statement(stmt)?;
            }
            let start = self.new_label();
            let next = self.new_label();
            let end = self.new_label();
            self.place_label(start)?;
            if let Some(condition) = condition {
                self.visit_expression(condition)?;
                self.emit_jump(OpCode::JMPIFNOT, end)?;
            }
            self.visit_loop_body(body, end, next)?;
            self.place_label(next)?;
            for expr in step {
                self.visit_expression_discarded(expr)?;
            }
            self.emit_jump(OpCode::JMP, start)?;
            self.place_label(end)
        })();
        self.pop_scope();
        result
    }

    /// Index-based iteration over an array, struct or byte string.
    fn visit_for_each(&mut self, variable: &str, ty: &TypeRef, collection: &Expression, body: &Statement) -> CompileResult<()> {
        let items = self.alloc_temp("items");
        let index = self.alloc_temp("index");
        self.visit_expression(collection)?;
        self.emitter.store(SlotKind::Local, items)?;
        self.emitter.push_i64(0)?;
        self.emitter.store(SlotKind::Local, index)?;

        let start = self.new_label();
        let next = self.new_label();
        let end = self.new_label();
        self.place_label(start)?;
        self.emitter.load(SlotKind::Local, index)?;
        self.emitter.load(SlotKind::Local, items)?;
        self.emitter.emit_op(OpCode::SIZE)?;
        self.emit_jump(OpCode::JMPGE, end)?;

        self.push_scope();
        let result = (|| {
            let element = self.declare_local(variable, ty.clone())?;
            self.emitter.load(SlotKind::Local, items)?;
            self.emitter.load(SlotKind::Local, index)?;
            self.emitter.emit_op(OpCode::PICKITEM)?;
            self.emitter.store(SlotKind::Local, element)?;
            self.visit_loop_body(body, end, next)
        })();
        self.pop_scope();
        result?;

        self.place_label(next)?;
        self.emitter.load(SlotKind::Local, index)?;
        self.emitter.emit_op(OpCode::INC)?;
        self.emitter.store(SlotKind::Local, index)?;
        self.emit_jump(OpCode::JMP, start)?;
        self.place_label(end)
    }

    fn visit_loop_body(&mut self, body: &Statement, break_label: Label, continue_label: Label) -> CompileResult<()> {
        self.breakables.push(Breakable {
            break_label,
            continue_label: Some(continue_label),
            try_depth: self.try_stack.len(),
        });
        let result = self.visit_statement(body);
        self.breakables.pop();
        result
    }

    /// Subject goes to a temp slot, then one `EQUAL`/`JMPIF` test per case
    /// label in declaration order, then a jump to `default` or past the end.
    fn visit_switch(&mut self, subject: &Expression, sections: &[SwitchSection]) -> CompileResult<()> {
        let temp = self.alloc_temp("switch");
        self.visit_expression(subject)?;
        self.emitter.store(SlotKind::Local, temp)?;

        let end = self.new_label();
        let section_labels: Vec<Label> = sections.iter().map(|_| self.new_label()).collect();
        let mut default_label = None;
        for (section, &label) in sections.iter().zip(&section_labels) {
            for case in &section.labels {
                match case {
                    CaseLabel::Value(value) => {
                        self.emitter.load(SlotKind::Local, temp)?;
                        self.visit_expression(value)?;
                        self.emitter.emit_op(OpCode::EQUAL)?;
                        self.emit_jump(OpCode::JMPIF, label)?;
                    }
                    CaseLabel::Default => {
                        if default_label.replace(label).is_some() {
                            return Err(CompileError::unsupported("switch with more than one default label"));
                        }
                    }
                }
            }
        }
        self.emit_jump(OpCode::JMP, default_label.unwrap_or(end))?;

        self.breakables.push(Breakable { break_label: end, continue_label: None, try_depth: self.try_stack.len() });
        let result: CompileResult<()> = (|| {
            for (section, &label) in sections.iter().zip(&section_labels) {
                self.place_label(label)?;
                self.push_scope();
                let body = section.body.iter().try_for_each(|s| self.visit_statement(s));
                self.pop_scope();
                body?;
            }
            Ok(())
        })();
        self.breakables.pop();
        result?;
        self.place_label(end)
    }

    fn visit_return(&mut self, value: Option<&Expression>) -> CompileResult<()> {
        let returns_value = !self.method.return_type.is_void();
        match (value, returns_value) {
            (Some(_), false) => return Err(CompileError::unsupported("return with a value from a void method")),
            (None, true) => return Err(CompileError::unsupported("return without a value from a non-void method")),
            _ => {}
        }
        if let Some(value) = value {
            self.visit_expression(value)?;
        }
        if self.try_stack.is_empty() {
            self.emitter.emit_op(OpCode::RET)?;
            return Ok(());
        }

        // Leave every enclosing try through ENDTRY, then return from the shared epilogue.
        if returns_value {
            let slot = match self.return_slot {
                Some(slot) => slot,
                None => {
                    let slot = self.alloc_temp("return");
                    self.return_slot = Some(slot);
                    slot
                }
            };
            self.emitter.store(SlotKind::Local, slot)?;
        }
        let epilogue = match self.epilogue {
            Some(label) => label,
            None => {
                let label = self.new_label();
                self.epilogue = Some(label);
                label
            }
        };
        self.emit_exit(epilogue, 0, "return")
    }

    fn visit_goto(&mut self, name: &str) -> CompileResult<()> {
        let (label, target_path) = match self.goto_targets.get(name) {
            Some(target) => (target.label, target.path.clone()),
            None => return Err(CompileError::unresolved(format!("label '{}'", name))),
        };
        let current = self.try_path();
        if !current.starts_with(&target_path) {
            return Err(CompileError::unsupported(format!("goto '{}' jumps into a try region", name)));
        }
        self.emit_exit(label, target_path.len(), "goto")
    }
}
