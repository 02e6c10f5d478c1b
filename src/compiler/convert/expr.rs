use super::MethodConverter;
use crate::compiler::ast::{BinaryOperator, Callee, Expression, UnaryOperator};
use crate::compiler::catalog::{Capability, NOTIFY_SERVICE};
use crate::compiler::emitter::{CallTarget, SlotKind};
use crate::compiler::error::{CompileError, CompileResult};
use crate::opcodes::OpCode;
use crate::types::StackItemType;
use crate::utils::interop_hash;

fn binary_opcode(op: BinaryOperator) -> Option<OpCode> {
    Some(match op {
        BinaryOperator::Add => OpCode::ADD,
        BinaryOperator::Subtract => OpCode::SUB,
        BinaryOperator::Multiply => OpCode::MUL,
        BinaryOperator::Divide => OpCode::DIV,
        BinaryOperator::Modulo => OpCode::MOD,
        BinaryOperator::ShiftLeft => OpCode::SHL,
        BinaryOperator::ShiftRight => OpCode::SHR,
        BinaryOperator::BitAnd => OpCode::AND,
        BinaryOperator::BitOr => OpCode::OR,
        BinaryOperator::BitXor => OpCode::XOR,
        BinaryOperator::Equal => OpCode::EQUAL,
        BinaryOperator::NotEqual => OpCode::NOTEQUAL,
        BinaryOperator::Greater => OpCode::GT,
        BinaryOperator::GreaterEqual => OpCode::GE,
        BinaryOperator::Less => OpCode::LT,
        BinaryOperator::LessEqual => OpCode::LE,
        BinaryOperator::And | BinaryOperator::Or => return None,
    })
}

/// Operators usable in `x op= y`.
fn compound_opcode(op: BinaryOperator) -> Option<OpCode> {
    match op {
        BinaryOperator::Add
        | BinaryOperator::Subtract
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo
        | BinaryOperator::ShiftLeft
        | BinaryOperator::ShiftRight
        | BinaryOperator::BitAnd
        | BinaryOperator::BitOr
        | BinaryOperator::BitXor => binary_opcode(op),
        _ => None,
    }
}

impl<'a> MethodConverter<'a> {
    /// Lowers `expr` so that it leaves exactly one value on the stack.
    pub(super) fn visit_expression(&mut self, expr: &Expression) -> CompileResult<()> {
        match expr {
            Expression::Null => self.emitter.push_null().map(drop),
            Expression::Bool { value } => self.emitter.push_bool(*value).map(drop),
            Expression::Int { value } => self.emitter.push_int(value).map(drop),
            Expression::String { value } => self.emitter.push_string(value).map(drop),
            Expression::Bytes { value } => {
                self.emitter.push_data(value)?;
                self.emitter.emit(OpCode::CONVERT, vec![StackItemType::Buffer.to_byte()])?;
                Ok(())
            }
            Expression::Variable { name } => {
                let (kind, index) = self
                    .resolve_variable(name)
                    .ok_or_else(|| CompileError::unresolved(format!("variable '{}'", name)))?;
                self.emitter.load(kind, index).map(drop)
            }
            Expression::Assign { target, value } => self.visit_assign(target, value, true),
            Expression::CompoundAssign { op, target, value } => self.visit_compound_assign(*op, target, value, true),
            Expression::IncDec { target, increment, prefix } => self.visit_inc_dec(target, *increment, *prefix, true),
            Expression::Binary { op: BinaryOperator::And, left, right } => self.visit_short_circuit(left, right, false),
            Expression::Binary { op: BinaryOperator::Or, left, right } => self.visit_short_circuit(left, right, true),
            Expression::Binary { op, left, right } => {
                let opcode =
                    binary_opcode(*op).ok_or_else(|| CompileError::internal(format!("operator {} has no opcode", op)))?;
                self.visit_expression(left)?;
                self.visit_expression(right)?;
                self.emitter.emit_op(opcode).map(drop)
            }
            Expression::Unary { op, operand } => {
                self.visit_expression(operand)?;
                let opcode = match op {
                    UnaryOperator::Minus => OpCode::NEGATE,
                    UnaryOperator::Not => OpCode::NOT,
                    UnaryOperator::BitNot => OpCode::INVERT,
                };
                self.emitter.emit_op(opcode).map(drop)
            }
            Expression::Conditional { condition, then_value, else_value } => {
                let else_label = self.new_label();
                let end = self.new_label();
                self.visit_expression(condition)?;
                self.emit_jump(OpCode::JMPIFNOT, else_label)?;
                self.visit_expression(then_value)?;
                self.emit_jump(OpCode::JMP, end)?;
                self.place_label(else_label)?;
                self.visit_expression(else_value)?;
                self.place_label(end)
            }
            Expression::Coalesce { left, right } => {
                let end = self.new_label();
                self.visit_expression(left)?;
                self.emitter.emit_op(OpCode::DUP)?;
                self.emitter.emit_op(OpCode::ISNULL)?;
                self.emit_jump(OpCode::JMPIFNOT, end)?;
                self.emitter.emit_op(OpCode::DROP)?;
                self.visit_expression(right)?;
                self.place_label(end)
            }
            Expression::Call { callee, args } => {
                if self.visit_call(callee, args)? {
                    Ok(())
                } else {
                    Err(CompileError::unsupported(format!("value of void call {}", expr.describe())))
                }
            }
            Expression::RaiseEvent { event, .. } => {
                Err(CompileError::unsupported(format!("value of event raise '{}'", event)))
            }
            Expression::NewArray { element_type, length } => {
                self.visit_expression(length)?;
                match element_type.stack_item_type() {
                    Some(item @ (StackItemType::Boolean | StackItemType::Integer | StackItemType::ByteString)) => {
                        self.emitter.emit(OpCode::NEWARRAY_T, vec![item.to_byte()]).map(drop)
                    }
                    _ => self.emitter.emit_op(OpCode::NEWARRAY).map(drop),
                }
            }
            Expression::ArrayLiteral { elements } => self.visit_packed(elements, OpCode::NEWARRAY0, OpCode::PACK),
            Expression::NewStruct { fields } => self.visit_packed(fields, OpCode::NEWSTRUCT0, OpCode::PACKSTRUCT),
            Expression::NewMap => self.emitter.emit_op(OpCode::NEWMAP).map(drop),
            Expression::Element { collection, index } => {
                self.visit_expression(collection)?;
                self.visit_expression(index)?;
                self.emitter.emit_op(OpCode::PICKITEM).map(drop)
            }
            Expression::Length { collection } => {
                self.visit_expression(collection)?;
                self.emitter.emit_op(OpCode::SIZE).map(drop)
            }
            Expression::Convert { operand, to } => {
                self.visit_expression(operand)?;
                // Reference conversions (to object or a class) leave the item as is.
                if let Some(item) = to.stack_item_type() {
                    self.emitter.emit(OpCode::CONVERT, vec![item.to_byte()])?;
                }
                Ok(())
            }
            Expression::Unsupported { construct } => Err(CompileError::unsupported(construct.clone())),
        }
    }

    /// Lowers `expr` as a statement: nothing is left on the stack.
    pub(super) fn visit_expression_discarded(&mut self, expr: &Expression) -> CompileResult<()> {
        match expr {
            Expression::Assign { target, value } => self.visit_assign(target, value, false),
            Expression::CompoundAssign { op, target, value } => self.visit_compound_assign(*op, target, value, false),
            Expression::IncDec { target, increment, prefix } => self.visit_inc_dec(target, *increment, *prefix, false),
            Expression::Call { callee, args } => {
                if self.visit_call(callee, args)? {
                    self.emitter.emit_op(OpCode::DROP)?;
                }
                Ok(())
            }
            Expression::RaiseEvent { event, args } => self.visit_raise(event, args),
            other => {
                self.visit_expression(other)?;
                self.emitter.emit_op(OpCode::DROP).map(drop)
            }
        }
    }

    fn visit_short_circuit(&mut self, left: &Expression, right: &Expression, is_or: bool) -> CompileResult<()> {
        let short = self.new_label();
        let end = self.new_label();
        self.visit_expression(left)?;
        self.emit_jump(if is_or { OpCode::JMPIF } else { OpCode::JMPIFNOT }, short)?;
        self.visit_expression(right)?;
        self.emit_jump(OpCode::JMP, end)?;
        self.place_label(short)?;
        self.emitter.push_bool(is_or)?;
        self.place_label(end)
    }

    fn visit_packed(&mut self, items: &[Expression], empty: OpCode, pack: OpCode) -> CompileResult<()> {
        if items.is_empty() {
            return self.emitter.emit_op(empty).map(drop);
        }
        for item in items.iter().rev() {
            self.visit_expression(item)?;
        }
        self.emitter.push_i64(items.len() as i64)?;
        self.emitter.emit_op(pack).map(drop)
    }

    /// With `coll idx value` on the stack, keeps a copy of `value` below the
    /// three operands of the upcoming `SETITEM`.
    fn keep_below_setitem(&mut self) -> CompileResult<()> {
        for op in [OpCode::DUP, OpCode::REVERSE4, OpCode::SWAP, OpCode::ROT] {
            self.emitter.emit_op(op)?;
        }
        Ok(())
    }

    fn variable_slot(&self, name: &str) -> CompileResult<(SlotKind, usize)> {
        self.resolve_variable(name)
            .ok_or_else(|| CompileError::unresolved(format!("variable '{}'", name)))
    }

    fn visit_assign(&mut self, target: &Expression, value: &Expression, keep: bool) -> CompileResult<()> {
        match target {
            Expression::Variable { name } => {
                let (kind, index) = self.variable_slot(name)?;
                self.visit_expression(value)?;
                if keep {
                    self.emitter.emit_op(OpCode::DUP)?;
                }
                self.emitter.store(kind, index).map(drop)
            }
            Expression::Element { collection, index } => {
                self.visit_expression(collection)?;
                self.visit_expression(index)?;
                self.visit_expression(value)?;
                if keep {
                    self.keep_below_setitem()?;
                }
                self.emitter.emit_op(OpCode::SETITEM).map(drop)
            }
            other => Err(CompileError::unsupported(format!("assignment to {}", other.describe()))),
        }
    }

    fn visit_compound_assign(
        &mut self,
        op: BinaryOperator,
        target: &Expression,
        value: &Expression,
        keep: bool,
    ) -> CompileResult<()> {
        let opcode = compound_opcode(op)
            .ok_or_else(|| CompileError::unsupported(format!("compound assignment with '{}'", op)))?;
        match target {
            Expression::Variable { name } => {
                let (kind, index) = self.variable_slot(name)?;
                self.emitter.load(kind, index)?;
                self.visit_expression(value)?;
                self.emitter.emit_op(opcode)?;
                if keep {
                    self.emitter.emit_op(OpCode::DUP)?;
                }
                self.emitter.store(kind, index).map(drop)
            }
            Expression::Element { collection, index } => {
                self.visit_expression(collection)?;
                self.visit_expression(index)?;
                self.emitter.emit_op(OpCode::OVER)?;
                self.emitter.emit_op(OpCode::OVER)?;
                self.emitter.emit_op(OpCode::PICKITEM)?;
                self.visit_expression(value)?;
                self.emitter.emit_op(opcode)?;
                if keep {
                    self.keep_below_setitem()?;
                }
                self.emitter.emit_op(OpCode::SETITEM).map(drop)
            }
            other => Err(CompileError::unsupported(format!("compound assignment to {}", other.describe()))),
        }
    }

    fn visit_inc_dec(&mut self, target: &Expression, increment: bool, prefix: bool, keep: bool) -> CompileResult<()> {
        let step = if increment { OpCode::INC } else { OpCode::DEC };
        match target {
            Expression::Variable { name } => {
                let (kind, index) = self.variable_slot(name)?;
                self.emitter.load(kind, index)?;
                if keep && !prefix {
                    self.emitter.emit_op(OpCode::DUP)?;
                }
                self.emitter.emit_op(step)?;
                if keep && prefix {
                    self.emitter.emit_op(OpCode::DUP)?;
                }
                self.emitter.store(kind, index).map(drop)
            }
            Expression::Element { collection, index } => {
                self.visit_expression(collection)?;
                self.visit_expression(index)?;
                self.emitter.emit_op(OpCode::OVER)?;
                self.emitter.emit_op(OpCode::OVER)?;
                self.emitter.emit_op(OpCode::PICKITEM)?;
                if keep && !prefix {
                    self.keep_below_setitem()?;
                }
                self.emitter.emit_op(step)?;
                if keep && prefix {
                    self.keep_below_setitem()?;
                }
                self.emitter.emit_op(OpCode::SETITEM).map(drop)
            }
            other => Err(CompileError::unsupported(format!("increment of {}", other.describe()))),
        }
    }

    /// Emits a call and reports whether it left a return value on the stack.
    fn visit_call(&mut self, callee: &Callee, args: &[Expression]) -> CompileResult<bool> {
        let context = self.context;
        match callee {
            Callee::Method { name } => {
                let method = context
                    .methods
                    .get(name.as_str())
                    .ok_or_else(|| CompileError::unresolved(format!("method '{}'", name)))?;
                check_arity(name, method.params.len(), args.len())?;
                for arg in args.iter().rev() {
                    self.visit_expression(arg)?;
                }
                self.emitter.emit_call(OpCode::CALL_L, CallTarget::Method(name.clone()))?;
                Ok(!method.return_type.is_void())
            }
            Callee::Capability { name } => {
                let entry = context
                    .catalog
                    .get(name)
                    .ok_or_else(|| CompileError::unresolved(format!("capability '{}'", name)))?;
                check_arity(name, entry.params, args.len())?;
                match &entry.capability {
                    Capability::Syscall { id, .. } => {
                        for arg in args.iter().rev() {
                            self.visit_expression(arg)?;
                        }
                        self.emitter.emit(OpCode::SYSCALL, id.to_le_bytes().to_vec())?;
                    }
                    Capability::Token(token) => {
                        for arg in args.iter().rev() {
                            self.visit_expression(arg)?;
                        }
                        self.emitter.emit_call(OpCode::CALLT, CallTarget::Token(token.clone()))?;
                    }
                    Capability::Inline(opcodes) => {
                        for arg in args {
                            self.visit_expression(arg)?;
                        }
                        for opcode in opcodes {
                            self.emitter.emit_op(*opcode)?;
                        }
                    }
                }
                Ok(entry.returns_value)
            }
        }
    }

    /// `Notify(name, [args...])`: arguments packed into an array under the event name.
    fn visit_raise(&mut self, name: &str, args: &[Expression]) -> CompileResult<()> {
        let context = self.context;
        let event = context
            .events
            .get(name)
            .ok_or_else(|| CompileError::unresolved(format!("event '{}'", name)))?;
        check_arity(name, event.params.len(), args.len())?;
        for arg in args.iter().rev() {
            self.visit_expression(arg)?;
        }
        self.emitter.push_i64(args.len() as i64)?;
        self.emitter.emit_op(OpCode::PACK)?;
        self.emitter.push_string(event.display_name.as_deref().unwrap_or(&event.name))?;
        self.emitter.emit(OpCode::SYSCALL, interop_hash(NOTIFY_SERVICE).to_le_bytes().to_vec())?;
        self.raised_events.insert(event.name.clone());
        Ok(())
    }
}

fn check_arity(name: &str, expected: usize, actual: usize) -> CompileResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CompileError::unsupported(format!(
            "call to {} with {} argument(s), {} expected",
            name, actual, expected
        )))
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::ast::*;
    use crate::compiler::catalog::Catalog;
    use crate::compiler::convert::{convert, ContractContext, MethodBlock};
    use crate::compiler::error::{CompileError, CompileResult};
    use crate::compiler::typeref::TypeRef;
    use crate::opcodes::OpCode;

    fn lower(contract: &ContractDecl) -> CompileResult<MethodBlock> {
        let catalog = Catalog::builtin();
        let context = ContractContext::new(contract, &catalog);
        convert(&contract.methods[0], &context)
    }

    fn ops(body: Vec<Statement>) -> Vec<OpCode> {
        let contract = ContractDecl::new("T").method(
            MethodDecl::new("M")
                .param("a", TypeRef::Array(Box::new(TypeRef::Integer)))
                .param("i", TypeRef::Integer)
                .body(body),
        );
        lower(&contract).unwrap().instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_element_assignment_as_value() {
        let assign = Expression::assign(
            Expression::element(Expression::variable("a"), Expression::int(0)),
            Expression::int(5),
        );
        let got = ops(vec![Statement::local("x", TypeRef::Integer, Some(assign))]);
        assert_eq!(
            got,
            vec![
                OpCode::INITSLOT,
                OpCode::LDARG0,
                OpCode::PUSH0,
                OpCode::PUSH5,
                OpCode::DUP,
                OpCode::REVERSE4,
                OpCode::SWAP,
                OpCode::ROT,
                OpCode::SETITEM,
                OpCode::STLOC0,
                OpCode::RET,
            ]
        );
    }

    #[test]
    fn test_postfix_increment_statement_has_no_dup() {
        let got = ops(vec![Statement::expr(Expression::increment(Expression::variable("i"), false))]);
        assert_eq!(got, vec![OpCode::INITSLOT, OpCode::LDARG1, OpCode::INC, OpCode::STARG1, OpCode::RET]);
    }

    #[test]
    fn test_short_circuit_and() {
        let cond = Expression::binary(Expression::variable("i"), BinaryOperator::And, Expression::boolean(false));
        let got = ops(vec![Statement::expr(cond)]);
        assert_eq!(
            got,
            vec![
                OpCode::INITSLOT,
                OpCode::LDARG1,
                OpCode::JMPIFNOT,
                OpCode::PUSHF,
                OpCode::JMP,
                OpCode::PUSHF,
                OpCode::DROP,
                OpCode::RET,
            ]
        );
    }

    #[test]
    fn test_coalesce() {
        let got = ops(vec![Statement::expr(Expression::coalesce(Expression::variable("a"), Expression::null()))]);
        assert_eq!(
            &got[1..8],
            &[OpCode::LDARG0, OpCode::DUP, OpCode::ISNULL, OpCode::JMPIFNOT, OpCode::DROP, OpCode::PUSHNULL, OpCode::DROP]
        );
    }

    #[test]
    fn test_syscall_arguments_reversed() {
        let put = Expression::capability(
            "Storage.Put",
            vec![
                Expression::capability("Storage.CurrentContext", vec![]),
                Expression::string("k"),
                Expression::int(1),
            ],
        );
        let contract = ContractDecl::new("T").method(MethodDecl::new("M").body(vec![Statement::expr(put)]));
        let block = lower(&contract).unwrap();
        let got: Vec<_> = block.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(got, vec![OpCode::PUSH1, OpCode::PUSHDATA1, OpCode::SYSCALL, OpCode::SYSCALL, OpCode::RET]);
        assert_eq!(block.instructions[2].operand, vec![0x9b, 0xf6, 0x67, 0xce]);
        assert_eq!(block.instructions[3].operand, vec![0xe6, 0x3f, 0x18, 0x84]);
    }

    #[test]
    fn test_inline_capability_keeps_argument_order() {
        let concat = Expression::capability("Helper.Concat", vec![Expression::string("a"), Expression::string("b")]);
        let contract = ContractDecl::new("T")
            .method(MethodDecl::new("M").returns(TypeRef::String).body(vec![Statement::return_stmt(Some(concat))]));
        let block = lower(&contract).unwrap();
        assert_eq!(block.instructions[0].operand, vec![1, b'a']);
        assert_eq!(block.instructions[1].operand, vec![1, b'b']);
        assert_eq!(block.instructions[2].opcode, OpCode::CAT);
    }

    #[test]
    fn test_event_raise() {
        let contract = ContractDecl::new("T")
            .event("Transfer", vec![ParamDecl { name: "amount".into(), ty: TypeRef::Integer }])
            .method(MethodDecl::new("M").body(vec![Statement::expr(Expression::raise("Transfer", vec![Expression::int(3)]))]));
        let block = lower(&contract).unwrap();
        let got: Vec<_> = block.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            got,
            vec![OpCode::PUSH3, OpCode::PUSH1, OpCode::PACK, OpCode::PUSHDATA1, OpCode::SYSCALL, OpCode::RET]
        );
        assert_eq!(block.instructions[3].operand[1..], b"Transfer"[..]);
        assert_eq!(block.instructions[4].operand, vec![0x95, 0x01, 0x6f, 0x61]);
    }

    #[test]
    fn test_void_call_as_value_is_rejected() {
        let contract = ContractDecl::new("T")
            .method(MethodDecl::new("M").body(vec![Statement::local(
                "x",
                TypeRef::Integer,
                Some(Expression::call("N", vec![])),
            )]))
            .method(MethodDecl::new("N"));
        let err = lower(&contract).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }

    #[test]
    fn test_unknown_names_are_unresolved() {
        for expr in [
            Expression::variable("ghost"),
            Expression::call("Ghost", vec![]),
            Expression::capability("Ghost.Call", vec![]),
        ] {
            let contract = ContractDecl::new("T").method(MethodDecl::new("M").body(vec![Statement::expr(expr)]));
            assert!(matches!(lower(&contract).unwrap_err(), CompileError::UnresolvedReference { .. }));
        }
    }

    #[test]
    fn test_unsupported_node_keeps_location() {
        let location = SourceLocation { document: "C.cs".into(), start_line: 12, start_column: 5, end_line: 12, end_column: 30 };
        let stmt = Statement::new(StatementKind::Unsupported { construct: "lock statement".into() }).at(location.clone());
        let contract = ContractDecl::new("T").method(MethodDecl::new("M").body(vec![stmt]));
        let err = lower(&contract).unwrap_err();
        assert_eq!(err.location(), Some(&location));
        assert_eq!(err.to_string(), "C.cs:12:5: unsupported construct: lock statement");
    }
}
