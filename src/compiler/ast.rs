//! Semantic model of a contract, as delivered by the C# front end.
//!
//! The front end has already resolved names, overloads and types; every node
//! here is plain data. Statements and expressions are closed sum types so the
//! converter can match them exhaustively.

use crate::compiler::catalog::CapabilityDecl;
use crate::compiler::typeref::TypeRef;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    pub document: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.document, self.start_line, self.start_column)
    }
}

/// One compilation unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractDecl {
    pub name: String,
    /// Manifest name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub supported_standards: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionDecl>,
    /// Script hashes, or `"*"`.
    #[serde(default)]
    pub trusts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub static_fields: Vec<FieldDecl>,
    #[serde(default)]
    pub events: Vec<EventDecl>,
    #[serde(default)]
    pub methods: Vec<MethodDecl>,
    /// Additional syscall, token and inline bindings on top of the built-in catalog.
    #[serde(default)]
    pub capabilities: Vec<CapabilityDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecl {
    /// Script hash, group public key, or `"*"`.
    pub contract: String,
    /// Method names; `["*"]` or empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
}

/// Attributes the front end extracted from the method declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MethodAttributes {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    #[serde(default = "TypeRef::void")]
    pub return_type: TypeRef,
    #[serde(default)]
    pub attributes: MethodAttributes,
    #[serde(default)]
    pub body: Vec<Statement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(flatten)]
    pub kind: StatementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatementKind {
    Block {
        statements: Vec<Statement>,
    },
    LocalDecl {
        name: String,
        #[serde(rename = "type")]
        ty: TypeRef,
        #[serde(default)]
        init: Option<Expression>,
    },
    Expression {
        expr: Expression,
    },
    If {
        condition: Expression,
        then_branch: Box<Statement>,
        #[serde(default)]
        else_branch: Option<Box<Statement>>,
    },
    While {
        condition: Expression,
        body: Box<Statement>,
    },
    DoWhile {
        body: Box<Statement>,
        condition: Expression,
    },
    For {
        #[serde(default)]
        init: Vec<Statement>,
        #[serde(default)]
        condition: Option<Expression>,
        #[serde(default)]
        step: Vec<Expression>,
        body: Box<Statement>,
    },
    ForEach {
        variable: String,
        #[serde(rename = "type")]
        ty: TypeRef,
        collection: Expression,
        body: Box<Statement>,
    },
    Switch {
        subject: Expression,
        sections: Vec<SwitchSection>,
    },
    Break,
    Continue,
    Return {
        #[serde(default)]
        value: Option<Expression>,
    },
    Throw {
        value: Expression,
    },
    Try {
        body: Box<Statement>,
        #[serde(default)]
        catch: Option<CatchClause>,
        #[serde(default)]
        finally: Option<Box<Statement>>,
    },
    Goto {
        label: String,
    },
    Labeled {
        label: String,
        body: Box<Statement>,
    },
    /// A construct the front end recognised but has no lowering.
    Unsupported {
        construct: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchSection {
    pub labels: Vec<CaseLabel>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseLabel {
    Value(Expression),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    /// Name bound to the exception, if any.
    #[serde(default)]
    pub variable: Option<String>,
    pub body: Box<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expression {
    Null,
    Bool {
        value: bool,
    },
    Int {
        #[serde(with = "bigint_repr")]
        value: BigInt,
    },
    String {
        value: String,
    },
    Bytes {
        #[serde(with = "hex_repr")]
        value: Vec<u8>,
    },
    /// Local, parameter or static field.
    Variable {
        name: String,
    },
    Assign {
        target: Box<Expression>,
        value: Box<Expression>,
    },
    CompoundAssign {
        op: BinaryOperator,
        target: Box<Expression>,
        value: Box<Expression>,
    },
    IncDec {
        target: Box<Expression>,
        increment: bool,
        prefix: bool,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then_value: Box<Expression>,
        else_value: Box<Expression>,
    },
    Coalesce {
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Call {
        callee: Callee,
        #[serde(default)]
        args: Vec<Expression>,
    },
    RaiseEvent {
        event: String,
        #[serde(default)]
        args: Vec<Expression>,
    },
    NewArray {
        element_type: TypeRef,
        length: Box<Expression>,
    },
    ArrayLiteral {
        elements: Vec<Expression>,
    },
    NewStruct {
        fields: Vec<Expression>,
    },
    NewMap,
    Element {
        collection: Box<Expression>,
        index: Box<Expression>,
    },
    Length {
        collection: Box<Expression>,
    },
    Convert {
        operand: Box<Expression>,
        to: TypeRef,
    },
    Unsupported {
        construct: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Callee {
    /// A method of the contract being compiled.
    Method { name: String },
    /// A catalog entry: syscall, method token or inline opcodes.
    Capability { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitOr,
    BitXor,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    Minus,
    Not,
    BitNot,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOperator::Add => write!(f, "+"),
            BinaryOperator::Subtract => write!(f, "-"),
            BinaryOperator::Multiply => write!(f, "*"),
            BinaryOperator::Divide => write!(f, "/"),
            BinaryOperator::Modulo => write!(f, "%"),
            BinaryOperator::ShiftLeft => write!(f, "<<"),
            BinaryOperator::ShiftRight => write!(f, ">>"),
            BinaryOperator::BitAnd => write!(f, "&"),
            BinaryOperator::BitOr => write!(f, "|"),
            BinaryOperator::BitXor => write!(f, "^"),
            BinaryOperator::Equal => write!(f, "=="),
            BinaryOperator::NotEqual => write!(f, "!="),
            BinaryOperator::Greater => write!(f, ">"),
            BinaryOperator::GreaterEqual => write!(f, ">="),
            BinaryOperator::Less => write!(f, "<"),
            BinaryOperator::LessEqual => write!(f, "<="),
            BinaryOperator::And => write!(f, "&&"),
            BinaryOperator::Or => write!(f, "||"),
        }
    }
}

impl fmt::Display for UnaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOperator::Minus => write!(f, "-"),
            UnaryOperator::Not => write!(f, "!"),
            UnaryOperator::BitNot => write!(f, "~"),
        }
    }
}

/// Integer literals are written as decimal strings (or `0x` hex) so that
/// values beyond 64 bits survive JSON; small JSON numbers are accepted too.
mod bigint_repr {
    use num_bigint::BigInt;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntRepr {
        Signed(i64),
        Unsigned(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        match IntRepr::deserialize(deserializer)? {
            IntRepr::Signed(v) => Ok(BigInt::from(v)),
            IntRepr::Unsigned(v) => Ok(BigInt::from(v)),
            IntRepr::Text(text) => {
                let (negative, digits) = match text.trim().strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, text.trim()),
                };
                let parsed = match digits.strip_prefix("0x") {
                    Some(hex) => BigInt::parse_bytes(hex.as_bytes(), 16),
                    None => BigInt::parse_bytes(digits.as_bytes(), 10),
                };
                let value = parsed.ok_or_else(|| D::Error::custom(format!("invalid integer literal '{}'", text)))?;
                Ok(if negative { -value } else { value })
            }
        }
    }
}

mod hex_repr {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.strip_prefix("0x").unwrap_or(&text)).map_err(D::Error::custom)
    }
}

// Helper functions for model construction
impl Expression {
    pub fn null() -> Self {
        Expression::Null
    }

    pub fn boolean(value: bool) -> Self {
        Expression::Bool { value }
    }

    pub fn int(value: impl Into<BigInt>) -> Self {
        Expression::Int { value: value.into() }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Expression::Variable { name: name.into() }
    }

    pub fn assign(target: Expression, value: Expression) -> Self {
        Expression::Assign { target: Box::new(target), value: Box::new(value) }
    }

    /// Short description used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Expression::Null => "null".to_string(),
            Expression::Bool { value } => value.to_string(),
            Expression::Int { value } => value.to_string(),
            Expression::String { value } => format!("{:?}", value),
            Expression::Bytes { value } => format!("0x{}", hex::encode(value)),
            Expression::Variable { name } => name.clone(),
            Expression::Element { collection, .. } => format!("{}[..]", collection.describe()),
            Expression::Call { callee: Callee::Method { name } | Callee::Capability { name }, .. } => {
                format!("{}(..)", name)
            }
            Expression::Length { collection } => format!("{}.Length", collection.describe()),
            Expression::Unsupported { construct } => construct.clone(),
            Expression::Assign { .. } | Expression::CompoundAssign { .. } | Expression::IncDec { .. } => {
                "assignment".to_string()
            }
            Expression::Binary { op, .. } => format!("'{}' expression", op),
            Expression::Unary { op, .. } => format!("'{}' expression", op),
            Expression::Conditional { .. } => "conditional expression".to_string(),
            Expression::Coalesce { .. } => "'??' expression".to_string(),
            Expression::RaiseEvent { event, .. } => format!("event {}", event),
            Expression::NewArray { .. } | Expression::ArrayLiteral { .. } => "array creation".to_string(),
            Expression::NewStruct { .. } => "struct creation".to_string(),
            Expression::NewMap => "map creation".to_string(),
            Expression::Convert { to, .. } => format!("conversion to {}", to),
        }
    }
}

#[cfg(test)]
impl Expression {
    pub fn string(value: impl Into<String>) -> Self {
        Expression::String { value: value.into() }
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Expression::Bytes { value: value.into() }
    }

    pub fn compound_assign(op: BinaryOperator, target: Expression, value: Expression) -> Self {
        Expression::CompoundAssign { op, target: Box::new(target), value: Box::new(value) }
    }

    pub fn increment(target: Expression, prefix: bool) -> Self {
        Expression::IncDec { target: Box::new(target), increment: true, prefix }
    }

    pub fn decrement(target: Expression, prefix: bool) -> Self {
        Expression::IncDec { target: Box::new(target), increment: false, prefix }
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn unary(op: UnaryOperator, operand: Expression) -> Self {
        Expression::Unary { op, operand: Box::new(operand) }
    }

    pub fn conditional(condition: Expression, then_value: Expression, else_value: Expression) -> Self {
        Expression::Conditional {
            condition: Box::new(condition),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
        }
    }

    pub fn coalesce(left: Expression, right: Expression) -> Self {
        Expression::Coalesce { left: Box::new(left), right: Box::new(right) }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Call { callee: Callee::Method { name: name.into() }, args }
    }

    pub fn capability(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Call { callee: Callee::Capability { name: name.into() }, args }
    }

    pub fn raise(event: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::RaiseEvent { event: event.into(), args }
    }

    pub fn element(collection: Expression, index: Expression) -> Self {
        Expression::Element { collection: Box::new(collection), index: Box::new(index) }
    }

    pub fn length(collection: Expression) -> Self {
        Expression::Length { collection: Box::new(collection) }
    }

    pub fn convert(operand: Expression, to: TypeRef) -> Self {
        Expression::Convert { operand: Box::new(operand), to }
    }

    pub fn array(elements: Vec<Expression>) -> Self {
        Expression::ArrayLiteral { elements }
    }
}

impl Statement {
    pub fn new(kind: StatementKind) -> Self {
        Statement { kind, location: None }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn expr(expr: Expression) -> Self {
        Statement::new(StatementKind::Expression { expr })
    }
}

#[cfg(test)]
impl Statement {
    pub fn block(statements: Vec<Statement>) -> Self {
        Statement::new(StatementKind::Block { statements })
    }

    pub fn local(name: impl Into<String>, ty: TypeRef, init: Option<Expression>) -> Self {
        Statement::new(StatementKind::LocalDecl { name: name.into(), ty, init })
    }

    pub fn if_stmt(condition: Expression, then_branch: Statement, else_branch: Option<Statement>) -> Self {
        Statement::new(StatementKind::If {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        })
    }

    pub fn while_stmt(condition: Expression, body: Statement) -> Self {
        Statement::new(StatementKind::While { condition, body: Box::new(body) })
    }

    pub fn do_while(body: Statement, condition: Expression) -> Self {
        Statement::new(StatementKind::DoWhile { body: Box::new(body), condition })
    }

    pub fn for_stmt(init: Vec<Statement>, condition: Option<Expression>, step: Vec<Expression>, body: Statement) -> Self {
        Statement::new(StatementKind::For { init, condition, step, body: Box::new(body) })
    }

    pub fn for_each(variable: impl Into<String>, ty: TypeRef, collection: Expression, body: Statement) -> Self {
        Statement::new(StatementKind::ForEach { variable: variable.into(), ty, collection, body: Box::new(body) })
    }

    pub fn switch(subject: Expression, sections: Vec<SwitchSection>) -> Self {
        Statement::new(StatementKind::Switch { subject, sections })
    }

    pub fn break_stmt() -> Self {
        Statement::new(StatementKind::Break)
    }

    pub fn continue_stmt() -> Self {
        Statement::new(StatementKind::Continue)
    }

    pub fn return_stmt(value: Option<Expression>) -> Self {
        Statement::new(StatementKind::Return { value })
    }

    pub fn throw(value: Expression) -> Self {
        Statement::new(StatementKind::Throw { value })
    }

    pub fn try_stmt(body: Statement, catch: Option<CatchClause>, finally: Option<Statement>) -> Self {
        Statement::new(StatementKind::Try { body: Box::new(body), catch, finally: finally.map(Box::new) })
    }

    pub fn goto(label: impl Into<String>) -> Self {
        Statement::new(StatementKind::Goto { label: label.into() })
    }

    pub fn labeled(label: impl Into<String>, body: Statement) -> Self {
        Statement::new(StatementKind::Labeled { label: label.into(), body: Box::new(body) })
    }
}

impl MethodDecl {
    pub fn new(name: impl Into<String>) -> Self {
        MethodDecl {
            name: name.into(),
            params: Vec::new(),
            return_type: TypeRef::Void,
            attributes: MethodAttributes::default(),
            body: Vec::new(),
            location: None,
        }
    }

    pub fn body(mut self, body: Vec<Statement>) -> Self {
        self.body = body;
        self
    }
}

#[cfg(test)]
impl MethodDecl {
    pub fn public(mut self) -> Self {
        self.attributes.public = true;
        self
    }

    pub fn safe(mut self) -> Self {
        self.attributes.safe = true;
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.attributes.display_name = Some(name.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.params.push(ParamDecl { name: name.into(), ty });
        self
    }

    pub fn returns(mut self, ty: TypeRef) -> Self {
        self.return_type = ty;
        self
    }
}

impl ContractDecl {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Name used in the manifest.
    pub fn manifest_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
impl ContractDecl {
    pub fn new(name: impl Into<String>) -> Self {
        ContractDecl { name: name.into(), ..Default::default() }
    }

    pub fn method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    pub fn event(mut self, name: impl Into<String>, params: Vec<ParamDecl>) -> Self {
        self.events.push(EventDecl { name: name.into(), display_name: None, params });
        self
    }

    pub fn static_field(mut self, name: impl Into<String>, ty: TypeRef, init: Option<Expression>) -> Self {
        self.static_fields.push(FieldDecl { name: name.into(), ty, init, location: None });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_from_json() {
        let json = r#"{
            "name": "HelloContract",
            "methods": [{
                "name": "SayHello",
                "return_type": "string",
                "attributes": { "public": true, "safe": true },
                "body": [
                    { "kind": "return", "value": { "kind": "string", "value": "Hello, World!" },
                      "location": { "document": "Hello.cs", "start_line": 5, "start_column": 9, "end_line": 5, "end_column": 33 } }
                ]
            }]
        }"#;
        let contract = ContractDecl::from_json(json).unwrap();
        let method = &contract.methods[0];
        assert_eq!(method.return_type, TypeRef::String);
        assert!(method.attributes.safe);
        assert_eq!(
            method.body[0].kind,
            StatementKind::Return { value: Some(Expression::string("Hello, World!")) }
        );
        assert_eq!(method.body[0].location.as_ref().map(|l| l.start_line), Some(5));
    }

    #[test]
    fn test_big_integer_literals() {
        let expr: Expression =
            serde_json::from_str(r#"{ "kind": "int", "value": "-340282366920938463463374607431768211456" }"#).unwrap();
        let Expression::Int { value } = &expr else { panic!("expected int literal") };
        assert_eq!(value.bits(), 129);

        let expr: Expression = serde_json::from_str(r#"{ "kind": "int", "value": 42 }"#).unwrap();
        assert_eq!(expr, Expression::int(42));
        let expr: Expression = serde_json::from_str(r#"{ "kind": "int", "value": "0xff" }"#).unwrap();
        assert_eq!(expr, Expression::int(255));
    }

    #[test]
    fn test_statement_json_round_trip() {
        let stmt = Statement::if_stmt(
            Expression::variable("a"),
            Statement::expr(Expression::assign(Expression::variable("x"), Expression::int(1))),
            Some(Statement::break_stmt()),
        );
        let json = serde_json::to_string(&stmt).unwrap();
        let back: Statement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stmt);
    }

    #[test]
    fn test_operator_display() {
        assert_eq!(BinaryOperator::ShiftLeft.to_string(), "<<");
        assert_eq!(UnaryOperator::BitNot.to_string(), "~");
    }
}
