use crate::types::{ContractParameterType, StackItemType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A source-level type as resolved by the front end.
///
/// Types travel through the model as strings (`"int"`, `"UInt160"`,
/// `"Map<string, BigInteger>"`, `"struct Token"`); both the C# spellings and
/// the manifest spellings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeRef {
    Void,
    Boolean,
    Integer,
    String,
    /// `byte[]`, a mutable buffer at runtime.
    ByteArray,
    ByteString,
    Hash160,
    Hash256,
    PublicKey,
    Signature,
    Object,
    Array(Box<TypeRef>),
    Map(Box<TypeRef>, Box<TypeRef>),
    Struct(String),
    Interop(String),
    /// Anything the front end passed through that has no primitive kind.
    Named(String),
}

impl TypeRef {
    pub fn void() -> Self {
        TypeRef::Void
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    /// ABI kind for manifests; `None` when the type cannot appear in one.
    pub fn abi_type(&self) -> Option<ContractParameterType> {
        Some(match self {
            TypeRef::Void => ContractParameterType::Void,
            TypeRef::Boolean => ContractParameterType::Boolean,
            TypeRef::Integer => ContractParameterType::Integer,
            TypeRef::String => ContractParameterType::String,
            TypeRef::ByteArray | TypeRef::ByteString => ContractParameterType::ByteArray,
            TypeRef::Hash160 => ContractParameterType::Hash160,
            TypeRef::Hash256 => ContractParameterType::Hash256,
            TypeRef::PublicKey => ContractParameterType::PublicKey,
            TypeRef::Signature => ContractParameterType::Signature,
            TypeRef::Object => ContractParameterType::Any,
            TypeRef::Array(_) | TypeRef::Struct(_) => ContractParameterType::Array,
            TypeRef::Map(_, _) => ContractParameterType::Map,
            TypeRef::Interop(_) => ContractParameterType::InteropInterface,
            TypeRef::Named(_) => return None,
        })
    }

    /// Runtime item type targeted by `CONVERT` and `NEWARRAY_T`.
    pub fn stack_item_type(&self) -> Option<StackItemType> {
        Some(match self {
            TypeRef::Boolean => StackItemType::Boolean,
            TypeRef::Integer => StackItemType::Integer,
            TypeRef::String
            | TypeRef::ByteString
            | TypeRef::Hash160
            | TypeRef::Hash256
            | TypeRef::PublicKey
            | TypeRef::Signature => StackItemType::ByteString,
            TypeRef::ByteArray => StackItemType::Buffer,
            TypeRef::Array(_) => StackItemType::Array,
            TypeRef::Struct(_) => StackItemType::Struct,
            TypeRef::Map(_, _) => StackItemType::Map,
            TypeRef::Interop(_) => StackItemType::InteropInterface,
            TypeRef::Void | TypeRef::Object | TypeRef::Named(_) => return None,
        })
    }

    pub fn parse(text: &str) -> Result<TypeRef, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty type name".to_string());
        }
        // Nullable value types share the runtime representation.
        let text = text.strip_suffix('?').unwrap_or(text);

        if let Some(element) = text.strip_suffix("[]") {
            return Ok(match element.trim() {
                "byte" | "Byte" => TypeRef::ByteArray,
                inner => TypeRef::Array(Box::new(TypeRef::parse(inner)?)),
            });
        }
        if let Some(name) = text.strip_prefix("struct ") {
            return Ok(TypeRef::Struct(name.trim().to_string()));
        }
        if let Some((outer, args)) = split_generic(text)? {
            return match (outer, args.as_slice()) {
                ("List" | "IList" | "IEnumerable" | "Array", [element]) => {
                    Ok(TypeRef::Array(Box::new(TypeRef::parse(element)?)))
                }
                ("Map" | "Dictionary" | "IDictionary", [key, value]) => Ok(TypeRef::Map(
                    Box::new(TypeRef::parse(key)?),
                    Box::new(TypeRef::parse(value)?),
                )),
                _ => Ok(TypeRef::Named(text.to_string())),
            };
        }

        Ok(match text {
            "void" | "Void" => TypeRef::Void,
            "bool" | "Boolean" => TypeRef::Boolean,
            "sbyte" | "byte" | "short" | "ushort" | "int" | "uint" | "long" | "ulong" | "char"
            | "BigInteger" | "Integer" => TypeRef::Integer,
            "string" | "String" => TypeRef::String,
            "ByteArray" => TypeRef::ByteArray,
            "ByteString" => TypeRef::ByteString,
            "UInt160" | "Hash160" => TypeRef::Hash160,
            "UInt256" | "Hash256" => TypeRef::Hash256,
            "ECPoint" | "PublicKey" => TypeRef::PublicKey,
            "Signature" => TypeRef::Signature,
            "object" | "Any" => TypeRef::Object,
            "Array" => TypeRef::Array(Box::new(TypeRef::Object)),
            "Map" => TypeRef::Map(Box::new(TypeRef::Object), Box::new(TypeRef::Object)),
            "Iterator" | "StorageContext" | "InteropInterface" => TypeRef::Interop(text.to_string()),
            other => TypeRef::Named(other.to_string()),
        })
    }
}

/// Splits `Outer<A, B<C, D>>` into `("Outer", ["A", "B<C, D>"])`.
fn split_generic(text: &str) -> Result<Option<(&str, Vec<&str>)>, String> {
    let Some(open) = text.find('<') else {
        return Ok(None);
    };
    let inner = text[open + 1..]
        .strip_suffix('>')
        .ok_or_else(|| format!("malformed generic type '{}'", text))?;

    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("malformed generic type '{}'", text))?;
            }
            ',' if depth == 0 => {
                args.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(format!("malformed generic type '{}'", text));
    }
    args.push(inner[start..].trim());
    Ok(Some((text[..open].trim(), args)))
}

impl TryFrom<String> for TypeRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TypeRef::parse(&value)
    }
}

impl From<TypeRef> for String {
    fn from(ty: TypeRef) -> String {
        ty.to_string()
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => f.write_str("Void"),
            TypeRef::Boolean => f.write_str("Boolean"),
            TypeRef::Integer => f.write_str("Integer"),
            TypeRef::String => f.write_str("String"),
            TypeRef::ByteArray => f.write_str("byte[]"),
            TypeRef::ByteString => f.write_str("ByteString"),
            TypeRef::Hash160 => f.write_str("UInt160"),
            TypeRef::Hash256 => f.write_str("UInt256"),
            TypeRef::PublicKey => f.write_str("ECPoint"),
            TypeRef::Signature => f.write_str("Signature"),
            TypeRef::Object => f.write_str("object"),
            TypeRef::Array(element) => write!(f, "{}[]", element),
            TypeRef::Map(key, value) => write!(f, "Map<{}, {}>", key, value),
            TypeRef::Struct(name) => write!(f, "struct {}", name),
            TypeRef::Interop(name) | TypeRef::Named(name) => f.write_str(name),
        }
    }
}
