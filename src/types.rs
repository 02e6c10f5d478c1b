use ethereum_types::H160;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 20-byte contract script hash, stored little-endian as on the wire.
pub type UInt160 = H160;

/// Parses the `0x`-prefixed big-endian display form of a script hash.
pub fn parse_script_hash(text: &str) -> Result<UInt160, String> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    let mut bytes = hex::decode(digits).map_err(|e| format!("invalid script hash '{}': {}", text, e))?;
    if bytes.len() != 20 {
        return Err(format!("invalid script hash '{}': expected 20 bytes, got {}", text, bytes.len()));
    }
    bytes.reverse();
    Ok(H160::from_slice(&bytes))
}

/// Big-endian display form with `0x` prefix, the inverse of [`parse_script_hash`].
pub fn format_script_hash(hash: &UInt160) -> String {
    let mut bytes = hash.as_bytes().to_vec();
    bytes.reverse();
    format!("0x{}", hex::encode(bytes))
}

/// Permissions granted to the callee of a contract call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "CallFlagsRepr", into = "u8")]
pub struct CallFlags(pub u8);

impl CallFlags {
    pub const NONE: CallFlags = CallFlags(0);
    pub const READ_STATES: CallFlags = CallFlags(0b0001);
    pub const WRITE_STATES: CallFlags = CallFlags(0b0010);
    pub const ALLOW_CALL: CallFlags = CallFlags(0b0100);
    pub const ALLOW_NOTIFY: CallFlags = CallFlags(0b1000);
    pub const STATES: CallFlags = CallFlags(0b0011);
    pub const READ_ONLY: CallFlags = CallFlags(0b0101);
    pub const ALL: CallFlags = CallFlags(0b1111);

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl From<CallFlags> for u8 {
    fn from(flags: CallFlags) -> u8 {
        flags.0
    }
}

impl FromStr for CallFlags {
    type Err = String;

    /// Accepts `All`, `ReadOnly`, `ReadStates|AllowNotify` or a plain number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(bits) = s.trim().parse::<u8>() {
            return CallFlags::try_from(CallFlagsRepr::Bits(bits));
        }
        let mut bits = 0u8;
        for part in s.split(|c| c == '|' || c == ',') {
            bits |= match part.trim() {
                "None" => CallFlags::NONE.0,
                "ReadStates" => CallFlags::READ_STATES.0,
                "WriteStates" => CallFlags::WRITE_STATES.0,
                "AllowCall" => CallFlags::ALLOW_CALL.0,
                "AllowNotify" => CallFlags::ALLOW_NOTIFY.0,
                "States" => CallFlags::STATES.0,
                "ReadOnly" => CallFlags::READ_ONLY.0,
                "All" => CallFlags::ALL.0,
                other => return Err(format!("unknown call flag '{}'", other)),
            };
        }
        Ok(CallFlags(bits))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum CallFlagsRepr {
    Bits(u8),
    Names(String),
}

impl TryFrom<CallFlagsRepr> for CallFlags {
    type Error = String;

    fn try_from(repr: CallFlagsRepr) -> Result<Self, Self::Error> {
        match repr {
            CallFlagsRepr::Bits(bits) if bits & !CallFlags::ALL.0 == 0 => Ok(CallFlags(bits)),
            CallFlagsRepr::Bits(bits) => Err(format!("call flags 0x{:02x} out of range", bits)),
            CallFlagsRepr::Names(names) => names.parse(),
        }
    }
}

impl fmt::Display for CallFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let named = [
            (CallFlags::ALL, "All"),
            (CallFlags::READ_ONLY, "ReadOnly"),
            (CallFlags::STATES, "States"),
            (CallFlags::NONE, "None"),
        ];
        if let Some((_, name)) = named.iter().find(|(flags, _)| flags == self) {
            return f.write_str(name);
        }
        let parts = [
            (CallFlags::READ_STATES, "ReadStates"),
            (CallFlags::WRITE_STATES, "WriteStates"),
            (CallFlags::ALLOW_CALL, "AllowCall"),
            (CallFlags::ALLOW_NOTIFY, "AllowNotify"),
        ]
        .iter()
        .filter(|(flag, _)| self.0 & flag.0 != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>();
        f.write_str(&parts.join("|"))
    }
}

/// Reference to a method of another contract, called through `CALLT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodToken {
    pub hash: UInt160,
    pub method: String,
    pub parameters_count: u8,
    pub call_flags: CallFlags,
}

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({} params, {})",
            format_script_hash(&self.hash),
            self.method,
            self.parameters_count,
            self.call_flags
        )
    }
}

/// Primitive kinds a manifest can declare for parameters and return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractParameterType {
    Any,
    Boolean,
    Integer,
    ByteArray,
    String,
    Hash160,
    Hash256,
    PublicKey,
    Signature,
    Array,
    Map,
    InteropInterface,
    Void,
}

impl fmt::Display for ContractParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Runtime stack item types, used as the operand of `CONVERT`, `ISTYPE` and `NEWARRAY_T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StackItemType {
    Any = 0x00,
    Pointer = 0x10,
    Boolean = 0x20,
    Integer = 0x21,
    ByteString = 0x28,
    Buffer = 0x30,
    Array = 0x40,
    Struct = 0x41,
    Map = 0x48,
    InteropInterface = 0x60,
}

impl StackItemType {
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}
