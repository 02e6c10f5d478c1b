use crate::compiler::nef::{check_token_method, NefError, MAX_TOKEN_METHOD};
use crate::opcodes::{OpCode, OperandSize};
use crate::types::{format_script_hash, parse_script_hash, CallFlags, MethodToken};
use crate::utils::interop_hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const NEO: &str = "0xef4073a0f2b305a38ec4050e4d3d28bc40ea63f5";
pub const GAS: &str = "0xd2a4cff31913016155e38e474a2c06d08be276cf";
pub const CONTRACT_MANAGEMENT: &str = "0xfffdc93764dbaddd97c48f252a53ea4643faa3fd";
pub const STD_LIB: &str = "0xacce6fd80d44e1796aa0c2c625e9e4e0ce39efc0";
pub const CRYPTO_LIB: &str = "0x726cb6e0cd8628a1350a611384688911ab75f51b";
pub const LEDGER: &str = "0xda65b600f7124ce6c79950c1772a36403104f2be";
pub const POLICY: &str = "0xcc5e4edd9f5f8dba8bb65734541df7a1c081c67b";
pub const ORACLE: &str = "0xfe924b7cfe89ddd271abaf7210a80a7e11178758";
pub const ROLE_MANAGEMENT: &str = "0x49cf4e5378ffcd4dec034fd98a174c5491e395e2";

pub const NOTIFY_SERVICE: &str = "System.Runtime.Notify";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("capability '{name}': invalid contract hash: {reason}")]
    InvalidHash { name: String, reason: String },
    #[error("capability '{name}': method name '{method}' is longer than {MAX_TOKEN_METHOD} bytes")]
    MethodNameTooLong { name: String, method: String },
    #[error("capability '{name}': method '{method}' is reserved and cannot be called through a token")]
    ReservedMethod { name: String, method: String },
    #[error("capability '{name}': inline opcode {opcode} takes an operand")]
    InlineOperand { name: String, opcode: OpCode },
    #[error("capability '{name}': empty inline sequence")]
    EmptyInline { name: String },
}

/// A capability binding as written in the semantic model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub name: String,
    #[serde(default)]
    pub params: u8,
    #[serde(default = "returns_value_default")]
    pub returns_value: bool,
    #[serde(flatten)]
    pub binding: Binding,
}

fn returns_value_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "binding", rename_all = "snake_case")]
pub enum Binding {
    Syscall {
        service: String,
    },
    Token {
        contract: String,
        method: String,
        #[serde(default = "all_flags")]
        call_flags: CallFlags,
    },
    Inline {
        opcodes: Vec<OpCode>,
    },
}

fn all_flags() -> CallFlags {
    CallFlags::ALL
}

/// How a resolved capability is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// `SYSCALL <id>`, arguments pushed last-first.
    Syscall { service: String, id: u32 },
    /// `CALLT <token>`, arguments pushed last-first.
    Token(MethodToken),
    /// Opcodes emitted in place, arguments pushed in declaration order.
    Inline(Vec<OpCode>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub params: usize,
    pub returns_value: bool,
    pub capability: Capability,
}

impl fmt::Display for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = format!("{}({}){}", self.name, self.params, if self.returns_value { "" } else { " void" });
        match &self.capability {
            Capability::Syscall { service, id } => write!(f, "{:<40} SYSCALL {} [0x{:08x}]", shape, service, id),
            Capability::Token(token) => {
                write!(f, "{:<40} CALLT {}::{} [{}]", shape, format_script_hash(&token.hash), token.method, token.call_flags)
            }
            Capability::Inline(opcodes) => {
                let ops = opcodes.iter().map(|op| op.mnemonic()).collect::<Vec<_>>();
                write!(f, "{:<40} {}", shape, ops.join(" "))
            }
        }
    }
}

impl CapabilityDecl {
    pub fn resolve(&self) -> Result<CatalogEntry, CatalogError> {
        let capability = match &self.binding {
            Binding::Syscall { service } => Capability::Syscall { service: service.clone(), id: interop_hash(service) },
            Binding::Token { contract, method, call_flags } => {
                let hash = parse_script_hash(contract)
                    .map_err(|reason| CatalogError::InvalidHash { name: self.name.clone(), reason })?;
                check_token_method(method).map_err(|e| match e {
                    NefError::ReservedTokenMethod(_) => {
                        CatalogError::ReservedMethod { name: self.name.clone(), method: method.clone() }
                    }
                    _ => CatalogError::MethodNameTooLong { name: self.name.clone(), method: method.clone() },
                })?;
                Capability::Token(MethodToken {
                    hash,
                    method: method.clone(),
                    parameters_count: self.params,
                    call_flags: *call_flags,
                })
            }
            Binding::Inline { opcodes } => {
                if opcodes.is_empty() {
                    return Err(CatalogError::EmptyInline { name: self.name.clone() });
                }
                if let Some(op) = opcodes.iter().find(|op| op.operand_size() != OperandSize::None) {
                    return Err(CatalogError::InlineOperand { name: self.name.clone(), opcode: *op });
                }
                Capability::Inline(opcodes.clone())
            }
        };
        Ok(CatalogEntry {
            name: self.name.clone(),
            params: self.params as usize,
            returns_value: self.returns_value,
            capability,
        })
    }
}

/// Name → capability table consulted by the converter for `Callee::Capability` calls.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Runtime and storage syscalls, native contract methods and inline helpers.
    pub fn builtin() -> Self {
        let mut catalog = Catalog::empty();
        for decl in builtin_decls() {
            // Built-in hashes and names are constants; a failure here is a table typo.
            match decl.resolve() {
                Ok(entry) => {
                    catalog.entries.insert(entry.name.clone(), entry);
                }
                Err(e) => log::error!("skipping built-in capability: {}", e),
            }
        }
        catalog
    }

    /// Adds model-declared capabilities; a declaration replaces a built-in of the same name.
    pub fn extend(&mut self, decls: &[CapabilityDecl]) -> Result<(), CatalogError> {
        for decl in decls {
            let entry = decl.resolve()?;
            if self.entries.contains_key(&entry.name) {
                log::warn!("capability '{}' overrides the built-in binding", entry.name);
            }
            self.entries.insert(entry.name.clone(), entry);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Service name behind a `SYSCALL` operand, for listings.
    pub fn service_name(&self, id: u32) -> Option<&str> {
        self.entries.values().find_map(|entry| match &entry.capability {
            Capability::Syscall { service, id: known } if *known == id => Some(service.as_str()),
            _ => None,
        })
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn syscall(name: &str, service: &str, params: u8, returns_value: bool) -> CapabilityDecl {
    CapabilityDecl {
        name: name.to_string(),
        params,
        returns_value,
        binding: Binding::Syscall { service: service.to_string() },
    }
}

fn token(name: &str, contract: &str, method: &str, params: u8, returns_value: bool, call_flags: CallFlags) -> CapabilityDecl {
    CapabilityDecl {
        name: name.to_string(),
        params,
        returns_value,
        binding: Binding::Token { contract: contract.to_string(), method: method.to_string(), call_flags },
    }
}

fn inline(name: &str, opcodes: &[OpCode], params: u8, returns_value: bool) -> CapabilityDecl {
    CapabilityDecl {
        name: name.to_string(),
        params,
        returns_value,
        binding: Binding::Inline { opcodes: opcodes.to_vec() },
    }
}

fn builtin_decls() -> Vec<CapabilityDecl> {
    use CallFlags as F;
    let mut decls = vec![
        syscall("Runtime.Log", "System.Runtime.Log", 1, false),
        syscall("Runtime.Notify", NOTIFY_SERVICE, 2, false),
        syscall("Runtime.CheckWitness", "System.Runtime.CheckWitness", 1, true),
        syscall("Runtime.Time", "System.Runtime.GetTime", 0, true),
        syscall("Runtime.Trigger", "System.Runtime.GetTrigger", 0, true),
        syscall("Runtime.Platform", "System.Runtime.Platform", 0, true),
        syscall("Runtime.GetNetwork", "System.Runtime.GetNetwork", 0, true),
        syscall("Runtime.GetRandom", "System.Runtime.GetRandom", 0, true),
        syscall("Runtime.GasLeft", "System.Runtime.GasLeft", 0, true),
        syscall("Runtime.BurnGas", "System.Runtime.BurnGas", 1, false),
        syscall("Runtime.ExecutingScriptHash", "System.Runtime.GetExecutingScriptHash", 0, true),
        syscall("Runtime.CallingScriptHash", "System.Runtime.GetCallingScriptHash", 0, true),
        syscall("Runtime.EntryScriptHash", "System.Runtime.GetEntryScriptHash", 0, true),
        syscall("Runtime.ScriptContainer", "System.Runtime.GetScriptContainer", 0, true),
        syscall("Storage.CurrentContext", "System.Storage.GetContext", 0, true),
        syscall("Storage.CurrentReadOnlyContext", "System.Storage.GetReadOnlyContext", 0, true),
        syscall("Storage.AsReadOnly", "System.Storage.AsReadOnly", 1, true),
        syscall("Storage.Get", "System.Storage.Get", 2, true),
        syscall("Storage.Put", "System.Storage.Put", 3, false),
        syscall("Storage.Delete", "System.Storage.Delete", 2, false),
        syscall("Storage.Find", "System.Storage.Find", 3, true),
        syscall("Iterator.Next", "System.Iterator.Next", 1, true),
        syscall("Iterator.Value", "System.Iterator.Value", 1, true),
        syscall("Contract.Call", "System.Contract.Call", 4, true),
        syscall("Contract.GetCallFlags", "System.Contract.GetCallFlags", 0, true),
        syscall("Contract.CreateStandardAccount", "System.Contract.CreateStandardAccount", 1, true),
        syscall("Contract.CreateMultisigAccount", "System.Contract.CreateMultisigAccount", 2, true),
        syscall("Crypto.CheckSig", "System.Crypto.CheckSig", 2, true),
        syscall("Crypto.CheckMultisig", "System.Crypto.CheckMultisig", 2, true),
    ];

    for (contract, hash) in [("NEO", NEO), ("GAS", GAS)] {
        decls.push(token(&format!("{}.Symbol", contract), hash, "symbol", 0, true, F::NONE));
        decls.push(token(&format!("{}.Decimals", contract), hash, "decimals", 0, true, F::NONE));
        decls.push(token(&format!("{}.TotalSupply", contract), hash, "totalSupply", 0, true, F::READ_STATES));
        decls.push(token(&format!("{}.BalanceOf", contract), hash, "balanceOf", 1, true, F::READ_STATES));
        decls.push(token(&format!("{}.Transfer", contract), hash, "transfer", 4, true, F::ALL));
    }

    decls.extend([
        token("NEO.Vote", NEO, "vote", 2, true, F::STATES),
        token("NEO.UnclaimedGas", NEO, "unclaimedGas", 2, true, F::READ_STATES),
        token("NEO.GetCommittee", NEO, "getCommittee", 0, true, F::READ_STATES),
        token("NEO.GetGasPerBlock", NEO, "getGasPerBlock", 0, true, F::READ_STATES),
        token("ContractManagement.GetContract", CONTRACT_MANAGEMENT, "getContract", 1, true, F::READ_STATES),
        token("ContractManagement.Deploy", CONTRACT_MANAGEMENT, "deploy", 2, true, F::ALL),
        token("ContractManagement.Update", CONTRACT_MANAGEMENT, "update", 3, false, F::ALL),
        token("ContractManagement.Destroy", CONTRACT_MANAGEMENT, "destroy", 0, false, F::ALL),
        token("StdLib.Serialize", STD_LIB, "serialize", 1, true, F::NONE),
        token("StdLib.Deserialize", STD_LIB, "deserialize", 1, true, F::NONE),
        token("StdLib.JsonSerialize", STD_LIB, "jsonSerialize", 1, true, F::NONE),
        token("StdLib.JsonDeserialize", STD_LIB, "jsonDeserialize", 1, true, F::NONE),
        token("StdLib.Itoa", STD_LIB, "itoa", 1, true, F::NONE),
        token("StdLib.Atoi", STD_LIB, "atoi", 1, true, F::NONE),
        token("StdLib.Base64Encode", STD_LIB, "base64Encode", 1, true, F::NONE),
        token("StdLib.Base64Decode", STD_LIB, "base64Decode", 1, true, F::NONE),
        token("StdLib.MemoryCompare", STD_LIB, "memoryCompare", 2, true, F::NONE),
        token("CryptoLib.Sha256", CRYPTO_LIB, "sha256", 1, true, F::NONE),
        token("CryptoLib.Ripemd160", CRYPTO_LIB, "ripemd160", 1, true, F::NONE),
        token("CryptoLib.VerifyWithECDsa", CRYPTO_LIB, "verifyWithECDsa", 4, true, F::NONE),
        token("Ledger.CurrentHash", LEDGER, "currentHash", 0, true, F::READ_STATES),
        token("Ledger.CurrentIndex", LEDGER, "currentIndex", 0, true, F::READ_STATES),
        token("Ledger.GetBlock", LEDGER, "getBlock", 1, true, F::READ_STATES),
        token("Ledger.GetTransaction", LEDGER, "getTransaction", 1, true, F::READ_STATES),
        token("Policy.GetFeePerByte", POLICY, "getFeePerByte", 0, true, F::READ_STATES),
        token("Policy.IsBlocked", POLICY, "isBlocked", 1, true, F::READ_STATES),
        token("Oracle.Request", ORACLE, "request", 5, false, CallFlags(F::STATES.0 | F::ALLOW_NOTIFY.0)),
        token("Oracle.GetPrice", ORACLE, "getPrice", 0, true, F::READ_STATES),
        token("RoleManagement.GetDesignatedByRole", ROLE_MANAGEMENT, "getDesignatedByRole", 2, true, F::READ_STATES),
    ]);

    decls.extend([
        inline("Helper.Concat", &[OpCode::CAT], 2, true),
        inline("Helper.Range", &[OpCode::SUBSTR], 3, true),
        inline("Helper.Take", &[OpCode::LEFT], 2, true),
        inline("Helper.Last", &[OpCode::RIGHT], 2, true),
        inline("Helper.Abs", &[OpCode::ABS], 1, true),
        inline("Helper.Sign", &[OpCode::SIGN], 1, true),
        inline("Helper.Min", &[OpCode::MIN], 2, true),
        inline("Helper.Max", &[OpCode::MAX], 2, true),
        inline("Helper.Pow", &[OpCode::POW], 2, true),
        inline("Helper.Sqrt", &[OpCode::SQRT], 1, true),
        inline("Helper.ModMultiply", &[OpCode::MODMUL], 3, true),
        inline("Helper.ModPow", &[OpCode::MODPOW], 3, true),
        inline("Helper.Within", &[OpCode::WITHIN], 3, true),
        inline("Helper.IsNull", &[OpCode::ISNULL], 1, true),
        inline("Helper.Assert", &[OpCode::ASSERT], 1, false),
        inline("Helper.Abort", &[OpCode::ABORT], 0, false),
        inline("List.Add", &[OpCode::APPEND], 2, false),
        inline("List.RemoveAt", &[OpCode::REMOVE], 2, false),
        inline("List.Clear", &[OpCode::CLEARITEMS], 1, false),
        inline("List.Pop", &[OpCode::POPITEM], 1, true),
        inline("List.Reverse", &[OpCode::REVERSEITEMS], 1, false),
        inline("Map.HasKey", &[OpCode::HASKEY], 2, true),
        inline("Map.Keys", &[OpCode::KEYS], 1, true),
        inline("Map.Values", &[OpCode::VALUES], 1, true),
        inline("Map.Remove", &[OpCode::REMOVE], 2, false),
    ]);
    decls
}
