//! Contract ABI and manifest.
//!
//! Built as the last pass, once the assembler has fixed every method offset.
//! Field order and key spelling of the JSON output are part of the format.

use crate::compiler::ast::{ContractDecl, MethodDecl, ParamDecl};
use crate::compiler::error::{CompileError, CompileErrors, Located};
use crate::compiler::typeref::TypeRef;
use crate::types::{parse_script_hash, ContractParameterType};
use crate::utils::lower_first;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};

pub const MAX_MANIFEST_SIZE: usize = u16::MAX as usize;
pub const INITIALIZE_METHOD: &str = "_initialize";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ContractParameterType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiMethod {
    pub name: String,
    pub parameters: Vec<AbiParameter>,
    pub returntype: ContractParameterType,
    pub offset: usize,
    pub safe: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEvent {
    pub name: String,
    pub parameters: Vec<AbiParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAbi {
    pub methods: Vec<AbiMethod>,
    pub events: Vec<AbiEvent>,
}

impl ContractAbi {
    #[cfg(test)]
    pub fn method(&self, name: &str) -> Option<&AbiMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// `"*"` or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WildcardList {
    Wildcard,
    List(Vec<String>),
}

impl WildcardList {
    fn from_names(names: &[String]) -> Self {
        if names.is_empty() || names.iter().any(|n| n == "*") {
            WildcardList::Wildcard
        } else {
            WildcardList::List(names.to_vec())
        }
    }
}

impl Serialize for WildcardList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WildcardList::Wildcard => serializer.serialize_str("*"),
            WildcardList::List(items) => items.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WildcardList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Star(String),
            List(Vec<String>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Star(star) if star == "*" => Ok(WildcardList::Wildcard),
            Repr::Star(other) => Err(D::Error::custom(format!("expected \"*\" or a list, got \"{}\"", other))),
            Repr::List(items) => Ok(WildcardList::List(items)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPermission {
    pub contract: String,
    pub methods: WildcardList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractGroup {
    pub pubkey: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractManifest {
    pub name: String,
    pub groups: Vec<ContractGroup>,
    pub features: serde_json::Map<String, serde_json::Value>,
    pub supportedstandards: Vec<String>,
    pub abi: ContractAbi,
    pub permissions: Vec<ContractPermission>,
    pub trusts: WildcardList,
    pub extra: Option<serde_json::Value>,
}

impl ContractManifest {
    pub fn to_json(&self) -> Result<String, CompileError> {
        serde_json::to_string(self).map_err(|e| CompileError::internal(format!("manifest serialization: {}", e)))
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        if self.name.is_empty() {
            return Err(CompileError::InvalidManifest("contract name is empty".into()));
        }

        let mut methods = HashSet::new();
        for method in &self.abi.methods {
            if method.name.is_empty() {
                return Err(CompileError::InvalidManifest("ABI method with an empty name".into()));
            }
            if !methods.insert((method.name.as_str(), method.parameters.len())) {
                return Err(CompileError::InvalidManifest(format!(
                    "ABI method '{}' with {} parameter(s) is declared twice",
                    method.name,
                    method.parameters.len()
                )));
            }
        }
        let mut events = HashSet::new();
        for event in &self.abi.events {
            if !events.insert(event.name.as_str()) {
                return Err(CompileError::InvalidManifest(format!("event '{}' is declared twice", event.name)));
            }
        }

        for permission in &self.permissions {
            if !is_contract_or_group(&permission.contract) {
                return Err(CompileError::InvalidManifest(format!(
                    "permission contract '{}' is neither \"*\", a script hash nor a group key",
                    permission.contract
                )));
            }
        }
        if let WildcardList::List(trusts) = &self.trusts {
            if let Some(bad) = trusts.iter().find(|t| !is_contract_or_group(t)) {
                return Err(CompileError::InvalidManifest(format!(
                    "trust '{}' is neither a script hash nor a group key",
                    bad
                )));
            }
        }

        let size = self.to_json()?.len();
        if size > MAX_MANIFEST_SIZE {
            return Err(CompileError::InvalidManifest(format!(
                "manifest is {} bytes, at most {} allowed",
                size, MAX_MANIFEST_SIZE
            )));
        }
        Ok(())
    }
}

fn is_contract_or_group(text: &str) -> bool {
    if text == "*" || parse_script_hash(text).is_ok() {
        return true;
    }
    // Compressed secp256r1 public key.
    matches!(hex::decode(text), Ok(key) if key.len() == 33 && (key[0] == 0x02 || key[0] == 0x03))
}

/// ABI name of a method: its display name, else its declared name with a
/// lower-case first letter.
pub fn abi_method_name(method: &MethodDecl) -> String {
    match &method.attributes.display_name {
        Some(name) => name.clone(),
        None => lower_first(&method.name),
    }
}

fn map_type(
    ty: &TypeRef,
    member: impl FnOnce() -> String,
    method: Option<&MethodDecl>,
    errors: &mut CompileErrors,
) -> ContractParameterType {
    match ty.abi_type() {
        Some(kind) => kind,
        None => {
            errors.push(CompileError::TypeMapping {
                member: member(),
                type_name: ty.to_string(),
                location: Located(method.and_then(|m| m.location.clone())),
            });
            ContractParameterType::Any
        }
    }
}

fn map_params(owner: &str, params: &[ParamDecl], method: Option<&MethodDecl>, errors: &mut CompileErrors) -> Vec<AbiParameter> {
    params
        .iter()
        .map(|param| AbiParameter {
            name: param.name.clone(),
            ty: map_type(&param.ty, || format!("parameter '{}' of {}", param.name, owner), method, errors),
        })
        .collect()
}

/// Public methods, the static initialiser when one was generated, and every
/// declared event. Every unmappable type is reported, not just the first.
pub fn build_abi(contract: &ContractDecl, offsets: &HashMap<String, usize>) -> Result<ContractAbi, CompileErrors> {
    let mut errors = CompileErrors::default();
    let mut methods = Vec::new();

    for method in contract.methods.iter().filter(|m| m.attributes.public) {
        let owner = format!("method '{}'", method.name);
        let parameters = map_params(&owner, &method.params, Some(method), &mut errors);
        let returntype = map_type(&method.return_type, || format!("return value of {}", owner), Some(method), &mut errors);
        let Some(&offset) = offsets.get(&method.name) else {
            errors.push(CompileError::internal(format!("no script offset for public method '{}'", method.name)));
            continue;
        };
        methods.push(AbiMethod {
            name: abi_method_name(method),
            parameters,
            returntype,
            offset,
            safe: method.attributes.safe,
        });
    }
    if let Some(&offset) = offsets.get(INITIALIZE_METHOD) {
        methods.push(AbiMethod {
            name: INITIALIZE_METHOD.to_string(),
            parameters: Vec::new(),
            returntype: ContractParameterType::Void,
            offset,
            safe: false,
        });
    }

    let events = contract
        .events
        .iter()
        .map(|event| AbiEvent {
            name: event.display_name.clone().unwrap_or_else(|| event.name.clone()),
            parameters: map_params(&format!("event '{}'", event.name), &event.params, None, &mut errors),
        })
        .collect();

    if errors.is_empty() {
        Ok(ContractAbi { methods, events })
    } else {
        Err(errors)
    }
}

/// Wraps `abi` with the contract-level declarations and validates the result.
pub fn build_manifest(contract: &ContractDecl, abi: ContractAbi) -> Result<ContractManifest, CompileError> {
    let permissions = if contract.permissions.is_empty() {
        vec![ContractPermission { contract: "*".into(), methods: WildcardList::Wildcard }]
    } else {
        contract
            .permissions
            .iter()
            .map(|p| ContractPermission { contract: p.contract.clone(), methods: WildcardList::from_names(&p.methods) })
            .collect()
    };
    let trusts = if contract.trusts.iter().any(|t| t == "*") {
        WildcardList::Wildcard
    } else {
        WildcardList::List(contract.trusts.clone())
    };

    let manifest = ContractManifest {
        name: contract.manifest_name().to_string(),
        groups: Vec::new(),
        features: serde_json::Map::new(),
        supportedstandards: contract.supported_standards.clone(),
        abi,
        permissions,
        trusts,
        extra: contract.extra.clone().map(serde_json::Value::Object),
    };
    manifest.validate()?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{ContractDecl, MethodDecl, PermissionDecl};

    fn offsets(entries: &[(&str, usize)]) -> HashMap<String, usize> {
        entries.iter().map(|(name, offset)| (name.to_string(), *offset)).collect()
    }

    #[test]
    fn test_method_names_are_lowercased() {
        let contract = ContractDecl::new("Oracle")
            .method(MethodDecl::new("DoRequest").public())
            .method(MethodDecl::new("Callback").public().display_name("OnOracle"))
            .method(MethodDecl::new("Hidden"));
        let abi = build_abi(&contract, &offsets(&[("DoRequest", 0), ("Callback", 7), ("Hidden", 12)])).unwrap();
        let names: Vec<&str> = abi.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["doRequest", "OnOracle"]);
        assert_eq!(abi.method("OnOracle").unwrap().offset, 7);
    }

    #[test]
    fn test_manifest_json_shape() {
        let contract = ContractDecl::new("HelloContract")
            .method(MethodDecl::new("SayHello").public().safe().returns(TypeRef::String))
            .event("Greeted", vec![ParamDecl { name: "who".into(), ty: TypeRef::Hash160 }]);
        let abi = build_abi(&contract, &offsets(&[("SayHello", 0)])).unwrap();
        let manifest = build_manifest(&contract, abi).unwrap();
        assert_eq!(
            manifest.to_json().unwrap(),
            concat!(
                r#"{"name":"HelloContract","groups":[],"features":{},"supportedstandards":[],"#,
                r#""abi":{"methods":[{"name":"sayHello","parameters":[],"returntype":"String","offset":0,"safe":true}],"#,
                r#""events":[{"name":"Greeted","parameters":[{"name":"who","type":"Hash160"}]}]},"#,
                r#""permissions":[{"contract":"*","methods":"*"}],"trusts":[],"extra":null}"#
            )
        );
        let parsed: ContractManifest = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_every_unmappable_type_is_reported() {
        let contract = ContractDecl::new("C").method(
            MethodDecl::new("Get")
                .public()
                .param("a", TypeRef::Named("Widget".into()))
                .returns(TypeRef::Named("Gadget".into())),
        );
        let errors = build_abi(&contract, &offsets(&[("Get", 0)])).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, CompileError::TypeMapping { .. })));
        assert!(errors.to_string().contains("Widget"));
    }

    #[test]
    fn test_initializer_is_listed() {
        let contract = ContractDecl::new("C");
        let abi = build_abi(&contract, &offsets(&[(INITIALIZE_METHOD, 3)])).unwrap();
        assert_eq!(abi.methods[0].name, "_initialize");
        assert_eq!(abi.methods[0].returntype, ContractParameterType::Void);
        assert_eq!(abi.methods[0].offset, 3);
    }

    #[test]
    fn test_overloads_with_same_arity_are_rejected() {
        let contract = ContractDecl::new("C")
            .method(MethodDecl::new("Run").public())
            .method(MethodDecl::new("Execute").public().display_name("run"));
        let abi = build_abi(&contract, &offsets(&[("Run", 0), ("Execute", 1)])).unwrap();
        let err = build_manifest(&contract, abi).unwrap_err();
        assert!(matches!(err, CompileError::InvalidManifest(_)));
    }

    #[test]
    fn test_permissions_and_trusts() {
        let mut contract = ContractDecl::new("C");
        contract.permissions = vec![PermissionDecl {
            contract: "0xd2a4cff31913016155e38e474a2c06d08be276cf".into(),
            methods: vec!["transfer".into()],
        }];
        contract.trusts = vec!["*".into()];
        let manifest = build_manifest(&contract, ContractAbi::default()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["permissions"][0]["methods"], serde_json::json!(["transfer"]));
        assert_eq!(json["trusts"], "*");

        contract.trusts = vec!["not-a-hash".into()];
        assert!(matches!(build_manifest(&contract, ContractAbi::default()), Err(CompileError::InvalidManifest(_))));
    }

    #[test]
    fn test_manifest_size_limit() {
        let mut contract = ContractDecl::new("C");
        let mut extra = serde_json::Map::new();
        extra.insert("Description".into(), serde_json::Value::String("x".repeat(MAX_MANIFEST_SIZE)));
        contract.extra = Some(extra);
        let err = build_manifest(&contract, ContractAbi::default()).unwrap_err();
        assert!(err.to_string().contains("at most 65535"));
    }
}
