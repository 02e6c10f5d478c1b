//! Contract compiler: semantic model in, NEF container and manifest out.
//!
//! Passes run in a fixed order: every method is converted on its own, the
//! assembler links the blocks, and only then are the ABI, manifest and debug
//! map built from the final offsets.

pub mod abi;
pub mod assembler;
pub mod ast;
pub mod catalog;
pub mod convert;
pub mod debug_info;
pub mod emitter;
pub mod error;
pub mod jumps;
pub mod nef;
pub mod typeref;

#[cfg(test)]
mod tests;

use crate::compiler::abi::{build_abi, build_manifest, ContractManifest, INITIALIZE_METHOD};
use crate::compiler::assembler::{assemble, Assembly, TokenTable};
use crate::compiler::ast::{ContractDecl, Expression, MethodDecl, Statement};
use crate::compiler::catalog::Catalog;
use crate::compiler::convert::{ContractContext, MethodBlock, MethodConverter};
use crate::compiler::debug_info::{build_debug_info, DebugInfo};
use crate::compiler::nef::CompiledScript;
use crate::compiler::typeref::TypeRef;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

pub use error::{CompileError, CompileErrors};

#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Also produce the debug map.
    pub debug: bool,
    /// Written into the NEF compiler field.
    pub compiler_name: String,
    /// Overrides the model's source URL.
    pub source_url: Option<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            debug: false,
            compiler_name: format!("nccs-rs {}", env!("CARGO_PKG_VERSION")),
            source_url: None,
        }
    }
}

#[derive(Debug)]
pub struct CompilationOutput {
    pub nef: CompiledScript,
    pub manifest: ContractManifest,
    pub debug_info: Option<DebugInfo>,
    pub assembly: Assembly,
    pub blocks: Vec<MethodBlock>,
}

impl CompilationOutput {
    /// Writes `<base>.nef`, `<base>.manifest.json` and, when present,
    /// `<base>.debug.json` into `dir`.
    pub fn write_artifacts(&self, dir: &Path, base_name: &str) -> io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let invalid = |e: CompileError| io::Error::new(io::ErrorKind::InvalidData, e);

        let mut written = Vec::new();
        let nef_path = dir.join(format!("{}.nef", base_name));
        std::fs::write(&nef_path, self.nef.to_bytes())?;
        written.push(nef_path);

        let manifest_path = dir.join(format!("{}.manifest.json", base_name));
        std::fs::write(&manifest_path, self.manifest.to_json().map_err(invalid)?)?;
        written.push(manifest_path);

        if let Some(debug_info) = &self.debug_info {
            let debug_path = dir.join(format!("{}.debug.json", base_name));
            std::fs::write(&debug_path, debug_info.to_json().map_err(invalid)?)?;
            written.push(debug_path);
        }
        for path in &written {
            log::info!("wrote {}", path.display());
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: CompilerOptions,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.options.debug = debug;
        self
    }

    pub fn with_compiler_name(mut self, name: impl Into<String>) -> Self {
        self.options.compiler_name = name.into();
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.options.source_url = Some(url.into());
        self
    }

    /// Compiles one contract. Every method is converted even after an earlier
    /// one failed, so the returned batch lists all problems at once; only an
    /// internal error stops the run early.
    pub fn compile(&self, contract: &ContractDecl) -> Result<CompilationOutput, CompileErrors> {
        let mut catalog = Catalog::builtin();
        catalog
            .extend(&contract.capabilities)
            .map_err(|e| CompileError::unsupported(format!("capability declaration: {}", e)))?;

        let mut errors = CompileErrors::default();
        check_method_names(contract, &mut errors);
        if !errors.is_empty() {
            return Err(errors);
        }

        let context = ContractContext::new(contract, &catalog);
        let mut blocks = Vec::with_capacity(contract.methods.len() + 1);
        for method in &contract.methods {
            match MethodConverter::new(method, &context).run() {
                Ok(block) => blocks.push(block),
                Err(e) if e.is_internal() => return Err(e.into()),
                Err(e) => errors.push(e),
            }
        }

        if !contract.static_fields.is_empty() {
            let initialize = initializer(contract);
            match MethodConverter::new(&initialize, &context).with_static_slots(contract.static_fields.len()).run() {
                Ok(block) => blocks.push(block),
                Err(e) if e.is_internal() => return Err(e.into()),
                Err(e) => errors.push(e),
            }
        }
        errors.into_result()?;

        let assembly = assemble(&blocks, &mut TokenTable::new())?;
        let source = self.options.source_url.as_deref().or(contract.source_url.as_deref()).unwrap_or_default();
        let nef = assembly.to_nef(&self.options.compiler_name, source)?;

        let abi = build_abi(contract, &assembly.offsets())?;
        let manifest = build_manifest(contract, abi)?;

        let raised: BTreeSet<&str> = blocks.iter().flat_map(|b| b.raised_events.iter().map(String::as_str)).collect();
        for event in contract.events.iter().filter(|e| !raised.contains(e.name.as_str())) {
            log::warn!("event {} is declared but never raised", event.name);
        }

        let debug_info = self.options.debug.then(|| build_debug_info(contract, &blocks, &assembly));

        log::info!(
            "compiled {}: {} methods, {} script bytes, {} method tokens, {} long branches",
            manifest.name,
            blocks.len(),
            nef.script.len(),
            nef.tokens.len(),
            blocks.iter().map(|b| b.stats.widened).sum::<usize>()
        );
        Ok(CompilationOutput { nef, manifest, debug_info, assembly, blocks })
    }
}

fn check_method_names(contract: &ContractDecl, errors: &mut CompileErrors) {
    let mut seen = HashSet::new();
    for method in &contract.methods {
        if !seen.insert(method.name.as_str()) {
            errors.push(
                CompileError::unsupported(format!("overloaded method '{}'", method.name)).at(method.location.as_ref()),
            );
        }
        if method.name == INITIALIZE_METHOD && !contract.static_fields.is_empty() {
            errors.push(
                CompileError::unsupported(format!("method '{}' together with static field initialisers", INITIALIZE_METHOD))
                    .at(method.location.as_ref()),
            );
        }
    }
}

/// `_initialize`: one store per static field, in declaration order.
fn initializer(contract: &ContractDecl) -> MethodDecl {
    let body = contract
        .static_fields
        .iter()
        .map(|field| {
            let value = field.init.clone().unwrap_or_else(|| default_value(&field.ty));
            let stmt = Statement::expr(Expression::assign(Expression::variable(field.name.clone()), value));
            match &field.location {
                Some(location) => stmt.at(location.clone()),
                None => stmt,
            }
        })
        .collect();
    MethodDecl::new(INITIALIZE_METHOD).body(body)
}

fn default_value(ty: &TypeRef) -> Expression {
    match ty {
        TypeRef::Boolean => Expression::boolean(false),
        TypeRef::Integer => Expression::int(0),
        _ => Expression::null(),
    }
}
