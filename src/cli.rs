use crate::compiler::ast::ContractDecl;
use crate::compiler::catalog::Catalog;
use crate::compiler::nef::CompiledScript;
use crate::compiler::Compiler;
use crate::opcodes::{disassemble, DecodedInstruction, OpCode};
use crate::types::{format_script_hash, MethodToken};
use crate::utils::format_hex_bytes;
use anyhow::{Context, Result};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct CompileArgs {
    pub file: PathBuf,
    pub output: Option<PathBuf>,
    pub debug: bool,
    pub base_name: Option<String>,
    pub source_url: Option<String>,
    pub compiler_name: Option<String>,
}

pub fn compile_command(args: CompileArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading contract model {}", args.file.display()))?;
    let contract = ContractDecl::from_json(&text)
        .with_context(|| format!("parsing contract model {}", args.file.display()))?;

    println!("📄 {}: {}", "Model".bright_yellow(), args.file.display());
    println!("📝 {}: {}", "Contract".bright_yellow(), contract.name);
    println!();

    let mut compiler = Compiler::new().with_debug(args.debug);
    if let Some(url) = args.source_url {
        compiler = compiler.with_source_url(url);
    }
    if let Some(name) = args.compiler_name {
        compiler = compiler.with_compiler_name(name);
    }

    println!("{}", "🔄 Compiling...".bright_green());
    let output = match compiler.compile(&contract) {
        Ok(output) => output,
        Err(errors) => {
            println!("{}", "❌ Compilation failed".bright_red().bold());
            for error in errors.iter() {
                println!("  {}: {}", "Error".bright_red().bold(), error);
            }
            anyhow::bail!("{} error(s) in {}", errors.len(), contract.name);
        }
    };

    println!("{}", "✨ Compilation Results".bright_green().bold());
    println!("{}", "─".repeat(30).bright_green());
    println!("Script: {} bytes", output.nef.script.len().to_string().bright_cyan());
    println!("Checksum: {}", format!("0x{:08x}", output.nef.checksum).bright_cyan());
    println!("\n📋 ABI methods:");
    for method in &output.manifest.abi.methods {
        let safe = if method.safe { " (safe)".bright_green().to_string() } else { String::new() };
        println!(
            "  {:>5}  {}({}) -> {}{}",
            method.offset,
            method.name.bright_magenta(),
            method.parameters.iter().map(|p| format!("{}: {}", p.name, p.ty)).collect::<Vec<_>>().join(", "),
            method.returntype,
            safe
        );
    }
    if !output.nef.tokens.is_empty() {
        println!("\n🔗 Method tokens:");
        print_tokens(&output.nef.tokens);
    }

    let dir = match args.output {
        Some(dir) => dir,
        None => model_dir(&args.file),
    };
    let base_name = args.base_name.unwrap_or_else(|| contract.name.clone());
    let written = output
        .write_artifacts(&dir, &base_name)
        .with_context(|| format!("writing artifacts to {}", dir.display()))?;
    println!();
    for path in written {
        println!("💾 {}", path.display().to_string().bright_blue());
    }

    Ok(())
}

fn model_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn disasm_command(file: Option<PathBuf>, script: Option<String>) -> Result<()> {
    let (script, tokens) = if let Some(path) = file {
        let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let nef = CompiledScript::from_bytes(&data).with_context(|| format!("parsing {}", path.display()))?;
        println!("📦 {}: {}", "NEF".bright_yellow(), path.display());
        (nef.script, nef.tokens)
    } else if let Some(text) = script {
        (hex::decode(text.trim().trim_start_matches("0x")).context("decoding script hex")?, Vec::new())
    } else {
        anyhow::bail!("Must provide either --file or --script");
    };

    let instructions = disassemble(&script).context("disassembling script")?;
    let catalog = Catalog::builtin();

    println!("{}", "🔍 Instruction Listing".bright_cyan().bold());
    println!("{}", "─".repeat(50).bright_blue());
    for instruction in &instructions {
        let mut raw = vec![instruction.opcode.to_byte()];
        raw.extend_from_slice(&instruction.operand);
        let mut line = format!(
            "{}  {:<24} {:<12} {}",
            format!("{:04x}", instruction.offset).bright_blue(),
            format_hex_bytes(&raw),
            instruction.opcode.mnemonic().bright_green(),
            instruction.operand_text()
        );
        if let Some(note) = annotate(instruction, &catalog, &tokens) {
            line.push_str(&format!("  ; {}", note).bright_black().to_string());
        }
        println!("{}", line.trim_end());
    }
    println!("{}", "─".repeat(50).bright_blue());
    println!("{} instructions, {} bytes", instructions.len(), script.len());

    Ok(())
}

/// Human-readable name behind a `SYSCALL` id or `CALLT` token index.
fn annotate(instruction: &DecodedInstruction, catalog: &Catalog, tokens: &[MethodToken]) -> Option<String> {
    match instruction.opcode {
        OpCode::SYSCALL => {
            let id = u32::from_le_bytes(instruction.operand.as_slice().try_into().ok()?);
            Some(catalog.service_name(id).unwrap_or("unknown service").to_string())
        }
        OpCode::CALLT => {
            let index = u16::from_le_bytes(instruction.operand.as_slice().try_into().ok()?);
            Some(match tokens.get(index as usize) {
                Some(token) => token.to_string(),
                None => format!("token #{} (not in table)", index),
            })
        }
        _ => None,
    }
}

pub fn analyze_command(file: PathBuf) -> Result<()> {
    let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let nef = CompiledScript::from_bytes_unverified(&data).with_context(|| format!("parsing {}", file.display()))?;

    println!("{}", "🔍 NEF Analysis".bright_cyan().bold());
    println!("{}", "─".repeat(50).bright_blue());
    println!("Compiler: {}", nef.compiler.bright_cyan());
    println!("Source: {}", if nef.source.is_empty() { "-".to_string() } else { nef.source.clone() });
    println!("Size: {} bytes ({} script)", data.len(), nef.script.len());

    let expected = nef.expected_checksum();
    if expected == nef.checksum {
        println!("Checksum: 0x{:08x} {}", nef.checksum, "VALID".bright_green().bold());
    } else {
        println!(
            "Checksum: 0x{:08x} {} (expected 0x{:08x})",
            nef.checksum,
            "INVALID".bright_red().bold(),
            expected
        );
    }

    println!("\n🔗 Method tokens: {}", nef.tokens.len());
    print_tokens(&nef.tokens);

    let instructions = disassemble(&nef.script).context("disassembling script")?;
    let histogram = opcode_histogram(&instructions);
    println!("\n📊 Opcode usage ({} instructions):", instructions.len());
    let mut by_count: Vec<_> = histogram.iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (mnemonic, count) in by_count {
        println!("  {:<12} {}", mnemonic.bright_green(), count);
    }

    let (short, long) = branch_forms(&instructions);
    println!("\n↪️  Jumps, calls and try blocks: {} short, {} long", short, long);

    Ok(())
}

fn print_tokens(tokens: &[MethodToken]) {
    for (index, token) in tokens.iter().enumerate() {
        println!(
            "  #{:<3} {} {} params={} flags={}",
            index,
            format_script_hash(&token.hash).bright_blue(),
            token.method.bright_magenta(),
            token.parameters_count,
            token.call_flags
        );
    }
}

fn opcode_histogram(instructions: &[DecodedInstruction]) -> BTreeMap<&'static str, usize> {
    let mut histogram = BTreeMap::new();
    for instruction in instructions {
        *histogram.entry(instruction.opcode.mnemonic()).or_insert(0) += 1;
    }
    histogram
}

/// Counts instructions carrying relative offsets, by operand width.
fn branch_forms(instructions: &[DecodedInstruction]) -> (usize, usize) {
    instructions
        .iter()
        .filter(|i| i.opcode.offset_slots().is_some())
        .fold((0, 0), |(short, long), i| if i.opcode.is_long_form() { (short, long + 1) } else { (short + 1, long) })
}

pub fn catalog_command() -> Result<()> {
    let catalog = Catalog::builtin();
    println!("{}", "📚 Built-in Capabilities".bright_cyan().bold());
    println!("{}", "─".repeat(50).bright_blue());
    for entry in catalog.entries() {
        println!("  {}", entry);
    }
    println!("\n{} entries", catalog.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_and_branch_forms() {
        // JMPIFNOT +2, JMP_L +5, NOP, RET, NOP, RET
        let script = hex::decode("2602230500000021402140").unwrap();
        let instructions = disassemble(&script).unwrap();
        let histogram = opcode_histogram(&instructions);
        assert_eq!(histogram.get("NOP"), Some(&2));
        assert_eq!(histogram.get("RET"), Some(&2));
        assert_eq!(branch_forms(&instructions), (1, 1));
    }

    #[test]
    fn test_annotations() {
        let catalog = Catalog::builtin();
        let id = crate::utils::interop_hash("System.Runtime.Notify");
        let mut script = vec![0x41];
        script.extend_from_slice(&id.to_le_bytes());
        script.extend_from_slice(&[0x37, 0x05, 0x00]);
        let instructions = disassemble(&script).unwrap();
        assert_eq!(annotate(&instructions[0], &catalog, &[]).as_deref(), Some("System.Runtime.Notify"));
        assert_eq!(annotate(&instructions[1], &catalog, &[]).as_deref(), Some("token #5 (not in table)"));
    }

    #[test]
    fn test_model_dir() {
        assert_eq!(model_dir(Path::new("contract.json")), PathBuf::from("."));
        assert_eq!(model_dir(Path::new("out/contract.json")), PathBuf::from("out"));
    }
}
