use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod cli;
mod compiler;
mod opcodes;
mod types;
mod utils;

use cli::*;

#[derive(Parser)]
#[command(name = "nccs")]
#[command(about = "Compiles a C# contract semantic model into a NeoVM script and manifest")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a contract model (JSON) into .nef and .manifest.json
    Compile {
        /// Contract model file
        #[arg(short, long)]
        file: PathBuf,

        /// Output directory (defaults to the model's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the debug map
        #[arg(short, long)]
        debug: bool,

        /// Base name of the artifacts (defaults to the contract name)
        #[arg(short, long)]
        base_name: Option<String>,

        /// Source URL recorded in the NEF header
        #[arg(short, long)]
        source_url: Option<String>,

        /// Compiler name recorded in the NEF header
        #[arg(long)]
        compiler_name: Option<String>,
    },

    /// Print an instruction listing of a NEF file or raw script
    Disasm {
        /// NEF file
        #[arg(short, long, conflicts_with = "script")]
        file: Option<PathBuf>,

        /// Script as a hex string
        #[arg(short, long, conflicts_with = "file")]
        script: Option<String>,
    },

    /// Inspect a NEF file: header, checksum, tokens and opcode usage
    Analyze {
        /// NEF file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List the built-in syscall, native contract and inline capabilities
    Catalog,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    println!("{}", "🛠  nccs - NeoVM Contract Compiler".bright_cyan().bold());
    println!("{}", "═".repeat(50).bright_blue());

    match cli.command {
        Commands::Compile { file, output, debug, base_name, source_url, compiler_name } => {
            compile_command(CompileArgs { file, output, debug, base_name, source_url, compiler_name })?;
        }
        Commands::Disasm { file, script } => {
            disasm_command(file, script)?;
        }
        Commands::Analyze { file } => {
            analyze_command(file)?;
        }
        Commands::Catalog => {
            catalog_command()?;
        }
    }

    Ok(())
}
