//! Command-line interface of the `elle` binary.

use crate::resolver::LocalDependencyProvider;
use clap::Parser as ClapParser;
use elle_compiler::compiler::lexer;
use elle_compiler::compiler::module::CompiledModule;
use elle_compiler::compiler::parser::Parser;
use elle_compiler::{compile_and_link, CompileError, CompilerConfig};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(ClapParser, Debug)]
#[command(
    name = "elle",
    version,
    about = "Compile Elle source into a linked stack-VM module"
)]
pub struct Args {
    /// Source file; standard input when omitted
    pub input: Option<PathBuf>,

    /// Output file for the linked module; standard output when omitted
    pub output: Option<PathBuf>,

    /// Directory with native-module definition files
    /// [default: <install-dir>/../defs]
    #[arg(long)]
    pub defs_dir: Option<PathBuf>,

    /// Directory searched for library modules [default: <install-dir>/../lib]
    #[arg(long)]
    pub lib_dir: Option<PathBuf>,

    /// Fixed seed for loop labels, for reproducible output
    #[arg(long)]
    pub seed: Option<u64>,

    /// Parse only and print the syntax tree as JSON
    #[arg(long)]
    pub emit_ast: bool,

    /// Print linked-module statistics to stderr
    #[arg(long)]
    pub inspect: bool,

    /// Report dependency compilation and linking progress on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to serialize syntax tree: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn run(args: &Args) -> Result<(), CliError> {
    let source = read_source(args.input.as_deref())?;

    let install_dir = install_dir();
    let defs_dir = args
        .defs_dir
        .clone()
        .unwrap_or_else(|| install_dir.join("..").join("defs"));
    let lib_dir = args
        .lib_dir
        .clone()
        .unwrap_or_else(|| install_dir.join("..").join("lib"));

    let mut config = CompilerConfig::new(defs_dir);
    config.label_seed = args.seed;

    if args.emit_ast {
        let tokens = lexer::tokenize(&source).map_err(CompileError::from)?;
        let ast = Parser::new(tokens, &source)
            .parse_to_ast()
            .map_err(CompileError::from)?;
        let json = serde_json::to_string_pretty(&ast)?;
        let mut output = open_output(args.output.as_deref())?;
        writeln!(output, "{json}")?;
        return Ok(());
    }

    let base_dir = args
        .input
        .as_deref()
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut provider =
        LocalDependencyProvider::new(base_dir, lib_dir, config.clone(), args.verbose);
    let mut output = open_output(args.output.as_deref())?;
    let linked = compile_and_link(&source, &config, &mut provider, &mut output)?;

    if args.inspect {
        inspect(&linked);
    }
    Ok(())
}

fn read_source(input: Option<&Path>) -> Result<String, io::Error> {
    match input {
        Some(path) => fs::read_to_string(path),
        None => {
            let mut source = String::new();
            io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
    }
}

fn open_output(output: Option<&Path>) -> Result<Box<dyn Write>, io::Error> {
    match output {
        Some(path) => Ok(Box::new(fs::File::create(path)?)),
        None => Ok(Box::new(io::stdout())),
    }
}

fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Print merged-module statistics, the way the VM's tooling summarizes a
/// module.
fn inspect(module: &CompiledModule) {
    eprintln!("module name: {}", module.name);
    eprintln!("references: {}", module.refs.len());
    eprintln!("imports: {}", module.imports.len());
    eprintln!("shared variables: {}", module.shared_vars.len());
    eprintln!("constant data items: {}", module.const_data.len());
    eprintln!("functions: {}", module.functions.len());
    eprintln!("code lines: {}", module.code_lines.len());
    eprintln!("global slots: {}", module.n_globals);
}
