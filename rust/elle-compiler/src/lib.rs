//! Elle Compiler
//!
//! Transforms Elle source text (`.l`) into textual stack-VM modules (`.lb`):
//! tokenizer → recursive-descent parser → single-pass code generator →
//! linker. The compiler core is self-contained; callers supply a
//! [`DependencyProvider`](compiler::linker::DependencyProvider) for script
//! imports and the location of native-module definition files.

pub mod compiler;
pub mod diagnostics;

use compiler::codegen::{CodeGen, CodeGenError, BUILTIN_MODULE};
use compiler::lexer::{self, LexError};
use compiler::linker::{DependencyProvider, LinkError, Linker};
use compiler::module::{CompiledModule, ModuleFormatError};
use compiler::parser::{ParseError, Parser};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Per-instance compiler configuration. Nothing is read from ambient state.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Directory holding `<name>.ld` native-module definition files
    pub defs_dir: PathBuf,
    /// Fixed seed for the jump-label counter. `None` draws a random offset,
    /// which keeps labels unique when linked modules are concatenated.
    pub label_seed: Option<u64>,
}

impl CompilerConfig {
    pub fn new(defs_dir: impl Into<PathBuf>) -> Self {
        Self {
            defs_dir: defs_dir.into(),
            label_seed: None,
        }
    }

    pub fn with_label_seed(mut self, seed: u64) -> Self {
        self.label_seed = Some(seed);
        self
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("code generation error: {0}")]
    CodeGen(#[from] CodeGenError),
    #[error("module format error: {0}")]
    Module(#[from] ModuleFormatError),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Compile one module from source text.
pub fn compile_module(
    name: &str,
    source: &str,
    config: &CompilerConfig,
) -> Result<CompiledModule, CompileError> {
    let tokens = lexer::tokenize(source)?;
    let ast = Parser::new(tokens, source).parse_to_ast()?;

    let mut generator = CodeGen::new(name, config);
    generator.load_native_module(BUILTIN_MODULE)?;
    Ok(generator.generate(&ast)?)
}

/// Compile the main module, link it with its imports, and write the merged
/// module to `output`.
pub fn compile_and_link<W: io::Write>(
    source: &str,
    config: &CompilerConfig,
    provider: &mut dyn DependencyProvider,
    output: &mut W,
) -> Result<CompiledModule, CompileError> {
    let main = compile_module("main", source, config)?;
    let linked = Linker::new(provider).link(main)?;
    linked.write_to(output)?;
    Ok(linked)
}
