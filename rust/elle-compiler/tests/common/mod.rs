//! Shared helpers for the integration suites: a throwaway project layout
//! with builtin definitions and opcode-sequence assertions over rendered
//! module text.
#![allow(dead_code)]

use elle_compiler::compiler::module::CompiledModule;
use elle_compiler::{compile_module, CompilerConfig};
use std::fs;

pub const BUILTIN_DEFS: &str = "\
true
false
null
println.1
print.1
len.1
add_handler.2
_iter_create$.1
_iter_hasnext$.1
_iter_next$.1
";

pub struct Project {
    pub dir: tempfile::TempDir,
    pub config: CompilerConfig,
}

impl Project {
    /// Add a native-module definition file to the project.
    pub fn add_defs(&self, module: &str, text: &str) {
        fs::write(self.config.defs_dir.join(format!("{module}.ld")), text).unwrap();
    }
}

pub fn project() -> Project {
    project_with_seed(100_000)
}

pub fn project_with_seed(seed: u64) -> Project {
    let dir = tempfile::tempdir().unwrap();
    let defs = dir.path().join("defs");
    fs::create_dir(&defs).unwrap();
    fs::write(defs.join("$builtin.ld"), BUILTIN_DEFS).unwrap();
    let config = CompilerConfig::new(defs).with_label_seed(seed);
    Project { dir, config }
}

/// Compile one module with deterministic labels and render it.
pub fn compile_to_text(source: &str) -> String {
    compile(source).render()
}

pub fn compile(source: &str) -> CompiledModule {
    let project = project();
    compile_module("main", source, &project.config).unwrap()
}

/// Check that the opcodes appear in the rendered text in the given order
/// (not necessarily adjacent). Mirrors how the VM test harness validates
/// compiler output.
pub fn contains_op_sequence(text: &str, opcodes: &[&str]) -> bool {
    let mut remaining = opcodes.iter();
    let mut target = match remaining.next() {
        Some(first) => *first,
        None => return true,
    };

    for line in text.lines() {
        let op = line.split(' ').next().unwrap_or("");
        if op == target {
            match remaining.next() {
                Some(next) => target = next,
                None => return true,
            }
        }
    }
    false
}

pub fn assert_op_sequence(text: &str, opcodes: &[&str]) {
    assert!(
        contains_op_sequence(text, opcodes),
        "expected opcode sequence {opcodes:?} in:\n{text}"
    );
}
