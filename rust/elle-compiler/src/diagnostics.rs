//! Rendering of compile errors for the driver's diagnostic stream.

use crate::CompileError;

/// Human-readable stage name for an error.
pub fn stage(error: &CompileError) -> &'static str {
    match error {
        CompileError::Lex(_) => "tokenizer",
        CompileError::Parse(_) => "parser",
        CompileError::CodeGen(_) => "code generator",
        CompileError::Module(_) => "module loader",
        CompileError::Link(_) => "linker",
        CompileError::Io(_) => "io",
    }
}

/// Render a compile error as the multi-line report printed to stderr. Line
/// numbers and source context are carried by the error display itself.
pub fn report(error: &CompileError) -> String {
    format!("script compile error ({})\n{error}", stage(error))
}
