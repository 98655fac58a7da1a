//! Compiled module model and its line-oriented textual form.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::sync::LazyLock;
use strum::{Display, EnumString};
use thiserror::Error;

/// `opcode`, optional argument (stopping before ` ; #`), optional debug
/// annotation.
static CODE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<op>\S+)(?: (?P<arg>.*?))??(?: ; (?P<dbg>#[\w$]+\(\d+\)))?$").unwrap()
});

/// Function entry-point label: `name.arity:`
static FUNC_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^.+\.[0-9]+:$").unwrap());

static DEBUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#(?P<module>[\w$]+)\((?P<line>\d+)\)$").unwrap());

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModuleFormatError {
    #[error("invalid opcode: {opcode}")]
    InvalidOpcode { opcode: String },
    #[error("invalid code line: {text}")]
    InvalidCodeLine { text: String },
    #[error("invalid section name: {name}")]
    InvalidSection { name: String },
    #[error("code line outside any section: {text}")]
    CodeOutsideSection { text: String },
    #[error("code line before any function label: {text}")]
    CodeOutsideFunction { text: String },
}

/// The complete opcode mnemonic set understood by the VM. Anything else in a
/// compiled module is invalid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum Opcode {
    #[strum(serialize = "load")]
    Load,
    #[strum(serialize = "load.const")]
    LoadConst,
    #[strum(serialize = "load.global")]
    LoadGlobal,
    #[strum(serialize = "load.outer")]
    LoadOuter,
    #[strum(serialize = "store")]
    Store,
    #[strum(serialize = "store.global")]
    StoreGlobal,
    #[strum(serialize = "store.outer")]
    StoreOuter,
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "mul")]
    Mul,
    #[strum(serialize = "div")]
    Div,
    #[strum(serialize = "mod")]
    Mod,
    #[strum(serialize = "concat")]
    Concat,
    #[strum(serialize = "lt")]
    Lt,
    #[strum(serialize = "le")]
    Le,
    #[strum(serialize = "gt")]
    Gt,
    #[strum(serialize = "ge")]
    Ge,
    #[strum(serialize = "eq")]
    Eq,
    #[strum(serialize = "ne")]
    Ne,
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "xor")]
    Xor,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "jmp")]
    Jmp,
    #[strum(serialize = "jmpeq")]
    JmpEq,
    #[strum(serialize = "jmpne")]
    JmpNe,
    #[strum(serialize = "jmplt")]
    JmpLt,
    #[strum(serialize = "jmple")]
    JmpLe,
    #[strum(serialize = "jmpgt")]
    JmpGt,
    #[strum(serialize = "jmpge")]
    JmpGe,
    #[strum(serialize = "get")]
    Get,
    #[strum(serialize = "get.index")]
    GetIndex,
    #[strum(serialize = "set")]
    Set,
    #[strum(serialize = "set.index")]
    SetIndex,
    #[strum(serialize = "set.op")]
    SetOp,
    #[strum(serialize = "dup")]
    Dup,
    #[strum(serialize = "unload")]
    Unload,
    #[strum(serialize = "mk_array")]
    MkArray,
    #[strum(serialize = "mk_hash")]
    MkHash,
    #[strum(serialize = "bind_refs")]
    BindRefs,
    #[strum(serialize = "mk_ref.native")]
    MkRefNative,
    #[strum(serialize = "mk_ref.udf")]
    MkRefUdf,
    #[strum(serialize = "call.native")]
    CallNative,
    #[strum(serialize = "call.udf")]
    CallUdf,
    #[strum(serialize = "invoke")]
    Invoke,
    #[strum(serialize = "emit")]
    Emit,
    #[strum(serialize = "ret")]
    Ret,
}

/// Section markers of the serialized module, in their fixed output order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum Section {
    #[strum(serialize = ".refs")]
    Refs,
    #[strum(serialize = ".imports")]
    Imports,
    #[strum(serialize = ".shared")]
    Shared,
    #[strum(serialize = ".data")]
    Data,
    #[strum(serialize = ".defs")]
    Defs,
    #[strum(serialize = ".entry")]
    Entry,
}

/// Source position annotation attached to generated opcodes: `#module(line)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub module: String,
    pub line: usize,
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}({})", self.module, self.line)
    }
}

/// One line of generated code: an opcode with optional argument, or a local
/// jump label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CodeLine {
    Op {
        op: Opcode,
        arg: Option<String>,
        debug: Option<DebugInfo>,
    },
    /// Jump target; serialized as `NAME:` (no debug annotation)
    Label(String),
}

impl CodeLine {
    pub fn op(op: Opcode, arg: Option<String>, debug: Option<DebugInfo>) -> Self {
        CodeLine::Op { op, arg, debug }
    }
}

impl fmt::Display for CodeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeLine::Op { op, arg, debug } => {
                write!(f, "{op}")?;
                if let Some(arg) = arg {
                    write!(f, " {arg}")?;
                }
                if let Some(debug) = debug {
                    write!(f, " ; {debug}")?;
                }
                Ok(())
            }
            CodeLine::Label(name) => write!(f, "{name}:"),
        }
    }
}

/// A compiled function: `label` has the form `name.arity` (serialized with a
/// trailing colon) and may be qualified as `module::name.arity` after linking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub label: String,
    pub ops: Vec<CodeLine>,
}

/// One compiled module: sections plus the global-slot count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModule {
    pub name: String,
    /// Referenced native module names (normalized set, serialized sorted)
    pub refs: BTreeSet<String>,
    /// Script module imports in declaration order
    pub imports: Vec<String>,
    /// Host-shared globals in declaration order; their slots start at zero
    pub shared_vars: Vec<String>,
    /// Constant data records, each a space-joined run of stringified values
    pub const_data: Vec<String>,
    pub functions: Vec<FunctionDef>,
    pub code_lines: Vec<CodeLine>,
    /// Number of global variable slots this module occupies
    pub n_globals: usize,
}

impl CompiledModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            refs: BTreeSet::new(),
            imports: Vec::new(),
            shared_vars: Vec::new(),
            const_data: Vec::new(),
            functions: Vec::new(),
            code_lines: Vec::new(),
            n_globals: 0,
        }
    }

    /// Serialize to the textual module format, sections in fixed order and
    /// only when non-empty.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();

        name_section(&mut lines, Section::Refs, self.refs.iter());
        name_section(&mut lines, Section::Imports, self.imports.iter());
        name_section(&mut lines, Section::Shared, self.shared_vars.iter());
        name_section(&mut lines, Section::Data, self.const_data.iter());

        if !self.functions.is_empty() {
            lines.push(Section::Defs.to_string());
            for func in &self.functions {
                lines.push(format!("{}:", func.label));
                for op in &func.ops {
                    lines.push(op.to_string());
                }
            }
        }

        if !self.code_lines.is_empty() {
            lines.push(Section::Entry.to_string());
            for op in &self.code_lines {
                lines.push(op.to_string());
            }
        }

        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.render().as_bytes())
    }

    /// Parse the textual module format back into a module. While reading
    /// `.entry`, `n_globals` is recovered from plain `store` arguments;
    /// shared variables keep it at least as large as their count.
    pub fn parse(name: &str, text: &str) -> Result<Self, ModuleFormatError> {
        let mut module = CompiledModule::new(name);
        let mut section: Option<Section> = None;
        let mut in_function = false;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('.') {
                let parsed = line.parse::<Section>().map_err(|_| {
                    ModuleFormatError::InvalidSection {
                        name: line.to_string(),
                    }
                })?;
                section = Some(parsed);
                in_function = false;
                continue;
            }

            match section {
                Some(Section::Refs) => {
                    module.refs.insert(line.to_string());
                }
                Some(Section::Imports) => module.imports.push(line.to_string()),
                Some(Section::Shared) => module.shared_vars.push(line.to_string()),
                Some(Section::Data) => module.const_data.push(line.to_string()),
                Some(Section::Defs) => {
                    if FUNC_LABEL_RE.is_match(line) {
                        module.functions.push(FunctionDef {
                            label: line[..line.len() - 1].to_string(),
                            ops: Vec::new(),
                        });
                        in_function = true;
                    } else {
                        let code = parse_code_line(line)?;
                        match module.functions.last_mut() {
                            Some(func) if in_function => func.ops.push(code),
                            _ => {
                                return Err(ModuleFormatError::CodeOutsideFunction {
                                    text: line.to_string(),
                                })
                            }
                        }
                    }
                }
                Some(Section::Entry) => {
                    let code = parse_code_line(line)?;
                    if let CodeLine::Op {
                        op: Opcode::Store,
                        arg: Some(arg),
                        ..
                    } = &code
                    {
                        if let Ok(slot) = arg.parse::<usize>() {
                            module.n_globals = module.n_globals.max(slot + 1);
                        }
                    }
                    module.code_lines.push(code);
                }
                None => {
                    return Err(ModuleFormatError::CodeOutsideSection {
                        text: line.to_string(),
                    })
                }
            }
        }

        module.n_globals = module.n_globals.max(module.shared_vars.len());
        Ok(module)
    }
}

fn name_section<'a>(
    lines: &mut Vec<String>,
    section: Section,
    names: impl Iterator<Item = &'a String>,
) {
    let mut names = names.peekable();
    if names.peek().is_some() {
        lines.push(section.to_string());
        lines.extend(names.cloned());
    }
}

fn parse_code_line(line: &str) -> Result<CodeLine, ModuleFormatError> {
    if let Some(label) = line.strip_suffix(':') {
        if !label.is_empty() && !label.contains(' ') {
            return Ok(CodeLine::Label(label.to_string()));
        }
    }

    let caps = CODE_LINE_RE
        .captures(line)
        .ok_or_else(|| ModuleFormatError::InvalidCodeLine {
            text: line.to_string(),
        })?;

    let op_text = caps.name("op").map(|m| m.as_str()).unwrap_or_default();
    let op = op_text
        .parse::<Opcode>()
        .map_err(|_| ModuleFormatError::InvalidOpcode {
            opcode: op_text.to_string(),
        })?;
    let arg = caps.name("arg").map(|m| m.as_str().to_string());
    let debug = match caps.name("dbg") {
        Some(m) => {
            let dbg_caps =
                DEBUG_RE
                    .captures(m.as_str())
                    .ok_or_else(|| ModuleFormatError::InvalidCodeLine {
                        text: line.to_string(),
                    })?;
            let line_no = dbg_caps["line"]
                .parse::<usize>()
                .map_err(|_| ModuleFormatError::InvalidCodeLine {
                    text: line.to_string(),
                })?;
            Some(DebugInfo {
                module: dbg_caps["module"].to_string(),
                line: line_no,
            })
        }
        None => None,
    };

    Ok(CodeLine::Op { op, arg, debug })
}
