//! Linker: resolves a module's imports through a dependency provider and
//! merges everything into one relocatable module for the VM.

use crate::compiler::module::{CodeLine, CompiledModule, Opcode};
use std::collections::HashSet;
use thiserror::Error;

/// Name of the merged output module.
pub const LINKED_MODULE_NAME: &str = "result";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("required module {name} not found")]
    MissingDependency { name: String },
    #[error("failed to load module {name}: {source}")]
    Dependency {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Resolves an imported module name to its compiled form. Whether the module
/// was compiled from source or read from a cache is the provider's business.
pub trait DependencyProvider {
    fn get_dependency(&mut self, name: &str) -> Result<CompiledModule, LinkError>;
}

/// Relocation offsets applied to a module being merged.
#[derive(Debug, Clone, Copy, Default)]
struct Offsets {
    global: usize,
    data: usize,
}

pub struct Linker<'a> {
    provider: &'a mut dyn DependencyProvider,
    visited: HashSet<String>,
}

impl<'a> Linker<'a> {
    pub fn new(provider: &'a mut dyn DependencyProvider) -> Self {
        Self {
            provider,
            visited: HashSet::new(),
        }
    }

    /// Link the main module with all of its transitive imports. Dependencies
    /// merge in depth-first declaration order; a module already merged is
    /// skipped, which also breaks import cycles.
    pub fn link(mut self, main: CompiledModule) -> Result<CompiledModule, LinkError> {
        self.merge_imports(main)
    }

    fn merge_imports(&mut self, target: CompiledModule) -> Result<CompiledModule, LinkError> {
        let import_names = target.imports.clone();
        let mut result = target;

        for name in import_names {
            if self.visited.contains(&name) {
                continue;
            }
            let dep = self.provider.get_dependency(&name)?;
            self.visited.insert(dep.name.clone());
            let dep = self.merge_imports(dep)?;
            result = merge(result, dep);
        }

        Ok(result)
    }
}

/// Merge `reference` under `accum`: the reference module's contents come
/// first, so its globals and constant data sit below the accumulator's and
/// the accumulator is relocated past them.
fn merge(mut accum: CompiledModule, mut reference: CompiledModule) -> CompiledModule {
    relocate(&mut reference, Offsets::default());
    relocate(
        &mut accum,
        Offsets {
            global: reference.n_globals,
            data: reference.const_data.len(),
        },
    );

    let mut out = CompiledModule::new(LINKED_MODULE_NAME);
    out.n_globals = reference.n_globals + accum.n_globals;

    out.refs = reference.refs;
    out.refs.extend(accum.refs);

    out.shared_vars = reference.shared_vars;
    out.shared_vars.extend(accum.shared_vars);

    out.const_data = reference.const_data;
    out.const_data.extend(accum.const_data);

    out.functions = reference.functions;
    out.functions.extend(accum.functions);

    out.code_lines = reference.code_lines;
    out.code_lines.extend(accum.code_lines);

    out
}

/// Qualify the module's names and shift its numeric indices so its code stays
/// correct inside the merged global frame and constant pool.
fn relocate(module: &mut CompiledModule, offsets: Offsets) {
    let module_name = module.name.clone();
    let imports = module.imports.clone();

    for func in &mut module.functions {
        if !func.label.contains("::") {
            func.label = format!("{module_name}::{}", func.label);
        }
    }

    for func in &mut module.functions {
        relocate_code(&mut func.ops, offsets, false, &module_name, &imports);
    }
    relocate_code(
        &mut module.code_lines,
        offsets,
        true,
        &module_name,
        &imports,
    );
}

fn relocate_code(
    code: &mut [CodeLine],
    offsets: Offsets,
    root: bool,
    module_name: &str,
    imports: &[String],
) {
    for line in code {
        let CodeLine::Op { op, arg, .. } = line else {
            continue;
        };
        let Some(arg) = arg else {
            continue;
        };

        match op {
            // Bare user-function names address this module unless they name
            // a script import; qualified names already address another one.
            Opcode::CallUdf | Opcode::MkRefUdf => {
                if !arg.contains("::") && !imports.iter().any(|import| import == arg) {
                    *arg = format!("{module_name}::{arg}");
                }
            }
            // An all-digits argument is a constant-data index
            Opcode::LoadConst => {
                if !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(index) = arg.parse::<usize>() {
                        *arg = (index + offsets.data).to_string();
                    }
                }
            }
            // Main code runs in the composite global frame
            Opcode::Load if root => {
                if let Some(slot) = arg.strip_prefix('#') {
                    if let Ok(index) = slot.parse::<usize>() {
                        *arg = format!("#{}", index + offsets.global);
                    }
                }
            }
            Opcode::Store if root => shift_index(arg, offsets.global),
            Opcode::LoadGlobal | Opcode::StoreGlobal => shift_index(arg, offsets.global),
            _ => {}
        }
    }
}

fn shift_index(arg: &mut String, offset: usize) {
    if let Ok(index) = arg.parse::<usize>() {
        *arg = (index + offset).to_string();
    }
}
