//! Single-pass code generator: walks the syntax tree and emits the linear
//! opcode sequence of one compiled module.

use crate::compiler::ast::*;
use crate::compiler::defs::ModuleDefs;
use crate::compiler::module::{
    CodeLine, CompiledModule, DebugInfo, FunctionDef, Opcode, Section,
};
use crate::CompilerConfig;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Module holding the always-available native names.
pub const BUILTIN_MODULE: &str = "$builtin";

const GLOBAL_SCOPE: usize = 0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodeGenError {
    #[error("module has no statements")]
    EmptyModule,
    #[error("scope {name} not found (line {line})")]
    ScopeNotFound { name: String, line: usize },
    #[error("variable {name} is not defined in any enclosing scope (line {line})")]
    UnresolvedVariable { name: String, line: usize },
    #[error("invalid module name: {name} (line {line})")]
    InvalidModule { name: String, line: usize },
    #[error("constant {name} not found in module {module} (line {line})")]
    UnknownConstant {
        name: String,
        module: String,
        line: usize,
    },
    #[error("break or continue outside the loop (line {line})")]
    LoopControlOutsideLoop { line: usize },
    #[error("undefined functions: {}", names.join(", "))]
    UndefinedFunctions { names: Vec<String> },
    #[error("definitions for module {module} are unavailable (line {line}): {reason}")]
    ModuleDefsUnavailable {
        module: String,
        line: usize,
        reason: String,
    },
}

/// Direction of a deferred variable access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarAccess {
    Load,
    Store,
}

/// One item of the growing emission list. Deferred variable references are
/// rewritten in place once all scopes are known.
#[derive(Debug, Clone)]
enum GenItem {
    Op {
        op: Opcode,
        arg: Option<String>,
        line: Option<usize>,
    },
    Label(String),
    Section(Section),
    Deferred {
        access: VarAccess,
        name: String,
        line: Option<usize>,
    },
}

/// Position of a deferred opcode plus the scope it was emitted in.
#[derive(Debug, Clone, Copy)]
struct DeferredRef {
    index: usize,
    scope: usize,
}

/// Global or function scope. Scopes live in an arena and reference their
/// parent by index; they are kept after a function body is generated so
/// deferred references can be resolved against the full chain.
#[derive(Debug)]
struct Scope {
    name: String,
    parent: Option<usize>,
    /// Local name → dense slot index, in declaration order
    variables: HashMap<String, usize>,
    /// Names declared by `use` to live in an enclosing or shared scope
    outer_refs: HashSet<String>,
    /// Ids of loops currently being generated, innermost last
    loops: Vec<u64>,
}

impl Scope {
    fn new(name: impl Into<String>, parent: Option<usize>) -> Self {
        Self {
            name: name.into(),
            parent,
            variables: HashMap::new(),
            outer_refs: HashSet::new(),
            loops: Vec::new(),
        }
    }
}

/// Result of resolving a name against the current scope.
enum Lookup {
    Local(usize),
    /// Declared `use`; the slot is found later in an enclosing scope
    Outer,
    /// Not bound in this scope at all
    Unknown,
}

pub struct CodeGen<'a> {
    module_name: String,
    config: &'a CompilerConfig,
    scopes: Vec<Scope>,
    current: usize,
    defined_funcs: HashSet<String>,
    function_refs: HashSet<String>,
    deferred: Vec<DeferredRef>,
    generated: Vec<GenItem>,
    shared_vars: Vec<String>,
    imports: Vec<String>,
    native_refs: BTreeMap<String, ModuleDefs>,
    const_data: Vec<String>,
    last_was_ret: bool,
    next_label_id: u64,
    /// Source lines of the nodes currently being generated; errors bind to
    /// the innermost one.
    line_stack: Vec<usize>,
}

impl<'a> CodeGen<'a> {
    pub fn new(module_name: impl Into<String>, config: &'a CompilerConfig) -> Self {
        // Loop labels survive textual concatenation by the linker, so each
        // module starts its counter at a randomized offset unless a fixed
        // seed is configured.
        let seed = config
            .label_seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..=100u64) * 100_000);
        Self {
            module_name: module_name.into(),
            config,
            scopes: Vec::new(),
            current: GLOBAL_SCOPE,
            defined_funcs: HashSet::new(),
            function_refs: HashSet::new(),
            deferred: Vec::new(),
            generated: Vec::new(),
            shared_vars: Vec::new(),
            imports: Vec::new(),
            native_refs: BTreeMap::new(),
            const_data: Vec::new(),
            last_was_ret: false,
            next_label_id: seed,
            line_stack: Vec::new(),
        }
    }

    /// Load `<name>.ld` from the configured definitions directory.
    pub fn load_native_module(&mut self, name: &str) -> Result<(), CodeGenError> {
        let defs = ModuleDefs::load(&self.config.defs_dir, name).map_err(|err| {
            CodeGenError::ModuleDefsUnavailable {
                module: name.to_string(),
                line: self.err_line(),
                reason: err.to_string(),
            }
        })?;
        self.register_native_module(name, defs);
        Ok(())
    }

    /// Register native-module definitions directly, for hosts that do not
    /// keep them in `.ld` files.
    pub fn register_native_module(&mut self, name: &str, defs: ModuleDefs) {
        self.native_refs.insert(name.to_string(), defs);
    }

    /// Generate the compiled module for a parsed program.
    pub fn generate(&mut self, root: &Block) -> Result<CompiledModule, CodeGenError> {
        if root.statements.is_empty() {
            return Err(CodeGenError::EmptyModule);
        }

        // Function definitions section, if the program has any
        for stmt in &root.statements {
            if matches!(stmt, Stmt::Func(_)) {
                self.generated.push(GenItem::Section(Section::Defs));
                break;
            }
            if !stmt.is_directive() {
                break;
            }
        }

        // Entry point: first statement that is neither a definition nor a
        // directive
        let entry_index = root
            .statements
            .iter()
            .position(|stmt| !matches!(stmt, Stmt::Func(_)) && !stmt.is_directive());

        self.scopes.push(Scope::new("global", None));
        self.current = GLOBAL_SCOPE;

        for (idx, stmt) in root.statements.iter().enumerate() {
            if Some(idx) == entry_index {
                self.generated.push(GenItem::Section(Section::Entry));
            }
            self.gen_stmt(stmt)?;
        }

        self.resolve_deferred()?;
        self.check_function_refs()?;

        Ok(self.write_out())
    }

    // ── Emission ──

    fn cur_line(&self) -> Option<usize> {
        self.line_stack.last().copied()
    }

    fn err_line(&self) -> usize {
        self.cur_line().unwrap_or(0)
    }

    fn emit(&mut self, op: Opcode, arg: Option<String>) {
        self.last_was_ret = op == Opcode::Ret;
        let line = self.cur_line();
        self.generated.push(GenItem::Op { op, arg, line });
    }

    fn emit_label(&mut self, name: String) {
        self.last_was_ret = false;
        self.generated.push(GenItem::Label(name));
    }

    /// Emit a variable access whose slot is not known yet; its position is
    /// recorded and the opcode is rewritten after the walk.
    fn defer(&mut self, access: VarAccess, name: &str) {
        self.last_was_ret = false;
        self.deferred.push(DeferredRef {
            index: self.generated.len(),
            scope: self.current,
        });
        let line = self.cur_line();
        self.generated.push(GenItem::Deferred {
            access,
            name: name.to_string(),
            line,
        });
    }

    fn new_label_id(&mut self) -> u64 {
        self.next_label_id += 1;
        self.next_label_id
    }

    // ── Scopes ──

    fn scope_by_name(&self, name: Option<&str>) -> Result<usize, CodeGenError> {
        match name {
            None => Ok(GLOBAL_SCOPE),
            Some(name) => self
                .scopes
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| CodeGenError::ScopeNotFound {
                    name: name.to_string(),
                    line: self.err_line(),
                }),
        }
    }

    fn add_scope(&mut self, name: &str, parent: usize) {
        self.scopes.push(Scope::new(name, Some(parent)));
        self.current = self.scopes.len() - 1;
    }

    /// Bind a name in the current scope, allocating the next dense index on
    /// first sight. Returns `None` when the name is declared `use` and must
    /// resolve in an enclosing scope.
    fn put_scope_var(&mut self, name: &str) -> Option<usize> {
        let scope = &mut self.scopes[self.current];
        if let Some(&idx) = scope.variables.get(name) {
            return Some(idx);
        }
        if scope.outer_refs.contains(name) {
            return None;
        }
        let idx = scope.variables.len();
        scope.variables.insert(name.to_string(), idx);
        Some(idx)
    }

    fn lookup_var(&self, name: &str) -> Lookup {
        let scope = &self.scopes[self.current];
        if let Some(&idx) = scope.variables.get(name) {
            Lookup::Local(idx)
        } else if scope.outer_refs.contains(name) {
            Lookup::Outer
        } else {
            Lookup::Unknown
        }
    }

    // ── Native modules ──

    fn is_native_func(&self, module: &str, name: &str) -> bool {
        self.native_refs
            .get(module)
            .is_some_and(|defs| defs.is_func(name))
    }

    fn is_builtin(&self, name: &str) -> bool {
        self.native_refs
            .get(BUILTIN_MODULE)
            .is_some_and(|defs| defs.contains(name))
    }

    // ── Statements ──

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        self.line_stack.push(stmt.line());
        let result = self.gen_stmt_inner(stmt);
        self.line_stack.pop();
        result
    }

    fn gen_stmt_inner(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::Call(expr) => self.gen_expr(expr),
            Stmt::Assign { name, expr, .. } => {
                self.gen_expr(expr)?;
                match self.put_scope_var(name) {
                    Some(idx) => self.emit(Opcode::Store, Some(idx.to_string())),
                    None => self.defer(VarAccess::Store, name),
                }
                Ok(())
            }
            Stmt::SetItem {
                target,
                index,
                value,
                op,
                ..
            } => self.gen_set_item(target, index, value, *op),
            Stmt::If {
                branches,
                else_block,
                ..
            } => self.gen_if_statement(branches, else_block.as_ref()),
            Stmt::While { cond, body, .. } => self.gen_while(cond, body),
            Stmt::ForEach {
                iter, var, body, ..
            } => self.gen_for_each(iter, var, body),
            Stmt::LoopCtl { kind, depth, .. } => self.gen_loop_ctl(*kind, *depth),
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.gen_expr(value)?;
                }
                self.emit(Opcode::Ret, None);
                Ok(())
            }
            Stmt::Emit { value, name, .. } => {
                self.gen_expr(value)?;
                let arg = name.as_ref().map(|n| format!("\"{n}\""));
                self.emit(Opcode::Emit, arg);
                Ok(())
            }
            Stmt::Func(def) => self.gen_func_def(def),
            Stmt::Use { names, .. } => {
                if self.current == GLOBAL_SCOPE {
                    // Shared with the host: slots in declaration order
                    for name in names {
                        self.shared_vars.push(name.clone());
                        self.put_scope_var(name);
                    }
                } else {
                    let scope = &mut self.scopes[self.current];
                    scope.outer_refs.extend(names.iter().cloned());
                }
                Ok(())
            }
            Stmt::Import {
                native, modules, ..
            } => {
                for module in modules {
                    if *native {
                        if !self.native_refs.contains_key(module) {
                            self.load_native_module(module)?;
                        }
                    } else if !self.imports.contains(module) {
                        self.imports.push(module.clone());
                    }
                }
                Ok(())
            }
        }
    }

    fn gen_block(&mut self, block: &Block) -> Result<(), CodeGenError> {
        for stmt in &block.statements {
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn gen_func_def(&mut self, def: &FuncDef) -> Result<(), CodeGenError> {
        self.defined_funcs.insert(def.name.clone());

        let parent = self.scope_by_name(def.scope_name.as_deref())?;
        self.add_scope(&def.name, parent);

        for param in &def.params {
            self.put_scope_var(param);
        }

        self.emit_label(format!("{}.{}", def.name, def.params.len()));
        self.gen_block(&def.body)?;
        if !self.last_was_ret {
            self.emit(Opcode::Ret, None);
        }

        // Scopes stay in the arena for deferred resolution
        self.current = GLOBAL_SCOPE;
        Ok(())
    }

    fn gen_set_item(
        &mut self,
        target: &Expr,
        index: &Expr,
        value: &Expr,
        op: Option<MathOp>,
    ) -> Result<(), CodeGenError> {
        self.gen_expr(value)?;
        self.gen_expr(target)?;

        match op {
            None => match index {
                Expr::Number { value, .. } => {
                    self.emit(Opcode::SetIndex, Some(format_number(*value)))
                }
                Expr::Str { value, .. } => self.emit(Opcode::SetIndex, Some(value.clone())),
                _ => {
                    self.gen_expr(index)?;
                    self.emit(Opcode::Set, None);
                }
            },
            Some(op) => {
                self.gen_expr(index)?;
                self.emit(Opcode::SetOp, Some(math_opcode(op).to_string()));
            }
        }
        Ok(())
    }

    // ── Conditionals ──

    /// Emit a branch condition. Comparisons jump directly; other expressions
    /// are tested against a boolean constant. Without an else branch the
    /// comparison is inverted so falling through enters the branch body.
    fn gen_if_cond(
        &mut self,
        cond: &Expr,
        has_else: bool,
        branch_label: &str,
    ) -> Result<(), CodeGenError> {
        if let Expr::Cmp { l, r, op, .. } = cond {
            self.gen_expr(l)?;
            self.gen_expr(r)?;
            let cmp = if has_else { *op } else { op.inverse() };
            self.emit(jmp_opcode(cmp), Some(branch_label.to_string()));
        } else {
            self.gen_expr(cond)?;
            let expected = if has_else { "true" } else { "false" };
            self.emit(Opcode::LoadConst, Some(expected.to_string()));
            self.emit(Opcode::JmpEq, Some(branch_label.to_string()));
        }
        Ok(())
    }

    fn gen_if_expr(
        &mut self,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
    ) -> Result<(), CodeGenError> {
        let id = self.new_label_id();
        let end_label = format!("IFE_END_{id}");
        let true_label = format!("IFE_TB_{id}");

        self.gen_if_cond(cond, true, &true_label)?;
        self.gen_expr(else_expr)?;
        self.emit(Opcode::Jmp, Some(end_label.clone()));
        self.emit_label(true_label);
        self.gen_expr(then_expr)?;
        self.emit_label(end_label);
        Ok(())
    }

    fn gen_if_statement(
        &mut self,
        branches: &[(Expr, Block)],
        else_block: Option<&Block>,
    ) -> Result<(), CodeGenError> {
        let id = self.new_label_id();
        let end_label = format!("IF_END_{id}");

        if let Some(else_block) = else_block {
            // Jump to the matching branch, fall through into else
            for (idx, (cond, _)) in branches.iter().enumerate() {
                let branch_label = format!("IF_C_{id}_{}", idx + 1);
                self.gen_if_cond(cond, true, &branch_label)?;
            }

            self.gen_block(else_block)?;
            self.emit(Opcode::Jmp, Some(end_label.clone()));
            for (idx, (_, block)) in branches.iter().enumerate() {
                self.emit_label(format!("IF_C_{id}_{}", idx + 1));
                self.gen_block(block)?;
                if idx < branches.len() - 1 {
                    self.emit(Opcode::Jmp, Some(end_label.clone()));
                }
            }
        } else {
            // Inverted conditions skip each branch body on falsehood
            for (idx, (cond, block)) in branches.iter().enumerate() {
                let jmp_label = if idx < branches.len() - 1 {
                    format!("IF_C_{id}_{}", idx + 2)
                } else {
                    end_label.clone()
                };
                self.gen_if_cond(cond, false, &jmp_label)?;
                self.gen_block(block)?;
                if jmp_label != end_label {
                    self.emit(Opcode::Jmp, Some(end_label.clone()));
                    self.emit_label(jmp_label);
                }
            }
        }

        self.emit_label(end_label);
        Ok(())
    }

    // ── Loops ──

    fn gen_while(&mut self, cond: &Expr, body: &Block) -> Result<(), CodeGenError> {
        let id = self.new_label_id();
        self.scopes[self.current].loops.push(id);

        let cond_label = format!("FOR_COND_{id}");
        let loop_label = format!("FOR_LOOP_{id}");
        let end_label = format!("FOR_END_{id}");

        self.emit_label(cond_label.clone());
        self.gen_if_cond(cond, true, &loop_label)?;
        self.emit(Opcode::Jmp, Some(end_label.clone()));
        self.emit_label(loop_label);
        self.gen_block(body)?;
        self.emit(Opcode::Jmp, Some(cond_label));
        self.emit_label(end_label);

        self.scopes[self.current].loops.pop();
        Ok(())
    }

    fn gen_for_each(&mut self, iter: &Expr, var: &str, body: &Block) -> Result<(), CodeGenError> {
        let id = self.new_label_id();
        self.scopes[self.current].loops.push(id);

        let cond_label = format!("FOR_COND_{id}");
        let end_label = format!("FOR_END_{id}");

        self.gen_expr(iter)?;
        self.emit(Opcode::CallNative, Some("_iter_create$".to_string()));
        self.emit_label(cond_label.clone());
        self.emit(Opcode::Dup, None);
        self.emit(Opcode::CallNative, Some("_iter_hasnext$".to_string()));
        self.emit(Opcode::LoadConst, Some("true".to_string()));
        self.emit(Opcode::JmpNe, Some(end_label.clone()));
        self.emit(Opcode::Dup, None);
        self.emit(Opcode::CallNative, Some("_iter_next$".to_string()));
        match self.put_scope_var(var) {
            Some(idx) => self.emit(Opcode::Store, Some(idx.to_string())),
            None => self.defer(VarAccess::Store, var),
        }
        self.gen_block(body)?;
        self.emit(Opcode::Jmp, Some(cond_label));
        self.emit_label(end_label);
        // Drop the iterator
        self.emit(Opcode::Unload, None);

        self.scopes[self.current].loops.pop();
        Ok(())
    }

    fn gen_loop_ctl(&mut self, kind: LoopCtlKind, depth: usize) -> Result<(), CodeGenError> {
        let loops = &self.scopes[self.current].loops;
        let loop_id = if depth >= 1 && depth <= loops.len() {
            loops[loops.len() - depth]
        } else {
            return Err(CodeGenError::LoopControlOutsideLoop {
                line: self.err_line(),
            });
        };

        let target = match kind {
            LoopCtlKind::Continue => format!("FOR_COND_{loop_id}"),
            LoopCtlKind::Break => format!("FOR_END_{loop_id}"),
        };
        self.emit(Opcode::Jmp, Some(target));
        Ok(())
    }

    // ── Expressions ──

    fn gen_expr(&mut self, expr: &Expr) -> Result<(), CodeGenError> {
        self.line_stack.push(expr.line());
        let result = self.gen_expr_inner(expr);
        self.line_stack.pop();
        result
    }

    fn gen_expr_inner(&mut self, expr: &Expr) -> Result<(), CodeGenError> {
        match expr {
            Expr::Number { value, .. } => {
                self.emit(Opcode::Load, Some(format_number(*value)));
                Ok(())
            }
            Expr::Str { value, .. } => {
                self.emit(Opcode::Load, Some(value.clone()));
                Ok(())
            }
            Expr::Ident { name, .. } => {
                self.gen_ident(name);
                Ok(())
            }
            Expr::Math { l, r, op, .. } => {
                self.gen_expr(l)?;
                self.gen_expr(r)?;
                self.emit(math_opcode(*op), None);
                Ok(())
            }
            Expr::Cmp { l, r, op, .. } => {
                self.gen_expr(l)?;
                self.gen_expr(r)?;
                self.emit(cmp_opcode(*op), None);
                Ok(())
            }
            Expr::Logic { l, r, op, .. } => {
                self.gen_expr(l)?;
                self.gen_expr(r)?;
                self.emit(logic_opcode(*op), None);
                Ok(())
            }
            Expr::Concat { l, r, .. } => {
                self.gen_expr(l)?;
                self.gen_expr(r)?;
                self.emit(Opcode::Concat, None);
                Ok(())
            }
            Expr::MathNeg { expr, .. } => {
                self.gen_expr(expr)?;
                self.emit(Opcode::Load, Some("-1".to_string()));
                self.emit(Opcode::Mul, None);
                Ok(())
            }
            Expr::Not { expr, .. } => {
                self.gen_expr(expr)?;
                self.emit(Opcode::Not, None);
                Ok(())
            }
            Expr::Call { target, args, .. } => self.gen_call(target, args),
            Expr::Index { target, index, .. } => self.gen_get(target, index),
            Expr::CondExpr {
                cond,
                then_expr,
                else_expr,
                ..
            } => self.gen_if_expr(cond, then_expr, else_expr),
            Expr::Array { elements, .. } => self.gen_array(elements),
            Expr::Hash { pairs, .. } => self.gen_hash(pairs),
            Expr::FuncRef { name, module, .. } => {
                self.gen_func_ref(name, module.as_deref());
                Ok(())
            }
            Expr::NewObject { hash, .. } => {
                self.gen_expr(hash)?;
                self.emit(Opcode::BindRefs, None);
                Ok(())
            }
        }
    }

    fn gen_ident(&mut self, name: &str) {
        if self.is_builtin(name) {
            self.emit(Opcode::LoadConst, Some(name.to_string()));
            return;
        }
        match self.lookup_var(name) {
            Lookup::Local(idx) => self.emit(Opcode::Load, Some(format!("#{idx}"))),
            Lookup::Outer | Lookup::Unknown => self.defer(VarAccess::Load, name),
        }
    }

    // ── Calls ──

    /// A call is static when its target names no variable in scope: a bare
    /// identifier addresses the builtin module, and `container[key]` with a
    /// non-variable container and a string-literal key addresses module
    /// `container`. Everything else evaluates the target and `invoke`s it.
    fn gen_call(&mut self, target: &Expr, args: &[Expr]) -> Result<(), CodeGenError> {
        for arg in args {
            self.gen_expr(arg)?;
        }

        let static_call = match target {
            Expr::Ident { name, .. } if matches!(self.lookup_var(name), Lookup::Unknown) => {
                Some((BUILTIN_MODULE.to_string(), name.clone()))
            }
            Expr::Index {
                target: container,
                index,
                ..
            } => match (container.as_ref(), index.as_ref()) {
                (Expr::Ident { name: container, .. }, Expr::Str { value, .. })
                    if matches!(self.lookup_var(container), Lookup::Unknown) =>
                {
                    Some((container.clone(), unquote(value)))
                }
                _ => None,
            },
            _ => None,
        };

        match static_call {
            Some((module, func)) => self.gen_static_call(target, &module, &func),
            None => {
                self.gen_expr(target)?;
                self.emit(Opcode::Invoke, None);
                Ok(())
            }
        }
    }

    fn gen_static_call(
        &mut self,
        target: &Expr,
        module: &str,
        func: &str,
    ) -> Result<(), CodeGenError> {
        if self.is_native_func(module, func) {
            self.emit(Opcode::CallNative, Some(qualified(module, func)));
            return Ok(());
        }

        let udf_name = if matches!(target, Expr::Ident { .. }) {
            func.to_string()
        } else if self.imports.iter().any(|m| m == module) {
            qualified(module, func)
        } else {
            return Err(CodeGenError::InvalidModule {
                name: module.to_string(),
                line: self.err_line(),
            });
        };

        self.function_refs.insert(udf_name.clone());
        self.emit(Opcode::CallUdf, Some(udf_name));
        Ok(())
    }

    fn gen_func_ref(&mut self, name: &str, module: Option<&str>) {
        let native_module = module.unwrap_or(BUILTIN_MODULE);
        if self.is_native_func(native_module, name) {
            self.emit(Opcode::MkRefNative, Some(qualified(native_module, name)));
        } else {
            let full_name = match module {
                Some(module) => qualified(module, name),
                None => name.to_string(),
            };
            self.emit(Opcode::MkRefUdf, Some(full_name));
        }
    }

    // ── Arrays and member access ──

    fn gen_array(&mut self, elements: &[Expr]) -> Result<(), CodeGenError> {
        let mut constants = Vec::with_capacity(elements.len());
        let mut all_const = !elements.is_empty();
        for element in elements {
            match element {
                Expr::Number { value, .. } => constants.push(format_number(*value)),
                Expr::Str { value, .. } => constants.push(value.clone()),
                _ => {
                    all_const = false;
                    break;
                }
            }
        }

        if all_const {
            // Literal-only arrays live in the constant-data pool
            self.const_data.push(constants.join(" "));
            let pool_index = self.const_data.len() - 1;
            self.emit(Opcode::LoadConst, Some(pool_index.to_string()));
        } else {
            for element in elements {
                self.gen_expr(element)?;
            }
            self.emit(Opcode::MkArray, Some(elements.len().to_string()));
        }
        Ok(())
    }

    fn gen_hash(&mut self, pairs: &[(String, Expr)]) -> Result<(), CodeGenError> {
        for (key, value) in pairs {
            self.emit(Opcode::Load, Some(format!("\"{key}\"")));
            self.gen_expr(value)?;
        }
        self.emit(Opcode::MkHash, Some(pairs.len().to_string()));
        Ok(())
    }

    fn gen_get(&mut self, target: &Expr, index: &Expr) -> Result<(), CodeGenError> {
        if let Expr::Ident { name, .. } = target {
            if self.native_refs.contains_key(name) {
                if let Expr::Str { value, .. } = index {
                    let const_name = unquote(value);
                    if self
                        .native_refs
                        .get(name)
                        .is_some_and(|defs| defs.contains(&const_name))
                    {
                        self.emit(Opcode::LoadConst, Some(qualified(name, &const_name)));
                        return Ok(());
                    }
                    return Err(CodeGenError::UnknownConstant {
                        name: const_name,
                        module: name.clone(),
                        line: self.err_line(),
                    });
                }
            }
        }

        self.gen_expr(target)?;
        match index {
            Expr::Number { value, .. } => self.emit(Opcode::GetIndex, Some(format_number(*value))),
            Expr::Str { value, .. } => self.emit(Opcode::GetIndex, Some(value.clone())),
            _ => {
                self.gen_expr(index)?;
                self.emit(Opcode::Get, None);
            }
        }
        Ok(())
    }

    // ── Post-walk passes ──

    /// Rewrite every deferred opcode by walking outward from its emit-time
    /// scope to the innermost scope that binds the name.
    fn resolve_deferred(&mut self) -> Result<(), CodeGenError> {
        let deferred = std::mem::take(&mut self.deferred);

        for entry in deferred {
            let (access, name, line) = match &self.generated[entry.index] {
                GenItem::Deferred { access, name, line } => (*access, name.clone(), *line),
                _ => continue,
            };

            let mut scope_id = entry.scope;
            let mut unwind = 0usize;
            let slot = loop {
                if let Some(&idx) = self.scopes[scope_id].variables.get(&name) {
                    break idx;
                }
                match self.scopes[scope_id].parent {
                    Some(parent) => {
                        scope_id = parent;
                        unwind += 1;
                    }
                    None => {
                        return Err(CodeGenError::UnresolvedVariable {
                            name,
                            line: line.unwrap_or(0),
                        })
                    }
                }
            };

            let (op, arg) = if scope_id == GLOBAL_SCOPE {
                let op = match access {
                    VarAccess::Load => Opcode::LoadGlobal,
                    VarAccess::Store => Opcode::StoreGlobal,
                };
                (op, slot.to_string())
            } else {
                let op = match access {
                    VarAccess::Load => Opcode::LoadOuter,
                    VarAccess::Store => Opcode::StoreOuter,
                };
                (op, format!("{unwind}:{slot}"))
            };

            self.generated[entry.index] = GenItem::Op {
                op,
                arg: Some(arg),
                line,
            };
        }
        Ok(())
    }

    /// Every unqualified user-function reference must be defined in this
    /// module; qualified names are the linker's concern.
    fn check_function_refs(&self) -> Result<(), CodeGenError> {
        let mut undefined: Vec<String> = self
            .function_refs
            .iter()
            .filter(|name| !name.contains("::"))
            .filter(|name| !self.defined_funcs.contains(*name))
            .cloned()
            .collect();

        if undefined.is_empty() {
            Ok(())
        } else {
            undefined.sort();
            Err(CodeGenError::UndefinedFunctions { names: undefined })
        }
    }

    // ── Output construction ──

    fn write_out(&self) -> CompiledModule {
        let mut module = CompiledModule::new(self.module_name.clone());
        module.n_globals = self.scopes[GLOBAL_SCOPE].variables.len();
        module.imports = self.imports.clone();
        module.refs = self.native_refs.keys().cloned().collect();
        module.shared_vars = self.shared_vars.clone();
        module.const_data = self.const_data.clone();

        let mut main_code = false;
        for item in &self.generated {
            match item {
                GenItem::Section(Section::Entry) => main_code = true,
                GenItem::Section(_) => {}
                GenItem::Label(name) if name.contains('.') => {
                    module.functions.push(FunctionDef {
                        label: name.clone(),
                        ops: Vec::new(),
                    });
                }
                GenItem::Label(name) => {
                    append_code(&mut module, main_code, CodeLine::Label(name.clone()));
                }
                GenItem::Op { op, arg, line } => {
                    let debug = line.map(|line| DebugInfo {
                        module: self.module_name.clone(),
                        line,
                    });
                    append_code(
                        &mut module,
                        main_code,
                        CodeLine::Op {
                            op: *op,
                            arg: arg.clone(),
                            debug,
                        },
                    );
                }
                GenItem::Deferred { .. } => {
                    unreachable!("deferred references are resolved before output")
                }
            }
        }

        module
    }
}

fn append_code(module: &mut CompiledModule, main_code: bool, line: CodeLine) {
    if main_code {
        module.code_lines.push(line);
    } else if let Some(func) = module.functions.last_mut() {
        func.ops.push(line);
    } else {
        module.code_lines.push(line);
    }
}

/// `1` and `1.5`, never `1.0` — the textual form the VM and the constant
/// pool use for numbers.
fn format_number(value: f64) -> String {
    value.to_string()
}

fn qualified(module: &str, name: &str) -> String {
    format!("{module}::{name}")
}

/// Strip the surrounding quotes of a string-literal token value.
fn unquote(value: &str) -> String {
    value[1..value.len() - 1].to_string()
}

fn math_opcode(op: MathOp) -> Opcode {
    match op {
        MathOp::Add => Opcode::Add,
        MathOp::Sub => Opcode::Sub,
        MathOp::Mul => Opcode::Mul,
        MathOp::Div => Opcode::Div,
        MathOp::Mod => Opcode::Mod,
    }
}

fn cmp_opcode(op: CmpOp) -> Opcode {
    match op {
        CmpOp::Lt => Opcode::Lt,
        CmpOp::Le => Opcode::Le,
        CmpOp::Gt => Opcode::Gt,
        CmpOp::Ge => Opcode::Ge,
        CmpOp::Eq => Opcode::Eq,
        CmpOp::Ne => Opcode::Ne,
    }
}

fn jmp_opcode(op: CmpOp) -> Opcode {
    match op {
        CmpOp::Lt => Opcode::JmpLt,
        CmpOp::Le => Opcode::JmpLe,
        CmpOp::Gt => Opcode::JmpGt,
        CmpOp::Ge => Opcode::JmpGe,
        CmpOp::Eq => Opcode::JmpEq,
        CmpOp::Ne => Opcode::JmpNe,
    }
}

fn logic_opcode(op: LogicOp) -> Opcode {
    match op {
        LogicOp::And => Opcode::And,
        LogicOp::Or => Opcode::Or,
        LogicOp::Xor => Opcode::Xor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;
    use crate::compiler::parser::Parser;
    use std::path::PathBuf;

    fn config() -> CompilerConfig {
        CompilerConfig {
            defs_dir: PathBuf::new(),
            label_seed: Some(100_000),
        }
    }

    fn builtin_defs() -> ModuleDefs {
        ModuleDefs::from_text("true\nfalse\nnull\nprintln.1\n_iter_create$.1\n_iter_hasnext$.1\n_iter_next$.1\n")
    }

    fn compile(source: &str) -> CompiledModule {
        try_compile(source).unwrap()
    }

    fn try_compile(source: &str) -> Result<CompiledModule, CodeGenError> {
        let tokens = tokenize(source).unwrap();
        let ast = Parser::new(tokens, source).parse_to_ast().unwrap();
        let cfg = config();
        let mut generator = CodeGen::new("main", &cfg);
        generator.register_native_module(BUILTIN_MODULE, builtin_defs());
        generator.generate(&ast)
    }

    fn ops(lines: &[CodeLine]) -> Vec<String> {
        lines
            .iter()
            .map(|l| match l {
                CodeLine::Op { op, .. } => op.to_string(),
                CodeLine::Label(name) => format!("{name}:"),
            })
            .collect()
    }

    #[test]
    fn literals_and_locals() {
        let module = compile("a = 1\nb = a\n");
        assert_eq!(
            module.code_lines,
            vec![
                CodeLine::op(
                    Opcode::Load,
                    Some("1".to_string()),
                    Some(DebugInfo {
                        module: "main".to_string(),
                        line: 1
                    })
                ),
                CodeLine::op(
                    Opcode::Store,
                    Some("0".to_string()),
                    Some(DebugInfo {
                        module: "main".to_string(),
                        line: 1
                    })
                ),
                CodeLine::op(
                    Opcode::Load,
                    Some("#0".to_string()),
                    Some(DebugInfo {
                        module: "main".to_string(),
                        line: 2
                    })
                ),
                CodeLine::op(
                    Opcode::Store,
                    Some("1".to_string()),
                    Some(DebugInfo {
                        module: "main".to_string(),
                        line: 2
                    })
                ),
            ]
        );
        assert_eq!(module.n_globals, 2);
    }

    #[test]
    fn integral_numbers_have_no_decimal_point() {
        let module = compile("a = [1, 2.5, 3]\n");
        assert_eq!(module.const_data, vec!["1 2.5 3"]);
    }

    #[test]
    fn builtin_names_load_as_constants() {
        let module = compile("a = true\n");
        assert_eq!(
            ops(&module.code_lines),
            vec!["load.const", "store"]
        );
    }

    #[test]
    fn global_reads_inside_functions_resolve_to_load_global() {
        let source = "func get() use counter\nreturn counter\nend\ncounter = 7\nemit get()\n";
        let module = compile(source);
        let func = &module.functions[0];
        assert_eq!(func.label, "get.0");
        assert_eq!(
            func.ops[0],
            CodeLine::op(
                Opcode::LoadGlobal,
                Some("0".to_string()),
                Some(DebugInfo {
                    module: "main".to_string(),
                    line: 2
                })
            )
        );
    }

    #[test]
    fn nested_capture_resolves_to_outer_slot() {
        let source = "\
func outer()
x = 5
f = func() use x
return x
end
return f()
end
emit outer()
";
        let module = compile(source);
        let lambda = module
            .functions
            .iter()
            .find(|f| f.label == "$lambda_1.0")
            .unwrap();
        assert_eq!(
            lambda.ops[0],
            CodeLine::op(
                Opcode::LoadOuter,
                Some("1:0".to_string()),
                Some(DebugInfo {
                    module: "main".to_string(),
                    line: 4
                })
            )
        );
    }

    #[test]
    fn unresolved_variable_reports_the_deferred_line() {
        let err = try_compile("func f()\nreturn ghost\nend\nemit f()\n").unwrap_err();
        assert_eq!(
            err,
            CodeGenError::UnresolvedVariable {
                name: "ghost".to_string(),
                line: 2
            }
        );
    }

    #[test]
    fn undefined_function_references_are_collected() {
        let err = try_compile("x = missing_fn(1)\ny = other_fn(2)\n").unwrap_err();
        assert_eq!(
            err,
            CodeGenError::UndefinedFunctions {
                names: vec!["missing_fn".to_string(), "other_fn".to_string()]
            }
        );
    }

    #[test]
    fn break_beyond_nesting_is_an_error() {
        let err = try_compile("for 1 == 1\nbreak 2\nend\n").unwrap_err();
        assert_eq!(err, CodeGenError::LoopControlOutsideLoop { line: 2 });
    }

    #[test]
    fn break_and_continue_target_the_right_depth() {
        let source = "\
for 1 == 1
for 2 == 2
break 2
continue
end
end
";
        let module = compile(source);
        let jumps: Vec<String> = module
            .code_lines
            .iter()
            .filter_map(|l| match l {
                CodeLine::Op {
                    op: Opcode::Jmp,
                    arg: Some(a),
                    ..
                } => Some(a.clone()),
                _ => None,
            })
            .collect();
        // break 2 exits the outer loop (first id), continue restarts the inner
        assert!(jumps.contains(&"FOR_END_100001".to_string()));
        assert!(jumps.contains(&"FOR_COND_100002".to_string()));
    }

    #[test]
    fn functions_end_with_an_implicit_ret() {
        let module = compile("func f()\nx = 1\nend\nemit f()\n");
        let func = &module.functions[0];
        assert!(matches!(
            func.ops.last(),
            Some(CodeLine::Op {
                op: Opcode::Ret,
                ..
            })
        ));
    }

    #[test]
    fn module_constant_lookup_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mathx.ld"), "pi\nsqrt.1\n").unwrap();
        let cfg = CompilerConfig {
            defs_dir: dir.path().to_path_buf(),
            label_seed: Some(100_000),
        };

        let compile_with = |source: &str| {
            let tokens = tokenize(source).unwrap();
            let ast = Parser::new(tokens, source).parse_to_ast().unwrap();
            let mut generator = CodeGen::new("main", &cfg);
            generator.register_native_module(BUILTIN_MODULE, builtin_defs());
            generator.generate(&ast)
        };

        let module = compile_with("import native mathx\nemit mathx.pi\n").unwrap();
        assert!(module.code_lines.iter().any(|l| matches!(
            l,
            CodeLine::Op { op: Opcode::LoadConst, arg: Some(a), .. } if a == "mathx::pi"
        )));

        let err = compile_with("import native mathx\nemit mathx.tau\n").unwrap_err();
        assert_eq!(
            err,
            CodeGenError::UnknownConstant {
                name: "tau".to_string(),
                module: "mathx".to_string(),
                line: 2
            }
        );
    }

    #[test]
    fn static_call_on_unknown_module_is_an_error() {
        let err = try_compile("nowhere.run()\n").unwrap_err();
        assert_eq!(
            err,
            CodeGenError::InvalidModule {
                name: "nowhere".to_string(),
                line: 1
            }
        );
    }

    #[test]
    fn empty_module_is_rejected() {
        assert_eq!(try_compile(""), Err(CodeGenError::EmptyModule));
    }
}
