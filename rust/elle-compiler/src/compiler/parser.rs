//! Recursive descent parser for Elle.

use crate::compiler::ast::*;
use crate::compiler::lexer::TokenCursor;
use crate::compiler::tokens::{Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid token: {kind}, {value:?}\nline {line}: {line_text}")]
    InvalidToken {
        kind: TokenKind,
        value: String,
        line: usize,
        line_text: String,
    },
}

/// Kind of statement block being parsed, which decides what may appear in it
/// and which tokens terminate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    /// Program scope
    Outer,
    /// Function body
    Func,
    /// `if` / `for` branch body
    Stmt,
}

pub struct Parser {
    cursor: TokenCursor,
    lines: Vec<String>,
    /// Names of enclosing function definitions while parsing nested bodies
    scope_names: Vec<String>,
    /// Root-level function definitions (including lifted lambdas) in
    /// definition-start order
    functions: Vec<FuncDef>,
    /// Root-level `use` / `import` directives in source order
    directives: Vec<Stmt>,
    auto_id: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, source: &str) -> Self {
        Self {
            cursor: TokenCursor::new(tokens),
            lines: source.lines().map(String::from).collect(),
            scope_names: Vec::new(),
            functions: Vec::new(),
            directives: Vec::new(),
            auto_id: 0,
        }
    }

    /// Parse the whole token stream into the root block: directives first,
    /// then function definitions, then executable statements, each group in
    /// source order.
    pub fn parse_to_ast(mut self) -> Result<Block, ParseError> {
        let body = self.parse_block(BlockKind::Outer)?;
        let mut root = Block::new();
        root.statements.extend(self.directives);
        root.statements.extend(self.functions.into_iter().map(Stmt::Func));
        root.statements.extend(body.statements);
        Ok(root)
    }

    // ── Cursor helpers ──

    fn advance(&mut self) {
        self.cursor.advance();
    }

    fn hold(&mut self) {
        self.cursor.hold();
    }

    fn kind(&self) -> TokenKind {
        self.cursor.kind()
    }

    fn value(&self) -> &str {
        self.cursor.value()
    }

    fn line(&self) -> usize {
        self.cursor.line()
    }

    fn invalid(&self) -> ParseError {
        let token = self.cursor.current();
        ParseError::InvalidToken {
            kind: token.kind,
            value: token.value.clone(),
            line: token.line,
            line_text: self
                .lines
                .get(token.line.saturating_sub(1))
                .cloned()
                .unwrap_or_default(),
        }
    }

    fn expect_ident(&self) -> Result<String, ParseError> {
        if self.kind() != TokenKind::Ident {
            return Err(self.invalid());
        }
        Ok(self.value().to_string())
    }

    /// Require a statement terminator and step over it.
    fn require_cr(&mut self) -> Result<(), ParseError> {
        if !matches!(self.kind(), TokenKind::Eol | TokenKind::Eof) {
            return Err(self.invalid());
        }
        self.advance();
        Ok(())
    }

    fn strip_cr(&mut self) {
        while self.kind() == TokenKind::Eol {
            self.advance();
        }
    }

    fn next_lambda_name(&mut self) -> String {
        self.auto_id += 1;
        format!("$lambda_{}", self.auto_id)
    }

    // ── Expressions ──

    /// Atom or subexpression; a leading `-` folds into a number literal and
    /// wraps anything else except a string, which is an error.
    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        self.advance();

        let inverted = self.kind() == TokenKind::Add && self.value() == "-";
        if inverted {
            self.advance();
        }

        let line = self.line();
        let result = match self.kind() {
            TokenKind::Number => {
                let value: f64 = self.value().parse().map_err(|_| self.invalid())?;
                Expr::Number { value, line }
            }
            TokenKind::Str => {
                if inverted {
                    return Err(self.invalid());
                }
                Expr::Str {
                    value: self.value().to_string(),
                    line,
                }
            }
            TokenKind::Ident => self.parse_access(false)?,
            TokenKind::If => {
                self.advance();
                self.parse_cond_expr()?
            }
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                if self.kind() != TokenKind::RParen {
                    return Err(self.invalid());
                }
                expr
            }
            TokenKind::LBracket => {
                if inverted {
                    return Err(self.invalid());
                }
                self.parse_array()?
            }
            TokenKind::LBrace => {
                if inverted {
                    return Err(self.invalid());
                }
                self.parse_hash()?
            }
            _ => return Err(self.invalid()),
        };

        if inverted {
            match result {
                Expr::Number { value, line } => Ok(Expr::Number {
                    value: -value,
                    line,
                }),
                other => Ok(Expr::MathNeg {
                    expr: Box::new(other),
                    line,
                }),
            }
        } else {
            Ok(result)
        }
    }

    fn parse_more_factors(&mut self, left: Expr) -> Result<Expr, ParseError> {
        self.advance();
        if self.kind() == TokenKind::Mul {
            let sym = self.value().chars().next().unwrap_or(' ');
            let op = MathOp::from_symbol(sym).ok_or_else(|| self.invalid())?;
            let line = self.line();
            let right = self.parse_factor()?;
            let combined = Expr::Math {
                l: Box::new(left),
                r: Box::new(right),
                op,
                line,
            };
            self.parse_more_factors(combined)
        } else {
            Ok(left)
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let factor = self.parse_factor()?;
        self.parse_more_factors(factor)
    }

    fn parse_more_terms(&mut self, left: Expr) -> Result<Expr, ParseError> {
        if self.kind() == TokenKind::Add {
            let sym = self.value().chars().next().unwrap_or(' ');
            let op = MathOp::from_symbol(sym).ok_or_else(|| self.invalid())?;
            let line = self.line();
            let right = self.parse_term()?;
            let combined = Expr::Math {
                l: Box::new(left),
                r: Box::new(right),
                op,
                line,
            };
            self.parse_more_terms(combined)
        } else {
            Ok(left)
        }
    }

    fn parse_cmp_operand(&mut self) -> Result<Expr, ParseError> {
        let term = self.parse_term()?;
        self.parse_more_terms(term)
    }

    fn parse_more_cmp(&mut self, left: Expr) -> Result<Expr, ParseError> {
        if self.kind() == TokenKind::Cmp {
            let op = CmpOp::from_symbol(self.value()).ok_or_else(|| self.invalid())?;
            let line = self.line();
            let right = self.parse_cmp_operand()?;
            let combined = Expr::Cmp {
                l: Box::new(left),
                r: Box::new(right),
                op,
                line,
            };
            self.parse_more_cmp(combined)
        } else {
            Ok(left)
        }
    }

    /// `[not] cmp (cmpop cmp)*`. When entered from `&`, end-of-line tokens
    /// may be skipped first so concatenations can span lines.
    fn parse_cond(&mut self) -> Result<Expr, ParseError> {
        let can_wrap_line = self.kind() == TokenKind::Concat;

        self.advance();
        if can_wrap_line {
            self.strip_cr();
        }

        let negated = self.kind() == TokenKind::Not;
        if !negated {
            self.hold();
        }

        let cmp = self.parse_cmp_operand()?;
        let cmp = self.parse_more_cmp(cmp)?;

        if negated {
            let line = self.line();
            Ok(Expr::Not {
                expr: Box::new(cmp),
                line,
            })
        } else {
            Ok(cmp)
        }
    }

    fn parse_more_conds(&mut self, left: Expr) -> Result<Expr, ParseError> {
        if self.kind() == TokenKind::Logic {
            let op = LogicOp::from_word(self.value()).ok_or_else(|| self.invalid())?;
            let line = self.line();
            let right = self.parse_cond()?;
            let combined = Expr::Logic {
                l: Box::new(left),
                r: Box::new(right),
                op,
                line,
            };
            self.parse_more_conds(combined)
        } else {
            Ok(left)
        }
    }

    fn parse_concat_operand(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_cond()?;
        self.parse_more_conds(cond)
    }

    fn parse_more_concats(&mut self, left: Expr) -> Result<Expr, ParseError> {
        if self.kind() == TokenKind::Concat {
            let line = self.line();
            let right = self.parse_concat_operand()?;
            // Two adjacent string literals fold into one
            let combined = match (left, right) {
                (Expr::Str { value: l, line }, Expr::Str { value: r, .. }) => {
                    let mut folded = l[..l.len() - 1].to_string();
                    folded.push_str(&r[1..]);
                    Expr::Str {
                        value: folded,
                        line,
                    }
                }
                (l, r) => Expr::Concat {
                    l: Box::new(l),
                    r: Box::new(r),
                    line,
                },
            };
            self.parse_more_concats(combined)
        } else {
            Ok(left)
        }
    }

    /// Expression entry point. Function references, object constructors and
    /// lambda definitions are only recognized here, at the head of an
    /// expression.
    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.advance();
        match self.kind() {
            TokenKind::Ref => self.parse_function_ref(),
            TokenKind::New => self.parse_obj(),
            TokenKind::Func => {
                self.advance();
                let mark = self.functions.len();
                let def = self.parse_func(true)?;
                let name = def.name.clone();
                let line = def.line;
                self.functions.insert(mark, def);
                Ok(Expr::FuncRef {
                    name,
                    module: None,
                    line,
                })
            }
            _ => {
                self.hold();
                let concat = self.parse_concat_operand()?;
                self.parse_more_concats(concat)
            }
        }
    }

    /// `ref name` / `ref module.name`
    fn parse_function_ref(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.advance();
        let name_part = self.expect_ident()?;
        self.advance();

        if self.kind() == TokenKind::Dot {
            self.advance();
            let func_name = self.expect_ident()?;
            self.advance();
            Ok(Expr::FuncRef {
                name: func_name,
                module: Some(name_part),
                line,
            })
        } else {
            Ok(Expr::FuncRef {
                name: name_part,
                module: None,
                line,
            })
        }
    }

    /// `new { … }`
    fn parse_obj(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.advance();
        if self.kind() != TokenKind::LBrace {
            return Err(self.invalid());
        }
        let hash = self.parse_hash()?;
        self.advance();
        Ok(Expr::NewObject {
            hash: Box::new(hash),
            line,
        })
    }

    fn parse_arglist(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();

        self.advance();
        while self.kind() != TokenKind::RParen {
            if args.is_empty() {
                self.hold();
            }
            args.push(self.parse_expr()?);
            if !matches!(self.kind(), TokenKind::Comma | TokenKind::RParen) {
                return Err(self.invalid());
            }
        }

        Ok(args)
    }

    /// `if(cond, true-expr, false-expr)`
    fn parse_cond_expr(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        if self.kind() != TokenKind::LParen {
            return Err(self.invalid());
        }
        let cond = self.parse_expr()?;
        if self.kind() != TokenKind::Comma {
            return Err(self.invalid());
        }
        let then_expr = self.parse_expr()?;
        if self.kind() != TokenKind::Comma {
            return Err(self.invalid());
        }
        let else_expr = self.parse_expr()?;
        if self.kind() != TokenKind::RParen {
            return Err(self.invalid());
        }
        Ok(Expr::CondExpr {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
            line,
        })
    }

    fn parse_array(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut elements = Vec::new();

        while self.kind() != TokenKind::RBracket {
            self.advance();
            self.strip_cr();
            if self.kind() != TokenKind::RBracket {
                self.hold();
                elements.push(self.parse_expr()?);
                self.strip_cr();
                if self.kind() != TokenKind::Comma && self.kind() != TokenKind::RBracket {
                    return Err(self.invalid());
                }
            }
        }

        Ok(Expr::Array { elements, line })
    }

    fn parse_hash(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut pairs = Vec::new();

        while self.kind() != TokenKind::RBrace {
            self.advance();
            self.strip_cr();
            if self.kind() != TokenKind::RBrace {
                if self.kind() != TokenKind::HashKey {
                    return Err(self.invalid());
                }
                let value = self.value();
                let key = value[..value.len() - 1].to_string();
                pairs.push((key, self.parse_expr()?));
                self.strip_cr();
                if self.kind() != TokenKind::Comma && self.kind() != TokenKind::RBrace {
                    return Err(self.invalid());
                }
            }
        }

        Ok(Expr::Hash { pairs, line })
    }

    /// Compound element access: `ident ([expr] | .name | (args))*`. In
    /// assignment-target position a call suffix is not consumed.
    fn parse_access(&mut self, assignment: bool) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut access = Expr::Ident {
            name: self.value().to_string(),
            line,
        };
        self.advance();

        loop {
            match self.kind() {
                TokenKind::LBracket => {
                    let index = self.parse_expr()?;
                    if self.kind() != TokenKind::RBracket {
                        return Err(self.invalid());
                    }
                    let line = self.line();
                    access = Expr::Index {
                        target: Box::new(access),
                        index: Box::new(index),
                        line,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    let line = self.line();
                    let index = Expr::Str {
                        value: format!("\"{name}\""),
                        line,
                    };
                    access = Expr::Index {
                        target: Box::new(access),
                        index: Box::new(index),
                        line,
                    };
                }
                TokenKind::LParen if !assignment => {
                    let args = self.parse_arglist()?;
                    let line = self.line();
                    access = Expr::Call {
                        target: Box::new(access),
                        args,
                        line,
                    };
                }
                _ => break,
            }
            self.advance();
        }

        self.hold();
        Ok(access)
    }

    // ── Statements ──

    /// Assignment to a variable or element, with optional compound operator.
    fn parse_assign(&mut self, target: Expr) -> Result<Stmt, ParseError> {
        let line = self.line();
        let op = if self.kind() == TokenKind::MathAssign {
            let sym = self.value().chars().next().unwrap_or(' ');
            Some(MathOp::from_symbol(sym).ok_or_else(|| self.invalid())?)
        } else {
            None
        };

        let expr = self.parse_expr()?;

        match target {
            Expr::Ident { name, .. } => {
                // `name <op>= e` expands to `name = name <op> e`
                let expr = match op {
                    Some(op) => Expr::Math {
                        l: Box::new(Expr::Ident {
                            name: name.clone(),
                            line,
                        }),
                        r: Box::new(expr),
                        op,
                        line,
                    },
                    None => expr,
                };
                Ok(Stmt::Assign { name, expr, line })
            }
            Expr::Index { target, index, .. } => Ok(Stmt::SetItem {
                target: *target,
                index: *index,
                value: expr,
                op,
                line,
            }),
            _ => Err(self.invalid()),
        }
    }

    fn parse_if_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let mut branches = Vec::new();

        loop {
            let cond = self.parse_expr()?;
            self.require_cr()?;
            let branch = self.parse_block(BlockKind::Stmt)?;
            branches.push((cond, branch));

            self.advance();
            if self.kind() != TokenKind::Elsif {
                break;
            }
        }

        let mut else_block = None;
        if self.kind() == TokenKind::Else {
            self.advance();
            self.require_cr()?;
            else_block = Some(self.parse_block(BlockKind::Stmt)?);
            self.advance();
        }

        if self.kind() != TokenKind::End {
            return Err(self.invalid());
        }
        self.advance();

        Ok(Stmt::If {
            branches,
            else_block,
            line,
        })
    }

    /// `for expr … end` (conditional) or `for expr as name … end` (iteration)
    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let expr = self.parse_expr()?;

        let mut iter_var = None;
        if self.kind() == TokenKind::As {
            self.advance();
            iter_var = Some(self.expect_ident()?);
            self.advance();
        }

        self.require_cr()?;

        let body = self.parse_block(BlockKind::Stmt)?;
        self.advance();
        if self.kind() != TokenKind::End {
            return Err(self.invalid());
        }
        self.advance();

        match iter_var {
            None => Ok(Stmt::While {
                cond: expr,
                body,
                line,
            }),
            Some(var) => Ok(Stmt::ForEach {
                iter: expr,
                var,
                body,
                line,
            }),
        }
    }

    fn parse_paramlist(&mut self) -> Result<Vec<String>, ParseError> {
        let mut params = Vec::new();

        while self.kind() != TokenKind::RParen {
            if self.kind() == TokenKind::Ident {
                params.push(self.value().to_string());
            }
            self.advance();

            if !matches!(self.kind(), TokenKind::Comma | TokenKind::RParen) {
                return Err(self.invalid());
            }
            if self.kind() == TokenKind::Comma {
                self.advance();
            }
        }

        Ok(params)
    }

    /// Function definition: `func name(params) … end`, the one-line form
    /// `func name(params) => stmt`, or an anonymous lambda in expression
    /// position. An optional `use` list between the parameters and the body
    /// is prepended to the body block.
    fn parse_func(&mut self, is_lambda: bool) -> Result<FuncDef, ParseError> {
        let line = self.line();

        let name = if is_lambda {
            self.next_lambda_name()
        } else {
            let id = self.expect_ident()?;
            self.advance();
            id
        };

        self.scope_names.push(name.clone());

        if self.kind() != TokenKind::LParen {
            return Err(self.invalid());
        }
        self.advance();

        let params = self.parse_paramlist()?;
        self.advance();

        let uses = if self.kind() == TokenKind::Use {
            Some(self.parse_use()?)
        } else {
            None
        };

        let mut body;
        if self.kind() == TokenKind::Assign {
            // One-line body: `=> stmt`
            self.advance();
            if self.value() != ">" {
                return Err(self.invalid());
            }
            self.advance();
            body = Block::new();
            body.statements.push(self.parse_stmt()?);
        } else {
            self.require_cr()?;
            body = self.parse_block(BlockKind::Func)?;
            self.advance();
            if self.kind() != TokenKind::End {
                return Err(self.invalid());
            }
            self.advance();
        }

        self.scope_names.pop();

        if let Some(uses) = uses {
            body.statements.insert(0, uses);
        }

        let scope_name = self.scope_names.last().cloned();

        Ok(FuncDef {
            name,
            params,
            body,
            scope_name,
            line,
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.kind() {
            TokenKind::Ident => {
                let line = self.line();
                let target = self.parse_access(true)?;
                self.advance();
                match self.kind() {
                    TokenKind::Assign | TokenKind::MathAssign => self.parse_assign(target),
                    TokenKind::LParen => {
                        let args = self.parse_arglist()?;
                        self.advance();
                        Ok(Stmt::Call(Expr::Call {
                            target: Box::new(target),
                            args,
                            line,
                        }))
                    }
                    _ => Err(self.invalid()),
                }
            }
            TokenKind::If => self.parse_if_stmt(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break | TokenKind::Continue => {
                let line = self.line();
                let kind = if self.kind() == TokenKind::Continue {
                    LoopCtlKind::Continue
                } else {
                    LoopCtlKind::Break
                };
                self.advance();
                let mut depth = 1;
                if self.kind() == TokenKind::Number {
                    depth = self.value().parse().map_err(|_| self.invalid())?;
                    self.advance();
                } else {
                    self.hold();
                }
                Ok(Stmt::LoopCtl { kind, depth, line })
            }
            TokenKind::Return => {
                let line = self.line();
                self.advance();
                let mut value = None;
                if self.kind() != TokenKind::Eol {
                    self.hold();
                    value = Some(self.parse_expr()?);
                }
                Ok(Stmt::Return { value, line })
            }
            TokenKind::Emit => {
                let line = self.line();
                let value = self.parse_expr()?;
                let mut name = None;
                if self.kind() == TokenKind::As {
                    self.advance();
                    name = Some(self.expect_ident()?);
                    self.advance();
                }
                Ok(Stmt::Emit { value, name, line })
            }
            _ => Err(self.invalid()),
        }
    }

    // ── Directives ──

    fn parse_ident_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut idents = Vec::new();

        while self.kind() != TokenKind::Eol {
            idents.push(self.expect_ident()?);
            self.advance();
            if self.kind() == TokenKind::Comma {
                self.advance();
            } else if self.kind() != TokenKind::Eol {
                break;
            }
        }

        Ok(idents)
    }

    fn parse_use(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let names = self.parse_ident_list()?;
        Ok(Stmt::Use { names, line })
    }

    fn parse_import(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.advance();
        let native = self.kind() == TokenKind::Native;
        if native {
            self.advance();
        }
        let modules = self.parse_ident_list()?;
        Ok(Stmt::Import {
            native,
            modules,
            line,
        })
    }

    // ── Blocks ──

    fn parse_block(&mut self, block_kind: BlockKind) -> Result<Block, ParseError> {
        let mut block = Block::new();

        if block_kind == BlockKind::Outer {
            self.advance();
        }

        loop {
            match self.kind() {
                TokenKind::Eof => {
                    if block_kind == BlockKind::Outer {
                        return Ok(block);
                    }
                    return Err(self.invalid());
                }
                TokenKind::Elsif | TokenKind::Else | TokenKind::End => {
                    if block_kind == BlockKind::Outer {
                        return Err(self.invalid());
                    }
                    if block_kind == BlockKind::Func && self.kind() != TokenKind::End {
                        return Err(self.invalid());
                    }
                    self.hold();
                    return Ok(block);
                }
                TokenKind::Eol => {
                    self.advance();
                    continue;
                }
                TokenKind::Func => {
                    // Named definitions live at program scope only
                    if block_kind != BlockKind::Outer {
                        return Err(self.invalid());
                    }
                    self.advance();
                    let mark = self.functions.len();
                    let def = self.parse_func(false)?;
                    self.functions.insert(mark, def);
                }
                TokenKind::Use => {
                    if block_kind == BlockKind::Stmt {
                        return Err(self.invalid());
                    }
                    let uses = self.parse_use()?;
                    if block_kind == BlockKind::Outer {
                        self.directives.push(uses);
                    } else {
                        block.statements.insert(0, uses);
                    }
                }
                TokenKind::Import => {
                    if block_kind != BlockKind::Outer {
                        return Err(self.invalid());
                    }
                    let import = self.parse_import()?;
                    self.directives.push(import);
                }
                _ => {
                    let stmt = self.parse_stmt()?;
                    block.statements.push(stmt);
                }
            }

            self.require_cr()?;
        }
    }
}
