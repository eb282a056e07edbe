//! The kernel DSL: a single `def kernel(...)` with a typed, indented body
//! of assignments, `if`/`elif`/`else` chains, bounded `for` loops and
//! `return`. Shares the expression lexer and parser with the infix
//! front-end; statements keep [`crate::ast::NodeId`] roots into one shared
//! arena.

pub(crate) mod interp;
pub(crate) mod lower;

use crate::ast::{BinaryOp, ExprTree, IndexVar, NodeId, NodeKind};
use crate::dtype::{self, Dtype};
use crate::error::{CompileError, CompileErrorKind};
use crate::lex::{Lexer, TokKind, Token};
use crate::parse::{self, NameResolver, Resolved};
use crate::var::Binding;

/// Lane semantics of `if`, `break` and `continue`, chosen by the in-source
/// `# me:dialect=<vector|element>` pragma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Conditions reduce through `any`; bodies run under the lane mask
    #[default]
    Vector,
    /// Every output lane runs the program independently
    Element,
}

#[derive(Debug, Clone)]
pub(crate) enum Stmt {
    Assign {
        slot: u32,
        value: NodeId,
        offset: usize,
    },
    If {
        /// `(condition, body)` for the `if` and each `elif`
        arms: Vec<(NodeId, Vec<Stmt>)>,
        default: Vec<Stmt>,
    },
    For {
        slot: u32,
        count: NodeId,
        body: Vec<Stmt>,
        offset: usize,
    },
    Break,
    Continue,
    Return {
        value: NodeId,
        offset: usize,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct LocalVar {
    pub name: String,
    pub dtype: Option<Dtype>,
}

#[derive(Debug, Clone)]
pub(crate) struct DslProgram {
    pub tree: ExprTree,
    pub body: Vec<Stmt>,
    /// Binding slots of the kernel parameters, in signature order
    pub params: Vec<u32>,
    pub locals: Vec<LocalVar>,
    pub dialect: Dialect,
    /// Dtype of the returned expression before any user output cast
    pub out_dtype: Dtype,
    pub uses_index_vars: bool,
    pub uses_reductions: bool,
    pub has_control_flow: bool,
}

/// Whether `source` is a kernel program rather than an infix one-liner.
#[must_use]
pub(crate) fn is_kernel_source(source: &str) -> bool {
    source
        .lines()
        .map(str::trim_start)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .is_some_and(|l| l.starts_with("def ") || l.starts_with("def\t"))
}

fn syntax(offset: usize, detail: impl Into<String>) -> CompileError {
    CompileError::new(CompileErrorKind::Syntax, offset, detail)
}

struct Line {
    indent: usize,
    toks: Vec<Token>,
    offset: usize,
}

fn split_lines(source: &str) -> Result<Vec<Line>, CompileError> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for raw in source.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\n', '\r']);
        let mut indent = 0;
        for ch in content.chars() {
            match ch {
                ' ' => indent += 1,
                '\t' => return Err(syntax(offset + indent, "tab in indentation")),
                _ => break,
            }
        }
        let rest = &content[indent..];
        if !rest.is_empty() && !rest.starts_with('#') {
            let toks = Lexer::new(rest, offset + indent)
                .tokenize()
                .map_err(CompileError::from)?;
            if toks.len() > 1 {
                lines.push(Line {
                    indent,
                    toks,
                    offset: offset + indent,
                });
            }
        }
        offset += raw.len();
    }
    Ok(lines)
}

fn scan_dialect(source: &str) -> Dialect {
    for line in source.lines() {
        if let Some(rest) = line.trim_start().strip_prefix('#') {
            if let Some(value) = rest.trim().strip_prefix("me:dialect=") {
                return match value.trim() {
                    "element" => Dialect::Element,
                    _ => Dialect::Vector,
                };
            }
        }
    }
    Dialect::Vector
}

/// Name environment of the kernel body: locals shadow bindings, and the
/// reserved index identifiers resolve last.
struct DslResolver<'a> {
    bindings: &'a [Binding],
    locals: Vec<LocalVar>,
    uses_index: bool,
}

impl DslResolver<'_> {
    fn local_slot(&self, name: &str) -> Option<u32> {
        self.locals
            .iter()
            .position(|l| l.name == name)
            .map(|i| i as u32)
    }

    fn define_local(&mut self, name: &str) -> u32 {
        if let Some(slot) = self.local_slot(name) {
            return slot;
        }
        self.locals.push(LocalVar {
            name: name.to_owned(),
            dtype: None,
        });
        (self.locals.len() - 1) as u32
    }

    fn reserved(name: &str) -> Option<IndexVar> {
        match name {
            "_ndim" => Some(IndexVar::Ndim),
            "_flat_idx" | "_global_linear_idx" => Some(IndexVar::FlatIdx),
            _ => {
                let (head, tail) = (name.get(..2)?, name.get(2..)?);
                let dim: u8 = tail.parse().ok().filter(|&d| d < 8)?;
                match head {
                    "_i" => Some(IndexVar::Dim(dim)),
                    "_n" => Some(IndexVar::ShapeDim(dim)),
                    _ => None,
                }
            }
        }
    }
}

impl NameResolver for DslResolver<'_> {
    fn resolve(&mut self, name: &str) -> Option<Resolved> {
        if let Some(slot) = self.local_slot(name) {
            return Some(Resolved::Local(slot));
        }
        if let Some(pos) = self.bindings.iter().position(|b| b.name == name) {
            let b = &self.bindings[pos];
            return Some(if b.is_function() {
                Resolved::Func(pos as u32, b.arity)
            } else {
                Resolved::Var(pos as u32)
            });
        }
        if let Some(iv) = Self::reserved(name) {
            self.uses_index = true;
            return Some(Resolved::Index(iv));
        }
        None
    }
}

struct KernelParser<'a> {
    lines: Vec<Line>,
    pos: usize,
    tree: ExprTree,
    res: DslResolver<'a>,
}

pub(crate) fn parse_kernel(
    source: &str,
    bindings: &[Binding],
) -> Result<DslProgram, CompileError> {
    let dialect = scan_dialect(source);
    let lines = split_lines(source)?;
    if lines.is_empty() {
        return Err(syntax(0, "empty kernel"));
    }
    let mut p = KernelParser {
        lines,
        pos: 0,
        tree: ExprTree::new(),
        res: DslResolver {
            bindings,
            locals: Vec::new(),
            uses_index: false,
        },
    };
    let params = p.parse_signature()?;
    let body_indent = p
        .lines
        .get(p.pos)
        .ok_or_else(|| syntax(source.len(), "kernel body is empty"))?
        .indent;
    if body_indent == 0 {
        return Err(syntax(p.lines[p.pos].offset, "kernel body must be indented"));
    }
    let body = p.parse_block(body_indent)?;
    if p.pos < p.lines.len() {
        return Err(syntax(p.lines[p.pos].offset, "unexpected dedent"));
    }
    let mut prog = DslProgram {
        tree: p.tree,
        body,
        params,
        locals: p.res.locals,
        dialect,
        out_dtype: Dtype::F64,
        uses_index_vars: p.res.uses_index,
        uses_reductions: false,
        has_control_flow: false,
    };
    type_program(&mut prog, bindings)?;
    prog.uses_reductions = program_has_reductions(&prog);
    prog.has_control_flow = stmts_have_control_flow(&prog.body);
    Ok(prog)
}

impl KernelParser<'_> {
    fn parse_signature(&mut self) -> Result<Vec<u32>, CompileError> {
        let line = &self.lines[self.pos];
        let toks = &line.toks;
        let mut i = 0;
        let expect = |i: &mut usize, want: &TokKind, what: &str| -> Result<usize, CompileError> {
            let t = toks.get(*i).ok_or_else(|| syntax(line.offset, what.to_owned()))?;
            if &t.kind == want {
                *i += 1;
                Ok(t.offset)
            } else {
                Err(syntax(t.offset, format!("expected {what}")))
            }
        };
        match toks.first().map(|t| &t.kind) {
            Some(TokKind::Ident(kw)) if kw == "def" => i += 1,
            _ => return Err(syntax(line.offset, "kernel must start with `def`")),
        }
        match toks.get(i).map(|t| &t.kind) {
            Some(TokKind::Ident(_)) => i += 1,
            _ => return Err(syntax(line.offset, "expected kernel name")),
        }
        expect(&mut i, &TokKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if toks.get(i).map(|t| &t.kind) != Some(&TokKind::RParen) {
            loop {
                let t = toks
                    .get(i)
                    .ok_or_else(|| syntax(line.offset, "unterminated parameter list"))?;
                let TokKind::Ident(name) = &t.kind else {
                    return Err(syntax(t.offset, "expected parameter name"));
                };
                let slot = self
                    .res
                    .bindings
                    .iter()
                    .position(|b| &b.name == name && !b.is_function())
                    .ok_or_else(|| {
                        CompileError::new(
                            CompileErrorKind::UnresolvedName,
                            t.offset,
                            format!("parameter `{name}` has no variable descriptor"),
                        )
                    })?;
                params.push(slot as u32);
                i += 1;
                match toks.get(i).map(|t| &t.kind) {
                    Some(TokKind::Comma) => i += 1,
                    Some(TokKind::RParen) => break,
                    _ => return Err(syntax(line.offset, "expected `,` or `)`")),
                }
            }
        }
        expect(&mut i, &TokKind::RParen, "`)`")?;
        expect(&mut i, &TokKind::Colon, "`:`")?;
        if toks.get(i).map(|t| &t.kind) != Some(&TokKind::Eof) {
            return Err(syntax(toks[i].offset, "unexpected input after `:`"));
        }
        self.pos += 1;
        Ok(params)
    }

    fn parse_block(&mut self, indent: usize) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        while let Some(line) = self.lines.get(self.pos) {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err(syntax(line.offset, "unexpected indent"));
            }
            stmts.push(self.parse_stmt(indent)?);
        }
        Ok(stmts)
    }

    fn nested_block(&mut self, parent_indent: usize, offset: usize) -> Result<Vec<Stmt>, CompileError> {
        let inner = match self.lines.get(self.pos) {
            Some(line) if line.indent > parent_indent => line.indent,
            _ => return Err(syntax(offset, "expected an indented block")),
        };
        self.parse_block(inner)
    }

    /// Parses the expression formed by `toks[start..]`, which must end with
    /// `stop` (consumed) followed by end of line.
    fn sub_expr(&mut self, line_idx: usize, start: usize, stop: Option<&TokKind>) -> Result<NodeId, CompileError> {
        let line = &self.lines[line_idx];
        let mut toks: Vec<Token> = line.toks[start..].to_vec();
        // the trailing Eof stays; drop the stop token before it
        if let Some(stop) = stop {
            let n = toks.len();
            if n < 2 || &toks[n - 2].kind != stop {
                let at = toks.last().map_or(line.offset, |t| t.offset);
                return Err(syntax(at, format!("expected `{stop:?}` at end of line")));
            }
            toks.remove(n - 2);
        }
        parse::parse_expr(&toks, &mut self.tree, &mut self.res)
    }

    fn parse_stmt(&mut self, indent: usize) -> Result<Stmt, CompileError> {
        let line_idx = self.pos;
        let offset = self.lines[line_idx].offset;
        let first_offset = self.lines[line_idx].toks[0].offset;
        let head = match &self.lines[line_idx].toks[0].kind {
            TokKind::Ident(h) => h.clone(),
            _ => return Err(syntax(first_offset, "expected a statement")),
        };
        match head.as_str() {
            "if" => self.parse_if(indent),
            "for" => self.parse_for(indent),
            "break" => {
                self.expect_bare(line_idx)?;
                self.pos += 1;
                Ok(Stmt::Break)
            }
            "continue" => {
                self.expect_bare(line_idx)?;
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            "return" => {
                self.pos += 1;
                let value = self.sub_expr(line_idx, 1, None)?;
                Ok(Stmt::Return { value, offset })
            }
            "elif" | "else" => Err(syntax(offset, format!("`{head}` without a matching `if`"))),
            _ => {
                // assignment: `name = expr` or `name op= expr`
                let second = self.lines[line_idx].toks.get(1).map(|t| t.kind.clone());
                match second {
                    Some(TokKind::Assign) => {
                        self.pos += 1;
                        let value = self.sub_expr(line_idx, 2, None)?;
                        let slot = self.res.define_local(&head);
                        Ok(Stmt::Assign { slot, value, offset })
                    }
                    Some(TokKind::AugAssign(op_tok)) => {
                        self.pos += 1;
                        // `x op= e` reads the pre-assignment binding of x
                        let current = self.res.resolve(&head).ok_or_else(|| {
                            CompileError::new(
                                CompileErrorKind::UnresolvedName,
                                first_offset,
                                format!("unknown identifier `{head}`"),
                            )
                        })?;
                        let lhs_kind = match current {
                            Resolved::Local(slot) => NodeKind::Local(slot),
                            Resolved::Var(slot) => NodeKind::Var(slot),
                            Resolved::Index(iv) => NodeKind::Index(iv),
                            Resolved::Func(..) => {
                                return Err(syntax(first_offset, "cannot assign to a function"));
                            }
                        };
                        let lhs = self
                            .tree
                            .push(crate::ast::Node::new(lhs_kind, first_offset));
                        let rhs = self.sub_expr(line_idx, 2, None)?;
                        let op = aug_op(&op_tok)
                            .ok_or_else(|| syntax(first_offset, "unsupported augmented operator"))?;
                        let value = self
                            .tree
                            .push(crate::ast::Node::new(NodeKind::Binary(op, lhs, rhs), offset));
                        let slot = self.res.define_local(&head);
                        Ok(Stmt::Assign { slot, value, offset })
                    }
                    _ => Err(syntax(offset, "expected `=` after identifier")),
                }
            }
        }
    }

    fn expect_bare(&self, line_idx: usize) -> Result<(), CompileError> {
        let line = &self.lines[line_idx];
        if line.toks.len() != 2 {
            return Err(syntax(line.toks[1].offset, "unexpected input after statement"));
        }
        Ok(())
    }

    fn parse_if(&mut self, indent: usize) -> Result<Stmt, CompileError> {
        let mut arms = Vec::new();
        let mut default = Vec::new();
        // the `if` arm
        let line_idx = self.pos;
        let offset = self.lines[line_idx].offset;
        self.pos += 1;
        let cond = self.sub_expr(line_idx, 1, Some(&TokKind::Colon))?;
        let body = self.nested_block(indent, offset)?;
        arms.push((cond, body));
        // `elif` and `else` continuations at the same indent
        loop {
            let keyword = match self.lines.get(self.pos) {
                Some(line) if line.indent == indent => match line.toks.first().map(|t| &t.kind) {
                    Some(TokKind::Ident(kw)) if kw == "elif" || kw == "else" => kw.clone(),
                    _ => break,
                },
                _ => break,
            };
            let line_idx = self.pos;
            let offset = self.lines[line_idx].offset;
            if keyword == "elif" {
                self.pos += 1;
                let cond = self.sub_expr(line_idx, 1, Some(&TokKind::Colon))?;
                let body = self.nested_block(indent, offset)?;
                arms.push((cond, body));
            } else {
                let toks = &self.lines[line_idx].toks;
                if toks.len() != 3 || toks[1].kind != TokKind::Colon {
                    return Err(syntax(offset, "expected `else:`"));
                }
                self.pos += 1;
                default = self.nested_block(indent, offset)?;
                break;
            }
        }
        Ok(Stmt::If { arms, default })
    }

    fn parse_for(&mut self, indent: usize) -> Result<Stmt, CompileError> {
        let line_idx = self.pos;
        let line = &self.lines[line_idx];
        let offset = line.offset;
        let toks = &line.toks;
        // for <name> in range(<expr>):
        let var_name = match toks.get(1).map(|t| &t.kind) {
            Some(TokKind::Ident(name)) => name.clone(),
            _ => return Err(syntax(offset, "expected loop variable")),
        };
        match toks.get(2).map(|t| &t.kind) {
            Some(TokKind::Ident(kw)) if kw == "in" => {}
            _ => return Err(syntax(offset, "expected `in`")),
        }
        match toks.get(3).map(|t| &t.kind) {
            Some(TokKind::Ident(kw)) if kw == "range" => {}
            _ => return Err(syntax(offset, "only `range(...)` loops are supported")),
        }
        if toks.get(4).map(|t| &t.kind) != Some(&TokKind::LParen) {
            return Err(syntax(offset, "expected `(` after `range`"));
        }
        // trailing `):` then Eof
        let n = toks.len();
        if n < 8
            || toks[n - 2].kind != TokKind::Colon
            || toks[n - 3].kind != TokKind::RParen
        {
            return Err(syntax(offset, "expected `):` at end of `for`"));
        }
        let mut count_toks: Vec<Token> = toks[5..n - 3].to_vec();
        count_toks.push(Token {
            kind: TokKind::Eof,
            offset: toks[n - 3].offset,
        });
        self.pos += 1;
        let count = parse::parse_expr(&count_toks, &mut self.tree, &mut self.res)?;
        let slot = self.res.define_local(&var_name);
        let body = self.nested_block(indent, offset)?;
        Ok(Stmt::For {
            slot,
            count,
            body,
            offset,
        })
    }
}

fn aug_op(tok: &TokKind) -> Option<BinaryOp> {
    Some(match tok {
        TokKind::Plus => BinaryOp::Add,
        TokKind::Minus => BinaryOp::Sub,
        TokKind::Star => BinaryOp::Mul,
        TokKind::Slash => BinaryOp::Div,
        TokKind::Percent => BinaryOp::Rem,
        TokKind::StarStar => BinaryOp::Pow,
        TokKind::Amp => BinaryOp::BitAnd,
        TokKind::Pipe => BinaryOp::BitOr,
        TokKind::Caret => BinaryOp::BitXor,
        _ => return None,
    })
}

/// Sequential typing pass: locals take the dtype of their first assignment;
/// later assignments may implicitly widen the stored value into it but
/// never narrow it or change the local.
fn type_program(prog: &mut DslProgram, bindings: &[Binding]) -> Result<(), CompileError> {
    let mut dts: Vec<Dtype> = vec![Dtype::I64; prog.locals.len()];
    let mut set: Vec<bool> = vec![false; prog.locals.len()];
    let mut returns: Vec<(Dtype, usize)> = Vec::new();
    type_stmts(
        &prog.body.clone(),
        &mut prog.tree,
        bindings,
        &mut dts,
        &mut set,
        &mut returns,
    )?;
    let Some(&(first, _)) = returns.first() else {
        return Err(syntax(0, "kernel never returns a value"));
    };
    let mut out = first;
    for &(dt, offset) in &returns[1..] {
        out = dtype::promote(out, dt).ok_or_else(|| {
            CompileError::new(
                CompileErrorKind::TypeMismatch,
                offset,
                format!("return dtypes {out} and {dt} do not combine"),
            )
        })?;
    }
    for (local, (&dt, &known)) in prog.locals.iter_mut().zip(dts.iter().zip(&set)) {
        local.dtype = known.then_some(dt);
    }
    prog.out_dtype = out;
    Ok(())
}

fn type_stmts(
    stmts: &[Stmt],
    tree: &mut ExprTree,
    bindings: &[Binding],
    dts: &mut Vec<Dtype>,
    set: &mut Vec<bool>,
    returns: &mut Vec<(Dtype, usize)>,
) -> Result<(), CompileError> {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { slot, value, offset } => {
                crate::infer::infer(tree, *value, bindings, dts)?;
                let vdt = tree.node(*value).dtype;
                let slot = *slot as usize;
                if !set[slot] {
                    dts[slot] = vdt;
                    set[slot] = true;
                } else if vdt != dts[slot] {
                    let est = dts[slot];
                    if dtype::promote(vdt, est) != Some(est) {
                        return Err(CompileError::new(
                            CompileErrorKind::TypeMismatch,
                            *offset,
                            format!("cannot assign {vdt} to a local established as {est}"),
                        ));
                    }
                }
            }
            Stmt::If { arms, default } => {
                for (cond, body) in arms {
                    crate::infer::infer(tree, *cond, bindings, dts)?;
                    if tree.node(*cond).dtype == Dtype::Str {
                        return Err(CompileError::new(
                            CompileErrorKind::TypeMismatch,
                            tree.node(*cond).offset,
                            "condition must be numeric or bool",
                        ));
                    }
                    type_stmts(body, tree, bindings, dts, set, returns)?;
                }
                type_stmts(default, tree, bindings, dts, set, returns)?;
            }
            Stmt::For {
                slot,
                count,
                body,
                offset,
            } => {
                crate::infer::infer(tree, *count, bindings, dts)?;
                let cdt = tree.node(*count).dtype;
                if !(cdt.is_integer() || cdt == Dtype::Bool) {
                    return Err(CompileError::new(
                        CompileErrorKind::TypeMismatch,
                        *offset,
                        format!("range bound must be an integer, got {cdt}"),
                    ));
                }
                let slot = *slot as usize;
                if set[slot] && dts[slot] != Dtype::I64 {
                    return Err(CompileError::new(
                        CompileErrorKind::TypeMismatch,
                        *offset,
                        "loop variable reuses a local of a different dtype",
                    ));
                }
                dts[slot] = Dtype::I64;
                set[slot] = true;
                type_stmts(body, tree, bindings, dts, set, returns)?;
            }
            Stmt::Break | Stmt::Continue => {}
            Stmt::Return { value, offset } => {
                crate::infer::infer(tree, *value, bindings, dts)?;
                let dt = tree.node(*value).dtype;
                if dt == Dtype::Str {
                    return Err(CompileError::new(
                        CompileErrorKind::TypeMismatch,
                        *offset,
                        "kernels cannot return strings",
                    ));
                }
                returns.push((dt, *offset));
            }
        }
    }
    Ok(())
}

fn program_has_reductions(prog: &DslProgram) -> bool {
    (0..prog.tree.len()).any(|i| {
        matches!(
            prog.tree.node(crate::ast::NodeId(i as u32)).kind,
            NodeKind::Reduce(..)
        )
    })
}

fn stmts_have_control_flow(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| {
        matches!(
            s,
            Stmt::If { .. } | Stmt::For { .. } | Stmt::Break | Stmt::Continue
        )
    })
}
