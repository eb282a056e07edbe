use crate::ast::{Args, BinaryOp, ExprTree, IndexVar, Node, NodeId, NodeKind, UnaryOp};
use crate::builtins::{self, BuiltinKind};
use crate::dtype::{Dtype, narrowest_signed};
use crate::error::{CompileError, CompileErrorKind};
use crate::lex::{Token, TokKind};
use crate::scalar::Scalar;

/// How an identifier resolves at compile time. Bindings are fixed before
/// parsing; the DSL front-end adds locals and the reserved index names.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Resolved {
    /// Data variable, by binding slot
    Var(u32),
    /// User function or closure bound to a slot, with its declared arity
    Func(u32, u8),
    /// DSL local, by frame slot
    Local(u32),
    Index(IndexVar),
}

pub(crate) trait NameResolver {
    fn resolve(&mut self, name: &str) -> Option<Resolved>;
}

/// Parses one infix expression spanning the whole token stream.
pub(crate) fn parse_expr<R: NameResolver>(
    toks: &[Token],
    tree: &mut ExprTree,
    resolver: &mut R,
) -> Result<NodeId, CompileError> {
    let mut p = Parser {
        toks,
        pos: 0,
        tree,
        resolver,
    };
    let root = p.expr(0)?;
    let trailing = p.peek();
    if trailing.kind != TokKind::Eof {
        return Err(CompileError::new(
            CompileErrorKind::Syntax,
            trailing.offset,
            "unexpected trailing input",
        ));
    }
    Ok(root)
}

struct Parser<'a, R> {
    toks: &'a [Token],
    pos: usize,
    tree: &'a mut ExprTree,
    resolver: &'a mut R,
}

/// Left/right binding powers; right-associative `**` binds its right side
/// one step looser than its left.
fn infix_power(kind: &TokKind) -> Option<(BinaryOp, u8, u8)> {
    let (op, prec) = match kind {
        TokKind::Pipe => (BinaryOp::BitOr, 1),
        TokKind::Caret => (BinaryOp::BitXor, 2),
        TokKind::Amp => (BinaryOp::BitAnd, 3),
        TokKind::EqEq => (BinaryOp::Eq, 4),
        TokKind::Ne => (BinaryOp::Ne, 4),
        TokKind::Lt => (BinaryOp::Lt, 5),
        TokKind::Le => (BinaryOp::Le, 5),
        TokKind::Gt => (BinaryOp::Gt, 5),
        TokKind::Ge => (BinaryOp::Ge, 5),
        TokKind::Shl => (BinaryOp::Shl, 6),
        TokKind::Shr => (BinaryOp::Shr, 6),
        TokKind::Plus => (BinaryOp::Add, 7),
        TokKind::Minus => (BinaryOp::Sub, 7),
        TokKind::Star => (BinaryOp::Mul, 8),
        TokKind::Slash => (BinaryOp::Div, 8),
        TokKind::Percent => (BinaryOp::Rem, 8),
        TokKind::StarStar => return Some((BinaryOp::Pow, 20, 19)),
        _ => return None,
    };
    Some((op, prec * 2, prec * 2 + 1))
}

// binding power of unary sign/not: between multiplicative and `**`
const UNARY_BP: u8 = 18;

impl<R: NameResolver> Parser<'_, R> {
    fn peek(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, kind: &TokKind, what: &str) -> Result<(), CompileError> {
        let t = self.bump();
        if &t.kind == kind {
            Ok(())
        } else {
            Err(CompileError::new(
                CompileErrorKind::Syntax,
                t.offset,
                format!("expected {what}"),
            ))
        }
    }

    fn expr(&mut self, min_bp: u8) -> Result<NodeId, CompileError> {
        let mut lhs = self.prefix()?;
        loop {
            let tok = self.peek();
            let Some((op, lbp, rbp)) = infix_power(&tok.kind) else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            let offset = tok.offset;
            self.bump();
            let rhs = self.expr(rbp)?;
            lhs = self
                .tree
                .push(Node::new(NodeKind::Binary(op, lhs, rhs), offset));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<NodeId, CompileError> {
        let tok = self.bump();
        let offset = tok.offset;
        match tok.kind {
            TokKind::Int(v) => {
                let scalar = if v <= i64::MAX as u64 {
                    match narrowest_signed(v as i64) {
                        Dtype::I8 => Scalar::I8(v as i8),
                        Dtype::I16 => Scalar::I16(v as i16),
                        Dtype::I32 => Scalar::I32(v as i32),
                        _ => Scalar::I64(v as i64),
                    }
                } else {
                    Scalar::U64(v)
                };
                Ok(self.push_literal(scalar, offset))
            }
            TokKind::Float(v) => Ok(self.push_literal(Scalar::F64(v), offset)),
            TokKind::StrLit(s) => {
                let mut node = Node::new(NodeKind::Const(Scalar::Str(s)), offset);
                node.dtype = Dtype::Str;
                node.input_dtype = Dtype::Str;
                Ok(self.tree.push(node))
            }
            TokKind::LParen => {
                let inner = self.expr(0)?;
                self.expect(&TokKind::RParen, "`)`")?;
                Ok(inner)
            }
            TokKind::Minus => {
                let operand = self.expr(UNARY_BP)?;
                Ok(self
                    .tree
                    .push(Node::new(NodeKind::Unary(UnaryOp::Neg, operand), offset)))
            }
            TokKind::Plus => self.expr(UNARY_BP),
            TokKind::Bang | TokKind::Tilde => {
                let operand = self.expr(UNARY_BP)?;
                Ok(self
                    .tree
                    .push(Node::new(NodeKind::Unary(UnaryOp::Not, operand), offset)))
            }
            TokKind::Ident(name) => self.ident(&name, offset),
            other => Err(CompileError::new(
                CompileErrorKind::Syntax,
                offset,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    fn push_literal(&mut self, scalar: Scalar, offset: usize) -> NodeId {
        let dtype = scalar.dtype();
        let mut node = Node::new(NodeKind::Const(scalar), offset);
        node.dtype = dtype;
        node.input_dtype = dtype;
        node.weak = true;
        self.tree.push(node)
    }

    fn ident(&mut self, name: &str, offset: usize) -> Result<NodeId, CompileError> {
        if let Some(resolved) = self.resolver.resolve(name) {
            return match resolved {
                Resolved::Var(slot) => Ok(self.tree.push(Node::new(NodeKind::Var(slot), offset))),
                Resolved::Local(slot) => {
                    Ok(self.tree.push(Node::new(NodeKind::Local(slot), offset)))
                }
                Resolved::Index(iv) => Ok(self.tree.push(Node::new(NodeKind::Index(iv), offset))),
                Resolved::Func(slot, arity) => {
                    let args = self.call_args(name, offset)?;
                    if args.len() != arity as usize {
                        return Err(CompileError::new(
                            CompileErrorKind::Arity,
                            offset,
                            format!("`{name}` takes {arity} arguments, got {}", args.len()),
                        ));
                    }
                    Ok(self
                        .tree
                        .push(Node::new(NodeKind::UserCall(slot, args), offset)))
                }
            };
        }
        let Some((id, def)) = builtins::lookup(name) else {
            return Err(CompileError::new(
                CompileErrorKind::UnresolvedName,
                offset,
                format!("unknown identifier `{name}`"),
            ));
        };
        let args = self.call_args(name, offset)?;
        if args.len() != def.arity as usize {
            return Err(CompileError::new(
                CompileErrorKind::Arity,
                offset,
                format!("`{name}` takes {} arguments, got {}", def.arity, args.len()),
            ));
        }
        let kind = match def.kind {
            BuiltinKind::Reduce(op) => NodeKind::Reduce(op, args[0]),
            BuiltinKind::Where => NodeKind::Where(args[0], args[1], args[2]),
            _ => NodeKind::Call(id, args),
        };
        Ok(self.tree.push(Node::new(kind, offset)))
    }

    fn call_args(&mut self, name: &str, offset: usize) -> Result<Args, CompileError> {
        if self.peek().kind != TokKind::LParen {
            return Err(CompileError::new(
                CompileErrorKind::Syntax,
                offset,
                format!("`{name}` is a function and must be called"),
            ));
        }
        self.bump();
        let mut args = Args::new();
        if self.peek().kind == TokKind::RParen {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.expr(0)?);
            let t = self.bump();
            match t.kind {
                TokKind::Comma => {}
                TokKind::RParen => return Ok(args),
                _ => {
                    return Err(CompileError::new(
                        CompileErrorKind::Syntax,
                        t.offset,
                        "expected `,` or `)`",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::Lexer;

    struct TwoVars;

    impl NameResolver for TwoVars {
        fn resolve(&mut self, name: &str) -> Option<Resolved> {
            match name {
                "a" => Some(Resolved::Var(0)),
                "b" => Some(Resolved::Var(1)),
                _ => None,
            }
        }
    }

    fn parse(src: &str) -> Result<(ExprTree, NodeId), CompileError> {
        let toks = Lexer::new(src, 0).tokenize().map_err(CompileError::from)?;
        let mut tree = ExprTree::new();
        let root = parse_expr(&toks, &mut tree, &mut TwoVars)?;
        Ok((tree, root))
    }

    #[test]
    fn precedence() {
        let (tree, root) = parse("a + b * a").unwrap();
        let NodeKind::Binary(BinaryOp::Add, _, rhs) = tree.node(root).kind else {
            panic!("expected + at root");
        };
        assert!(matches!(
            tree.node(rhs).kind,
            NodeKind::Binary(BinaryOp::Mul, _, _)
        ));

        // `^` is xor and binds looser than comparison
        let (tree, root) = parse("a ^ b == a").unwrap();
        assert!(matches!(
            tree.node(root).kind,
            NodeKind::Binary(BinaryOp::BitXor, _, _)
        ));
    }

    #[test]
    fn pow_is_right_associative_and_tight() {
        let (tree, root) = parse("a ** b ** a").unwrap();
        let NodeKind::Binary(BinaryOp::Pow, _, rhs) = tree.node(root).kind else {
            panic!("expected ** at root");
        };
        assert!(matches!(
            tree.node(rhs).kind,
            NodeKind::Binary(BinaryOp::Pow, _, _)
        ));

        let (tree, root) = parse("-a ** 2").unwrap();
        assert!(matches!(
            tree.node(root).kind,
            NodeKind::Unary(UnaryOp::Neg, _)
        ));
    }

    #[test]
    fn calls_and_reductions() {
        let (tree, root) = parse("sum(a != 0)").unwrap();
        assert!(matches!(
            tree.node(root).kind,
            NodeKind::Reduce(crate::dtype::ReduceOp::Sum, _)
        ));

        let (tree, root) = parse("where(a > b, a, b)").unwrap();
        assert!(matches!(tree.node(root).kind, NodeKind::Where(_, _, _)));

        let err = parse("atan2(a)").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Arity);

        let err = parse("nosuch(a)").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnresolvedName);
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn error_offsets() {
        let err = parse("a + )").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax);
        assert_eq!(err.offset, 4);

        let err = parse("a + q").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnresolvedName);
        assert_eq!(err.offset, 4);
    }
}
