//! Dtype inference: a post-order walk assigning every node its result
//! dtype and the promoted dtype its children are evaluated in.
//!
//! Weak literals adapt to their siblings before promotion: a bare float
//! literal next to an `f32` (or `c64`) operand narrows to the 32-bit width
//! instead of silently widening the whole pipeline to `f64`.

use crate::ast::{BinaryOp, ExprTree, NodeId, NodeKind, UnaryOp};
use crate::builtins::{self, BuiltinKind, Domain, OutRule};

use crate::dtype::{self, Dtype, ReduceOp};
use crate::error::{CompileError, CompileErrorKind};
use crate::var::Binding;

pub(crate) fn infer(
    tree: &mut ExprTree,
    root: NodeId,
    bindings: &[Binding],
    locals: &[Dtype],
) -> Result<(), CompileError> {
    for id in tree.postorder(root) {
        infer_node(tree, id, bindings, locals)?;
    }
    Ok(())
}

fn mismatch(offset: usize, detail: impl Into<String>) -> CompileError {
    CompileError::new(CompileErrorKind::TypeMismatch, offset, detail)
}

/// Narrow a weak `f64`/`c128` subtree to the 32-bit widths. Only weak nodes
/// are touched, so a literal folded into a wider expression stays put.
fn retype_weak_narrow(tree: &mut ExprTree, id: NodeId) {
    if !tree.node(id).weak {
        return;
    }
    for child in tree.children(id) {
        retype_weak_narrow(tree, child);
    }
    let node = tree.node_mut(id);
    for dt in [&mut node.dtype, &mut node.input_dtype] {
        *dt = match *dt {
            Dtype::F64 => Dtype::F32,
            Dtype::C128 => Dtype::C64,
            other => other,
        };
    }
    // stored literals must match the narrowed dtype
    let narrowed = node.dtype;
    if let NodeKind::Const(value) = &mut node.kind {
        if value.dtype() != narrowed {
            if let Some(cast) = value.cast(narrowed) {
                *value = cast;
            }
        }
    }
}

/// True when the sibling's width asks a weak float literal to narrow.
fn wants_narrow(weak: Dtype, sibling: Dtype) -> bool {
    matches!(weak, Dtype::F64 | Dtype::C128) && matches!(sibling, Dtype::F32 | Dtype::C64)
}

fn promote_pair(
    tree: &mut ExprTree,
    a: NodeId,
    b: NodeId,
    offset: usize,
) -> Result<Dtype, CompileError> {
    let (da, wa) = {
        let n = tree.node(a);
        (n.dtype, n.weak)
    };
    let (db, wb) = {
        let n = tree.node(b);
        (n.dtype, n.weak)
    };
    if wa && !wb && wants_narrow(da, db) {
        retype_weak_narrow(tree, a);
    } else if wb && !wa && wants_narrow(db, da) {
        retype_weak_narrow(tree, b);
    }
    let (da, db) = (tree.node(a).dtype, tree.node(b).dtype);
    dtype::promote(da, db).ok_or_else(|| mismatch(offset, format!("cannot combine {da} and {db}")))
}

/// Promoted float (or complex) dtype for a transcendental operand.
fn float_input(dt: Dtype, domain: Domain, offset: usize) -> Result<Dtype, CompileError> {
    match dt {
        Dtype::F32 | Dtype::F64 => Ok(dt),
        Dtype::C64 | Dtype::C128 => {
            if domain == Domain::FloatOrComplex {
                Ok(dt)
            } else {
                Err(mismatch(offset, "complex operand not accepted"))
            }
        }
        Dtype::Str => Err(mismatch(offset, "string operand in numeric function")),
        _ => Ok(Dtype::F64),
    }
}

fn infer_node(
    tree: &mut ExprTree,
    id: NodeId,
    bindings: &[Binding],
    locals: &[Dtype],
) -> Result<(), CompileError> {
    let (kind, offset) = {
        let n = tree.node(id);
        (n.kind.clone(), n.offset)
    };
    let (dtype, input_dtype, weak) = match kind {
        NodeKind::Const(_) => return Ok(()), // typed at parse
        NodeKind::Var(slot) => {
            let b = &bindings[slot as usize];
            (b.dtype, b.dtype, false)
        }
        NodeKind::Local(slot) => {
            let dt = locals[slot as usize];
            (dt, dt, false)
        }
        NodeKind::Index(_) => (Dtype::I64, Dtype::I64, false),
        NodeKind::Unary(op, child) => {
            let (cd, cw) = {
                let n = tree.node(child);
                (n.dtype, n.weak)
            };
            match op {
                UnaryOp::Neg => {
                    if cd == Dtype::Str {
                        return Err(mismatch(offset, "cannot negate a string"));
                    }
                    let dt = if cd == Dtype::Bool { Dtype::I8 } else { cd };
                    (dt, dt, cw)
                }
                UnaryOp::Not => {
                    if !(cd.is_integer() || cd == Dtype::Bool) {
                        return Err(mismatch(offset, format!("cannot apply not to {cd}")));
                    }
                    (cd, cd, cw)
                }
            }
        }
        NodeKind::Binary(op, lhs, rhs) => {
            let (ld, rd) = (tree.node(lhs).dtype, tree.node(rhs).dtype);
            if ld == Dtype::Str || rd == Dtype::Str {
                // strings support equality only; everything else mismatches
                if ld != rd {
                    return Err(mismatch(offset, format!("cannot combine {ld} and {rd}")));
                }
                if !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    return Err(mismatch(offset, "strings support only == and !="));
                }
                (Dtype::Bool, Dtype::Str, false)
            } else if op.is_comparison() {
                let common = promote_pair(tree, lhs, rhs, offset)?;
                if common.is_complex() && !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    return Err(mismatch(offset, "complex values have no ordering"));
                }
                (Dtype::Bool, common, false)
            } else {
                match op {
                    BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                        if ld == Dtype::Bool && rd == Dtype::Bool {
                            (Dtype::Bool, Dtype::Bool, false)
                        } else {
                            let common = promote_pair(tree, lhs, rhs, offset)?;
                            if !common.is_integer() {
                                return Err(mismatch(
                                    offset,
                                    format!("bitwise operator needs integers, got {common}"),
                                ));
                            }
                            let weak = tree.node(lhs).weak && tree.node(rhs).weak;
                            (common, common, weak)
                        }
                    }
                    BinaryOp::Shl | BinaryOp::Shr => {
                        let common = promote_pair(tree, lhs, rhs, offset)?;
                        if !common.is_integer() {
                            return Err(mismatch(
                                offset,
                                format!("shift needs integers, got {common}"),
                            ));
                        }
                        let weak = tree.node(lhs).weak && tree.node(rhs).weak;
                        (common, common, weak)
                    }
                    BinaryOp::Rem => {
                        let common = promote_pair(tree, lhs, rhs, offset)?;
                        if common.is_complex() {
                            return Err(mismatch(offset, "remainder of complex values"));
                        }
                        let weak = tree.node(lhs).weak && tree.node(rhs).weak;
                        (common, common, weak)
                    }
                    _ => {
                        let common = promote_pair(tree, lhs, rhs, offset)?;
                        let weak = tree.node(lhs).weak && tree.node(rhs).weak;
                        (common, common, weak)
                    }
                }
            }
        }
        NodeKind::Call(bid, ref args) => {
            let def = builtins::def(bid);
            match def.kind {
                BuiltinKind::Math1(_) => {
                    let cd = tree.node(args[0]).dtype;
                    if def.out == OutRule::SameAsOperand {
                        // rounding family: type-preserving, ints untouched
                        if !(cd.is_integer() || cd.is_float() || cd == Dtype::Bool) {
                            return Err(mismatch(
                                offset,
                                format!("`{}` needs a real operand, got {cd}", def.name),
                            ));
                        }
                        (cd, cd, false)
                    } else {
                        let dt = float_input(cd, def.domain, offset)?;
                        (dt, dt, false)
                    }
                }
                BuiltinKind::Math2(_) => {
                    let common = promote_pair(tree, args[0], args[1], offset)?;
                    let dt = float_input(common, def.domain, offset)?;
                    if dt.is_complex() {
                        return Err(mismatch(
                            offset,
                            format!("`{}` does not accept complex operands", def.name),
                        ));
                    }
                    (dt, dt, false)
                }
                BuiltinKind::Abs => {
                    let cd = tree.node(args[0]).dtype;
                    match cd {
                        Dtype::Str => return Err(mismatch(offset, "abs of a string")),
                        Dtype::Bool => (Dtype::I8, Dtype::I8, false),
                        Dtype::C64 => (Dtype::F32, Dtype::C64, false),
                        Dtype::C128 => (Dtype::F64, Dtype::C128, false),
                        real => (real, real, false),
                    }
                }
                BuiltinKind::Real | BuiltinKind::Imag => {
                    let cd = tree.node(args[0]).dtype;
                    match cd {
                        Dtype::Str => return Err(mismatch(offset, "string operand")),
                        Dtype::C64 => (Dtype::F32, Dtype::C64, false),
                        Dtype::C128 => (Dtype::F64, Dtype::C128, false),
                        real => (real, real, false),
                    }
                }
                BuiltinKind::Conj => {
                    let cd = tree.node(args[0]).dtype;
                    if cd == Dtype::Str {
                        return Err(mismatch(offset, "string operand"));
                    }
                    (cd, cd, false)
                }
                BuiltinKind::StrPred(_) => {
                    let (a, b) = (tree.node(args[0]).dtype, tree.node(args[1]).dtype);
                    if a != Dtype::Str || b != Dtype::Str {
                        return Err(mismatch(
                            offset,
                            format!("`{}` needs two strings, got {a} and {b}", def.name),
                        ));
                    }
                    (Dtype::Bool, Dtype::Str, false)
                }
                // reductions and where are dedicated node kinds
                BuiltinKind::Reduce(_) | BuiltinKind::Where => {
                    return Err(CompileError::new(
                        CompileErrorKind::Syntax,
                        offset,
                        "internal: misrouted builtin",
                    ));
                }
            }
        }
        NodeKind::UserCall(slot, ref args) => {
            // user functions evaluate lane-wise over f64
            for &arg in args {
                let ad = tree.node(arg).dtype;
                if ad == Dtype::Str || ad.is_complex() {
                    return Err(mismatch(
                        offset,
                        format!("`{}` accepts real arguments, got {ad}", bindings[slot as usize].name),
                    ));
                }
            }
            (Dtype::F64, Dtype::F64, false)
        }
        NodeKind::Reduce(op, child) => {
            let cd = tree.node(child).dtype;
            if cd == Dtype::Str {
                return Err(mismatch(offset, "cannot reduce strings"));
            }
            if cd.is_complex() && matches!(op, ReduceOp::Min | ReduceOp::Max) {
                return Err(mismatch(offset, "complex values have no ordering"));
            }
            (dtype::reduce_output(op, cd), cd, false)
        }
        NodeKind::Where(cond, then, els) => {
            let cd = tree.node(cond).dtype;
            if cd == Dtype::Str {
                return Err(mismatch(offset, "where condition must be numeric or bool"));
            }
            let common = promote_pair(tree, then, els, offset)?;
            (common, common, false)
        }
        NodeKind::Cast(to, child) => {
            let cd = tree.node(child).dtype;
            if !dtype::castable(cd, to) {
                return Err(CompileError::new(
                    CompileErrorKind::TypeUnrepresentable,
                    offset,
                    format!("cannot represent {cd} as {to}"),
                ));
            }
            (to, cd, false)
        }
    };
    let node = tree.node_mut(id);
    node.dtype = dtype;
    node.input_dtype = input_dtype;
    node.weak = weak;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::Lexer;
    use crate::parse::{self, NameResolver, Resolved};
    use crate::var::VarDecl;

    struct Vars(Vec<Binding>);

    impl NameResolver for Vars {
        fn resolve(&mut self, name: &str) -> Option<Resolved> {
            let slot = self.0.iter().position(|b| b.name == name)?;
            Some(Resolved::Var(slot as u32))
        }
    }

    fn typed(src: &str, vars: &[(&str, Dtype)]) -> Result<Dtype, CompileError> {
        let bindings: Vec<Binding> = vars
            .iter()
            .map(|(n, dt)| Binding::from_decl(&VarDecl::new(*n, *dt)))
            .collect();
        let toks = Lexer::new(src, 0).tokenize().map_err(CompileError::from)?;
        let mut tree = ExprTree::new();
        let mut resolver = Vars(bindings);
        let root = parse::parse_expr(&toks, &mut tree, &mut resolver)?;
        infer(&mut tree, root, &resolver.0, &[])?;
        Ok(tree.node(root).dtype)
    }

    #[test]
    fn promotion_through_operators() {
        assert_eq!(typed("a + b", &[("a", Dtype::I32), ("b", Dtype::F64)]).unwrap(), Dtype::F64);
        assert_eq!(typed("a * b", &[("a", Dtype::I16), ("b", Dtype::U8)]).unwrap(), Dtype::I16);
        assert_eq!(typed("a < b", &[("a", Dtype::I8), ("b", Dtype::I8)]).unwrap(), Dtype::Bool);
        assert_eq!(typed("a & b", &[("a", Dtype::Bool), ("b", Dtype::Bool)]).unwrap(), Dtype::Bool);
    }

    #[test]
    fn weak_literals_respect_f32() {
        // the float literal must not widen the f32 pipeline
        assert_eq!(typed("a * 2.5", &[("a", Dtype::F32)]).unwrap(), Dtype::F32);
        assert_eq!(typed("a * 2.5", &[("a", Dtype::F64)]).unwrap(), Dtype::F64);
        assert_eq!(typed("a + 1", &[("a", Dtype::I16)]).unwrap(), Dtype::I16);
        assert_eq!(typed("a + 300", &[("a", Dtype::I16)]).unwrap(), Dtype::I16);
        assert_eq!(typed("2.5", &[]).unwrap(), Dtype::F64);
        assert_eq!(typed("(0.5 + 1.5) * a", &[("a", Dtype::F32)]).unwrap(), Dtype::F32);
    }

    #[test]
    fn transcendental_types() {
        assert_eq!(typed("sin(a)", &[("a", Dtype::I32)]).unwrap(), Dtype::F64);
        assert_eq!(typed("sin(a)", &[("a", Dtype::F32)]).unwrap(), Dtype::F32);
        assert_eq!(typed("abs(a)", &[("a", Dtype::C64)]).unwrap(), Dtype::F32);
        assert_eq!(typed("floor(a)", &[("a", Dtype::I64)]).unwrap(), Dtype::I64);
        assert!(typed("erf(a)", &[("a", Dtype::C128)]).is_err());
    }

    #[test]
    fn reductions_and_comparisons() {
        assert_eq!(typed("sum(a != 0)", &[("a", Dtype::I32)]).unwrap(), Dtype::I64);
        assert_eq!(typed("sum(a)", &[("a", Dtype::U16)]).unwrap(), Dtype::U64);
        assert_eq!(typed("max(a)", &[("a", Dtype::F32)]).unwrap(), Dtype::F32);
        assert_eq!(typed("any(a)", &[("a", Dtype::F64)]).unwrap(), Dtype::Bool);
    }

    #[test]
    fn string_rules() {
        let vars = &[("s", Dtype::Str), ("t", Dtype::Str), ("x", Dtype::I32)];
        assert_eq!(typed("s == t", vars).unwrap(), Dtype::Bool);
        assert_eq!(typed("startswith(s, t)", vars).unwrap(), Dtype::Bool);
        assert!(typed("s < t", vars).is_err());
        assert!(typed("s + t", vars).is_err());
        assert!(typed("s == x", vars).is_err());
    }
}
