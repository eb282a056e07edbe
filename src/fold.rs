//! Constant folding and algebraic simplification. Runs post-order after
//! inference; every rewrite may narrow a dtype, so inference runs again
//! over the whole tree before the result is used.

use crate::ast::{BinaryOp, ExprTree, NodeId, NodeKind, UnaryOp};
use crate::builtins::{self, BuiltinKind};
use crate::dtype::Dtype;
use crate::error::CompileError;
use crate::eval::complex_math;
use crate::eval::kernels;
use crate::infer;
use crate::scalar::Scalar;
use crate::simd;
use crate::var::Binding;

pub(crate) fn optimize(
    tree: &mut ExprTree,
    root: NodeId,
    bindings: &[Binding],
    locals: &[Dtype],
) -> Result<(), CompileError> {
    for id in tree.postorder(root) {
        fold_node(tree, id, bindings);
    }
    // folding may narrow subtree dtypes
    infer::infer(tree, root, bindings, locals)
}

fn const_of(tree: &ExprTree, id: NodeId) -> Option<&Scalar> {
    match &tree.node(id).kind {
        NodeKind::Const(s) => Some(s),
        _ => None,
    }
}

fn is_zero(s: &Scalar) -> bool {
    !matches!(s, Scalar::Str(_)) && !s.is_truthy()
}

fn is_one(s: &Scalar) -> bool {
    match s {
        Scalar::Str(_) | Scalar::Bool(_) => false,
        Scalar::F32(v) => *v == 1.0,
        Scalar::F64(v) => *v == 1.0,
        Scalar::C64(v) => v.re == 1.0 && v.im == 0.0,
        Scalar::C128(v) => v.re == 1.0 && v.im == 0.0,
        other => other.as_i64() == Some(1),
    }
}

/// Replaces `id` with a copy of `src` (identity rewrites like `x * 1 → x`).
fn alias(tree: &mut ExprTree, id: NodeId, src: NodeId) {
    let node = tree.node(src).clone();
    *tree.node_mut(id) = node;
}

fn set_const(tree: &mut ExprTree, id: NodeId, value: Scalar, weak: bool) {
    let node = tree.node_mut(id);
    node.dtype = value.dtype();
    node.input_dtype = value.dtype();
    node.kind = NodeKind::Const(value);
    node.weak = weak;
}

fn fold_node(tree: &mut ExprTree, id: NodeId, bindings: &[Binding]) {
    let node = tree.node(id).clone();
    match &node.kind {
        NodeKind::Unary(op, a) => {
            if let Some(sa) = const_of(tree, *a) {
                if let Ok(v) = kernels::scalar_unary(*op, node.input_dtype, sa) {
                    let weak = tree.node(*a).weak;
                    set_const(tree, id, v, weak);
                    return;
                }
            }
            // !!x → x
            if *op == UnaryOp::Not {
                if let NodeKind::Unary(UnaryOp::Not, inner) = tree.node(*a).kind {
                    alias(tree, id, inner);
                }
            }
        }
        NodeKind::Binary(op, a, b) => {
            if node.input_dtype == Dtype::Str {
                return;
            }
            if let (Some(sa), Some(sb)) = (const_of(tree, *a), const_of(tree, *b)) {
                if let Ok(v) = kernels::scalar_binary(*op, node.input_dtype, sa, sb) {
                    let weak = tree.node(*a).weak && tree.node(*b).weak;
                    set_const(tree, id, v, weak);
                    return;
                }
            }
            match op {
                BinaryOp::Add => {
                    if const_of(tree, *a).is_some_and(is_zero) {
                        alias(tree, id, *b);
                    } else if const_of(tree, *b).is_some_and(is_zero) {
                        alias(tree, id, *a);
                    }
                }
                BinaryOp::Sub => {
                    if const_of(tree, *b).is_some_and(is_zero) {
                        alias(tree, id, *a);
                    }
                }
                BinaryOp::Mul => {
                    if const_of(tree, *a).is_some_and(is_one) {
                        alias(tree, id, *b);
                    } else if const_of(tree, *b).is_some_and(is_one) {
                        alias(tree, id, *a);
                    }
                }
                BinaryOp::Div => {
                    if const_of(tree, *b).is_some_and(is_one) {
                        alias(tree, id, *a);
                    }
                }
                BinaryOp::Pow => {
                    if const_of(tree, *b).is_some_and(is_zero) {
                        let one = Scalar::F64(1.0)
                            .cast(node.dtype)
                            .unwrap_or(Scalar::F64(1.0));
                        set_const(tree, id, one, false);
                    } else if const_of(tree, *b).is_some_and(is_one) {
                        alias(tree, id, *a);
                    }
                }
                _ => {}
            }
        }
        NodeKind::Where(c, t, e) => {
            // dead branch elimination
            if let Some(sc) = const_of(tree, *c) {
                let taken = if sc.is_truthy() { *t } else { *e };
                alias(tree, id, taken);
            }
        }
        NodeKind::Cast(to, a) => {
            if let Some(sa) = const_of(tree, *a) {
                if let Some(v) = sa.cast(*to) {
                    set_const(tree, id, v, false);
                }
            }
        }
        NodeKind::Call(bid, args) => {
            if !builtins::def(*bid).pure {
                return;
            }
            let consts: Option<Vec<Scalar>> =
                args.iter().map(|&a| const_of(tree, a).cloned()).collect();
            if let Some(consts) = consts {
                if let Some(v) = fold_call(*bid, node.dtype, node.input_dtype, &consts) {
                    set_const(tree, id, v, false);
                }
            }
        }
        NodeKind::UserCall(slot, args) => {
            // only pure callables fold, and nothing folds across impure ones
            let binding = &bindings[*slot as usize];
            if !binding.is_pure() {
                return;
            }
            let consts: Option<Vec<f64>> = args
                .iter()
                .map(|&a| const_of(tree, a).and_then(Scalar::as_f64))
                .collect();
            if let (Some(consts), Some(f)) = (consts, binding.func.as_ref()) {
                set_const(tree, id, Scalar::F64(f(&consts)), false);
            }
        }
        _ => {}
    }
}

fn fold_call(
    bid: builtins::BuiltinId,
    out_dt: Dtype,
    in_dt: Dtype,
    args: &[Scalar],
) -> Option<Scalar> {
    let def = builtins::def(bid);
    match def.kind {
        BuiltinKind::Math1(op) => {
            if in_dt.is_integer() || in_dt == Dtype::Bool {
                // rounding family over integers is the identity
                return args[0].cast(out_dt);
            }
            match in_dt {
                Dtype::F64 => Some(Scalar::F64(simd::scalar_f64(op, args[0].as_f64()?))),
                Dtype::F32 => Some(Scalar::F32(simd::scalar_f64(op, args[0].as_f64()?) as f32)),
                Dtype::C64 | Dtype::C128 => {
                    Scalar::C128(complex_math(op, args[0].as_c128()?)).cast(out_dt)
                }
                _ => None,
            }
        }
        BuiltinKind::Math2(op) => {
            let v = simd::scalar2_f64(op, args[0].as_f64()?, args[1].as_f64()?);
            Scalar::F64(v).cast(out_dt)
        }
        BuiltinKind::Abs => match args[0] {
            Scalar::C64(z) => Some(Scalar::F32(z.norm())),
            Scalar::C128(z) => Some(Scalar::F64(z.norm())),
            Scalar::F32(v) => Some(Scalar::F32(v.abs())),
            Scalar::F64(v) => Some(Scalar::F64(v.abs())),
            ref s => Scalar::I64(s.as_i64()?.wrapping_abs()).cast(out_dt),
        },
        BuiltinKind::Real => match args[0] {
            Scalar::C64(z) => Some(Scalar::F32(z.re)),
            Scalar::C128(z) => Some(Scalar::F64(z.re)),
            ref s => Some(s.clone()),
        },
        BuiltinKind::Imag => match args[0] {
            Scalar::C64(z) => Some(Scalar::F32(z.im)),
            Scalar::C128(z) => Some(Scalar::F64(z.im)),
            ref s => Some(Scalar::zero(s.dtype())),
        },
        BuiltinKind::Conj => match args[0] {
            Scalar::C64(z) => Some(Scalar::C64(z.conj())),
            Scalar::C128(z) => Some(Scalar::C128(z.conj())),
            ref s => Some(s.clone()),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::Lexer;
    use crate::parse::{self, NameResolver, Resolved};
    use crate::var::VarDecl;

    struct OneVar(Dtype);

    impl NameResolver for OneVar {
        fn resolve(&mut self, name: &str) -> Option<Resolved> {
            (name == "x").then_some(Resolved::Var(0))
        }
    }

    fn optimized(src: &str, var_dt: Dtype) -> (ExprTree, NodeId) {
        let bindings = vec![Binding::from_decl(&VarDecl::new("x", var_dt))];
        let toks = Lexer::new(src, 0).tokenize().unwrap();
        let mut tree = ExprTree::new();
        let mut resolver = OneVar(var_dt);
        let root = parse::parse_expr(&toks, &mut tree, &mut resolver).unwrap();
        infer::infer(&mut tree, root, &bindings, &[]).unwrap();
        optimize(&mut tree, root, &bindings, &[]).unwrap();
        (tree, root)
    }

    #[test]
    fn folds_constant_subtrees() {
        let (tree, root) = optimized("2 + 3 * 4", Dtype::F64);
        assert!(matches!(tree.node(root).kind, NodeKind::Const(Scalar::I8(14))));

        let (tree, root) = optimized("2.0 ** 10", Dtype::F64);
        assert!(matches!(tree.node(root).kind, NodeKind::Const(Scalar::F64(v)) if v == 1024.0));
    }

    #[test]
    fn identities() {
        let (tree, root) = optimized("x + 0", Dtype::I32);
        assert!(matches!(tree.node(root).kind, NodeKind::Var(0)));

        let (tree, root) = optimized("1 * x", Dtype::F32);
        assert!(matches!(tree.node(root).kind, NodeKind::Var(0)));

        let (tree, root) = optimized("x ** 1", Dtype::F64);
        assert!(matches!(tree.node(root).kind, NodeKind::Var(0)));

        let (tree, root) = optimized("x ** 0", Dtype::F64);
        assert!(matches!(tree.node(root).kind, NodeKind::Const(Scalar::F64(v)) if v == 1.0));

        let (tree, root) = optimized("!!x", Dtype::Bool);
        assert!(matches!(tree.node(root).kind, NodeKind::Var(0)));
    }

    #[test]
    fn dead_branches_and_math() {
        let (tree, root) = optimized("where(1 < 2, x, x * 2)", Dtype::I64);
        assert!(matches!(tree.node(root).kind, NodeKind::Var(0)));

        let (tree, root) = optimized("sqrt(4.0) + x", Dtype::F64);
        let NodeKind::Binary(BinaryOp::Add, lhs, _) = tree.node(root).kind else {
            panic!("expected + at root");
        };
        assert!(matches!(tree.node(lhs).kind, NodeKind::Const(Scalar::F64(v)) if v == 2.0));
    }

    #[test]
    fn refines_dtype_after_folding() {
        // the folded constant is weak and must not widen the result
        let (tree, root) = optimized("x + (3 - 3)", Dtype::I16);
        assert_eq!(tree.node(root).dtype, Dtype::I16);
    }
}
