//! The block interpreter: walks the compiled tree post-order over fixed
//! blocks of elements, materialising one typed temporary per node and
//! writing the root through the output cast.

pub(crate) mod kernels;

use std::cell::Cell;

use num::complex::Complex64;
use once_cell::sync::Lazy;
use smallvec::SmallVec;

use crate::ast::{ExprTree, IndexVar, NodeId, NodeKind};
use crate::buffer::{BufferMut, BufferRef};
use crate::builtins::{self, BuiltinKind, StrPred};
use crate::dtype::{Dtype, ReduceOp};
use crate::error::EvalError;
use crate::scalar::{Scalar, trim_padding, ucs4_eq};
use crate::simd::{self, EvalParams, FSrc, MathOp};
use crate::var::Binding;

use kernels::{ColVec, Lane, Operand, Src, convert};

/// Elements per interpreter block, sized for L1-resident temporaries.
pub(crate) const BLOCK_LEN: usize = 1024;

/// Reserved index values materialised for one block.
#[derive(Debug, Clone)]
pub(crate) struct IndexBlock {
    pub rank: usize,
    pub shape: SmallVec<[i64; 8]>,
    /// Block-local index per dimension, one column per dimension
    pub dims: SmallVec<[Vec<i64>; 2]>,
    /// Global row-major linear index
    pub flat: Vec<i64>,
}

impl IndexBlock {
    /// Sub-view of lanes `start .. start + len`, used by the element
    /// dialect to address one lane at a time.
    pub(crate) fn slice(&self, start: usize, len: usize) -> IndexBlock {
        IndexBlock {
            rank: self.rank,
            shape: self.shape.clone(),
            dims: self
                .dims
                .iter()
                .map(|col| col[start..start + len].to_vec())
                .collect(),
            flat: self.flat[start..start + len].to_vec(),
        }
    }
}

/// Where reserved index variables come from during a call.
pub(crate) enum IndexSource<'a> {
    /// Index variables are not available (plain infix evaluation)
    None,
    /// 1-D walk: `_i0` and `_flat_idx` are the global element index
    Linear { nitems: usize },
    /// N-D walk over one padded block region
    Region(&'a crate::nd::BlockRegion),
}

impl IndexSource<'_> {
    pub(crate) fn materialize(&self, base: usize, len: usize) -> Option<IndexBlock> {
        match self {
            Self::None => None,
            Self::Linear { nitems } => {
                let flat: Vec<i64> = (base..base + len).map(|i| i as i64).collect();
                let mut dims = SmallVec::new();
                dims.push(flat.clone());
                let mut shape = SmallVec::new();
                shape.push(*nitems as i64);
                Some(IndexBlock {
                    rank: 1,
                    shape,
                    dims,
                    flat,
                })
            }
            Self::Region(region) => Some(region.index_block(base, len)),
        }
    }
}

static POS_CACHE_ENABLED: Lazy<bool> =
    Lazy::new(|| std::env::var("DSL_JIT_POS_CACHE").is_ok_and(|v| v == "1"));

thread_local! {
    // memoises the last scalar sin/cos argument seen by this thread
    static POS_CACHE: Cell<(u8, u64, f64)> = const { Cell::new((u8::MAX, 0, 0.0)) };
}

fn scalar_math_cached(op: MathOp, x: f64) -> f64 {
    if *POS_CACHE_ENABLED && matches!(op, MathOp::Sin | MathOp::Cos) {
        let tag = if op == MathOp::Sin { 0 } else { 1 };
        let key = x.to_bits();
        let (ctag, ckey, cval) = POS_CACHE.with(Cell::get);
        if ctag == tag && ckey == key {
            return cval;
        }
        let val = simd::scalar_f64(op, x);
        POS_CACHE.with(|c| c.set((tag, key, val)));
        return val;
    }
    simd::scalar_f64(op, x)
}

/// Per-block evaluation context.
pub(crate) struct BlockCtx<'a, 'e> {
    pub base: usize,
    pub len: usize,
    pub idx: Option<&'a IndexBlock>,
    /// DSL frame; empty for infix expressions
    pub locals: &'a [Operand<'e>],
    /// DSL active lane mask; its presence switches reductions to block scope
    pub mask: Option<&'a [bool]>,
    /// Whole-call reduction results, indexed by node
    pub reductions: &'a [Option<Scalar>],
}

/// Post-order schedule that stops descending at reduction nodes; their
/// results come precomputed through the context.
pub(crate) fn pruned_postorder(tree: &ExprTree, root: NodeId, prune_reduce: bool) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        stack.push((id, true));
        // a pruned reduction is scheduled but its subtree is not: the
        // result arrives precomputed through the context
        if prune_reduce && matches!(tree.node(id).kind, NodeKind::Reduce(..)) {
            continue;
        }
        for child in tree.children(id).iter().rev() {
            stack.push((*child, false));
        }
    }
    order
}

/// Collects reduction nodes reachable from `root`, innermost first.
pub(crate) fn reduce_schedule(tree: &ExprTree, root: NodeId) -> Vec<NodeId> {
    tree.postorder(root)
        .into_iter()
        .filter(|&id| matches!(tree.node(id).kind, NodeKind::Reduce(..)))
        .collect()
}

pub(crate) struct Interpreter<'e> {
    pub tree: &'e ExprTree,
    pub bindings: &'e [Binding],
    pub inputs: &'e [Option<BufferRef<'e>>],
    pub params: EvalParams,
}

impl<'e> Interpreter<'e> {
    /// Evaluates the subtree under `root` for one block.
    pub(crate) fn eval_expr(
        &self,
        root: NodeId,
        ctx: &BlockCtx<'_, 'e>,
    ) -> Result<Operand<'e>, EvalError> {
        let in_dsl = ctx.mask.is_some();
        let order = pruned_postorder(self.tree, root, !in_dsl);
        self.eval_with_order(&order, root, ctx)
    }

    pub(crate) fn eval_with_order(
        &self,
        order: &[NodeId],
        root: NodeId,
        ctx: &BlockCtx<'_, 'e>,
    ) -> Result<Operand<'e>, EvalError> {
        let mut slots: Vec<Option<Operand<'e>>> = vec![None; self.tree.len()];
        for &id in order {
            let value = self.eval_node(id, ctx, &slots)?;
            slots[id.index()] = Some(value);
        }
        slots[root.index()]
            .take()
            .ok_or(EvalError::Internal("missing root temporary"))
    }

    fn slot<'s>(
        &self,
        slots: &'s [Option<Operand<'e>>],
        id: NodeId,
    ) -> Result<&'s Operand<'e>, EvalError> {
        slots[id.index()]
            .as_ref()
            .ok_or(EvalError::Internal("child evaluated out of order"))
    }

    /// Child operand converted to the parent's promoted input dtype.
    fn child_as(
        &self,
        slots: &[Option<Operand<'e>>],
        id: NodeId,
        want: Dtype,
        len: usize,
    ) -> Result<Operand<'e>, EvalError> {
        let have = self.tree.node(id).dtype;
        let op = self.slot(slots, id)?;
        convert(op, have, want, len)
    }

    fn eval_node(
        &self,
        id: NodeId,
        ctx: &BlockCtx<'_, 'e>,
        slots: &[Option<Operand<'e>>],
    ) -> Result<Operand<'e>, EvalError> {
        let node = self.tree.node(id);
        let len = ctx.len;
        match &node.kind {
            NodeKind::Const(s) => Ok(Operand::Scalar(s.clone())),
            NodeKind::Var(slot) => {
                let buf = self.inputs[*slot as usize]
                    .as_ref()
                    .ok_or_else(|| EvalError::MissingInput(self.bindings[*slot as usize].name.clone()))?;
                if buf.len() == 1 {
                    Ok(Operand::Scalar(buf.get(0)))
                } else {
                    Ok(Operand::View(buf.slice(ctx.base, len)))
                }
            }
            NodeKind::Local(slot) => ctx
                .locals
                .get(*slot as usize)
                .cloned()
                .ok_or(EvalError::Internal("unset local")),
            NodeKind::Index(iv) => {
                let idx = ctx.idx.ok_or(EvalError::Internal("index variables unavailable"))?;
                Ok(match iv {
                    IndexVar::Ndim => Operand::Scalar(Scalar::I64(idx.rank as i64)),
                    IndexVar::ShapeDim(d) => Operand::Scalar(Scalar::I64(
                        idx.shape.get(*d as usize).copied().unwrap_or(0),
                    )),
                    IndexVar::Dim(d) => match idx.dims.get(*d as usize) {
                        Some(col) => Operand::Vec(ColVec::I64(col.clone())),
                        None => Operand::Scalar(Scalar::I64(0)),
                    },
                    IndexVar::FlatIdx => Operand::Vec(ColVec::I64(idx.flat.clone())),
                })
            }
            NodeKind::Unary(op, a) => {
                let ca = self.child_as(slots, *a, node.input_dtype, len)?;
                kernels::unary_op(*op, node.input_dtype, &ca, len)
            }
            NodeKind::Binary(op, a, b) => {
                if node.input_dtype == Dtype::Str {
                    return self.str_compare(*op, *a, *b, slots, ctx);
                }
                let ca = self.child_as(slots, *a, node.input_dtype, len)?;
                let cb = self.child_as(slots, *b, node.input_dtype, len)?;
                kernels::binary_op(*op, node.input_dtype, &ca, &cb, len)
            }
            NodeKind::Where(c, t, e) => {
                let cc = self.child_as(slots, *c, Dtype::Bool, len)?;
                let ct = self.child_as(slots, *t, node.input_dtype, len)?;
                let ce = self.child_as(slots, *e, node.input_dtype, len)?;
                kernels::where_op(node.input_dtype, &cc, &ct, &ce, len)
            }
            NodeKind::Cast(to, a) => {
                let have = self.tree.node(*a).dtype;
                let op = self.slot(slots, *a)?;
                convert(op, have, *to, len)
            }
            NodeKind::Call(bid, args) => self.builtin_call(*bid, args, id, ctx, slots),
            NodeKind::UserCall(slot, args) => {
                let f = self.bindings[*slot as usize]
                    .func
                    .clone()
                    .ok_or(EvalError::Internal("function binding without callable"))?;
                let mut srcs = Vec::with_capacity(args.len());
                let mut all_scalar = true;
                for &arg in args {
                    let conv = self.child_as(slots, arg, Dtype::F64, len)?;
                    all_scalar &= conv.is_scalar();
                    srcs.push(conv);
                }
                let lanes = |i: usize| -> SmallVec<[f64; 8]> {
                    srcs.iter()
                        .map(|s| match s.get(i) {
                            Scalar::F64(v) => v,
                            _ => f64::NAN,
                        })
                        .collect()
                };
                if all_scalar {
                    Ok(Operand::Scalar(Scalar::F64(f(&lanes(0)))))
                } else {
                    let mut out = Vec::with_capacity(len);
                    for i in 0..len {
                        out.push(f(&lanes(i)));
                    }
                    Ok(Operand::Vec(ColVec::F64(out)))
                }
            }
            NodeKind::Reduce(op, child) => {
                if ctx.mask.is_some() {
                    // DSL scope: reduce this block under the active mask
                    let cd = self.tree.node(*child).dtype;
                    let out_dt = crate::dtype::reduce_output(*op, cd);
                    let block = self.slot(slots, *child)?;
                    reduce_block(*op, out_dt, block, len, ctx.mask)
                        .map(Operand::Scalar)
                } else {
                    ctx.reductions[id.index()]
                        .clone()
                        .map(Operand::Scalar)
                        .ok_or(EvalError::Internal("reduction result not ready"))
                }
            }
        }
    }

    fn builtin_call(
        &self,
        bid: builtins::BuiltinId,
        args: &[NodeId],
        id: NodeId,
        ctx: &BlockCtx<'_, 'e>,
        slots: &[Option<Operand<'e>>],
    ) -> Result<Operand<'e>, EvalError> {
        let node = self.tree.node(id);
        let def = builtins::def(bid);
        let len = ctx.len;
        match def.kind {
            BuiltinKind::Math1(op) => {
                let dt = node.input_dtype;
                if dt.is_integer() || dt == Dtype::Bool {
                    // rounding family over integers is the identity
                    return self.child_as(slots, args[0], node.dtype, len);
                }
                let ca = self.child_as(slots, args[0], dt, len)?;
                match dt {
                    Dtype::F64 => match f64::src(&ca)? {
                        Src::S(x) => Ok(Operand::Scalar(Scalar::F64(scalar_math_cached(op, x)))),
                        Src::V(s) => {
                            let mut out = vec![0.0f64; len];
                            simd::unary_f64(op, self.params, s, &mut out);
                            Ok(Operand::Vec(ColVec::F64(out)))
                        }
                    },
                    Dtype::F32 => match f32::src(&ca)? {
                        Src::S(x) => Ok(Operand::Scalar(Scalar::F32(
                            simd::scalar_f64(op, f64::from(x)) as f32,
                        ))),
                        Src::V(s) => {
                            let mut out = vec![0.0f32; len];
                            simd::unary_f32(op, self.params, s, &mut out);
                            Ok(Operand::Vec(ColVec::F32(out)))
                        }
                    },
                    Dtype::C64 => kernels::map1::<num::complex::Complex32, num::complex::Complex32>(
                        &ca,
                        len,
                        |z| {
                            let w = complex_math(op, Complex64::new(f64::from(z.re), f64::from(z.im)));
                            num::complex::Complex32::new(w.re as f32, w.im as f32)
                        },
                    ),
                    Dtype::C128 => {
                        kernels::map1::<Complex64, Complex64>(&ca, len, |z| complex_math(op, z))
                    }
                    _ => Err(EvalError::Internal("math kernel on unsupported dtype")),
                }
            }
            BuiltinKind::Math2(op) => {
                let ca = self.child_as(slots, args[0], Dtype::F64, len)?;
                let cb = self.child_as(slots, args[1], Dtype::F64, len)?;
                let fa = to_fsrc(&ca)?;
                let fb = to_fsrc(&cb)?;
                let result = match (fa, fb) {
                    (FSrc::Scalar(x), FSrc::Scalar(y)) => {
                        Operand::Scalar(Scalar::F64(simd::scalar2_f64(op, x, y)))
                    }
                    (fa, fb) => {
                        let mut out = vec![0.0f64; len];
                        simd::binary_f64(op, self.params, fa, fb, &mut out);
                        Operand::Vec(ColVec::F64(out))
                    }
                };
                finish_float(node.dtype, result, len)
            }
            BuiltinKind::Abs => {
                let dt = self.tree.node(args[0]).dtype;
                let ca = self.slot(slots, args[0])?;
                match dt {
                    Dtype::C64 => kernels::map1::<num::complex::Complex32, f32>(ca, len, |z| z.norm()),
                    Dtype::C128 => kernels::map1::<Complex64, f64>(ca, len, |z| z.norm()),
                    Dtype::F32 => kernels::map1::<f32, f32>(ca, len, f32::abs),
                    Dtype::F64 => kernels::map1::<f64, f64>(ca, len, f64::abs),
                    _ => {
                        let conv = self.child_as(slots, args[0], node.dtype, len)?;
                        int_abs(node.dtype, &conv, len)
                    }
                }
            }
            BuiltinKind::Real | BuiltinKind::Imag => {
                let want_re = def.kind == BuiltinKind::Real;
                let dt = self.tree.node(args[0]).dtype;
                let ca = self.slot(slots, args[0])?;
                match dt {
                    Dtype::C64 => kernels::map1::<num::complex::Complex32, f32>(ca, len, |z| {
                        if want_re { z.re } else { z.im }
                    }),
                    Dtype::C128 => kernels::map1::<Complex64, f64>(ca, len, |z| {
                        if want_re { z.re } else { z.im }
                    }),
                    _ if want_re => Ok(ca.clone()),
                    _ => Ok(Operand::Scalar(Scalar::zero(node.dtype))),
                }
            }
            BuiltinKind::Conj => {
                let dt = self.tree.node(args[0]).dtype;
                let ca = self.slot(slots, args[0])?;
                match dt {
                    Dtype::C64 => kernels::map1::<num::complex::Complex32, num::complex::Complex32>(
                        ca,
                        len,
                        |z| z.conj(),
                    ),
                    Dtype::C128 => kernels::map1::<Complex64, Complex64>(ca, len, |z| z.conj()),
                    _ => Ok(ca.clone()),
                }
            }
            BuiltinKind::StrPred(pred) => self.str_pred(pred, args[0], args[1], slots, ctx),
            BuiltinKind::Reduce(_) | BuiltinKind::Where => {
                Err(EvalError::Internal("misrouted builtin"))
            }
        }
    }

    /// String operand access: only variables and literals carry strings.
    fn str_src(
        &self,
        id: NodeId,
        ctx: &BlockCtx<'_, 'e>,
    ) -> Result<StrSrc<'e>, EvalError> {
        match &self.tree.node(id).kind {
            NodeKind::Const(Scalar::Str(item)) => Ok(StrSrc::Item(item.clone())),
            NodeKind::Var(slot) => {
                let buf = self.inputs[*slot as usize]
                    .as_ref()
                    .ok_or_else(|| EvalError::MissingInput(self.bindings[*slot as usize].name.clone()))?;
                if buf.len() == 1 {
                    match buf.get(0) {
                        Scalar::Str(item) => Ok(StrSrc::Item(item)),
                        _ => Err(EvalError::Internal("string binding with non-string data")),
                    }
                } else {
                    Ok(StrSrc::Buf(buf.slice(ctx.base, ctx.len)))
                }
            }
            _ => Err(EvalError::Internal("string operand is not a variable or literal")),
        }
    }

    fn str_compare(
        &self,
        op: crate::ast::BinaryOp,
        a: NodeId,
        b: NodeId,
        _slots: &[Option<Operand<'e>>],
        ctx: &BlockCtx<'_, 'e>,
    ) -> Result<Operand<'e>, EvalError> {
        use crate::ast::BinaryOp;
        let sa = self.str_src(a, ctx)?;
        let sb = self.str_src(b, ctx)?;
        let negate = op == BinaryOp::Ne;
        str_map2(&sa, &sb, ctx.len, |x, y| ucs4_eq(x, y) != negate)
    }

    fn str_pred(
        &self,
        pred: StrPred,
        a: NodeId,
        b: NodeId,
        _slots: &[Option<Operand<'e>>],
        ctx: &BlockCtx<'_, 'e>,
    ) -> Result<Operand<'e>, EvalError> {
        let sa = self.str_src(a, ctx)?;
        let sb = self.str_src(b, ctx)?;
        str_map2(&sa, &sb, ctx.len, |x, y| {
            let (x, y) = (trim_padding(x), trim_padding(y));
            match pred {
                StrPred::StartsWith => x.starts_with(y),
                StrPred::EndsWith => x.ends_with(y),
                StrPred::Contains => {
                    y.is_empty() || x.windows(y.len().max(1)).any(|w| w == y)
                }
            }
        })
    }
}

enum StrSrc<'a> {
    Item(Box<[u32]>),
    Buf(BufferRef<'a>),
}

impl StrSrc<'_> {
    fn item(&self, i: usize) -> &[u32] {
        match self {
            Self::Item(s) => s,
            Self::Buf(b) => b.str_item(i).unwrap_or(&[]),
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, Self::Item(_))
    }
}

fn str_map2<'e>(
    a: &StrSrc<'_>,
    b: &StrSrc<'_>,
    len: usize,
    f: impl Fn(&[u32], &[u32]) -> bool,
) -> Result<Operand<'e>, EvalError> {
    if a.is_scalar() && b.is_scalar() {
        return Ok(Operand::Scalar(Scalar::Bool(f(a.item(0), b.item(0)))));
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(f(a.item(i), b.item(i)));
    }
    Ok(Operand::Vec(ColVec::Bool(out)))
}

fn to_fsrc<'a>(op: &'a Operand<'a>) -> Result<FSrc<'a>, EvalError> {
    Ok(match f64::src(op)? {
        Src::S(x) => FSrc::Scalar(x),
        Src::V(s) => FSrc::Slice(s),
    })
}

/// Narrow a f64 math result back to the declared output width.
fn finish_float<'e>(
    out_dt: Dtype,
    op: Operand<'e>,
    len: usize,
) -> Result<Operand<'e>, EvalError> {
    convert(&op, Dtype::F64, out_dt, len)
}

fn int_abs<'e>(dt: Dtype, a: &Operand<'e>, len: usize) -> Result<Operand<'e>, EvalError> {
    use kernels::LaneInt;
    match dt {
        Dtype::I8 => kernels::map1::<i8, i8>(a, len, LaneInt::wabs),
        Dtype::I16 => kernels::map1::<i16, i16>(a, len, LaneInt::wabs),
        Dtype::I32 => kernels::map1::<i32, i32>(a, len, LaneInt::wabs),
        Dtype::I64 => kernels::map1::<i64, i64>(a, len, LaneInt::wabs),
        Dtype::U8 | Dtype::U16 | Dtype::U32 | Dtype::U64 => Ok(a.clone()),
        _ => Err(EvalError::Internal("abs on unsupported dtype")),
    }
}

/// Complex transcendental, computed in `Complex64`.
pub(crate) fn complex_math(op: MathOp, z: Complex64) -> Complex64 {
    match op {
        MathOp::Exp => z.exp(),
        MathOp::Log => z.ln(),
        MathOp::Sqrt => z.sqrt(),
        MathOp::Sin => z.sin(),
        MathOp::Cos => z.cos(),
        MathOp::Tan => z.tan(),
        MathOp::Sinh => z.sinh(),
        MathOp::Cosh => z.cosh(),
        MathOp::Tanh => z.tanh(),
        _ => Complex64::new(f64::NAN, f64::NAN),
    }
}

/// Reduces one block (optionally masked) to a scalar of `out_dt`.
pub(crate) fn reduce_block(
    op: ReduceOp,
    out_dt: Dtype,
    block: &Operand<'_>,
    len: usize,
    mask: Option<&[bool]>,
) -> Result<Scalar, EvalError> {
    let mut acc: Option<Scalar> = None;
    reduce_accumulate(op, out_dt, block, len, mask, &mut acc)?;
    finish_reduce(op, out_dt, acc)
}

/// Folds one block into a running accumulator. Returns `true` when the
/// reduction saturated (any/all short-circuit).
pub(crate) fn reduce_accumulate(
    op: ReduceOp,
    out_dt: Dtype,
    block: &Operand<'_>,
    len: usize,
    mask: Option<&[bool]>,
    acc: &mut Option<Scalar>,
) -> Result<bool, EvalError> {
    let live = |i: usize| mask.is_none_or(|m| m[i]);
    match op {
        ReduceOp::Any => {
            for i in 0..len {
                if live(i) && block.get(i).is_truthy() {
                    *acc = Some(Scalar::Bool(true));
                    return Ok(true);
                }
            }
            acc.get_or_insert(Scalar::Bool(false));
            Ok(false)
        }
        ReduceOp::All => {
            for i in 0..len {
                if live(i) && !block.get(i).is_truthy() {
                    *acc = Some(Scalar::Bool(false));
                    return Ok(true);
                }
            }
            acc.get_or_insert(Scalar::Bool(true));
            Ok(false)
        }
        ReduceOp::Sum | ReduceOp::Prod => {
            let bop = if op == ReduceOp::Sum {
                crate::ast::BinaryOp::Add
            } else {
                crate::ast::BinaryOp::Mul
            };
            let mut running = acc.clone().unwrap_or_else(|| {
                let unit = if op == ReduceOp::Sum { 0.0 } else { 1.0 };
                Scalar::F64(unit).cast(out_dt).unwrap_or(Scalar::zero(out_dt))
            });
            for i in 0..len {
                if !live(i) {
                    continue;
                }
                let v = block
                    .get(i)
                    .cast(out_dt)
                    .ok_or(EvalError::Internal("unreducible element"))?;
                running = kernels::scalar_binary(bop, out_dt, &running, &v)?;
            }
            *acc = Some(running);
            Ok(false)
        }
        ReduceOp::Min | ReduceOp::Max => {
            let keep_lt = op == ReduceOp::Min;
            let mut running = acc.clone();
            for i in 0..len {
                if !live(i) {
                    continue;
                }
                let v = block
                    .get(i)
                    .cast(out_dt)
                    .ok_or(EvalError::Internal("unreducible element"))?;
                running = Some(match running {
                    None => v,
                    Some(cur) => {
                        let lt = kernels::scalar_binary(
                            crate::ast::BinaryOp::Lt,
                            out_dt,
                            &v,
                            &cur,
                        )?;
                        if lt.is_truthy() == keep_lt { v } else { cur }
                    }
                });
            }
            *acc = running;
            Ok(false)
        }
    }
}

/// Resolves an empty reduction to its unit value.
pub(crate) fn finish_reduce(
    op: ReduceOp,
    out_dt: Dtype,
    acc: Option<Scalar>,
) -> Result<Scalar, EvalError> {
    Ok(match acc {
        Some(v) => v,
        None => match op {
            ReduceOp::Any => Scalar::Bool(false),
            ReduceOp::All => Scalar::Bool(true),
            ReduceOp::Prod => Scalar::F64(1.0)
                .cast(out_dt)
                .unwrap_or(Scalar::zero(out_dt)),
            _ => Scalar::zero(out_dt),
        },
    })
}

/// Stores one block of the root temporary into the caller's output buffer,
/// applying the output cast element-wise when dtypes differ.
pub(crate) fn store_block(
    out: &mut BufferMut<'_>,
    base: usize,
    len: usize,
    value: &Operand<'_>,
) -> Result<(), EvalError> {
    macro_rules! fast {
        ($t:ty, $ov:ident) => {{
            if let (BufferMut::$ov(dst), Ok(src)) = (&mut *out, <$t as kernels::Lane>::src(value)) {
                match src {
                    Src::V(s) => {
                        dst[base..base + len].copy_from_slice(&s[..len]);
                        return Ok(());
                    }
                    Src::S(v) => {
                        for d in &mut dst[base..base + len] {
                            *d = v;
                        }
                        return Ok(());
                    }
                }
            }
        }};
    }
    match out.dtype() {
        Dtype::I8 => fast!(i8, I8),
        Dtype::I16 => fast!(i16, I16),
        Dtype::I32 => fast!(i32, I32),
        Dtype::I64 => fast!(i64, I64),
        Dtype::U8 => fast!(u8, U8),
        Dtype::U16 => fast!(u16, U16),
        Dtype::U32 => fast!(u32, U32),
        Dtype::U64 => fast!(u64, U64),
        Dtype::F32 => fast!(f32, F32),
        Dtype::F64 => fast!(f64, F64),
        Dtype::C64 => fast!(num::complex::Complex32, C64),
        Dtype::C128 => fast!(Complex64, C128),
        Dtype::Bool => fast!(bool, Bool),
        Dtype::Str => {}
    }
    // slow path: element-wise conversion
    for i in 0..len {
        let v = value.get(i);
        out.set(base + i, &v);
    }
    Ok(())
}
