//! The public compile/eval surface. A compiled [`Expression`] is immutable,
//! `Send + Sync`, and owns its tree, bindings and optional native kernel;
//! evaluation touches only caller buffers plus the thread-local accuracy
//! policy.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::ast::{BinaryOp, ExprTree, IndexVar, Node, NodeId, NodeKind, UnaryOp};
use crate::buffer::{BufferMut, BufferRef};
use crate::builtins;
use crate::dsl::interp::DslRunner;
use crate::dsl::{self, DslProgram, Stmt};
use crate::dtype::{self, Dtype, ReduceOp};
use crate::error::{CompileError, CompileErrorKind, EvalError};
use crate::eval::{
    BLOCK_LEN, BlockCtx, IndexSource, Interpreter, finish_reduce, pruned_postorder,
    reduce_accumulate, reduce_schedule, store_block,
};
use crate::fold;
use crate::infer;
use crate::jit::{self, JitKernel};
use crate::lex::Lexer;
use crate::nd::NdLayout;
use crate::parse::{self, NameResolver, Resolved};
use crate::scalar::Scalar;
use crate::simd::{self, EvalParams};
use crate::var::{Binding, VarDecl};

/// One whole-call reduction: the node, its operator, its output dtype, the
/// vector child and the child's evaluation order.
struct ReduceStep {
    node: NodeId,
    op: ReduceOp,
    out_dtype: Dtype,
    child: NodeId,
    order: Vec<NodeId>,
}

enum Repr {
    Infix {
        tree: ExprTree,
        root: NodeId,
        /// Flattened post-order of the main pass, reductions pruned
        program: Vec<NodeId>,
        reduce_plan: Vec<ReduceStep>,
    },
    Dsl(Box<DslProgram>),
}

/// A compiled expression or kernel, ready for repeated evaluation.
pub struct Expression {
    source: String,
    bindings: Vec<Binding>,
    /// Binding slots that take caller data, in input order
    data_slots: Vec<usize>,
    out_dtype: Dtype,
    nd: Option<NdLayout>,
    repr: Repr,
    jit: Option<Arc<JitKernel>>,
}

struct BindingResolver<'a>(&'a [Binding]);

impl NameResolver for BindingResolver<'_> {
    fn resolve(&mut self, name: &str) -> Option<Resolved> {
        let slot = self.0.iter().position(|b| b.name == name)?;
        let b = &self.0[slot];
        Some(if b.is_function() {
            Resolved::Func(slot as u32, b.arity)
        } else {
            Resolved::Var(slot as u32)
        })
    }
}

impl Expression {
    /// Compiles infix or kernel-DSL `source` against the given variable
    /// descriptors. `out_dtype` of `None` infers the output dtype from the
    /// expression; otherwise a trailing cast to the requested dtype is
    /// applied and validated.
    pub fn compile(
        source: &str,
        vars: &[VarDecl],
        out_dtype: Option<Dtype>,
    ) -> Result<Self, CompileError> {
        Self::compile_inner(source, vars, out_dtype, None)
    }

    /// Like [`Expression::compile`] with an N-D chunk/block layout attached,
    /// enabling [`Expression::eval_nd`] and the reserved index variables.
    pub fn compile_nd(
        source: &str,
        vars: &[VarDecl],
        out_dtype: Option<Dtype>,
        layout: NdLayout,
    ) -> Result<Self, CompileError> {
        Self::compile_inner(source, vars, out_dtype, Some(layout))
    }

    fn compile_inner(
        source: &str,
        vars: &[VarDecl],
        out_dtype: Option<Dtype>,
        nd: Option<NdLayout>,
    ) -> Result<Self, CompileError> {
        let bindings: Vec<Binding> = vars.iter().map(Binding::from_decl).collect();
        for (i, b) in bindings.iter().enumerate() {
            if b.dtype == Dtype::Str && (b.itemsize == 0 || b.itemsize % 4 != 0) {
                return Err(CompileError::new(
                    CompileErrorKind::TypeMismatch,
                    0,
                    format!("string variable `{}` needs an item size in whole code points", b.name),
                ));
            }
            if bindings[..i].iter().any(|o| o.name == b.name) {
                return Err(CompileError::new(
                    CompileErrorKind::Syntax,
                    0,
                    format!("duplicate variable `{}`", b.name),
                ));
            }
        }
        let data_slots: Vec<usize> = bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_function())
            .map(|(i, _)| i)
            .collect();

        if dsl::is_kernel_source(source) {
            let mut prog = dsl::parse_kernel(source, &bindings)?;
            optimize_program(&mut prog, &bindings)?;
            let inferred = prog.out_dtype;
            let out = match out_dtype {
                None => inferred,
                Some(want) => {
                    if !dtype::castable(inferred, want) {
                        return Err(CompileError::new(
                            CompileErrorKind::TypeUnrepresentable,
                            0,
                            format!("cannot represent {inferred} as {want}"),
                        ));
                    }
                    want
                }
            };
            let jit = jit::try_compile(source, &prog, &bindings, out, nd.as_ref());
            return Ok(Self {
                source: source.to_owned(),
                bindings,
                data_slots,
                out_dtype: out,
                nd,
                repr: Repr::Dsl(Box::new(prog)),
                jit,
            });
        }

        let toks = Lexer::new(source, 0).tokenize().map_err(CompileError::from)?;
        let mut tree = ExprTree::new();
        let mut resolver = BindingResolver(&bindings);
        let mut root = parse::parse_expr(&toks, &mut tree, &mut resolver)?;
        infer::infer(&mut tree, root, &bindings, &[])?;
        fold::optimize(&mut tree, root, &bindings, &[])?;
        if let Some(want) = out_dtype {
            if tree.node(root).dtype != want {
                let offset = tree.node(root).offset;
                root = tree.push(Node::new(NodeKind::Cast(want, root), offset));
                infer::infer(&mut tree, root, &bindings, &[])?;
            }
        }
        let out = tree.node(root).dtype;
        let program = pruned_postorder(&tree, root, true);
        let reduce_plan = reduce_schedule(&tree, root)
            .into_iter()
            .map(|node| {
                let NodeKind::Reduce(op, child) = tree.node(node).kind else {
                    unreachable!("reduce schedule holds only reductions");
                };
                ReduceStep {
                    node,
                    op,
                    out_dtype: tree.node(node).dtype,
                    child,
                    order: pruned_postorder(&tree, child, true),
                }
            })
            .collect();
        Ok(Self {
            source: source.to_owned(),
            bindings,
            data_slots,
            out_dtype: out,
            nd,
            repr: Repr::Infix {
                tree,
                root,
                program,
                reduce_plan,
            },
            jit: None,
        })
    }

    /// Output dtype of every evaluation.
    #[must_use]
    pub fn dtype(&self) -> Dtype {
        self.out_dtype
    }

    /// Whether a native kernel was compiled and loaded for this expression.
    #[must_use]
    pub fn has_jit_kernel(&self) -> bool {
        self.jit.is_some()
    }

    /// The source text this expression was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn nd_layout(&self) -> Option<&NdLayout> {
        self.nd.as_ref()
    }

    /// Valid (non-padding) element count of the addressed block.
    pub fn valid_nitems(&self, nchunk: usize, nblock: usize) -> Result<usize, EvalError> {
        let layout = self
            .nd
            .as_ref()
            .ok_or_else(|| EvalError::ShapeMismatch("expression has no N-D layout".into()))?;
        Ok(layout.region(nchunk, nblock)?.valid_nitems())
    }

    /// Evaluates over `nitems` elements. `inputs` supplies one buffer per
    /// data variable in declaration order; a length-1 buffer broadcasts.
    /// Reduction results land in `output[0]`.
    pub fn eval(
        &self,
        inputs: &[BufferRef<'_>],
        output: &mut BufferMut<'_>,
        nitems: usize,
        params: Option<EvalParams>,
    ) -> Result<(), EvalError> {
        // nested evaluations inherit the enclosing policy by default
        let params = params.unwrap_or_else(simd::current_policy);
        let _policy = simd::push_policy(params);
        let slots = self.bind_inputs(inputs, nitems)?;
        self.check_output(output)?;
        let idx = match &self.repr {
            Repr::Dsl(prog) if prog.uses_index_vars => IndexSource::Linear { nitems },
            _ => IndexSource::None,
        };
        self.run(&slots, output, nitems, &idx, params)
    }

    /// Evaluates one padded N-D block addressed by `(nchunk, nblock)`.
    /// Inputs and output cover the padded block; positions outside the
    /// valid extent are written as zero.
    pub fn eval_nd(
        &self,
        inputs: &[BufferRef<'_>],
        output: &mut BufferMut<'_>,
        nchunk: usize,
        nblock: usize,
        params: Option<EvalParams>,
    ) -> Result<(), EvalError> {
        let layout = self
            .nd
            .as_ref()
            .ok_or_else(|| EvalError::ShapeMismatch("expression has no N-D layout".into()))?;
        let region = layout.region(nchunk, nblock)?;
        let nitems = region.nitems();
        let params = params.unwrap_or_else(simd::current_policy);
        let _policy = simd::push_policy(params);
        let slots = self.bind_inputs(inputs, nitems)?;
        self.check_output(output)?;
        if output.len() < nitems {
            return Err(EvalError::ShapeMismatch(format!(
                "output holds {} elements, the padded block needs {nitems}",
                output.len()
            )));
        }
        let idx = IndexSource::Region(&region);
        self.run(&slots, output, nitems, &idx, params)?;
        if region.valid_nitems() < nitems {
            let zero = Scalar::zero(self.out_dtype);
            for p in 0..nitems {
                if !region.is_valid_pos(p) {
                    output.set(p, &zero);
                }
            }
        }
        Ok(())
    }

    fn bind_inputs<'a>(
        &self,
        inputs: &[BufferRef<'a>],
        nitems: usize,
    ) -> Result<Vec<Option<BufferRef<'a>>>, EvalError> {
        if inputs.len() != self.data_slots.len() {
            return Err(EvalError::ShapeMismatch(format!(
                "expression takes {} inputs, got {}",
                self.data_slots.len(),
                inputs.len()
            )));
        }
        let mut slots: Vec<Option<BufferRef<'a>>> = vec![None; self.bindings.len()];
        for (&slot, buf) in self.data_slots.iter().zip(inputs) {
            let binding = &self.bindings[slot];
            if buf.dtype() != binding.dtype {
                return Err(EvalError::ShapeMismatch(format!(
                    "`{}` is declared {} but bound to {}",
                    binding.name,
                    binding.dtype,
                    buf.dtype()
                )));
            }
            if let BufferRef::Str { itemsize, .. } = buf {
                if *itemsize != binding.itemsize {
                    return Err(EvalError::ShapeMismatch(format!(
                        "`{}` expects item size {}, got {itemsize}",
                        binding.name, binding.itemsize
                    )));
                }
            }
            if buf.len() != nitems && buf.len() != 1 {
                return Err(EvalError::ShapeMismatch(format!(
                    "`{}` holds {} elements, expected {nitems} (or 1 to broadcast)",
                    binding.name,
                    buf.len()
                )));
            }
            slots[slot] = Some(*buf);
        }
        Ok(slots)
    }

    fn check_output(&self, output: &BufferMut<'_>) -> Result<(), EvalError> {
        if output.dtype() != self.out_dtype {
            return Err(EvalError::ShapeMismatch(format!(
                "output dtype {} does not match expression dtype {}",
                output.dtype(),
                self.out_dtype
            )));
        }
        Ok(())
    }

    fn run(
        &self,
        slots: &[Option<BufferRef<'_>>],
        output: &mut BufferMut<'_>,
        nitems: usize,
        idx_src: &IndexSource<'_>,
        params: EvalParams,
    ) -> Result<(), EvalError> {
        match &self.repr {
            Repr::Infix {
                tree,
                root,
                program,
                reduce_plan,
            } => self.run_infix(
                tree, *root, program, reduce_plan, slots, output, nitems, idx_src, params,
            ),
            Repr::Dsl(prog) => self.run_dsl(prog, slots, output, nitems, idx_src, params),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_infix(
        &self,
        tree: &ExprTree,
        root: NodeId,
        program: &[NodeId],
        reduce_plan: &[ReduceStep],
        slots: &[Option<BufferRef<'_>>],
        output: &mut BufferMut<'_>,
        nitems: usize,
        idx_src: &IndexSource<'_>,
        params: EvalParams,
    ) -> Result<(), EvalError> {
        let interp = Interpreter {
            tree,
            bindings: &self.bindings,
            inputs: slots,
            params,
        };
        let mut reductions: Vec<Option<Scalar>> = vec![None; tree.len()];
        for step in reduce_plan {
            let mut acc = None;
            let mut base = 0;
            loop {
                let len = BLOCK_LEN.min(nitems - base);
                let idx = idx_src.materialize(base, len);
                let ctx = BlockCtx {
                    base,
                    len,
                    idx: idx.as_ref(),
                    locals: &[],
                    mask: None,
                    reductions: &reductions,
                };
                let block = interp.eval_with_order(&step.order, step.child, &ctx)?;
                let done = reduce_accumulate(step.op, step.out_dtype, &block, len, None, &mut acc)?;
                base += len;
                if done || base >= nitems {
                    break;
                }
            }
            reductions[step.node.index()] = Some(finish_reduce(step.op, step.out_dtype, acc)?);
        }
        let mut base = 0;
        loop {
            let len = BLOCK_LEN.min(nitems - base);
            let idx = idx_src.materialize(base, len);
            let ctx = BlockCtx {
                base,
                len,
                idx: idx.as_ref(),
                locals: &[],
                mask: None,
                reductions: &reductions,
            };
            let value = interp.eval_with_order(program, root, &ctx)?;
            if value.is_scalar() {
                // constant or reduction result: broadcast once
                let n = output.len().min(nitems.max(1));
                store_block(output, 0, n, &value)?;
                return Ok(());
            }
            if output.len() < nitems {
                return Err(EvalError::ShapeMismatch(format!(
                    "output holds {} elements, expected {nitems}",
                    output.len()
                )));
            }
            store_block(output, base, len, &value)?;
            base += len;
            if base >= nitems {
                return Ok(());
            }
        }
    }

    fn run_dsl(
        &self,
        prog: &DslProgram,
        slots: &[Option<BufferRef<'_>>],
        output: &mut BufferMut<'_>,
        nitems: usize,
        idx_src: &IndexSource<'_>,
        params: EvalParams,
    ) -> Result<(), EvalError> {
        if let Some(jit) = &self.jit {
            if self.try_jit(jit, slots, output, nitems, idx_src)? {
                return Ok(());
            }
        }
        if output.len() < nitems {
            return Err(EvalError::ShapeMismatch(format!(
                "output holds {} elements, expected {nitems}",
                output.len()
            )));
        }
        let runner = DslRunner {
            prog,
            interp: Interpreter {
                tree: &prog.tree,
                bindings: &self.bindings,
                inputs: slots,
                params,
            },
            out_dtype: self.out_dtype,
        };
        let mut base = 0;
        while base < nitems {
            let len = BLOCK_LEN.min(nitems - base);
            let idx = idx_src.materialize(base, len);
            let value = runner.run_block(base, len, idx.as_ref())?;
            store_block(output, base, len, &value)?;
            base += len;
        }
        Ok(())
    }

    /// Runs the native kernel when the call shape allows it. Returns
    /// `Ok(false)` to fall back to the interpreter.
    fn try_jit(
        &self,
        jit: &JitKernel,
        slots: &[Option<BufferRef<'_>>],
        output: &mut BufferMut<'_>,
        nitems: usize,
        idx_src: &IndexSource<'_>,
    ) -> Result<bool, EvalError> {
        // the generated code indexes every input by row
        let mut ptrs: Vec<*const c_void> = Vec::with_capacity(self.data_slots.len());
        for &slot in &self.data_slots {
            match &slots[slot] {
                Some(buf) if buf.len() == nitems => ptrs.push(buf.as_ptr()),
                _ => return Ok(false),
            }
        }
        if output.len() < nitems {
            return Err(EvalError::ShapeMismatch(format!(
                "output holds {} elements, expected {nitems}",
                output.len()
            )));
        }
        let indices = if jit.uses_index_vars {
            let built = match idx_src {
                IndexSource::None => return Ok(false),
                IndexSource::Linear { nitems: total } => {
                    let idx = idx_src
                        .materialize(0, nitems)
                        .ok_or(EvalError::Internal("index source yielded nothing"))?;
                    let _ = total;
                    jit::build_indices(&idx, &[nitems], &[0], nitems, jit.synth_index)
                }
                IndexSource::Region(region) => {
                    let idx = region.index_block(0, nitems);
                    jit::build_indices(
                        &idx,
                        region.block_shape(),
                        region.global_start(),
                        nitems,
                        jit.synth_index,
                    )
                }
            };
            Some(built)
        } else {
            None
        };
        let indices_ptr = indices
            .as_ref()
            .map_or(std::ptr::null(), |v| v.as_ptr());
        unsafe {
            jit.call(&ptrs, output.as_mut_ptr(), nitems, indices_ptr);
        }
        Ok(true)
    }
}

/// Folds every statement expression of a kernel in place.
fn optimize_program(prog: &mut DslProgram, bindings: &[Binding]) -> Result<(), CompileError> {
    let locals: Vec<Dtype> = prog
        .locals
        .iter()
        .map(|l| l.dtype.unwrap_or(Dtype::I64))
        .collect();
    let body = prog.body.clone();
    optimize_stmts(&body, &mut prog.tree, bindings, &locals)
}

fn optimize_stmts(
    stmts: &[Stmt],
    tree: &mut ExprTree,
    bindings: &[Binding],
    locals: &[Dtype],
) -> Result<(), CompileError> {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { value, .. } | Stmt::Return { value, .. } => {
                fold::optimize(tree, *value, bindings, locals)?;
            }
            Stmt::If { arms, default } => {
                for (cond, body) in arms {
                    fold::optimize(tree, *cond, bindings, locals)?;
                    optimize_stmts(body, tree, bindings, locals)?;
                }
                optimize_stmts(default, tree, bindings, locals)?;
            }
            Stmt::For { count, body, .. } => {
                fold::optimize(tree, *count, bindings, locals)?;
                optimize_stmts(body, tree, bindings, locals)?;
            }
            Stmt::Break | Stmt::Continue => {}
        }
    }
    Ok(())
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .field("dtype", &self.out_dtype)
            .field("nd", &self.nd)
            .field("jit", &self.jit.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Expression {
    /// Prints the canonicalised infix form; `parse(print(e))` yields an
    /// equivalent tree. Kernel programs print their source verbatim.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Dsl(_) => f.write_str(&self.source),
            Repr::Infix { tree, root, .. } => print_node(f, tree, &self.bindings, *root, 0),
        }
    }
}

const PRINT_UNARY_PREC: u8 = 9;

fn print_node(
    f: &mut fmt::Formatter<'_>,
    tree: &ExprTree,
    bindings: &[Binding],
    id: NodeId,
    min_prec: u8,
) -> fmt::Result {
    match &tree.node(id).kind {
        NodeKind::Const(s) => write!(f, "{s}"),
        NodeKind::Var(slot) => f.write_str(&bindings[*slot as usize].name),
        NodeKind::Local(_) => f.write_str("<local>"),
        NodeKind::Index(iv) => f.write_str(match iv {
            IndexVar::Ndim => "_ndim",
            IndexVar::FlatIdx => "_flat_idx",
            IndexVar::Dim(0) => "_i0",
            IndexVar::Dim(1) => "_i1",
            IndexVar::Dim(2) => "_i2",
            IndexVar::Dim(3) => "_i3",
            IndexVar::Dim(4) => "_i4",
            IndexVar::Dim(5) => "_i5",
            IndexVar::Dim(6) => "_i6",
            IndexVar::Dim(_) => "_i7",
            IndexVar::ShapeDim(0) => "_n0",
            IndexVar::ShapeDim(1) => "_n1",
            IndexVar::ShapeDim(2) => "_n2",
            IndexVar::ShapeDim(3) => "_n3",
            IndexVar::ShapeDim(4) => "_n4",
            IndexVar::ShapeDim(5) => "_n5",
            IndexVar::ShapeDim(6) => "_n6",
            IndexVar::ShapeDim(_) => "_n7",
        }),
        NodeKind::Unary(op, a) => {
            let parens = PRINT_UNARY_PREC < min_prec;
            if parens {
                f.write_str("(")?;
            }
            f.write_str(match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
            })?;
            print_node(f, tree, bindings, *a, PRINT_UNARY_PREC)?;
            if parens {
                f.write_str(")")?;
            }
            Ok(())
        }
        NodeKind::Binary(op, a, b) => {
            let prec = op.precedence();
            let parens = prec < min_prec;
            if parens {
                f.write_str("(")?;
            }
            let (lmin, rmin) = if *op == BinaryOp::Pow {
                (prec + 1, prec)
            } else {
                (prec, prec + 1)
            };
            print_node(f, tree, bindings, *a, lmin)?;
            write!(f, " {} ", op.symbol())?;
            print_node(f, tree, bindings, *b, rmin)?;
            if parens {
                f.write_str(")")?;
            }
            Ok(())
        }
        NodeKind::Call(bid, args) => {
            f.write_str(builtins::name(*bid))?;
            f.write_str("(")?;
            for (i, &arg) in args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                print_node(f, tree, bindings, arg, 0)?;
            }
            f.write_str(")")
        }
        NodeKind::UserCall(slot, args) => {
            f.write_str(&bindings[*slot as usize].name)?;
            f.write_str("(")?;
            for (i, &arg) in args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                print_node(f, tree, bindings, arg, 0)?;
            }
            f.write_str(")")
        }
        NodeKind::Reduce(op, child) => {
            f.write_str(op.name())?;
            f.write_str("(")?;
            print_node(f, tree, bindings, *child, 0)?;
            f.write_str(")")
        }
        NodeKind::Where(c, t, e) => {
            f.write_str("where(")?;
            print_node(f, tree, bindings, *c, 0)?;
            f.write_str(", ")?;
            print_node(f, tree, bindings, *t, 0)?;
            f.write_str(", ")?;
            print_node(f, tree, bindings, *e, 0)?;
            f.write_str(")")
        }
        // the output cast has no infix spelling; print transparently
        NodeKind::Cast(_, a) => print_node(f, tree, bindings, *a, min_prec),
    }
}
