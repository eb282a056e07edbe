//! Kernel execution without native code: a masked block machine for the
//! vector dialect and a per-lane reference machine for the element dialect.
//! The JIT must agree with both for any program it accepts.

use crate::ast::NodeId;
use crate::dtype::Dtype;
use crate::error::EvalError;
use crate::eval::kernels::{self, ColVec, Operand, convert};
use crate::eval::{BlockCtx, IndexBlock, Interpreter};
use crate::scalar::Scalar;

use super::{Dialect, DslProgram, Stmt};

pub(crate) struct DslRunner<'e> {
    pub prog: &'e DslProgram,
    pub interp: Interpreter<'e>,
    /// Final output dtype, including any user-requested trailing cast
    pub out_dtype: Dtype,
}

/// Linear-flow state of the vector machine for one block.
struct VecState<'e> {
    locals: Vec<Operand<'e>>,
    ret: Option<Operand<'e>>,
    returned: Vec<bool>,
}

/// Per-loop lane bookkeeping; `continued` resets every iteration.
struct LoopCtx {
    broken: Vec<bool>,
    continued: Vec<bool>,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return,
}

impl<'e> DslRunner<'e> {
    fn local_dtype(&self, slot: u32) -> Dtype {
        self.prog.locals[slot as usize].dtype.unwrap_or(Dtype::I64)
    }

    fn zero_locals(&self) -> Vec<Operand<'e>> {
        self.prog
            .locals
            .iter()
            .map(|l| Operand::Scalar(Scalar::zero(l.dtype.unwrap_or(Dtype::I64))))
            .collect()
    }

    /// Evaluates the kernel over one block, producing the output operand in
    /// the final dtype. Lanes that never reach a `return` yield zero.
    pub(crate) fn run_block(
        &self,
        base: usize,
        len: usize,
        idx: Option<&IndexBlock>,
    ) -> Result<Operand<'e>, EvalError> {
        match self.prog.dialect {
            Dialect::Vector => self.run_vector(base, len, idx),
            Dialect::Element => self.run_element(base, len, idx),
        }
    }

    fn ctx<'a>(
        &self,
        base: usize,
        len: usize,
        idx: Option<&'a IndexBlock>,
        locals: &'a [Operand<'e>],
        mask: &'a [bool],
    ) -> BlockCtx<'a, 'e> {
        BlockCtx {
            base,
            len,
            idx,
            locals,
            mask: Some(mask),
            reductions: &[],
        }
    }

    // ---- vector dialect ----

    fn run_vector(
        &self,
        base: usize,
        len: usize,
        idx: Option<&IndexBlock>,
    ) -> Result<Operand<'e>, EvalError> {
        let mut st = VecState {
            locals: self.zero_locals(),
            ret: None,
            returned: vec![false; len],
        };
        let mask = vec![true; len];
        self.exec_vec(&self.prog.body, &mut st, mask, None, base, len, idx)?;
        Ok(st
            .ret
            .unwrap_or_else(|| Operand::Scalar(Scalar::zero(self.out_dtype))))
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_vec(
        &self,
        stmts: &[Stmt],
        st: &mut VecState<'e>,
        mut mask: Vec<bool>,
        mut loop_ctx: Option<&mut LoopCtx>,
        base: usize,
        len: usize,
        idx: Option<&IndexBlock>,
    ) -> Result<(), EvalError> {
        for stmt in stmts {
            if !mask.iter().any(|&m| m) {
                return Ok(());
            }
            match stmt {
                Stmt::Assign { slot, value, offset: _ } => {
                    let val = {
                        let ctx = self.ctx(base, len, idx, &st.locals, &mask);
                        self.interp.eval_expr(*value, &ctx)?
                    };
                    let ldt = self.local_dtype(*slot);
                    let vdt = self.prog.tree.node(*value).dtype;
                    let val = convert(&val, vdt, ldt, len)?;
                    let merged = if mask.iter().all(|&m| m) {
                        val
                    } else {
                        let cond = Operand::Vec(ColVec::Bool(mask.clone()));
                        kernels::where_op(ldt, &cond, &val, &st.locals[*slot as usize], len)?
                    };
                    st.locals[*slot as usize] = merged;
                }
                Stmt::If { arms, default } => {
                    // lanes not yet claimed by an earlier arm
                    let mut unclaimed = mask.clone();
                    for (cond, body) in arms {
                        let cond_op = {
                            let ctx = self.ctx(base, len, idx, &st.locals, &unclaimed);
                            self.interp.eval_expr(*cond, &ctx)?
                        };
                        let cdt = self.prog.tree.node(*cond).dtype;
                        let cond_op = convert(&cond_op, cdt, Dtype::Bool, len)?;
                        let truthy = bool_lanes(&cond_op, len);
                        let arm_mask: Vec<bool> = (0..len)
                            .map(|i| unclaimed[i] && truthy(i))
                            .collect();
                        for i in 0..len {
                            unclaimed[i] &= !arm_mask[i];
                        }
                        if arm_mask.iter().any(|&m| m) {
                            self.exec_vec(
                                body,
                                st,
                                arm_mask,
                                loop_ctx.as_deref_mut(),
                                base,
                                len,
                                idx,
                            )?;
                        }
                    }
                    if unclaimed.iter().any(|&m| m) && !default.is_empty() {
                        self.exec_vec(
                            default,
                            st,
                            unclaimed,
                            loop_ctx.as_deref_mut(),
                            base,
                            len,
                            idx,
                        )?;
                    }
                }
                Stmt::For {
                    slot,
                    count,
                    body,
                    offset: _,
                } => {
                    let count_op = {
                        let ctx = self.ctx(base, len, idx, &st.locals, &mask);
                        self.interp.eval_expr(*count, &ctx)?
                    };
                    let cdt = self.prog.tree.node(*count).dtype;
                    let count_op = convert(&count_op, cdt, Dtype::I64, len)?;
                    let trip = i64_lanes(&count_op, len);
                    let mut lc = LoopCtx {
                        broken: vec![false; len],
                        continued: vec![false; len],
                    };
                    let mut iter: i64 = 0;
                    loop {
                        lc.continued.iter_mut().for_each(|c| *c = false);
                        let active: Vec<bool> = (0..len)
                            .map(|i| {
                                mask[i] && !st.returned[i] && !lc.broken[i] && iter < trip(i)
                            })
                            .collect();
                        if !active.iter().any(|&m| m) {
                            break;
                        }
                        st.locals[*slot as usize] = Operand::Scalar(Scalar::I64(iter));
                        self.exec_vec(body, st, active, Some(&mut lc), base, len, idx)?;
                        iter += 1;
                    }
                }
                Stmt::Break => match loop_ctx.as_deref_mut() {
                    Some(lc) => {
                        for i in 0..len {
                            lc.broken[i] |= mask[i];
                        }
                    }
                    None => return Err(EvalError::Internal("break outside a loop")),
                },
                Stmt::Continue => match loop_ctx.as_deref_mut() {
                    Some(lc) => {
                        for i in 0..len {
                            lc.continued[i] |= mask[i];
                        }
                    }
                    None => return Err(EvalError::Internal("continue outside a loop")),
                },
                Stmt::Return { value, offset: _ } => {
                    let val = {
                        let ctx = self.ctx(base, len, idx, &st.locals, &mask);
                        self.interp.eval_expr(*value, &ctx)?
                    };
                    let vdt = self.prog.tree.node(*value).dtype;
                    let val = convert(&val, vdt, self.out_dtype, len)?;
                    self.merge_return(st, &mask, val, len)?;
                    for i in 0..len {
                        st.returned[i] |= mask[i];
                    }
                }
            }
            // lanes that returned, broke or continued stop executing here
            for i in 0..len {
                mask[i] &= !st.returned[i];
                if let Some(lc) = loop_ctx.as_deref() {
                    mask[i] &= !lc.broken[i] && !lc.continued[i];
                }
            }
        }
        Ok(())
    }

    fn merge_return(
        &self,
        st: &mut VecState<'e>,
        mask: &[bool],
        val: Operand<'e>,
        len: usize,
    ) -> Result<(), EvalError> {
        let full = mask.iter().all(|&m| m);
        match (&st.ret, full) {
            (None, true) => {
                st.ret = Some(val);
            }
            _ => {
                let prev = st
                    .ret
                    .take()
                    .unwrap_or_else(|| Operand::Scalar(Scalar::zero(self.out_dtype)));
                let cond = Operand::Vec(ColVec::Bool(mask.to_vec()));
                st.ret = Some(kernels::where_op(self.out_dtype, &cond, &val, &prev, len)?);
            }
        }
        Ok(())
    }

    // ---- element dialect ----

    fn run_element(
        &self,
        base: usize,
        len: usize,
        idx: Option<&IndexBlock>,
    ) -> Result<Operand<'e>, EvalError> {
        let mut out = Vec::with_capacity(len);
        for lane in 0..len {
            let lane_idx = idx.map(|ib| ib.slice(lane, 1));
            let mut locals = self.zero_locals();
            let mut ret: Option<Scalar> = None;
            self.exec_elem(
                &self.prog.body,
                &mut locals,
                &mut ret,
                base + lane,
                lane_idx.as_ref(),
            )?;
            out.push(ret.unwrap_or_else(|| Scalar::zero(self.out_dtype)));
        }
        kernels::pack(self.out_dtype, &out)
    }

    fn elem_value(
        &self,
        root: NodeId,
        locals: &[Operand<'e>],
        lane: usize,
        idx: Option<&IndexBlock>,
    ) -> Result<Scalar, EvalError> {
        const LIVE: [bool; 1] = [true];
        let ctx = self.ctx(lane, 1, idx, locals, &LIVE);
        Ok(self.interp.eval_expr(root, &ctx)?.get(0))
    }

    fn exec_elem(
        &self,
        stmts: &[Stmt],
        locals: &mut Vec<Operand<'e>>,
        ret: &mut Option<Scalar>,
        lane: usize,
        idx: Option<&IndexBlock>,
    ) -> Result<Flow, EvalError> {
        for stmt in stmts {
            match stmt {
                Stmt::Assign { slot, value, offset: _ } => {
                    let v = self.elem_value(*value, locals, lane, idx)?;
                    let ldt = self.local_dtype(*slot);
                    let v = v.cast(ldt).ok_or(EvalError::Internal("uncastable local"))?;
                    locals[*slot as usize] = Operand::Scalar(v);
                }
                Stmt::If { arms, default } => {
                    let mut taken = false;
                    for (cond, body) in arms {
                        if self.elem_value(*cond, locals, lane, idx)?.is_truthy() {
                            taken = true;
                            match self.exec_elem(body, locals, ret, lane, idx)? {
                                Flow::Normal => {}
                                flow => return Ok(flow),
                            }
                            break;
                        }
                    }
                    if !taken {
                        match self.exec_elem(default, locals, ret, lane, idx)? {
                            Flow::Normal => {}
                            flow => return Ok(flow),
                        }
                    }
                }
                Stmt::For {
                    slot,
                    count,
                    body,
                    offset: _,
                } => {
                    let trip = self
                        .elem_value(*count, locals, lane, idx)?
                        .as_i64()
                        .unwrap_or(0);
                    let mut iter = 0;
                    'iterations: while iter < trip {
                        locals[*slot as usize] = Operand::Scalar(Scalar::I64(iter));
                        match self.exec_elem(body, locals, ret, lane, idx)? {
                            Flow::Normal | Flow::Continue => {}
                            Flow::Break => break 'iterations,
                            Flow::Return => return Ok(Flow::Return),
                        }
                        iter += 1;
                    }
                }
                Stmt::Break => return Ok(Flow::Break),
                Stmt::Continue => return Ok(Flow::Continue),
                Stmt::Return { value, offset: _ } => {
                    let v = self.elem_value(*value, locals, lane, idx)?;
                    *ret = v.cast(self.out_dtype);
                    return Ok(Flow::Return);
                }
            }
        }
        Ok(Flow::Normal)
    }
}

/// Lane accessor over a bool operand (scalar broadcasts).
fn bool_lanes<'a>(op: &'a Operand<'_>, _len: usize) -> impl Fn(usize) -> bool + 'a {
    move |i| match op {
        Operand::Scalar(s) => s.is_truthy(),
        other => other.get(i).is_truthy(),
    }
}

fn i64_lanes<'a>(op: &'a Operand<'_>, _len: usize) -> impl Fn(usize) -> i64 + 'a {
    move |i| match op {
        Operand::Scalar(s) => s.as_i64().unwrap_or(0),
        other => other.get(i).as_i64().unwrap_or(0),
    }
}
