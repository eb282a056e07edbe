//! Lowers a kernel program to portable C99 implementing
//! `void kernel_block(const void *inputs[], void *output, long nitems,
//! const long indices[])`.
//!
//! Only programs whose semantics survive a straight per-row translation are
//! accepted: the element dialect compiles in full, the vector dialect only
//! when the body is straight-line (no cross-lane construct). Everything
//! else returns `None` and runs on the interpreter.

use std::fmt::Write;

use crate::ast::{BinaryOp, IndexVar, NodeId, NodeKind, UnaryOp};
use crate::builtins::{self, BuiltinKind};
use crate::dtype::Dtype;
use crate::scalar::Scalar;
use crate::simd::MathOp;
use crate::var::Binding;

use super::{Dialect, DslProgram, Stmt};

pub(crate) struct Lowered {
    pub c_source: String,
    /// The kernel reads reserved index variables from `indices[]`
    pub uses_index_vars: bool,
    /// Index values are synthesised in-kernel from the header only
    pub synth_index: bool,
}

/// C type of a dtype, or `None` when the backend cannot express it.
fn ctype(dt: Dtype) -> Option<&'static str> {
    Some(match dt {
        Dtype::I8 => "int8_t",
        Dtype::I16 => "int16_t",
        Dtype::I32 => "int32_t",
        Dtype::I64 => "int64_t",
        Dtype::U8 => "uint8_t",
        Dtype::U16 => "uint16_t",
        Dtype::U32 => "uint32_t",
        Dtype::U64 => "uint64_t",
        Dtype::F32 => "float",
        Dtype::F64 => "double",
        Dtype::Bool => "uint8_t",
        Dtype::C64 | Dtype::C128 | Dtype::Str => return None,
    })
}

fn int_suffix(dt: Dtype) -> &'static str {
    match dt {
        Dtype::I8 => "i8",
        Dtype::I16 => "i16",
        Dtype::I32 => "i32",
        Dtype::I64 => "i64",
        Dtype::U8 => "u8",
        Dtype::U16 => "u16",
        Dtype::U32 => "u32",
        Dtype::U64 => "u64",
        _ => "i64",
    }
}

struct CodeGen<'a> {
    prog: &'a DslProgram,
    bindings: &'a [Binding],
    /// Binding slot → position in the `inputs[]` array (data bindings only)
    data_index: Vec<Option<usize>>,
    out_dtype: Dtype,
    synth_index: bool,
    uses_index: bool,
}

pub(crate) fn lower(
    prog: &DslProgram,
    bindings: &[Binding],
    out_dtype: Dtype,
    synth_index: bool,
) -> Option<Lowered> {
    if prog.uses_reductions {
        return None;
    }
    if prog.dialect == Dialect::Vector && prog.has_control_flow {
        return None;
    }
    ctype(out_dtype)?;
    for local in &prog.locals {
        ctype(local.dtype.unwrap_or(Dtype::I64))?;
    }
    // every node dtype must be expressible, and user calls cannot cross
    // the native boundary
    for i in 0..prog.tree.len() {
        let node = prog.tree.node(crate::ast::NodeId(i as u32));
        if matches!(node.kind, NodeKind::UserCall(..)) {
            return None;
        }
    }
    let mut data_index = vec![None; bindings.len()];
    let mut next = 0;
    for (slot, b) in bindings.iter().enumerate() {
        if !b.is_function() {
            data_index[slot] = Some(next);
            next += 1;
        }
    }
    let mut cg = CodeGen {
        prog,
        bindings,
        data_index,
        out_dtype,
        synth_index,
        uses_index: prog.uses_index_vars,
    };
    let body = cg.emit()?;
    Some(Lowered {
        c_source: body,
        uses_index_vars: prog.uses_index_vars,
        synth_index,
    })
}

const PRELUDE_INTS: [(Dtype, &str, &str, u32); 8] = [
    (Dtype::I8, "int8_t", "uint8_t", 8),
    (Dtype::I16, "int16_t", "uint16_t", 16),
    (Dtype::I32, "int32_t", "uint32_t", 32),
    (Dtype::I64, "int64_t", "uint64_t", 64),
    (Dtype::U8, "uint8_t", "uint8_t", 8),
    (Dtype::U16, "uint16_t", "uint16_t", 16),
    (Dtype::U32, "uint32_t", "uint32_t", 32),
    (Dtype::U64, "uint64_t", "uint64_t", 64),
];

fn prelude() -> String {
    let mut s = String::from(
        "#include <stdint.h>\n#include <math.h>\n\n#ifndef M_PI\n#define M_PI 3.14159265358979323846\n#endif\n\n",
    );
    for (dt, st, ut, bits) in PRELUDE_INTS {
        let sfx = int_suffix(dt);
        let signed = dt.is_signed_int();
        // wrapping arithmetic through the unsigned type
        let _ = writeln!(
            s,
            "static inline {st} me_add_{sfx}({st} a, {st} b) {{ return ({st})(({ut})a + ({ut})b); }}"
        );
        let _ = writeln!(
            s,
            "static inline {st} me_sub_{sfx}({st} a, {st} b) {{ return ({st})(({ut})a - ({ut})b); }}"
        );
        let _ = writeln!(
            s,
            "static inline {st} me_mul_{sfx}({st} a, {st} b) {{ return ({st})(({ut})a * ({ut})b); }}"
        );
        if signed {
            let _ = writeln!(
                s,
                "static inline {st} me_div_{sfx}({st} a, {st} b) {{ if (b == 0) return 0; if (b == -1) return ({st})(0u - ({ut})a); return ({st})(a / b); }}"
            );
            let _ = writeln!(
                s,
                "static inline {st} me_rem_{sfx}({st} a, {st} b) {{ if (b == 0) return 0; if (b == -1) return 0; return ({st})(a % b); }}"
            );
            let _ = writeln!(
                s,
                "static inline {st} me_abs_{sfx}({st} a) {{ return a < 0 ? ({st})(0u - ({ut})a) : a; }}"
            );
            let _ = writeln!(
                s,
                "static inline {st} me_pow_{sfx}({st} a, {st} e) {{ if (e < 0) return a == 1 ? 1 : (a == -1 ? ((e & 1) ? -1 : 1) : 0); {ut} r = 1, b = ({ut})a; uint64_t n = (uint64_t)e; while (n) {{ if (n & 1) r = ({ut})(r * b); b = ({ut})(b * b); n >>= 1; }} return ({st})r; }}"
            );
        } else {
            let _ = writeln!(
                s,
                "static inline {st} me_div_{sfx}({st} a, {st} b) {{ return b == 0 ? 0 : ({st})(a / b); }}"
            );
            let _ = writeln!(
                s,
                "static inline {st} me_rem_{sfx}({st} a, {st} b) {{ return b == 0 ? 0 : ({st})(a % b); }}"
            );
            let _ = writeln!(
                s,
                "static inline {st} me_pow_{sfx}({st} a, {st} e) {{ {ut} r = 1, b = a; uint64_t n = (uint64_t)e; while (n) {{ if (n & 1) r = ({ut})(r * b); b = ({ut})(b * b); n >>= 1; }} return ({st})r; }}"
            );
        }
        let mask = bits - 1;
        let _ = writeln!(
            s,
            "static inline {st} me_shl_{sfx}({st} a, {st} e) {{ return ({st})(({ut})a << ((uint32_t)e & {mask}u)); }}"
        );
        let _ = writeln!(
            s,
            "static inline {st} me_shr_{sfx}({st} a, {st} e) {{ return ({st})(a >> ((uint32_t)e & {mask}u)); }}"
        );
    }
    s.push('\n');
    s
}

impl CodeGen<'_> {
    fn emit(&mut self) -> Option<String> {
        let mut s = prelude();
        let out_ct = ctype(self.out_dtype)?;
        s.push_str(
            "void kernel_block(const void *inputs[], void *output, long nitems, const long indices[])\n{\n",
        );
        // typed views of the caller buffers
        for (slot, data) in self.data_index.clone().iter().enumerate() {
            let Some(pos) = data else { continue };
            if !self.slot_used(slot as u32) {
                continue;
            }
            let dt = self.binding_dtype(slot as u32)?;
            let ct = ctype(dt)?;
            let _ = writeln!(s, "    const {ct} *v{pos} = (const {ct} *)inputs[{pos}];");
        }
        let _ = writeln!(s, "    {out_ct} *out = ({out_ct} *)output;");
        if self.uses_index {
            s.push_str("    const long rank = indices[0];\n");
            s.push_str("    const long *hshape = indices + 1;\n");
            s.push_str("    const long *hblock = indices + 1 + rank;\n");
            s.push_str("    const long *hstart = indices + 1 + 2 * rank;\n");
            s.push_str("    (void)hblock; (void)hstart; (void)hshape;\n");
        }
        s.push_str("    for (long row = 0; row < nitems; ++row) {\n");
        if self.uses_index {
            if self.synth_index {
                s.push_str("        long me_l[8]; long me_rem = row;\n");
                s.push_str("        for (long d = rank - 1; d >= 0; --d) { me_l[d] = me_rem % hblock[d]; me_rem /= hblock[d]; }\n");
                s.push_str("        long me_flat = 0; long me_stride = 1;\n");
                s.push_str("        for (long d = rank - 1; d >= 0; --d) { me_flat += (hstart[d] + me_l[d]) * me_stride; me_stride *= hshape[d]; }\n");
            } else {
                s.push_str("        const long *me_cols = indices + 1 + 3 * rank;\n");
            }
        }
        for (i, local) in self.prog.locals.iter().enumerate() {
            let ct = ctype(local.dtype.unwrap_or(Dtype::I64))?;
            let _ = writeln!(s, "        {ct} l{i} = 0;");
        }
        let _ = writeln!(s, "        out[row] = ({out_ct})0;");
        let body = self.stmts(&self.prog.body, 2)?;
        s.push_str(&body);
        s.push_str("    row_done:;\n    }\n}\n");
        Some(s)
    }

    fn binding_dtype(&self, slot: u32) -> Option<Dtype> {
        Some(self.bindings[slot as usize].dtype)
    }

    fn find_var_node(&self, slot: u32) -> Option<NodeId> {
        (0..self.prog.tree.len())
            .map(|i| crate::ast::NodeId(i as u32))
            .find(|&id| matches!(self.prog.tree.node(id).kind, NodeKind::Var(s) if s == slot))
    }

    fn slot_used(&self, slot: u32) -> bool {
        self.find_var_node(slot).is_some()
    }

    fn indent(level: usize) -> String {
        "    ".repeat(level + 1)
    }

    fn stmts(&self, stmts: &[Stmt], level: usize) -> Option<String> {
        let mut s = String::new();
        let pad = Self::indent(level);
        for stmt in stmts {
            match stmt {
                Stmt::Assign { slot, value, .. } => {
                    let ldt = self.prog.locals[*slot as usize].dtype.unwrap_or(Dtype::I64);
                    let v = self.conv(*value, ldt)?;
                    let _ = writeln!(s, "{pad}l{slot} = {v};");
                }
                Stmt::If { arms, default } => {
                    for (i, (cond, body)) in arms.iter().enumerate() {
                        let kw = if i == 0 { "if" } else { "} else if" };
                        let c = self.truth(*cond)?;
                        let _ = writeln!(s, "{pad}{kw} ({c}) {{");
                        s.push_str(&self.stmts(body, level + 1)?);
                    }
                    if !default.is_empty() {
                        let _ = writeln!(s, "{pad}}} else {{");
                        s.push_str(&self.stmts(default, level + 1)?);
                    }
                    let _ = writeln!(s, "{pad}}}");
                }
                Stmt::For {
                    slot, count, body, ..
                } => {
                    let c = self.conv(*count, Dtype::I64)?;
                    let _ = writeln!(
                        s,
                        "{pad}for (l{slot} = 0; l{slot} < (int64_t)({c}); ++l{slot}) {{"
                    );
                    s.push_str(&self.stmts(body, level + 1)?);
                    let _ = writeln!(s, "{pad}}}");
                }
                Stmt::Break => {
                    let _ = writeln!(s, "{pad}break;");
                }
                Stmt::Continue => {
                    let _ = writeln!(s, "{pad}continue;");
                }
                Stmt::Return { value, .. } => {
                    let v = self.conv(*value, self.out_dtype)?;
                    let _ = writeln!(s, "{pad}out[row] = {v}; goto row_done;");
                }
            }
        }
        Some(s)
    }

    /// Child expression converted to `want`.
    fn conv(&self, id: NodeId, want: Dtype) -> Option<String> {
        let have = self.prog.tree.node(id).dtype;
        let code = self.expr(id)?;
        if have == want {
            return Some(code);
        }
        Some(match want {
            Dtype::Bool => format!("(({code}) != 0)"),
            _ => format!("({})({code})", ctype(want)?),
        })
    }

    /// Condition expression as a C truth value.
    fn truth(&self, id: NodeId) -> Option<String> {
        let code = self.expr(id)?;
        Some(format!("({code}) != 0"))
    }

    fn expr(&self, id: NodeId) -> Option<String> {
        let node = self.prog.tree.node(id);
        let dt = node.dtype;
        ctype(dt)?;
        Some(match &node.kind {
            NodeKind::Const(s) => const_literal(s)?,
            NodeKind::Var(slot) => {
                let pos = self.data_index[*slot as usize]?;
                format!("v{pos}[row]")
            }
            NodeKind::Local(slot) => format!("l{slot}"),
            NodeKind::Index(iv) => {
                if !self.uses_index {
                    return None;
                }
                match (iv, self.synth_index) {
                    (IndexVar::Ndim, _) => "rank".to_owned(),
                    (IndexVar::ShapeDim(d), _) => format!("hshape[{d}]"),
                    (IndexVar::Dim(d), true) => format!("me_l[{d}]"),
                    (IndexVar::Dim(d), false) => format!("me_cols[{d} * nitems + row]"),
                    (IndexVar::FlatIdx, true) => "me_flat".to_owned(),
                    (IndexVar::FlatIdx, false) => "me_cols[rank * nitems + row]".to_owned(),
                }
            }
            NodeKind::Unary(op, a) => {
                let ca = self.conv(*a, node.input_dtype)?;
                match (op, node.input_dtype) {
                    (UnaryOp::Neg, dt) if dt.is_integer() => {
                        let sfx = int_suffix(dt);
                        format!("me_sub_{sfx}(0, {ca})")
                    }
                    (UnaryOp::Neg, _) => format!("(-({ca}))"),
                    (UnaryOp::Not, Dtype::Bool) => format!("(!({ca}))"),
                    (UnaryOp::Not, _) => format!("(~({ca}))"),
                }
            }
            NodeKind::Binary(op, a, b) => {
                let idt = node.input_dtype;
                let ca = self.conv(*a, idt)?;
                let cb = self.conv(*b, idt)?;
                self.binary(*op, idt, &ca, &cb)?
            }
            NodeKind::Where(c, t, e) => {
                let cc = self.truth(*c)?;
                let ct = self.conv(*t, node.input_dtype)?;
                let ce = self.conv(*e, node.input_dtype)?;
                format!("(({cc}) ? ({ct}) : ({ce}))")
            }
            NodeKind::Cast(to, a) => self.conv(*a, *to)?,
            NodeKind::Call(bid, args) => self.call(*bid, args, id)?,
            NodeKind::UserCall(..) | NodeKind::Reduce(..) => return None,
        })
    }

    fn binary(&self, op: BinaryOp, dt: Dtype, a: &str, b: &str) -> Option<String> {
        if dt.is_integer() {
            let sfx = int_suffix(dt);
            return Some(match op {
                BinaryOp::Add => format!("me_add_{sfx}({a}, {b})"),
                BinaryOp::Sub => format!("me_sub_{sfx}({a}, {b})"),
                BinaryOp::Mul => format!("me_mul_{sfx}({a}, {b})"),
                BinaryOp::Div => format!("me_div_{sfx}({a}, {b})"),
                BinaryOp::Rem => format!("me_rem_{sfx}({a}, {b})"),
                BinaryOp::Pow => format!("me_pow_{sfx}({a}, {b})"),
                BinaryOp::BitAnd => format!("(({a}) & ({b}))"),
                BinaryOp::BitOr => format!("(({a}) | ({b}))"),
                BinaryOp::BitXor => format!("(({a}) ^ ({b}))"),
                BinaryOp::Shl => format!("me_shl_{sfx}({a}, {b})"),
                BinaryOp::Shr => format!("me_shr_{sfx}({a}, {b})"),
                _ => format!("(({a}) {} ({b}))", op.symbol()),
            });
        }
        Some(match (op, dt) {
            (BinaryOp::Pow, Dtype::F32) => format!("(float)pow((double)({a}), (double)({b}))"),
            (BinaryOp::Pow, _) => format!("pow({a}, {b})"),
            (BinaryOp::Rem, Dtype::F32) => format!("(float)fmod((double)({a}), (double)({b}))"),
            (BinaryOp::Rem, _) => format!("fmod({a}, {b})"),
            (BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor, Dtype::Bool) => {
                format!("(({a}) {} ({b}))", op.symbol())
            }
            (BinaryOp::Shl | BinaryOp::Shr | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor, _) => {
                return None;
            }
            _ => format!("(({a}) {} ({b}))", op.symbol()),
        })
    }

    fn call(&self, bid: builtins::BuiltinId, args: &[NodeId], id: NodeId) -> Option<String> {
        let node = self.prog.tree.node(id);
        let def = builtins::def(bid);
        match def.kind {
            BuiltinKind::Math1(op) => {
                let idt = node.input_dtype;
                if idt.is_integer() || idt == Dtype::Bool {
                    // rounding family over integers is the identity
                    return self.conv(args[0], node.dtype);
                }
                let a = self.conv(args[0], Dtype::F64)?;
                let call = math1_c(op, &a)?;
                Some(if node.dtype == Dtype::F32 {
                    format!("(float)({call})")
                } else {
                    call
                })
            }
            BuiltinKind::Math2(op) => {
                let a = self.conv(args[0], Dtype::F64)?;
                let b = self.conv(args[1], Dtype::F64)?;
                let f = match op {
                    MathOp::Atan2 => "atan2",
                    MathOp::Hypot => "hypot",
                    MathOp::Pow => "pow",
                    _ => return None,
                };
                let call = format!("{f}({a}, {b})");
                Some(if node.dtype == Dtype::F32 {
                    format!("(float)({call})")
                } else {
                    call
                })
            }
            BuiltinKind::Abs => {
                let dt = self.prog.tree.node(args[0]).dtype;
                let a = self.expr(args[0])?;
                Some(match dt {
                    Dtype::F64 => format!("fabs({a})"),
                    Dtype::F32 => format!("(float)fabs((double)({a}))"),
                    dt if dt.is_unsigned_int() => a,
                    dt if dt.is_signed_int() => format!("me_abs_{}({a})", int_suffix(dt)),
                    _ => return None,
                })
            }
            BuiltinKind::Real | BuiltinKind::Conj => self.expr(args[0]),
            BuiltinKind::Imag => Some(format!("({})0", ctype(node.dtype)?)),
            BuiltinKind::Reduce(_) | BuiltinKind::Where | BuiltinKind::StrPred(_) => None,
        }
    }
}

fn const_literal(s: &Scalar) -> Option<String> {
    Some(match s {
        Scalar::F64(v) => float_literal(*v)?,
        Scalar::F32(v) => format!("(float)({})", float_literal(f64::from(*v))?),
        Scalar::Bool(v) => if *v { "1" } else { "0" }.to_owned(),
        Scalar::U64(v) => format!("UINT64_C({v})"),
        Scalar::Str(_) | Scalar::C64(_) | Scalar::C128(_) => return None,
        other => {
            let v = other.as_i64()?;
            format!("INT64_C({v})")
        }
    })
}

fn float_literal(v: f64) -> Option<String> {
    if v.is_nan() {
        return Some("(0.0 / 0.0)".to_owned());
    }
    if v.is_infinite() {
        return Some(if v > 0.0 { "(1.0 / 0.0)" } else { "(-1.0 / 0.0)" }.to_owned());
    }
    Some(format!("{v:.17e}"))
}

fn math1_c(op: MathOp, a: &str) -> Option<String> {
    Some(match op {
        MathOp::Sin => format!("sin({a})"),
        MathOp::Cos => format!("cos({a})"),
        MathOp::Tan => format!("tan({a})"),
        MathOp::Asin => format!("asin({a})"),
        MathOp::Acos => format!("acos({a})"),
        MathOp::Atan => format!("atan({a})"),
        MathOp::Sinh => format!("sinh({a})"),
        MathOp::Cosh => format!("cosh({a})"),
        MathOp::Tanh => format!("tanh({a})"),
        MathOp::Asinh => format!("asinh({a})"),
        MathOp::Acosh => format!("acosh({a})"),
        MathOp::Atanh => format!("atanh({a})"),
        MathOp::Exp => format!("exp({a})"),
        MathOp::Expm1 => format!("expm1({a})"),
        MathOp::Exp2 => format!("exp2({a})"),
        MathOp::Exp10 => format!("exp(({a}) * 2.30258509299404568402)"),
        MathOp::Log => format!("log({a})"),
        MathOp::Log10 => format!("log10({a})"),
        MathOp::Log1p => format!("log1p({a})"),
        MathOp::Log2 => format!("log2({a})"),
        MathOp::Sinpi => format!("sin(M_PI * ({a}))"),
        MathOp::Cospi => format!("cos(M_PI * ({a}))"),
        MathOp::Cbrt => format!("cbrt({a})"),
        MathOp::Sqrt => format!("sqrt({a})"),
        MathOp::Erf => format!("erf({a})"),
        MathOp::Erfc => format!("erfc({a})"),
        MathOp::Tgamma => format!("tgamma({a})"),
        MathOp::Lgamma => format!("lgamma({a})"),
        MathOp::Floor => format!("floor({a})"),
        MathOp::Ceil => format!("ceil({a})"),
        MathOp::Round => format!("round({a})"),
        MathOp::Trunc => format!("trunc({a})"),
        MathOp::Atan2 | MathOp::Hypot | MathOp::Pow => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::VarDecl;

    fn bindings(vars: &[(&str, Dtype)]) -> Vec<Binding> {
        vars.iter()
            .map(|(n, dt)| Binding::from_decl(&VarDecl::new(*n, *dt)))
            .collect()
    }

    #[test]
    fn lowers_straight_line_kernels() {
        let b = bindings(&[("x", Dtype::F64), ("y", Dtype::F64)]);
        let prog = super::super::parse_kernel(
            "def kernel(x, y):\n    t = x * y + 1.0\n    return sqrt(t)\n",
            &b,
        )
        .unwrap();
        let low = lower(&prog, &b, Dtype::F64, false).unwrap();
        assert!(low.c_source.contains("void kernel_block"));
        assert!(low.c_source.contains("sqrt("));
        assert!(low.c_source.contains("out[row] ="));
        assert!(!low.uses_index_vars);
    }

    #[test]
    fn element_dialect_control_flow_compiles() {
        let b = bindings(&[("x", Dtype::F64)]);
        let prog = super::super::parse_kernel(
            "# me:dialect=element\ndef kernel(x):\n    acc = 0.0\n    for i in range(4):\n        acc += x\n        if acc > 10.0:\n            break\n    return acc\n",
            &b,
        )
        .unwrap();
        let low = lower(&prog, &b, Dtype::F64, false).unwrap();
        assert!(low.c_source.contains("for (l1 = 0;"));
        assert!(low.c_source.contains("break;"));
    }

    #[test]
    fn vector_control_flow_is_rejected() {
        let b = bindings(&[("x", Dtype::F64)]);
        let prog = super::super::parse_kernel(
            "def kernel(x):\n    if x > 0.0:\n        return x\n    return 0.0\n",
            &b,
        )
        .unwrap();
        assert!(lower(&prog, &b, Dtype::F64, false).is_none());
    }

    #[test]
    fn reductions_are_rejected() {
        let b = bindings(&[("x", Dtype::F64)]);
        let prog = super::super::parse_kernel(
            "# me:dialect=element\ndef kernel(x):\n    return where(any(x > 0.0), x, 0.0 - x)\n",
            &b,
        )
        .unwrap();
        assert!(lower(&prog, &b, Dtype::F64, false).is_none());
    }

    #[test]
    fn index_kernels_read_or_synthesise() {
        let b = bindings(&[("x", Dtype::I64)]);
        let prog = super::super::parse_kernel(
            "def kernel(x):\n    return _flat_idx + x\n",
            &b,
        )
        .unwrap();
        let read = lower(&prog, &b, Dtype::I64, false).unwrap();
        assert!(read.c_source.contains("me_cols["));
        let synth = lower(&prog, &b, Dtype::I64, true).unwrap();
        assert!(synth.c_source.contains("me_flat"));
    }
}
