//! Monomorphic per-dtype kernels for the block interpreter. The op × dtype
//! cartesian product lives here and nowhere else; the interpreter picks a
//! kernel from `(operator, promoted dtype)` and never branches per element.
//!
//! Every binary kernel handles the scalar/vector operand combinations
//! without materialising a block-wide broadcast of the scalar side.

use num::Float;
use num::complex::{Complex32, Complex64};

use crate::ast::{BinaryOp, UnaryOp};
use crate::buffer::BufferRef;
use crate::dtype::Dtype;
use crate::error::EvalError;
use crate::scalar::Scalar;

/// Owned typed column, one block long (or shorter for the final block).
#[derive(Debug, Clone)]
pub(crate) enum ColVec {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    C64(Vec<Complex32>),
    C128(Vec<Complex64>),
    Bool(Vec<bool>),
}

impl ColVec {
    pub(crate) fn get(&self, i: usize) -> Scalar {
        match self {
            Self::I8(v) => Scalar::I8(v[i]),
            Self::I16(v) => Scalar::I16(v[i]),
            Self::I32(v) => Scalar::I32(v[i]),
            Self::I64(v) => Scalar::I64(v[i]),
            Self::U8(v) => Scalar::U8(v[i]),
            Self::U16(v) => Scalar::U16(v[i]),
            Self::U32(v) => Scalar::U32(v[i]),
            Self::U64(v) => Scalar::U64(v[i]),
            Self::F32(v) => Scalar::F32(v[i]),
            Self::F64(v) => Scalar::F64(v[i]),
            Self::C64(v) => Scalar::C64(v[i]),
            Self::C128(v) => Scalar::C128(v[i]),
            Self::Bool(v) => Scalar::Bool(v[i]),
        }
    }
}

/// One evaluation temporary: a scalar, an owned column, or a borrowed view
/// of caller memory. Strings never flow through here as vectors; the string
/// operators read their operand buffers directly.
#[derive(Debug, Clone)]
pub(crate) enum Operand<'a> {
    Scalar(Scalar),
    Vec(ColVec),
    View(BufferRef<'a>),
}

impl Operand<'_> {
    pub(crate) fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    pub(crate) fn get(&self, i: usize) -> Scalar {
        match self {
            Self::Scalar(s) => s.clone(),
            Self::Vec(v) => v.get(i),
            Self::View(b) => b.get(i),
        }
    }
}

/// Scalar-or-slice access to one operand lane stream.
#[derive(Clone, Copy)]
pub(crate) enum Src<'a, T: Copy> {
    S(T),
    V(&'a [T]),
}

impl<T: Copy> Src<'_, T> {
    #[inline]
    pub(crate) fn at(&self, i: usize) -> T {
        match self {
            Self::S(v) => *v,
            Self::V(s) => s[i],
        }
    }

    pub(crate) fn as_scalar(&self) -> Option<T> {
        match self {
            Self::S(v) => Some(*v),
            Self::V(_) => None,
        }
    }
}

/// A lane type the kernels are monomorphised over.
pub(crate) trait Lane: Copy + 'static {
    fn wrap_vec(v: Vec<Self>) -> ColVec;
    fn wrap_scalar(self) -> Scalar;
    fn src<'a>(op: &'a Operand<'a>) -> Result<Src<'a, Self>, EvalError>;
}

macro_rules! impl_lane {
    ($($t:ty => $v:ident),* $(,)?) => {
        $(
            impl Lane for $t {
                fn wrap_vec(v: Vec<Self>) -> ColVec {
                    ColVec::$v(v)
                }
                fn wrap_scalar(self) -> Scalar {
                    Scalar::$v(self)
                }
                fn src<'a>(op: &'a Operand<'a>) -> Result<Src<'a, Self>, EvalError> {
                    match op {
                        Operand::Scalar(Scalar::$v(x)) => Ok(Src::S(*x)),
                        Operand::Vec(ColVec::$v(x)) => Ok(Src::V(x.as_slice())),
                        Operand::View(BufferRef::$v(x)) => Ok(Src::V(*x)),
                        _ => Err(EvalError::Internal("operand dtype mismatch")),
                    }
                }
            }
        )*
    };
}

impl_lane! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
    Complex32 => C64, Complex64 => C128,
    bool => Bool,
}

pub(crate) fn map1<A: Lane, R: Lane>(
    a: &Operand<'_>,
    len: usize,
    f: impl Fn(A) -> R,
) -> Result<Operand<'static>, EvalError> {
    let sa = A::src(a)?;
    Ok(match sa {
        Src::S(x) => Operand::Scalar(f(x).wrap_scalar()),
        Src::V(s) => {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                out.push(f(s[i]));
            }
            Operand::Vec(R::wrap_vec(out))
        }
    })
}

pub(crate) fn map2<A: Lane, R: Lane>(
    a: &Operand<'_>,
    b: &Operand<'_>,
    len: usize,
    f: impl Fn(A, A) -> R,
) -> Result<Operand<'static>, EvalError> {
    let sa = A::src(a)?;
    let sb = A::src(b)?;
    Ok(match (sa.as_scalar(), sb.as_scalar()) {
        (Some(x), Some(y)) => Operand::Scalar(f(x, y).wrap_scalar()),
        _ => {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                out.push(f(sa.at(i), sb.at(i)));
            }
            Operand::Vec(R::wrap_vec(out))
        }
    })
}

/// Lane select: `out[i] = if cond[i] { t[i] } else { e[i] }`
pub(crate) fn select<T: Lane>(
    cond: &Operand<'_>,
    t: &Operand<'_>,
    e: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    let sc = bool::src(cond)?;
    let st = T::src(t)?;
    let se = T::src(e)?;
    if let (Some(c), Some(x), Some(y)) = (sc.as_scalar(), st.as_scalar(), se.as_scalar()) {
        return Ok(Operand::Scalar(if c { x } else { y }.wrap_scalar()));
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(if sc.at(i) { st.at(i) } else { se.at(i) });
    }
    Ok(Operand::Vec(T::wrap_vec(out)))
}

/// Integer lane operations with C-engine semantics: wrapping arithmetic,
/// division/remainder by zero yields 0, shift counts are masked.
pub(crate) trait LaneInt: Lane + PartialOrd + Eq {
    fn wadd(self, o: Self) -> Self;
    fn wsub(self, o: Self) -> Self;
    fn wmul(self, o: Self) -> Self;
    fn wdiv(self, o: Self) -> Self;
    fn wrem(self, o: Self) -> Self;
    fn wneg(self) -> Self;
    fn wabs(self) -> Self;
    fn bnot(self) -> Self;
    fn band(self, o: Self) -> Self;
    fn bor(self, o: Self) -> Self;
    fn bxor(self, o: Self) -> Self;
    fn wshl(self, o: Self) -> Self;
    fn wshr(self, o: Self) -> Self;
    fn wpow(self, e: Self) -> Self;
}

macro_rules! impl_lane_int {
    (signed $($t:ty),*) => {
        $(impl_lane_int!(@common $t);
        impl LaneInt for $t {
            impl_lane_int!(@methods $t);
            fn wabs(self) -> Self {
                self.wrapping_abs()
            }
            fn wpow(self, e: Self) -> Self {
                if e < 0 {
                    match self {
                        1 => 1,
                        -1 => if e & 1 == 0 { 1 } else { -1 },
                        _ => 0,
                    }
                } else {
                    self.wrapping_pow(e as u32)
                }
            }
        })*
    };
    (unsigned $($t:ty),*) => {
        $(impl_lane_int!(@common $t);
        impl LaneInt for $t {
            impl_lane_int!(@methods $t);
            fn wabs(self) -> Self {
                self
            }
            fn wpow(self, e: Self) -> Self {
                self.wrapping_pow(e.min(u32::MAX as $t & <$t>::MAX) as u32)
            }
        })*
    };
    (@common $t:ty) => {};
    (@methods $t:ty) => {
        fn wadd(self, o: Self) -> Self {
            self.wrapping_add(o)
        }
        fn wsub(self, o: Self) -> Self {
            self.wrapping_sub(o)
        }
        fn wmul(self, o: Self) -> Self {
            self.wrapping_mul(o)
        }
        fn wdiv(self, o: Self) -> Self {
            if o == 0 { 0 } else { self.wrapping_div(o) }
        }
        fn wrem(self, o: Self) -> Self {
            if o == 0 { 0 } else { self.wrapping_rem(o) }
        }
        fn wneg(self) -> Self {
            self.wrapping_neg()
        }
        fn bnot(self) -> Self {
            !self
        }
        fn band(self, o: Self) -> Self {
            self & o
        }
        fn bor(self, o: Self) -> Self {
            self | o
        }
        fn bxor(self, o: Self) -> Self {
            self ^ o
        }
        fn wshl(self, o: Self) -> Self {
            self.wrapping_shl(o as u32)
        }
        fn wshr(self, o: Self) -> Self {
            self.wrapping_shr(o as u32)
        }
    };
}

impl_lane_int!(signed i8, i16, i32, i64);
impl_lane_int!(unsigned u8, u16, u32, u64);

fn int_binary<T: LaneInt>(
    op: BinaryOp,
    a: &Operand<'_>,
    b: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    match op {
        BinaryOp::Add => map2::<T, T>(a, b, len, T::wadd),
        BinaryOp::Sub => map2::<T, T>(a, b, len, T::wsub),
        BinaryOp::Mul => map2::<T, T>(a, b, len, T::wmul),
        BinaryOp::Div => map2::<T, T>(a, b, len, T::wdiv),
        BinaryOp::Rem => map2::<T, T>(a, b, len, T::wrem),
        BinaryOp::Pow => map2::<T, T>(a, b, len, T::wpow),
        BinaryOp::BitAnd => map2::<T, T>(a, b, len, T::band),
        BinaryOp::BitOr => map2::<T, T>(a, b, len, T::bor),
        BinaryOp::BitXor => map2::<T, T>(a, b, len, T::bxor),
        BinaryOp::Shl => map2::<T, T>(a, b, len, T::wshl),
        BinaryOp::Shr => map2::<T, T>(a, b, len, T::wshr),
        BinaryOp::Eq => map2::<T, bool>(a, b, len, |x, y| x == y),
        BinaryOp::Ne => map2::<T, bool>(a, b, len, |x, y| x != y),
        BinaryOp::Lt => map2::<T, bool>(a, b, len, |x, y| x < y),
        BinaryOp::Le => map2::<T, bool>(a, b, len, |x, y| x <= y),
        BinaryOp::Gt => map2::<T, bool>(a, b, len, |x, y| x > y),
        BinaryOp::Ge => map2::<T, bool>(a, b, len, |x, y| x >= y),
    }
}

fn float_binary<T: Lane + Float>(
    op: BinaryOp,
    a: &Operand<'_>,
    b: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    match op {
        BinaryOp::Add => map2::<T, T>(a, b, len, |x, y| x + y),
        BinaryOp::Sub => map2::<T, T>(a, b, len, |x, y| x - y),
        BinaryOp::Mul => map2::<T, T>(a, b, len, |x, y| x * y),
        BinaryOp::Div => map2::<T, T>(a, b, len, |x, y| x / y),
        BinaryOp::Rem => map2::<T, T>(a, b, len, |x, y| x % y),
        BinaryOp::Pow => map2::<T, T>(a, b, len, |x, y| x.powf(y)),
        BinaryOp::Eq => map2::<T, bool>(a, b, len, |x, y| x == y),
        BinaryOp::Ne => map2::<T, bool>(a, b, len, |x, y| x != y),
        BinaryOp::Lt => map2::<T, bool>(a, b, len, |x, y| x < y),
        BinaryOp::Le => map2::<T, bool>(a, b, len, |x, y| x <= y),
        BinaryOp::Gt => map2::<T, bool>(a, b, len, |x, y| x > y),
        BinaryOp::Ge => map2::<T, bool>(a, b, len, |x, y| x >= y),
        _ => Err(EvalError::Internal("bitwise operator on float")),
    }
}

/// Complex lane with the `num` power implementation attached.
pub(crate) trait LaneComplex:
    Lane
    + PartialEq
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
{
    fn cpow(self, o: Self) -> Self;
}

impl LaneComplex for Complex32 {
    fn cpow(self, o: Self) -> Self {
        self.powc(o)
    }
}

impl LaneComplex for Complex64 {
    fn cpow(self, o: Self) -> Self {
        self.powc(o)
    }
}

fn complex_binary<T: LaneComplex>(
    op: BinaryOp,
    a: &Operand<'_>,
    b: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    match op {
        BinaryOp::Add => map2::<T, T>(a, b, len, |x, y| x + y),
        BinaryOp::Sub => map2::<T, T>(a, b, len, |x, y| x - y),
        BinaryOp::Mul => map2::<T, T>(a, b, len, |x, y| x * y),
        BinaryOp::Div => map2::<T, T>(a, b, len, |x, y| x / y),
        BinaryOp::Pow => map2::<T, T>(a, b, len, T::cpow),
        BinaryOp::Eq => map2::<T, bool>(a, b, len, |x, y| x == y),
        BinaryOp::Ne => map2::<T, bool>(a, b, len, |x, y| x != y),
        _ => Err(EvalError::Internal("unsupported complex operator")),
    }
}

fn bool_binary(
    op: BinaryOp,
    a: &Operand<'_>,
    b: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    match op {
        BinaryOp::BitAnd => map2::<bool, bool>(a, b, len, |x, y| x & y),
        BinaryOp::BitOr => map2::<bool, bool>(a, b, len, |x, y| x | y),
        BinaryOp::BitXor => map2::<bool, bool>(a, b, len, |x, y| x ^ y),
        BinaryOp::Eq => map2::<bool, bool>(a, b, len, |x, y| x == y),
        BinaryOp::Ne => map2::<bool, bool>(a, b, len, |x, y| x != y),
        BinaryOp::Lt => map2::<bool, bool>(a, b, len, |x, y| !x & y),
        BinaryOp::Le => map2::<bool, bool>(a, b, len, |x, y| x <= y),
        BinaryOp::Gt => map2::<bool, bool>(a, b, len, |x, y| x & !y),
        BinaryOp::Ge => map2::<bool, bool>(a, b, len, |x, y| x >= y),
        _ => Err(EvalError::Internal("arithmetic on unpromoted bool")),
    }
}

/// Binary dispatch on `(operator, promoted dtype)`. Both operands must
/// already be converted to `dt`.
pub(crate) fn binary_op(
    op: BinaryOp,
    dt: Dtype,
    a: &Operand<'_>,
    b: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    match dt {
        Dtype::I8 => int_binary::<i8>(op, a, b, len),
        Dtype::I16 => int_binary::<i16>(op, a, b, len),
        Dtype::I32 => int_binary::<i32>(op, a, b, len),
        Dtype::I64 => int_binary::<i64>(op, a, b, len),
        Dtype::U8 => int_binary::<u8>(op, a, b, len),
        Dtype::U16 => int_binary::<u16>(op, a, b, len),
        Dtype::U32 => int_binary::<u32>(op, a, b, len),
        Dtype::U64 => int_binary::<u64>(op, a, b, len),
        Dtype::F32 => float_binary::<f32>(op, a, b, len),
        Dtype::F64 => float_binary::<f64>(op, a, b, len),
        Dtype::C64 => complex_binary::<Complex32>(op, a, b, len),
        Dtype::C128 => complex_binary::<Complex64>(op, a, b, len),
        Dtype::Bool => bool_binary(op, a, b, len),
        Dtype::Str => Err(EvalError::Internal("string operands reach no kernel")),
    }
}

pub(crate) fn unary_op(
    op: UnaryOp,
    dt: Dtype,
    a: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    fn int_unary<T: LaneInt>(
        op: UnaryOp,
        a: &Operand<'_>,
        len: usize,
    ) -> Result<Operand<'static>, EvalError> {
        match op {
            UnaryOp::Neg => map1::<T, T>(a, len, T::wneg),
            UnaryOp::Not => map1::<T, T>(a, len, T::bnot),
        }
    }
    match (dt, op) {
        (Dtype::I8, _) => int_unary::<i8>(op, a, len),
        (Dtype::I16, _) => int_unary::<i16>(op, a, len),
        (Dtype::I32, _) => int_unary::<i32>(op, a, len),
        (Dtype::I64, _) => int_unary::<i64>(op, a, len),
        (Dtype::U8, _) => int_unary::<u8>(op, a, len),
        (Dtype::U16, _) => int_unary::<u16>(op, a, len),
        (Dtype::U32, _) => int_unary::<u32>(op, a, len),
        (Dtype::U64, _) => int_unary::<u64>(op, a, len),
        (Dtype::F32, UnaryOp::Neg) => map1::<f32, f32>(a, len, |x| -x),
        (Dtype::F64, UnaryOp::Neg) => map1::<f64, f64>(a, len, |x| -x),
        (Dtype::C64, UnaryOp::Neg) => map1::<Complex32, Complex32>(a, len, |x| -x),
        (Dtype::C128, UnaryOp::Neg) => map1::<Complex64, Complex64>(a, len, |x| -x),
        (Dtype::Bool, UnaryOp::Not) => map1::<bool, bool>(a, len, |x| !x),
        _ => Err(EvalError::Internal("unary op on unsupported dtype")),
    }
}

/// Lane select dispatched on the promoted result dtype.
pub(crate) fn where_op(
    dt: Dtype,
    cond: &Operand<'_>,
    t: &Operand<'_>,
    e: &Operand<'_>,
    len: usize,
) -> Result<Operand<'static>, EvalError> {
    match dt {
        Dtype::I8 => select::<i8>(cond, t, e, len),
        Dtype::I16 => select::<i16>(cond, t, e, len),
        Dtype::I32 => select::<i32>(cond, t, e, len),
        Dtype::I64 => select::<i64>(cond, t, e, len),
        Dtype::U8 => select::<u8>(cond, t, e, len),
        Dtype::U16 => select::<u16>(cond, t, e, len),
        Dtype::U32 => select::<u32>(cond, t, e, len),
        Dtype::U64 => select::<u64>(cond, t, e, len),
        Dtype::F32 => select::<f32>(cond, t, e, len),
        Dtype::F64 => select::<f64>(cond, t, e, len),
        Dtype::C64 => select::<Complex32>(cond, t, e, len),
        Dtype::C128 => select::<Complex64>(cond, t, e, len),
        Dtype::Bool => select::<bool>(cond, t, e, len),
        Dtype::Str => Err(EvalError::Internal("string operands reach no kernel")),
    }
}

/// Converts an operand to `to`, element-wise. Identity conversions return a
/// cheap clone of the borrowed view.
pub(crate) fn convert<'a>(
    op: &Operand<'a>,
    from: Dtype,
    to: Dtype,
    len: usize,
) -> Result<Operand<'a>, EvalError> {
    if from == to {
        return Ok(op.clone());
    }
    match op {
        Operand::Scalar(s) => s
            .cast(to)
            .map(Operand::Scalar)
            .ok_or(EvalError::Internal("uncastable operand")),
        _ => {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                out.push(
                    op.get(i)
                        .cast(to)
                        .ok_or(EvalError::Internal("uncastable operand"))?,
                );
            }
            // re-pack the scalars into a typed column
            pack(to, &out)
        }
    }
}

pub(crate) fn pack(to: Dtype, items: &[Scalar]) -> Result<Operand<'static>, EvalError> {
    macro_rules! pack_as {
        ($v:ident) => {{
            let mut out = Vec::with_capacity(items.len());
            for s in items {
                match s {
                    Scalar::$v(x) => out.push(x.clone()),
                    _ => return Err(EvalError::Internal("conversion produced mixed dtypes")),
                }
            }
            Ok(Operand::Vec(ColVec::$v(out)))
        }};
    }
    match to {
        Dtype::I8 => pack_as!(I8),
        Dtype::I16 => pack_as!(I16),
        Dtype::I32 => pack_as!(I32),
        Dtype::I64 => pack_as!(I64),
        Dtype::U8 => pack_as!(U8),
        Dtype::U16 => pack_as!(U16),
        Dtype::U32 => pack_as!(U32),
        Dtype::U64 => pack_as!(U64),
        Dtype::F32 => pack_as!(F32),
        Dtype::F64 => pack_as!(F64),
        Dtype::C64 => pack_as!(C64),
        Dtype::C128 => pack_as!(C128),
        Dtype::Bool => pack_as!(Bool),
        Dtype::Str => Err(EvalError::Internal("cannot pack strings")),
    }
}

/// Scalar fast path shared by the optimizer and the element-dialect
/// interpreter: both operands cast to `dt`, then the same kernels run with
/// length 1.
pub(crate) fn scalar_binary(
    op: BinaryOp,
    dt: Dtype,
    a: &Scalar,
    b: &Scalar,
) -> Result<Scalar, EvalError> {
    let ca = a.cast(dt).ok_or(EvalError::Internal("uncastable operand"))?;
    let cb = b.cast(dt).ok_or(EvalError::Internal("uncastable operand"))?;
    match binary_op(op, dt, &Operand::Scalar(ca), &Operand::Scalar(cb), 1)? {
        Operand::Scalar(s) => Ok(s),
        _ => Err(EvalError::Internal("scalar kernel produced a vector")),
    }
}

pub(crate) fn scalar_unary(op: UnaryOp, dt: Dtype, a: &Scalar) -> Result<Scalar, EvalError> {
    let ca = a.cast(dt).ok_or(EvalError::Internal("uncastable operand"))?;
    match unary_op(op, dt, &Operand::Scalar(ca), 1)? {
        Operand::Scalar(s) => Ok(s),
        _ => Err(EvalError::Internal("scalar kernel produced a vector")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_vector_mix_avoids_broadcast() {
        let a = Operand::Vec(ColVec::I32(vec![1, 2, 3, 4]));
        let b = Operand::Scalar(Scalar::I32(10));
        let out = binary_op(BinaryOp::Mul, Dtype::I32, &a, &b, 4).unwrap();
        match out {
            Operand::Vec(ColVec::I32(v)) => assert_eq!(v, vec![10, 20, 30, 40]),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn int_division_by_zero_is_zero() {
        let a = Operand::Vec(ColVec::I16(vec![7, -9, 5]));
        let b = Operand::Vec(ColVec::I16(vec![2, 0, -5]));
        let out = binary_op(BinaryOp::Div, Dtype::I16, &a, &b, 3).unwrap();
        match out {
            Operand::Vec(ColVec::I16(v)) => assert_eq!(v, vec![3, 0, -1]),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn integer_pow() {
        assert_eq!(
            scalar_binary(BinaryOp::Pow, Dtype::I32, &Scalar::I32(3), &Scalar::I32(4)).unwrap(),
            Scalar::I32(81)
        );
        assert_eq!(
            scalar_binary(BinaryOp::Pow, Dtype::I32, &Scalar::I32(2), &Scalar::I32(-1)).unwrap(),
            Scalar::I32(0)
        );
        assert_eq!(
            scalar_binary(BinaryOp::Pow, Dtype::I64, &Scalar::I64(-1), &Scalar::I64(-3)).unwrap(),
            Scalar::I64(-1)
        );
    }

    #[test]
    fn conversions() {
        let a = Operand::Vec(ColVec::I32(vec![1, 2, 3]));
        let out = convert(&a, Dtype::I32, Dtype::F64, 3).unwrap();
        match out {
            Operand::Vec(ColVec::F64(v)) => assert_eq!(v, vec![1.0, 2.0, 3.0]),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn where_select() {
        let c = Operand::Vec(ColVec::Bool(vec![true, false, true]));
        let t = Operand::Scalar(Scalar::F64(1.0));
        let e = Operand::Vec(ColVec::F64(vec![9.0, 8.0, 7.0]));
        let out = where_op(Dtype::F64, &c, &t, &e, 3).unwrap();
        match out {
            Operand::Vec(ColVec::F64(v)) => assert_eq!(v, vec![1.0, 8.0, 7.0]),
            other => panic!("unexpected operand {other:?}"),
        }
    }
}
