use once_cell::sync::Lazy;

use crate::dtype::ReduceOp;
use crate::simd::MathOp;

/// Index into the builtin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuiltinId(pub(crate) u16);

/// String predicates; padding code points are ignored on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrPred {
    StartsWith,
    EndsWith,
    Contains,
}

/// Evaluation strategy of a builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Unary transcendental/rounding, dispatched through [`crate::simd`]
    Math1(MathOp),
    /// Binary transcendental
    Math2(MathOp),
    /// Collapses a vector child to a scalar
    Reduce(ReduceOp),
    /// Lane select `where(c, x, y)`
    Where,
    StrPred(StrPred),
    /// `abs`: type-preserving on reals, magnitude on complex
    Abs,
    Real,
    Imag,
    Conj,
}

/// Operand dtypes a builtin accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Integers promote to f64; f32/f64 keep their width
    Float,
    /// Same, plus the complex dtypes
    FloatOrComplex,
    /// Integer, float or complex
    Numeric,
    /// Integer or float (no complex)
    RealNumeric,
    /// Anything except strings
    NumericOrBool,
    /// Both operands must be strings
    StrPair,
}

/// Output dtype rule, resolved against the promoted operand dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutRule {
    SameAsOperand,
    /// Integer operands widen to f64, floats keep their width
    PromoteToFloat,
    Boolean,
    /// See [`crate::dtype::reduce_output`]
    Reduction,
    /// Float of the operand's part width (complex magnitude, `real`, `imag`)
    PartFloat,
}

#[derive(Debug, Clone, Copy)]
pub struct BuiltinDef {
    pub name: &'static str,
    pub arity: u8,
    /// Non-pure entries block optimisation across the call; every builtin
    /// here is pure, the flag exists for user-registered functions
    pub pure: bool,
    pub domain: Domain,
    pub out: OutRule,
    pub kind: BuiltinKind,
}

const fn math1(name: &'static str, op: MathOp) -> BuiltinDef {
    BuiltinDef {
        name,
        arity: 1,
        pure: true,
        domain: Domain::Float,
        out: OutRule::PromoteToFloat,
        kind: BuiltinKind::Math1(op),
    }
}

const fn math1_c(name: &'static str, op: MathOp) -> BuiltinDef {
    BuiltinDef {
        name,
        arity: 1,
        pure: true,
        domain: Domain::FloatOrComplex,
        out: OutRule::PromoteToFloat,
        kind: BuiltinKind::Math1(op),
    }
}

const fn math2(name: &'static str, op: MathOp) -> BuiltinDef {
    BuiltinDef {
        name,
        arity: 2,
        pure: true,
        domain: Domain::Float,
        out: OutRule::PromoteToFloat,
        kind: BuiltinKind::Math2(op),
    }
}

const fn rounding(name: &'static str, op: MathOp) -> BuiltinDef {
    BuiltinDef {
        name,
        arity: 1,
        pure: true,
        domain: Domain::RealNumeric,
        out: OutRule::SameAsOperand,
        kind: BuiltinKind::Math1(op),
    }
}

const fn reduction(name: &'static str, op: ReduceOp) -> BuiltinDef {
    BuiltinDef {
        name,
        arity: 1,
        pure: true,
        domain: Domain::NumericOrBool,
        out: OutRule::Reduction,
        kind: BuiltinKind::Reduce(op),
    }
}

const fn str_pred(name: &'static str, op: StrPred) -> BuiltinDef {
    BuiltinDef {
        name,
        arity: 2,
        pure: true,
        domain: Domain::StrPair,
        out: OutRule::Boolean,
        kind: BuiltinKind::StrPred(op),
    }
}

/// The registry, sorted by name. Lookup binary-searches, so order is a hard
/// invariant, checked once on first access and by a test below.
static TABLE: &[BuiltinDef] = &[
    BuiltinDef {
        name: "abs",
        arity: 1,
        pure: true,
        domain: Domain::Numeric,
        out: OutRule::SameAsOperand,
        kind: BuiltinKind::Abs,
    },
    math1("acos", MathOp::Acos),
    math1("acosh", MathOp::Acosh),
    reduction("all", ReduceOp::All),
    reduction("any", ReduceOp::Any),
    math1("asin", MathOp::Asin),
    math1("asinh", MathOp::Asinh),
    math1("atan", MathOp::Atan),
    math2("atan2", MathOp::Atan2),
    math1("atanh", MathOp::Atanh),
    math1("cbrt", MathOp::Cbrt),
    rounding("ceil", MathOp::Ceil),
    BuiltinDef {
        name: "conj",
        arity: 1,
        pure: true,
        domain: Domain::Numeric,
        out: OutRule::SameAsOperand,
        kind: BuiltinKind::Conj,
    },
    str_pred("contains", StrPred::Contains),
    math1_c("cos", MathOp::Cos),
    math1_c("cosh", MathOp::Cosh),
    math1("cospi", MathOp::Cospi),
    str_pred("endswith", StrPred::EndsWith),
    math1("erf", MathOp::Erf),
    math1("erfc", MathOp::Erfc),
    math1_c("exp", MathOp::Exp),
    math1("exp10", MathOp::Exp10),
    math1("exp2", MathOp::Exp2),
    math1("expm1", MathOp::Expm1),
    rounding("floor", MathOp::Floor),
    math2("hypot", MathOp::Hypot),
    BuiltinDef {
        name: "imag",
        arity: 1,
        pure: true,
        domain: Domain::Numeric,
        out: OutRule::PartFloat,
        kind: BuiltinKind::Imag,
    },
    math1("lgamma", MathOp::Lgamma),
    math1_c("log", MathOp::Log),
    math1("log10", MathOp::Log10),
    math1("log1p", MathOp::Log1p),
    math1("log2", MathOp::Log2),
    reduction("max", ReduceOp::Max),
    reduction("min", ReduceOp::Min),
    math2("pow", MathOp::Pow),
    reduction("prod", ReduceOp::Prod),
    BuiltinDef {
        name: "real",
        arity: 1,
        pure: true,
        domain: Domain::Numeric,
        out: OutRule::PartFloat,
        kind: BuiltinKind::Real,
    },
    rounding("round", MathOp::Round),
    math1_c("sin", MathOp::Sin),
    math1_c("sinh", MathOp::Sinh),
    math1("sinpi", MathOp::Sinpi),
    math1_c("sqrt", MathOp::Sqrt),
    str_pred("startswith", StrPred::StartsWith),
    reduction("sum", ReduceOp::Sum),
    math1_c("tan", MathOp::Tan),
    math1_c("tanh", MathOp::Tanh),
    math1("tgamma", MathOp::Tgamma),
    rounding("trunc", MathOp::Trunc),
    BuiltinDef {
        name: "where",
        arity: 3,
        pure: true,
        domain: Domain::NumericOrBool,
        out: OutRule::SameAsOperand,
        kind: BuiltinKind::Where,
    },
];

static REGISTRY: Lazy<&'static [BuiltinDef]> = Lazy::new(|| {
    assert!(
        TABLE.windows(2).all(|w| w[0].name < w[1].name),
        "builtin table must stay alphabetically sorted"
    );
    TABLE
});

/// Exact-name lookup.
#[must_use]
pub fn lookup(name: &str) -> Option<(BuiltinId, &'static BuiltinDef)> {
    let table = *REGISTRY;
    let idx = table.binary_search_by(|def| def.name.cmp(name)).ok()?;
    Some((BuiltinId(idx as u16), &table[idx]))
}

#[must_use]
pub fn def(id: BuiltinId) -> &'static BuiltinDef {
    &REGISTRY[id.0 as usize]
}

#[must_use]
pub fn name(id: BuiltinId) -> &'static str {
    def(id).name
}
