use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Element type of a variable, constant or evaluation buffer.
///
/// The discriminants are stable: they are written into the JIT cache header
/// and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Dtype {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
    /// Complex with `f32` parts
    C64 = 10,
    /// Complex with `f64` parts
    C128 = 11,
    /// One byte per element
    Bool = 12,
    /// Fixed-width UCS-4 string; the item size lives on the variable
    Str = 13,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::C64 => "c64",
            Self::C128 => "c128",
            Self::Bool => "bool",
            Self::Str => "str",
        })
    }
}

impl Dtype {
    #[must_use]
    pub fn is_signed_int(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    #[must_use]
    pub fn is_unsigned_int(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(self, Self::C64 | Self::C128)
    }

    /// Integer, float or complex (not bool, not string)
    #[must_use]
    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float() || self.is_complex()
    }

    /// Bytes per element. Strings report the per-code-point width; the full
    /// item size is a property of the variable, not the dtype.
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 | Self::Str => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
        }
    }

    /// Bit width of the value domain (parts, for complex)
    fn bits(self) -> u8 {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 8,
            Self::I16 | Self::U16 => 16,
            Self::I32 | Self::U32 | Self::F32 | Self::C64 => 32,
            Self::I64 | Self::U64 | Self::F64 | Self::C128 | Self::Str => 64,
        }
    }

    fn signed_of_bits(bits: u8) -> Dtype {
        match bits {
            8 => Self::I8,
            16 => Self::I16,
            32 => Self::I32,
            _ => Self::I64,
        }
    }

    fn unsigned_of_bits(bits: u8) -> Dtype {
        match bits {
            8 => Self::U8,
            16 => Self::U16,
            32 => Self::U32,
            _ => Self::U64,
        }
    }

    /// The narrowest signed integer dtype that holds the unsigned operand.
    /// `U64` has no signed superset and is capped at `I64`.
    fn signed_superset(self) -> Dtype {
        debug_assert!(self.is_unsigned_int());
        match self {
            Self::U8 => Self::I16,
            Self::U16 => Self::I32,
            _ => Self::I64,
        }
    }
}

/// Binary promotion over the dtype lattice. `None` means the pair is not
/// combinable and the caller reports a type mismatch.
///
/// Strings promote only with strings, and only the comparison operators
/// accept them; the caller maps the result to `Bool`.
#[must_use]
pub fn promote(a: Dtype, b: Dtype) -> Option<Dtype> {
    use Dtype::*;

    if a == b {
        // bool ∘ bool arithmetic widens to the narrowest signed integer;
        // bitwise ops keep Bool, handled by the caller before promotion.
        return Some(if a == Bool { I8 } else { a });
    }
    match (a, b) {
        (Str, _) | (_, Str) => None,
        // bool widens to whatever it is operated with
        (Bool, other) | (other, Bool) => Some(other),
        (C128, other) | (other, C128) if other.is_numeric() => Some(C128),
        (C64, other) | (other, C64) if other.is_numeric() => {
            Some(if other.bits() > 32 { C128 } else { C64 })
        }
        (F64, other) | (other, F64) if other.is_integer() || other.is_float() => Some(F64),
        // integer × float takes the float's width, never widening the float
        (F32, other) | (other, F32) if other.is_integer() => Some(F32),
        _ => {
            debug_assert!(a.is_integer() && b.is_integer());
            let bits = a.bits().max(b.bits());
            Some(match (a.is_signed_int(), b.is_signed_int()) {
                (true, true) => Dtype::signed_of_bits(bits),
                (false, false) => Dtype::unsigned_of_bits(bits),
                (true, false) => {
                    Dtype::signed_of_bits(a.bits().max(b.signed_superset().bits()))
                }
                (false, true) => {
                    Dtype::signed_of_bits(b.bits().max(a.signed_superset().bits()))
                }
            })
        }
    }
}

/// Reduction operations recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    Any,
    All,
}

impl ReduceOp {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Prod => "prod",
            Self::Min => "min",
            Self::Max => "max",
            Self::Any => "any",
            Self::All => "all",
        }
    }
}

/// Output dtype of a reduction over `input`.
///
/// Integer sums and products accumulate in 64 bits preserving signedness;
/// float reductions keep their width; min/max are type-preserving.
#[must_use]
pub fn reduce_output(op: ReduceOp, input: Dtype) -> Dtype {
    use Dtype::*;

    match op {
        ReduceOp::Any | ReduceOp::All => Bool,
        ReduceOp::Min | ReduceOp::Max => input,
        ReduceOp::Sum | ReduceOp::Prod => match input {
            Bool => I64,
            d if d.is_signed_int() => I64,
            d if d.is_unsigned_int() => U64,
            other => other,
        },
    }
}

/// Whether a value of `from` can be stored into a buffer of `to`.
///
/// Complex values cannot reach real or integer outputs; strings convert to
/// nothing and from nothing. An unreachable pair is a
/// `TypeUnrepresentable` compile error when the user requests it as the
/// output dtype.
#[must_use]
pub fn castable(from: Dtype, to: Dtype) -> bool {
    use Dtype::*;

    match (from, to) {
        (a, b) if a == b => true,
        (Str, _) | (_, Str) => false,
        (C64 | C128, C64 | C128) => true,
        (C64 | C128, _) => false,
        (_, C64 | C128) => true,
        // any real/bool value has a defined conversion to any real/bool dtype
        _ => true,
    }
}

/// Narrowest signed integer dtype holding `value`. Literals start out weak
/// and widen through [`promote`] against their siblings.
#[must_use]
pub fn narrowest_signed(value: i64) -> Dtype {
    if i64::from(value as i8) == value {
        Dtype::I8
    } else if i64::from(value as i16) == value {
        Dtype::I16
    } else if i64::from(value as i32) == value {
        Dtype::I32
    } else {
        Dtype::I64
    }
}
