use std::fmt;

use num::complex::{Complex32, Complex64};

use crate::dtype::Dtype;

/// A single typed value: a parsed literal, a folded constant, or a
/// reduction result.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    C64(Complex32),
    C128(Complex64),
    Bool(bool),
    /// UCS-4 code points, trailing zeros are padding
    Str(Box<[u32]>),
}

impl Scalar {
    #[must_use]
    pub fn dtype(&self) -> Dtype {
        match self {
            Self::I8(_) => Dtype::I8,
            Self::I16(_) => Dtype::I16,
            Self::I32(_) => Dtype::I32,
            Self::I64(_) => Dtype::I64,
            Self::U8(_) => Dtype::U8,
            Self::U16(_) => Dtype::U16,
            Self::U32(_) => Dtype::U32,
            Self::U64(_) => Dtype::U64,
            Self::F32(_) => Dtype::F32,
            Self::F64(_) => Dtype::F64,
            Self::C64(_) => Dtype::C64,
            Self::C128(_) => Dtype::C128,
            Self::Bool(_) => Dtype::Bool,
            Self::Str(_) => Dtype::Str,
        }
    }

    /// The zero value of `dtype` (empty string for `Str`)
    #[must_use]
    pub fn zero(dtype: Dtype) -> Self {
        match dtype {
            Dtype::I8 => Self::I8(0),
            Dtype::I16 => Self::I16(0),
            Dtype::I32 => Self::I32(0),
            Dtype::I64 => Self::I64(0),
            Dtype::U8 => Self::U8(0),
            Dtype::U16 => Self::U16(0),
            Dtype::U32 => Self::U32(0),
            Dtype::U64 => Self::U64(0),
            Dtype::F32 => Self::F32(0.0),
            Dtype::F64 => Self::F64(0.0),
            Dtype::C64 => Self::C64(Complex32::new(0.0, 0.0)),
            Dtype::C128 => Self::C128(Complex64::new(0.0, 0.0)),
            Dtype::Bool => Self::Bool(false),
            Dtype::Str => Self::Str(Box::new([])),
        }
    }

    /// Widest signed view of an integer/bool value; `None` for everything else
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        Some(match *self {
            Self::I8(v) => i64::from(v),
            Self::I16(v) => i64::from(v),
            Self::I32(v) => i64::from(v),
            Self::I64(v) => v,
            Self::U8(v) => i64::from(v),
            Self::U16(v) => i64::from(v),
            Self::U32(v) => i64::from(v),
            Self::U64(v) => v as i64,
            Self::Bool(v) => i64::from(v),
            _ => return None,
        })
    }

    /// Lossy view as `f64`; complex takes the real part, `None` for strings
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        Some(match *self {
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
            Self::C64(v) => f64::from(v.re),
            Self::C128(v) => v.re,
            Self::U64(v) => v as f64,
            ref other => other.as_i64()? as f64,
        })
    }

    #[must_use]
    pub fn as_c128(&self) -> Option<Complex64> {
        Some(match *self {
            Self::C64(v) => Complex64::new(f64::from(v.re), f64::from(v.im)),
            Self::C128(v) => v,
            ref other => Complex64::new(other.as_f64()?, 0.0),
        })
    }

    /// Truthiness: nonzero for numbers, non-empty for strings
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(v) => *v,
            Self::F32(v) => *v != 0.0,
            Self::F64(v) => *v != 0.0,
            Self::C64(v) => v.re != 0.0 || v.im != 0.0,
            Self::C128(v) => v.re != 0.0 || v.im != 0.0,
            Self::Str(s) => s.iter().any(|&c| c != 0),
            other => other.as_i64() != Some(0),
        }
    }

    /// Value conversion into `to`, with C conversion semantics for the
    /// numeric dtypes (wrap on narrowing, truncate float → int).
    /// `None` when the pair is not castable.
    #[must_use]
    pub fn cast(&self, to: Dtype) -> Option<Scalar> {
        if self.dtype() == to {
            return Some(self.clone());
        }
        if !crate::dtype::castable(self.dtype(), to) {
            return None;
        }
        Some(match to {
            Dtype::C64 => {
                let c = self.as_c128()?;
                Self::C64(Complex32::new(c.re as f32, c.im as f32))
            }
            Dtype::C128 => Self::C128(self.as_c128()?),
            Dtype::F32 => Self::F32(self.as_f64()? as f32),
            Dtype::F64 => Self::F64(self.as_f64()?),
            Dtype::Bool => Self::Bool(self.is_truthy()),
            Dtype::Str => return None,
            _ => {
                // all integer targets go through a widest-lane view
                let wide = match *self {
                    Self::F32(v) => v as i64,
                    Self::F64(v) => v as i64,
                    Self::U64(v) => v as i64,
                    ref other => other.as_i64()?,
                };
                match to {
                    Dtype::I8 => Self::I8(wide as i8),
                    Dtype::I16 => Self::I16(wide as i16),
                    Dtype::I32 => Self::I32(wide as i32),
                    Dtype::I64 => Self::I64(wide),
                    Dtype::U8 => Self::U8(wide as u8),
                    Dtype::U16 => Self::U16(wide as u16),
                    Dtype::U32 => Self::U32(wide as u32),
                    Dtype::U64 => match *self {
                        Self::F64(v) => Self::U64(v as u64),
                        Self::F32(v) => Self::U64(v as u64),
                        _ => Self::U64(wide as u64),
                    },
                    _ => unreachable!(),
                }
            }
        })
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::F64(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::C64(v) => write!(f, "({}+{}j)", v.re, v.im),
            Self::C128(v) => write!(f, "({}+{}j)", v.re, v.im),
            Self::Bool(v) => f.write_str(if *v { "True" } else { "False" }),
            Self::Str(s) => {
                f.write_str("\"")?;
                for &c in s.iter().take_while(|&&c| c != 0) {
                    f.write_str(char::from_u32(c).map(String::from).as_deref().unwrap_or("\u{fffd}"))?;
                }
                f.write_str("\"")
            }
        }
    }
}

/// Decode a UTF-8 source string into fixed-width UCS-4 code points.
#[must_use]
pub fn ucs4_of_str(s: &str) -> Box<[u32]> {
    s.chars().map(u32::from).collect()
}

/// Compare two UCS-4 items ignoring trailing zero padding.
#[must_use]
pub fn ucs4_eq(a: &[u32], b: &[u32]) -> bool {
    let a = trim_padding(a);
    let b = trim_padding(b);
    a == b
}

pub(crate) fn trim_padding(s: &[u32]) -> &[u32] {
    let end = s.iter().rposition(|&c| c != 0).map_or(0, |p| p + 1);
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts() {
        assert_eq!(Scalar::F64(3.9).cast(Dtype::I32), Some(Scalar::I32(3)));
        assert_eq!(Scalar::I64(-1).cast(Dtype::U8), Some(Scalar::U8(255)));
        assert_eq!(Scalar::I32(0).cast(Dtype::Bool), Some(Scalar::Bool(false)));
        assert_eq!(Scalar::C64(Complex32::new(1.0, 2.0)).cast(Dtype::F64), None);
        assert_eq!(
            Scalar::F32(1.5).cast(Dtype::C128),
            Some(Scalar::C128(Complex64::new(1.5, 0.0)))
        );
    }

    #[test]
    fn string_padding() {
        let a = ucs4_of_str("abc");
        let padded = vec![u32::from('a'), u32::from('b'), u32::from('c'), 0, 0];
        assert!(ucs4_eq(&a, &padded));
        assert!(!ucs4_eq(&a, &[u32::from('a'), 0]));
    }
}
