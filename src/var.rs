use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::dtype::Dtype;

bitflags! {
    /// Role flags of a variable descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarFlags: u32 {
        /// The binding is callable rather than data
        const FUNCTION = 1;
        /// Callable with captured context
        const CLOSURE = 1 << 1;
        /// The optimizer must not fold across calls to this binding
        const IMPURE = 1 << 2;
    }
}

/// A user-registered scalar function. Arguments arrive promoted to `f64`,
/// one value per lane.
pub type UserFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Compile-time description of one name visible to the expression: a data
/// variable, or a user function/closure of stated arity.
#[derive(Clone)]
pub struct VarDecl {
    pub name: String,
    /// `None` requests inference and currently resolves to `f64`
    pub dtype: Option<Dtype>,
    /// Item size in bytes; required (multiple of 4) for string variables
    pub itemsize: usize,
    pub flags: VarFlags,
    pub arity: u8,
    pub func: Option<UserFn>,
}

impl fmt::Debug for VarDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarDecl")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("itemsize", &self.itemsize)
            .field("flags", &self.flags)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl VarDecl {
    /// Data variable of the given dtype.
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            dtype: Some(dtype),
            itemsize: dtype.size_of(),
            flags: VarFlags::empty(),
            arity: 0,
            func: None,
        }
    }

    /// String variable; `itemsize` is the fixed item width in bytes and must
    /// be a non-zero multiple of 4.
    #[must_use]
    pub fn string(name: impl Into<String>, itemsize: usize) -> Self {
        Self {
            name: name.into(),
            dtype: Some(Dtype::Str),
            itemsize,
            flags: VarFlags::empty(),
            arity: 0,
            func: None,
        }
    }

    /// Pure scalar function of `arity` arguments.
    #[must_use]
    pub fn function(name: impl Into<String>, arity: u8, func: UserFn) -> Self {
        Self {
            name: name.into(),
            dtype: Some(Dtype::F64),
            itemsize: Dtype::F64.size_of(),
            flags: VarFlags::FUNCTION,
            arity,
            func: Some(func),
        }
    }

    /// Closure: a function that captures context.
    #[must_use]
    pub fn closure(name: impl Into<String>, arity: u8, func: UserFn) -> Self {
        let mut decl = Self::function(name, arity, func);
        decl.flags |= VarFlags::CLOSURE;
        decl
    }

    /// Marks the callable as impure, blocking constant folding across it.
    #[must_use]
    pub fn impure(mut self) -> Self {
        self.flags |= VarFlags::IMPURE;
        self
    }
}

/// Resolved binding held by a compiled expression.
#[derive(Clone)]
pub(crate) struct Binding {
    pub name: String,
    pub dtype: Dtype,
    pub itemsize: usize,
    pub flags: VarFlags,
    pub arity: u8,
    pub func: Option<UserFn>,
}

impl Binding {
    pub(crate) fn from_decl(decl: &VarDecl) -> Self {
        Self {
            name: decl.name.clone(),
            dtype: decl.dtype.unwrap_or(Dtype::F64),
            itemsize: decl.itemsize,
            flags: decl.flags,
            arity: decl.arity,
            func: decl.func.clone(),
        }
    }

    pub(crate) fn is_function(&self) -> bool {
        self.flags.intersects(VarFlags::FUNCTION | VarFlags::CLOSURE)
    }

    pub(crate) fn is_pure(&self) -> bool {
        !self.flags.contains(VarFlags::IMPURE)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
