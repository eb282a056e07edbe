use smallvec::SmallVec;

use crate::builtins::BuiltinId;
use crate::dtype::{Dtype, ReduceOp};
use crate::scalar::Scalar;

/// Index of a node inside its [`ExprTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x` / `~x`: logical not on bool, bitwise not on integers
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Pow => "**",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Binding power for the printer; mirrors the parser's precedence table.
    #[must_use]
    pub(crate) fn precedence(self) -> u8 {
        match self {
            Self::BitOr => 1,
            Self::BitXor => 2,
            Self::BitAnd => 3,
            Self::Eq | Self::Ne => 4,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 5,
            Self::Shl | Self::Shr => 6,
            Self::Add | Self::Sub => 7,
            Self::Mul | Self::Div | Self::Rem => 8,
            Self::Pow => 10,
        }
    }
}

/// Reserved read-only identifiers available to N-D kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexVar {
    /// `_i{d}`: block-local index along dimension `d`
    Dim(u8),
    /// `_n{d}`: global shape along dimension `d`
    ShapeDim(u8),
    /// `_ndim`: rank
    Ndim,
    /// `_flat_idx` / `_global_linear_idx`: row-major global linear index
    FlatIdx,
}

/// Children of a call node; builtin arity is capped at 7.
pub type Args = SmallVec<[NodeId; 4]>;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Const(Scalar),
    /// Reference to a compile-time binding slot
    Var(u32),
    /// DSL local, slot into the kernel frame
    Local(u32),
    Index(IndexVar),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    Call(BuiltinId, Args),
    /// User function or closure bound to a variable slot
    UserCall(u32, Args),
    Reduce(ReduceOp, NodeId),
    /// Lane select `where(cond, then, else)`
    Where(NodeId, NodeId, NodeId),
    Cast(Dtype, NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    /// Result dtype, filled in by inference
    pub dtype: Dtype,
    /// Promoted dtype the children are evaluated in
    pub input_dtype: Dtype,
    /// Weak literal: the dtype may still adapt to a sibling's width
    pub weak: bool,
    /// Source offset for diagnostics
    pub offset: usize,
}

impl Node {
    #[must_use]
    pub(crate) fn new(kind: NodeKind, offset: usize) -> Self {
        Self {
            kind,
            dtype: Dtype::F64,
            input_dtype: Dtype::F64,
            weak: false,
            offset,
        }
    }
}

/// Arena of expression nodes. Sharing is explicit through [`NodeId`] and
/// dropping the tree frees every node at once.
#[derive(Debug, Clone, Default)]
pub struct ExprTree {
    nodes: Vec<Node>,
}

impl ExprTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn children(&self, id: NodeId) -> Args {
        match &self.node(id).kind {
            NodeKind::Const(_) | NodeKind::Var(_) | NodeKind::Local(_) | NodeKind::Index(_) => {
                Args::new()
            }
            NodeKind::Unary(_, a) | NodeKind::Reduce(_, a) | NodeKind::Cast(_, a) => {
                let mut v = Args::new();
                v.push(*a);
                v
            }
            NodeKind::Binary(_, a, b) => {
                let mut v = Args::new();
                v.push(*a);
                v.push(*b);
                v
            }
            NodeKind::Where(c, t, e) => {
                let mut v = Args::new();
                v.push(*c);
                v.push(*t);
                v.push(*e);
                v
            }
            NodeKind::Call(_, args) | NodeKind::UserCall(_, args) => args.clone(),
        }
    }

    /// Post-order traversal from `root`; the returned schedule drives the
    /// block interpreter without recursion.
    #[must_use]
    pub(crate) fn postorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        // (node, children already expanded)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id, true));
            let children = self.children(id);
            for &child in children.iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Structural equivalence modulo node identity: same operators, same
    /// constants, same dtypes.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn equivalent(&self, a: NodeId, other: &ExprTree, b: NodeId) -> bool {
        let (na, nb) = (self.node(a), other.node(b));
        if na.dtype != nb.dtype {
            return false;
        }
        match (&na.kind, &nb.kind) {
            (NodeKind::Const(x), NodeKind::Const(y)) => x == y,
            (NodeKind::Var(x), NodeKind::Var(y)) => x == y,
            (NodeKind::Local(x), NodeKind::Local(y)) => x == y,
            (NodeKind::Index(x), NodeKind::Index(y)) => x == y,
            (NodeKind::Unary(op, x), NodeKind::Unary(oq, y)) => {
                op == oq && self.equivalent(*x, other, *y)
            }
            (NodeKind::Binary(op, x1, x2), NodeKind::Binary(oq, y1, y2)) => {
                op == oq && self.equivalent(*x1, other, *y1) && self.equivalent(*x2, other, *y2)
            }
            (NodeKind::Reduce(op, x), NodeKind::Reduce(oq, y)) => {
                op == oq && self.equivalent(*x, other, *y)
            }
            (NodeKind::Cast(dt, x), NodeKind::Cast(du, y)) => {
                dt == du && self.equivalent(*x, other, *y)
            }
            (NodeKind::Where(c1, t1, e1), NodeKind::Where(c2, t2, e2)) => {
                self.equivalent(*c1, other, *c2)
                    && self.equivalent(*t1, other, *t2)
                    && self.equivalent(*e1, other, *e2)
            }
            (NodeKind::Call(fx, xs), NodeKind::Call(fy, ys)) => {
                fx == fy
                    && xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys.iter())
                        .all(|(&x, &y)| self.equivalent(x, other, y))
            }
            (NodeKind::UserCall(fx, xs), NodeKind::UserCall(fy, ys)) => {
                fx == fy
                    && xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys.iter())
                        .all(|(&x, &y)| self.equivalent(x, other, y))
            }
            _ => false,
        }
    }
}
