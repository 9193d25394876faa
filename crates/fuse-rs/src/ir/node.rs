//! Node model of the fusion IR.
//!
//! Nodes live in the arenas of their owning [`Fusion`](super::Fusion) and are
//! addressed through copyable handles. Every handle records the id of the
//! fusion that created it, so handing a node of one fusion to another is caught
//! on first use instead of silently aliasing an unrelated slot.
//!
//! ## Layout
//!
//! ```text
//! Value ── Scalar { dtype, constant? }
//!       └─ TensorView { dtype, TensorDomain, compute_at? }
//!                          │
//!                          ├── root    [IterDomainId]   axes as declared
//!                          ├── rfactor [IterDomainId]?  logical axes after rFactor
//!                          ├── leaf    [IterDomainId]   axes after scheduling
//!                          └── history [Transform]      root -> leaf splits/merges
//! Expr ── { kind, inputs: [ValId], outputs: [ValId] }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

/// Identity of a [`Fusion`](super::Fusion) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FusionId(pub(crate) u64);

macro_rules! arena_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name {
            pub(crate) fusion: FusionId,
            pub(crate) index: u32,
        }

        impl $name {
            pub(crate) fn new(fusion: FusionId, index: usize) -> Self {
                Self {
                    fusion,
                    index: index as u32,
                }
            }

            /// Fusion that allocated this handle.
            pub fn fusion(&self) -> FusionId {
                self.fusion
            }

            /// Arena slot of the node.
            pub fn index(&self) -> usize {
                self.index as usize
            }
        }
    };
}

arena_handle!(
    /// Handle to a scalar or tensor value.
    ValId
);
arena_handle!(
    /// Handle to an operation.
    ExprId
);
arena_handle!(
    /// Handle to an axis descriptor.
    IterDomainId
);

/// Either side of the value/operation split, used by traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statement {
    Val(ValId),
    Expr(ExprId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    Float,
}

impl DataType {
    /// Result type of combining two operands in arithmetic.
    pub fn promote(self, other: DataType) -> DataType {
        match (self, other) {
            (DataType::Float, _) | (_, DataType::Float) => DataType::Float,
            (DataType::Int, _) | (_, DataType::Int) => DataType::Int,
            _ => DataType::Bool,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int => write!(f, "int64_t"),
            DataType::Float => write!(f, "float"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ScalarValue {
    pub fn dtype(&self) -> DataType {
        match self {
            ScalarValue::Bool(_) => DataType::Bool,
            ScalarValue::Int(_) => DataType::Int,
            ScalarValue::Float(_) => DataType::Float,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::Bool(v) => f64::from(u8::from(v)),
            ScalarValue::Int(v) => v as f64,
            ScalarValue::Float(v) => v,
        }
    }
}

/// Scalar value: symbolic when `value` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    pub dtype: DataType,
    pub value: Option<ScalarValue>,
}

impl Scalar {
    pub fn is_symbolic(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_const(&self) -> bool {
        self.value.is_some()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Some(ScalarValue::Int(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IterType {
    Iteration,
    Reduction,
    Broadcast,
}

/// Execution binding of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParallelType {
    BIDz,
    BIDy,
    BIDx,
    TIDz,
    TIDy,
    TIDx,
    Vectorize,
    Unroll,
    Serial,
}

impl ParallelType {
    pub const THREADS: [ParallelType; 3] =
        [ParallelType::TIDx, ParallelType::TIDy, ParallelType::TIDz];
    pub const BLOCKS: [ParallelType; 3] =
        [ParallelType::BIDx, ParallelType::BIDy, ParallelType::BIDz];

    pub fn is_thread(self) -> bool {
        matches!(
            self,
            ParallelType::TIDx | ParallelType::TIDy | ParallelType::TIDz
        )
    }

    pub fn is_block(self) -> bool {
        matches!(
            self,
            ParallelType::BIDx | ParallelType::BIDy | ParallelType::BIDz
        )
    }

    pub fn is_thread_or_block(self) -> bool {
        self.is_thread() || self.is_block()
    }

    /// Component slot (x = 0, y = 1, z = 2) of a thread or block binding.
    pub fn dim_slot(self) -> Option<usize> {
        match self {
            ParallelType::TIDx | ParallelType::BIDx => Some(0),
            ParallelType::TIDy | ParallelType::BIDy => Some(1),
            ParallelType::TIDz | ParallelType::BIDz => Some(2),
            _ => None,
        }
    }

    /// Kernel-side index variable (`threadIdx.x`, `blockIdx.y`, ...).
    pub fn index_name(self) -> Option<&'static str> {
        Some(match self {
            ParallelType::BIDx => "blockIdx.x",
            ParallelType::BIDy => "blockIdx.y",
            ParallelType::BIDz => "blockIdx.z",
            ParallelType::TIDx => "threadIdx.x",
            ParallelType::TIDy => "threadIdx.y",
            ParallelType::TIDz => "threadIdx.z",
            _ => return None,
        })
    }

    /// Kernel-side dimension variable (`blockDim.x`, `gridDim.y`, ...).
    pub fn dim_name(self) -> Option<&'static str> {
        Some(match self {
            ParallelType::BIDx => "gridDim.x",
            ParallelType::BIDy => "gridDim.y",
            ParallelType::BIDz => "gridDim.z",
            ParallelType::TIDx => "blockDim.x",
            ParallelType::TIDy => "blockDim.y",
            ParallelType::TIDz => "blockDim.z",
            _ => return None,
        })
    }
}

impl fmt::Display for ParallelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParallelType::Serial => write!(f, "S"),
            ParallelType::Unroll => write!(f, "U"),
            ParallelType::Vectorize => write!(f, "V"),
            other => match other.index_name() {
                Some(name) => write!(f, "{name}"),
                None => Ok(()),
            },
        }
    }
}

/// One axis of a tensor: `[start, start + extent)` with a kind and a binding.
#[derive(Debug, Clone, PartialEq)]
pub struct IterDomain {
    pub name: usize,
    pub start: ValId,
    pub extent: ValId,
    pub iter_type: IterType,
    pub parallel: ParallelType,
    /// Axis kept as iteration by a reduction factorisation.
    pub rfactor_product: bool,
}

impl IterDomain {
    pub fn is_reduction(&self) -> bool {
        self.iter_type == IterType::Reduction
    }

    pub fn is_broadcast(&self) -> bool {
        self.iter_type == IterType::Broadcast
    }

    pub fn is_thread_or_block(&self) -> bool {
        self.parallel.is_thread_or_block()
    }
}

/// A recorded step from one set of axes to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Split {
        input: IterDomainId,
        outer: IterDomainId,
        inner: IterDomainId,
        factor: ValId,
    },
    Merge {
        outer: IterDomainId,
        inner: IterDomainId,
        output: IterDomainId,
    },
}

impl Transform {
    pub fn inputs(&self) -> SmallVec<[IterDomainId; 2]> {
        match *self {
            Transform::Split { input, .. } => smallvec![input],
            Transform::Merge { outer, inner, .. } => smallvec![outer, inner],
        }
    }

    pub fn outputs(&self) -> SmallVec<[IterDomainId; 2]> {
        match *self {
            Transform::Split { outer, inner, .. } => smallvec![outer, inner],
            Transform::Merge { output, .. } => smallvec![output],
        }
    }
}

/// Axes of a tensor together with the transforms that derived them.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDomain {
    pub root: Vec<IterDomainId>,
    pub rfactor: Option<Vec<IterDomainId>>,
    pub leaf: Vec<IterDomainId>,
    pub history: Vec<Transform>,
}

impl TensorDomain {
    pub fn new(root: Vec<IterDomainId>) -> Self {
        Self {
            leaf: root.clone(),
            root,
            rfactor: None,
            history: Vec::new(),
        }
    }

    /// Axes seen by consumers: the rfactor domain when present, else the root.
    pub fn logical(&self) -> &[IterDomainId] {
        self.rfactor.as_deref().unwrap_or(&self.root)
    }

    pub fn n_dims(&self) -> usize {
        self.leaf.len()
    }
}

/// Outgoing compute-at link of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeAt {
    /// Tensor whose loop nest hosts this one.
    pub view: ValId,
    /// Number of `view` loops enclosing this tensor's computation.
    pub axis: usize,
    /// Number of leading leaf axes of this tensor that reuse `view` loops.
    pub this_axis: usize,
    /// For each of the first `this_axis` leaf axes, the position in the loop
    /// nest of `view` that iterates it. Always smaller than `axis`.
    pub positions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorView {
    pub dtype: DataType,
    pub domain: TensorDomain,
    pub compute_at: Option<ComputeAt>,
}

impl TensorView {
    pub fn n_dims(&self) -> usize {
        self.domain.n_dims()
    }

    /// Leaf axis at `index`; negative indices count from the back.
    pub fn axis(&self, index: i64) -> Option<IterDomainId> {
        let ndims = self.n_dims() as i64;
        let resolved = if index < 0 { index + ndims } else { index };
        usize::try_from(resolved)
            .ok()
            .and_then(|i| self.domain.leaf.get(i).copied())
    }

    pub fn compute_at_view(&self) -> Option<ValId> {
        self.compute_at.as_ref().map(|ca| ca.view)
    }

    pub fn compute_at_axis(&self) -> Option<usize> {
        self.compute_at.as_ref().map(|ca| ca.axis)
    }

    pub fn this_compute_at_axis(&self) -> usize {
        self.compute_at.as_ref().map_or(0, |ca| ca.this_axis)
    }

    pub fn has_rfactor(&self) -> bool {
        self.domain.rfactor.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Scalar(Scalar),
    Tensor(TensorView),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub name: usize,
    pub kind: ValueKind,
}

impl Value {
    pub fn dtype(&self) -> DataType {
        match &self.kind {
            ValueKind::Scalar(s) => s.dtype,
            ValueKind::Tensor(tv) => tv.dtype,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ValueKind::Scalar(_))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.kind, ValueKind::Tensor(_))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match &self.kind {
            ValueKind::Scalar(s) => Some(s),
            ValueKind::Tensor(_) => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorView> {
        match &self.kind {
            ValueKind::Tensor(tv) => Some(tv),
            ValueKind::Scalar(_) => None,
        }
    }

    pub fn as_tensor_mut(&mut self) -> Option<&mut TensorView> {
        match &mut self.kind {
            ValueKind::Tensor(tv) => Some(tv),
            ValueKind::Scalar(_) => None,
        }
    }

    pub fn constant(&self) -> Option<ScalarValue> {
        self.as_scalar().and_then(|s| s.value)
    }

    /// Printed handle: `T3` for tensors, `f5`/`i7`/`b2` for scalars.
    pub fn label(&self) -> String {
        match &self.kind {
            ValueKind::Tensor(_) => format!("T{}", self.name),
            ValueKind::Scalar(s) => match s.dtype {
                DataType::Float => format!("f{}", self.name),
                DataType::Int => format!("i{}", self.name),
                DataType::Bool => format!("b{}", self.name),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Sqrt,
    Cast,
    RandLike,
    Set,
}

impl UnaryOp {
    pub fn inline_str(self) -> Option<&'static str> {
        match self {
            UnaryOp::Neg => Some("-"),
            UnaryOp::Set => Some(""),
            _ => None,
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "fabs",
            UnaryOp::Exp => "expf",
            UnaryOp::Sqrt => "sqrtf",
            UnaryOp::Cast => "cast",
            UnaryOp::RandLike => "randLike",
            UnaryOp::Set => "set",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    CeilDiv,
    Max,
    Min,
    Lt,
    Eq,
}

impl BinaryOp {
    pub fn inline_str(self) -> Option<&'static str> {
        match self {
            BinaryOp::Add => Some("+"),
            BinaryOp::Sub => Some("-"),
            BinaryOp::Mul => Some("*"),
            BinaryOp::Div => Some("/"),
            BinaryOp::Mod => Some("%"),
            BinaryOp::Lt => Some("<"),
            BinaryOp::Eq => Some("=="),
            _ => None,
        }
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Eq)
    }

    /// Applies the operator to floating point operands.
    pub fn apply_f64(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Mod => lhs % rhs,
            BinaryOp::CeilDiv => (lhs / rhs).ceil(),
            BinaryOp::Max => lhs.max(rhs),
            BinaryOp::Min => lhs.min(rhs),
            BinaryOp::Lt => f64::from(u8::from(lhs < rhs)),
            BinaryOp::Eq => f64::from(u8::from(lhs == rhs)),
        }
    }

    /// Applies the operator to integers; `None` on division by zero or overflow.
    pub fn apply_i64(self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            BinaryOp::Add => lhs.checked_add(rhs),
            BinaryOp::Sub => lhs.checked_sub(rhs),
            BinaryOp::Mul => lhs.checked_mul(rhs),
            BinaryOp::Div => lhs.checked_div(rhs),
            BinaryOp::Mod => lhs.checked_rem(rhs),
            BinaryOp::CeilDiv => {
                if rhs == 0 {
                    None
                } else {
                    lhs.checked_add(rhs - 1)?.checked_div(rhs)
                }
            }
            BinaryOp::Max => Some(lhs.max(rhs)),
            BinaryOp::Min => Some(lhs.min(rhs)),
            BinaryOp::Lt => Some(i64::from(lhs < rhs)),
            BinaryOp::Eq => Some(i64::from(lhs == rhs)),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::CeilDiv => "ceilDiv",
            BinaryOp::Max => "fmax",
            BinaryOp::Min => "fmin",
            BinaryOp::Lt => "lessThan",
            BinaryOp::Eq => "equal",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOp {
    Where,
}

impl fmt::Display for TernaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TernaryOp::Where => write!(f, "where"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    /// Folds the reduction axes of the output with `op`, starting from `init`.
    Reduction { op: BinaryOp, init: ValId },
    /// Inserts size-one axes where `is_broadcast_dim` is set.
    Broadcast { is_broadcast_dim: Vec<bool> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub name: usize,
    pub kind: ExprKind,
    pub inputs: SmallVec<[ValId; 3]>,
    pub outputs: SmallVec<[ValId; 1]>,
}

impl Expr {
    pub fn output(&self) -> Option<ValId> {
        match self.outputs.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self.kind, ExprKind::Reduction { .. })
    }
}
