//! Fusion IR: node model, container, construction and the active-fusion
//! context.

mod arith;
mod cloner;
pub mod context;
mod equality;
mod fusion;
mod node;

pub use cloner::CloneMap;
pub use context::{with_active_fusion, FusionGuard, SharedFusion};
pub use fusion::Fusion;
pub use node::{
    BinaryOp, ComputeAt, DataType, Expr, ExprId, ExprKind, FusionId, IterDomain, IterDomainId,
    IterType, ParallelType, Scalar, ScalarValue, Statement, TensorDomain, TensorView, TernaryOp,
    Transform, UnaryOp, ValId, Value, ValueKind,
};
