//! Lowered kernel IR.
//!
//! The tree is self-contained: it refers to kernel parameters by position
//! and to fusion tensors only by their printed number, so it can be printed
//! or interpreted without the fusion it came from.

use serde::{Deserialize, Serialize};

use crate::ir::{BinaryOp, DataType, ParallelType, TernaryOp, UnaryOp};

/// Where a tensor element lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Kernel parameter at the given argument position.
    Global { arg: usize },
    /// Per-thread buffer declared by an [`Stmt::Allocate`].
    Local,
}

/// One element of tensor `T<name>`; the flat offset is the sum of `terms`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    pub name: usize,
    pub storage: Storage,
    pub terms: Vec<KExpr>,
}

/// Scalar expression evaluated per thread.
#[derive(Debug, Clone, PartialEq)]
pub enum KExpr {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Loop index variable `i<n>`.
    Index(usize),
    /// `threadIdx.x`, `blockIdx.y`, ...
    ParallelIndex(ParallelType),
    /// `blockDim.x`, `gridDim.y`, ...
    ParallelDim(ParallelType),
    /// `T<name>.size[dim]` of the tensor argument at `arg`.
    Size { arg: usize, name: usize, dim: usize },
    /// `T<name>.stride[dim]` of the tensor argument at `arg`.
    Stride { arg: usize, name: usize, dim: usize },
    /// Scalar kernel argument.
    ScalarArg { arg: usize, label: String },
    Unary(UnaryOp, DataType, Box<KExpr>),
    Binary(BinaryOp, Box<KExpr>, Box<KExpr>),
    Ternary(TernaryOp, Box<KExpr>, Box<KExpr>, Box<KExpr>),
    /// Conjunction of boolean terms.
    All(Vec<KExpr>),
    Load(TensorRef),
    /// Next uniform sample of the kernel's random stream.
    Rand,
}

impl KExpr {
    pub fn binary(op: BinaryOp, lhs: KExpr, rhs: KExpr) -> KExpr {
        KExpr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn add(lhs: KExpr, rhs: KExpr) -> KExpr {
        match (lhs, rhs) {
            (KExpr::Int(0), other) | (other, KExpr::Int(0)) => other,
            (lhs, rhs) => KExpr::binary(BinaryOp::Add, lhs, rhs),
        }
    }

    pub fn mul(lhs: KExpr, rhs: KExpr) -> KExpr {
        match (lhs, rhs) {
            (KExpr::Int(0), _) | (_, KExpr::Int(0)) => KExpr::Int(0),
            (KExpr::Int(1), other) | (other, KExpr::Int(1)) => other,
            (lhs, rhs) => KExpr::binary(BinaryOp::Mul, lhs, rhs),
        }
    }

    pub fn div(lhs: KExpr, rhs: KExpr) -> KExpr {
        match (lhs, rhs) {
            (KExpr::Int(0), _) => KExpr::Int(0),
            (other, KExpr::Int(1)) => other,
            (lhs, rhs) => KExpr::binary(BinaryOp::Div, lhs, rhs),
        }
    }

    pub fn rem(lhs: KExpr, rhs: KExpr) -> KExpr {
        match (lhs, rhs) {
            (KExpr::Int(0), _) | (_, KExpr::Int(1)) => KExpr::Int(0),
            (lhs, rhs) => KExpr::binary(BinaryOp::Mod, lhs, rhs),
        }
    }
}

/// Target of a lowered reduction step.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceTarget {
    Tensor(TensorRef),
    /// The `block_result` temporary shared by a block and a grid reduction.
    BlockResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Tensor(usize),
    BlockResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Serial loop `for(index = start; index < extent; ++index)`.
    ForLoop {
        index: usize,
        start: KExpr,
        extent: KExpr,
        unroll: bool,
        body: Vec<Stmt>,
    },
    IfThenElse {
        cond: KExpr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    /// Per-thread buffer of `size` elements filled with `init` when given.
    Allocate {
        buffer: Buffer,
        dtype: DataType,
        size: KExpr,
        init: Option<KExpr>,
    },
    Assign {
        target: TensorRef,
        value: KExpr,
    },
    /// Folds `input` across the flagged thread dimensions of each block and
    /// combines the result into `target`. Threads whose `pred` is false do
    /// not contribute and do not write tensor targets.
    BlockReduce {
        op: BinaryOp,
        dtype: DataType,
        threads: [bool; 3],
        target: ReduceTarget,
        input: KExpr,
        pred: Option<KExpr>,
    },
    /// Folds across the flagged block dimensions. `threads` marks the
    /// thread dimensions that keep separate results; the others were already
    /// folded by a block reduction into `block_result` (`input == None`).
    GridReduce {
        op: BinaryOp,
        dtype: DataType,
        blocks: [bool; 3],
        threads: [bool; 3],
        target: TensorRef,
        input: Option<KExpr>,
        pred: Option<KExpr>,
    },
}

impl Stmt {
    /// Statements nested directly inside this one.
    pub fn children(&self) -> impl Iterator<Item = &Stmt> {
        let (first, second): (&[Stmt], &[Stmt]) = match self {
            Stmt::ForLoop { body, .. } => (body, &[]),
            Stmt::IfThenElse {
                then_body,
                else_body,
                ..
            } => (then_body, else_body),
            _ => (&[], &[]),
        };
        first.iter().chain(second.iter())
    }
}

/// Counts statements of a tree matching `pred`, nested ones included.
pub fn count_stmts(stmts: &[Stmt], pred: &dyn Fn(&Stmt) -> bool) -> usize {
    stmts
        .iter()
        .map(|s| {
            let nested: Vec<Stmt> = s.children().cloned().collect();
            usize::from(pred(s)) + count_stmts(&nested, pred)
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Tensor { dtype: DataType, ndims: usize },
    Scalar { dtype: DataType },
}

/// One kernel argument slot, in declaration order (inputs, then outputs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParam {
    pub label: String,
    pub kind: ParamKind,
    pub is_output: bool,
}

/// A lowered fusion, ready to print or interpret.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub params: Vec<KernelParam>,
    /// Distinct `(op, dtype)` pairs needing a reduction helper.
    pub reduction_ops: Vec<(BinaryOp, DataType)>,
    pub has_rng: bool,
    pub has_block_reduction: bool,
    pub has_grid_reduction: bool,
    pub body: Vec<Stmt>,
}

impl Kernel {
    pub fn count_loops(&self) -> usize {
        count_stmts(&self.body, &|s| matches!(s, Stmt::ForLoop { .. }))
    }

    pub fn count_predicates(&self) -> usize {
        count_stmts(&self.body, &|s| matches!(s, Stmt::IfThenElse { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_helpers_fold_identities() {
        assert_eq!(KExpr::add(KExpr::Int(0), KExpr::Index(3)), KExpr::Index(3));
        assert_eq!(KExpr::mul(KExpr::Index(3), KExpr::Int(1)), KExpr::Index(3));
        assert_eq!(KExpr::mul(KExpr::Index(3), KExpr::Int(0)), KExpr::Int(0));
        assert_eq!(KExpr::rem(KExpr::Index(3), KExpr::Int(1)), KExpr::Int(0));
        assert_eq!(KExpr::div(KExpr::Index(3), KExpr::Int(1)), KExpr::Index(3));
    }

    #[test]
    fn counting_descends_into_nested_bodies() {
        let inner = Stmt::ForLoop {
            index: 1,
            start: KExpr::Int(0),
            extent: KExpr::Int(4),
            unroll: false,
            body: Vec::new(),
        };
        let guarded = Stmt::IfThenElse {
            cond: KExpr::Bool(true),
            then_body: vec![inner],
            else_body: Vec::new(),
        };
        let outer = Stmt::ForLoop {
            index: 0,
            start: KExpr::Int(0),
            extent: KExpr::Int(2),
            unroll: false,
            body: vec![guarded],
        };
        let body = vec![outer];
        assert_eq!(count_stmts(&body, &|s| matches!(s, Stmt::ForLoop { .. })), 2);
        assert_eq!(count_stmts(&body, &|s| matches!(s, Stmt::IfThenElse { .. })), 1);
    }
}
