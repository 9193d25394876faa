//! Node construction: scalars, tensors and the operator builders.
//!
//! Every builder registers what it creates with the fusion it is called on.
//! Elementwise builders accept any mix of scalars and tensors; when at least
//! one operand is a tensor the result is a fresh tensor whose root axes share
//! extents with the first tensor operand's logical axes.

use smallvec::{smallvec, SmallVec};

use crate::error::{FusionError, FusionResult};
use crate::ir::fusion::Fusion;
use crate::ir::node::{
    BinaryOp, DataType, ExprKind, IterDomainId, IterType, ParallelType, Scalar, ScalarValue,
    TensorDomain, TensorView, TernaryOp, UnaryOp, ValId,
};

impl Fusion {
    /// Symbolic scalar.
    pub fn new_scalar(&mut self, dtype: DataType) -> ValId {
        self.push_scalar(Scalar { dtype, value: None })
    }

    pub fn new_float(&mut self, value: f64) -> ValId {
        self.push_scalar(Scalar {
            dtype: DataType::Float,
            value: Some(ScalarValue::Float(value)),
        })
    }

    pub fn new_int(&mut self, value: i64) -> ValId {
        self.push_scalar(Scalar {
            dtype: DataType::Int,
            value: Some(ScalarValue::Int(value)),
        })
    }

    pub fn new_bool(&mut self, value: bool) -> ValId {
        self.push_scalar(Scalar {
            dtype: DataType::Bool,
            value: Some(ScalarValue::Bool(value)),
        })
    }

    pub fn new_iter_domain(
        &mut self,
        start: ValId,
        extent: ValId,
        iter_type: IterType,
        parallel: ParallelType,
    ) -> FusionResult<IterDomainId> {
        for val in [start, extent] {
            if self.scalar(val)?.dtype != DataType::Int {
                return Err(FusionError::invalid_input(format!(
                    "iter domain bounds must be integer scalars, got {}",
                    self.label(val)
                )));
            }
        }
        Ok(self.push_iter_domain(start, extent, iter_type, parallel, false))
    }

    /// Tensor over the given root axes.
    pub fn new_tensor_view(
        &mut self,
        root: Vec<IterDomainId>,
        dtype: DataType,
    ) -> FusionResult<ValId> {
        for id in &root {
            self.iter_domain(*id)?;
        }
        Ok(self.push_tensor(TensorView {
            dtype,
            domain: TensorDomain::new(root),
            compute_at: None,
        }))
    }

    /// Tensor of rank `ndims` whose extents are fresh symbolic integers.
    pub fn new_dims_tensor(&mut self, ndims: usize, dtype: DataType) -> ValId {
        let root = (0..ndims)
            .map(|_| {
                let start = self.new_int(0);
                let extent = self.new_scalar(DataType::Int);
                self.push_iter_domain(start, extent, IterType::Iteration, ParallelType::Serial, false)
            })
            .collect();
        self.push_tensor(TensorView {
            dtype,
            domain: TensorDomain::new(root),
            compute_at: None,
        })
    }

    /// Tensor with constant extents.
    pub fn new_const_tensor(&mut self, extents: &[i64], dtype: DataType) -> ValId {
        let root = extents
            .iter()
            .map(|extent| {
                let start = self.new_int(0);
                let extent = self.new_int(*extent);
                self.push_iter_domain(start, extent, IterType::Iteration, ParallelType::Serial, false)
            })
            .collect();
        self.push_tensor(TensorView {
            dtype,
            domain: TensorDomain::new(root),
            compute_at: None,
        })
    }

    /// Logical axes of a tensor without its reduction axes.
    pub(crate) fn no_reduction_logical(&self, tv: ValId) -> FusionResult<Vec<IterDomainId>> {
        let tv = self.tensor_view(tv)?;
        Ok(tv
            .domain
            .logical()
            .iter()
            .copied()
            .filter(|id| !self.iter_domains[id.index()].is_reduction())
            .collect())
    }

    fn new_output(&mut self, inputs: &[ValId], dtype: DataType) -> FusionResult<ValId> {
        let mut tensors = Vec::new();
        let mut domains = Vec::new();
        for input in inputs {
            if self.val(*input)?.is_tensor() {
                tensors.push(*input);
                domains.push(self.no_reduction_logical(*input)?);
            }
        }
        let Some(first) = domains.first() else {
            return Ok(self.new_scalar(dtype));
        };
        let ndims = first.len();
        if let Some((tv, domain)) = tensors
            .iter()
            .zip(domains.iter())
            .find(|(_, d)| d.len() != ndims)
        {
            return Err(FusionError::invalid_input(format!(
                "operands disagree on rank: {} has {} axes, expected {ndims}",
                self.label(*tv),
                domain.len()
            )));
        }
        let mut root = Vec::with_capacity(ndims);
        for axis in 0..ndims {
            let pick = domains
                .iter()
                .map(|d| d[axis])
                .find(|id| !self.iter_domains[id.index()].is_broadcast())
                .unwrap_or(domains[0][axis]);
            let source = self.iter_domains[pick.index()].clone();
            let iter_type = if source.is_broadcast() {
                IterType::Broadcast
            } else {
                IterType::Iteration
            };
            root.push(self.push_iter_domain(
                source.start,
                source.extent,
                iter_type,
                ParallelType::Serial,
                false,
            ));
        }
        self.new_tensor_view(root, dtype)
    }

    fn dtype_of(&self, val: ValId) -> FusionResult<DataType> {
        Ok(self.val(val)?.dtype())
    }

    pub fn unary_op(&mut self, op: UnaryOp, input: ValId) -> FusionResult<ValId> {
        let dtype = match op {
            UnaryOp::RandLike => DataType::Float,
            _ => self.dtype_of(input)?,
        };
        let out = self.new_output(&[input], dtype)?;
        self.push_expr(ExprKind::Unary(op), smallvec![input], smallvec![out])?;
        Ok(out)
    }

    pub fn cast(&mut self, input: ValId, dtype: DataType) -> FusionResult<ValId> {
        let out = self.new_output(&[input], dtype)?;
        self.push_expr(ExprKind::Unary(UnaryOp::Cast), smallvec![input], smallvec![out])?;
        Ok(out)
    }

    pub fn binary_op(&mut self, op: BinaryOp, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        let dtype = if op.is_logical() {
            DataType::Bool
        } else {
            self.dtype_of(lhs)?.promote(self.dtype_of(rhs)?)
        };
        let out = self.new_output(&[lhs, rhs], dtype)?;
        self.push_expr(ExprKind::Binary(op), smallvec![lhs, rhs], smallvec![out])?;
        Ok(out)
    }

    pub fn ternary_op(
        &mut self,
        op: TernaryOp,
        in1: ValId,
        in2: ValId,
        in3: ValId,
    ) -> FusionResult<ValId> {
        let dtype = match op {
            TernaryOp::Where => self.dtype_of(in2)?.promote(self.dtype_of(in3)?),
        };
        let out = self.new_output(&[in1, in2, in3], dtype)?;
        self.push_expr(
            ExprKind::Ternary(op),
            smallvec![in1, in2, in3],
            smallvec![out],
        )?;
        Ok(out)
    }

    pub fn neg(&mut self, v: ValId) -> FusionResult<ValId> {
        self.unary_op(UnaryOp::Neg, v)
    }

    pub fn abs(&mut self, v: ValId) -> FusionResult<ValId> {
        self.unary_op(UnaryOp::Abs, v)
    }

    pub fn exp(&mut self, v: ValId) -> FusionResult<ValId> {
        self.unary_op(UnaryOp::Exp, v)
    }

    pub fn sqrt(&mut self, v: ValId) -> FusionResult<ValId> {
        self.unary_op(UnaryOp::Sqrt, v)
    }

    pub fn set(&mut self, v: ValId) -> FusionResult<ValId> {
        self.unary_op(UnaryOp::Set, v)
    }

    /// Uniform random values in `[0, 1)` shaped like `v`.
    pub fn rand_like(&mut self, v: ValId) -> FusionResult<ValId> {
        self.unary_op(UnaryOp::RandLike, v)
    }

    pub fn add(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Div, lhs, rhs)
    }

    pub fn modulo(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Mod, lhs, rhs)
    }

    pub fn ceil_div(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::CeilDiv, lhs, rhs)
    }

    pub fn max(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Max, lhs, rhs)
    }

    pub fn min(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Min, lhs, rhs)
    }

    pub fn lt(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Lt, lhs, rhs)
    }

    pub fn eq(&mut self, lhs: ValId, rhs: ValId) -> FusionResult<ValId> {
        self.binary_op(BinaryOp::Eq, lhs, rhs)
    }

    pub fn where_(&mut self, cond: ValId, on_true: ValId, on_false: ValId) -> FusionResult<ValId> {
        self.ternary_op(TernaryOp::Where, cond, on_true, on_false)
    }

    /// Reduces `input` over `axes` (negative indices count from the back)
    /// with `op`, seeding every output element with the constant `init`.
    pub fn reduction_op(
        &mut self,
        op: BinaryOp,
        axes: &[i64],
        init: ValId,
        input: ValId,
    ) -> FusionResult<ValId> {
        if self.scalar(init)?.is_symbolic() {
            return Err(FusionError::invalid_input(format!(
                "reduction init {} must be a constant",
                self.label(init)
            )));
        }
        let domain = self.no_reduction_logical(input)?;
        let ndims = domain.len() as i64;
        if axes.is_empty() {
            return Err(FusionError::invalid_input("reduction needs at least one axis"));
        }
        let mut reduced = vec![false; domain.len()];
        for &axis in axes {
            let resolved = if axis < 0 { axis + ndims } else { axis };
            if resolved < 0 || resolved >= ndims {
                return Err(FusionError::invalid_input(format!(
                    "reduction axis {axis} out of range for {} with {ndims} axes",
                    self.label(input)
                )));
            }
            if std::mem::replace(&mut reduced[resolved as usize], true) {
                return Err(FusionError::invalid_input(format!(
                    "reduction axis {axis} listed twice"
                )));
            }
        }
        let mut root = Vec::with_capacity(domain.len());
        for (id, is_reduced) in domain.iter().zip(reduced) {
            let source = self.iter_domains[id.index()].clone();
            let iter_type = match (is_reduced, source.iter_type) {
                (true, IterType::Broadcast) => {
                    return Err(FusionError::invalid_input(format!(
                        "cannot reduce broadcast axis of {}",
                        self.label(input)
                    )))
                }
                (true, _) => IterType::Reduction,
                (false, kind) => kind,
            };
            root.push(self.push_iter_domain(
                source.start,
                source.extent,
                iter_type,
                ParallelType::Serial,
                false,
            ));
        }
        let dtype = self.dtype_of(input)?;
        let out = self.new_tensor_view(root, dtype)?;
        self.push_expr(
            ExprKind::Reduction { op, init },
            smallvec![input],
            smallvec![out],
        )?;
        Ok(out)
    }

    pub fn sum(&mut self, input: ValId, axes: &[i64]) -> FusionResult<ValId> {
        let init = match self.dtype_of(input)? {
            DataType::Float => self.new_float(0.0),
            DataType::Int => self.new_int(0),
            DataType::Bool => self.new_bool(false),
        };
        self.reduction_op(BinaryOp::Add, axes, init, input)
    }

    /// Inserts size-one axes at the positions flagged in `is_broadcast_dim`.
    pub fn broadcast(&mut self, input: ValId, is_broadcast_dim: &[bool]) -> FusionResult<ValId> {
        let domain = self.no_reduction_logical(input)?;
        let kept = is_broadcast_dim.iter().filter(|b| !**b).count();
        if kept != domain.len() {
            return Err(FusionError::invalid_input(format!(
                "broadcast of {} keeps {kept} axes but the tensor has {}",
                self.label(input),
                domain.len()
            )));
        }
        let mut source_axes = domain.into_iter();
        let mut root: Vec<IterDomainId> = Vec::with_capacity(is_broadcast_dim.len());
        for &is_broadcast in is_broadcast_dim {
            let id = if is_broadcast {
                let start = self.new_int(0);
                let extent = self.new_int(1);
                self.push_iter_domain(start, extent, IterType::Broadcast, ParallelType::Serial, false)
            } else {
                let source = source_axes
                    .next()
                    .map(|id| self.iter_domains[id.index()].clone())
                    .ok_or_else(|| FusionError::invalid_input("broadcast mask is too long"))?;
                self.push_iter_domain(
                    source.start,
                    source.extent,
                    source.iter_type,
                    ParallelType::Serial,
                    false,
                )
            };
            root.push(id);
        }
        let dtype = self.dtype_of(input)?;
        let out = self.new_tensor_view(root, dtype)?;
        let inputs: SmallVec<[ValId; 3]> = smallvec![input];
        self.push_expr(
            ExprKind::Broadcast {
                is_broadcast_dim: is_broadcast_dim.to_vec(),
            },
            inputs,
            smallvec![out],
        )?;
        Ok(out)
    }
}
