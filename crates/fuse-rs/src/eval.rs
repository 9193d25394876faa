//! Integer evaluation of scalar expressions.
//!
//! An [`EvaluationContext`] binds concrete values to symbolic leaf scalars
//! (typically tensor extents) and resolves derived scalars by walking their
//! origin operations. A value that depends on anything unbound evaluates to
//! `None`; that is "not known yet", never an error.

use std::collections::HashMap;

use log::trace;

use crate::error::{FusionError, FusionResult};
use crate::ir::{ExprKind, Fusion, IterDomainId, ScalarValue, UnaryOp, ValId};

/// Binding table over the scalars of one fusion.
#[derive(Debug)]
pub struct EvaluationContext<'a> {
    fusion: &'a Fusion,
    bindings: HashMap<ValId, i64>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(fusion: &'a Fusion) -> Self {
        Self {
            fusion,
            bindings: HashMap::new(),
        }
    }

    pub fn fusion(&self) -> &'a Fusion {
        self.fusion
    }

    /// Binds a symbolic leaf scalar. Rebinding replaces the previous value.
    pub fn bind(&mut self, val: ValId, value: i64) -> FusionResult<()> {
        let scalar = self.fusion.scalar(val)?;
        if self.fusion.origin(val).is_some() {
            return Err(FusionError::binding(format!(
                "cannot bind {}: it is computed by an operation",
                self.fusion.label(val)
            )));
        }
        if scalar.is_const() {
            return Err(FusionError::binding(format!(
                "cannot bind {}: it is a constant",
                self.fusion.label(val)
            )));
        }
        trace!("bind {} = {value}", self.fusion.label(val));
        self.bindings.insert(val, value);
        Ok(())
    }

    /// Value bound to `val`, without evaluating anything.
    pub fn binding(&self, val: ValId) -> Option<i64> {
        self.bindings.get(&val).copied()
    }

    /// Resolves `val` to an integer, or `None` when it depends on an unbound
    /// scalar, is not a scalar, or the arithmetic is undefined.
    pub fn evaluate(&self, val: ValId) -> Option<i64> {
        let value = self.fusion.val(val).ok()?;
        if let Some(bound) = self.binding(val) {
            return Some(bound);
        }
        if let Some(constant) = value.constant() {
            return match constant {
                ScalarValue::Int(v) => Some(v),
                ScalarValue::Bool(v) => Some(i64::from(v)),
                ScalarValue::Float(v) if v.fract() == 0.0 => Some(v as i64),
                ScalarValue::Float(_) => None,
            };
        }
        if !value.is_scalar() {
            return None;
        }
        let expr = self.fusion.expr(self.fusion.origin(val)?).ok()?;
        match (&expr.kind, expr.inputs.as_slice()) {
            (ExprKind::Unary(UnaryOp::Neg), [input]) => self.evaluate(*input)?.checked_neg(),
            (ExprKind::Unary(UnaryOp::Set | UnaryOp::Cast), [input]) => self.evaluate(*input),
            (ExprKind::Unary(UnaryOp::Abs), [input]) => self.evaluate(*input)?.checked_abs(),
            (ExprKind::Binary(op), [lhs, rhs]) => {
                op.apply_i64(self.evaluate(*lhs)?, self.evaluate(*rhs)?)
            }
            (ExprKind::Ternary(_), [cond, on_true, on_false]) => {
                if self.evaluate(*cond)? != 0 {
                    self.evaluate(*on_true)
                } else {
                    self.evaluate(*on_false)
                }
            }
            _ => None,
        }
    }

    /// Extent of an axis, if it can be resolved.
    pub fn evaluate_extent(&self, id: IterDomainId) -> Option<i64> {
        let axis = self.fusion.iter_domain(id).ok()?;
        self.evaluate(axis.extent)
    }
}
