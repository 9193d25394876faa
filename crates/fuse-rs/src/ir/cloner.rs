//! Deep structural copies of a fusion.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::ir::fusion::Fusion;
use crate::ir::node::{
    ComputeAt, Expr, ExprId, ExprKind, FusionId, IterDomain, IterDomainId, TensorDomain,
    TensorView, Transform, ValId, Value, ValueKind,
};

/// Old-to-new handle translation produced by [`Fusion::clone_fusion`].
#[derive(Debug, Clone)]
pub struct CloneMap {
    from: FusionId,
    to: FusionId,
    vals: HashMap<ValId, ValId>,
    exprs: HashMap<ExprId, ExprId>,
    iter_domains: HashMap<IterDomainId, IterDomainId>,
}

impl CloneMap {
    fn new(from: FusionId, to: FusionId) -> Self {
        Self {
            from,
            to,
            vals: HashMap::new(),
            exprs: HashMap::new(),
            iter_domains: HashMap::new(),
        }
    }

    pub fn source(&self) -> FusionId {
        self.from
    }

    pub fn target(&self) -> FusionId {
        self.to
    }

    /// Counterpart of `val` in the clone, if `val` belonged to the source.
    pub fn val(&self, val: ValId) -> Option<ValId> {
        self.vals.get(&val).copied()
    }

    pub fn expr(&self, expr: ExprId) -> Option<ExprId> {
        self.exprs.get(&expr).copied()
    }

    pub fn iter_domain(&self, id: IterDomainId) -> Option<IterDomainId> {
        self.iter_domains.get(&id).copied()
    }

    fn map_val(&mut self, val: ValId) -> ValId {
        let to = self.to;
        *self
            .vals
            .entry(val)
            .or_insert_with(|| ValId::new(to, val.index()))
    }

    fn map_expr(&mut self, expr: ExprId) -> ExprId {
        let to = self.to;
        *self
            .exprs
            .entry(expr)
            .or_insert_with(|| ExprId::new(to, expr.index()))
    }

    fn map_id(&mut self, id: IterDomainId) -> IterDomainId {
        let to = self.to;
        *self
            .iter_domains
            .entry(id)
            .or_insert_with(|| IterDomainId::new(to, id.index()))
    }

    fn map_ids(&mut self, ids: &[IterDomainId]) -> Vec<IterDomainId> {
        ids.iter().map(|id| self.map_id(*id)).collect()
    }

    fn clone_transform(&mut self, t: &Transform) -> Transform {
        match *t {
            Transform::Split {
                input,
                outer,
                inner,
                factor,
            } => Transform::Split {
                input: self.map_id(input),
                outer: self.map_id(outer),
                inner: self.map_id(inner),
                factor: self.map_val(factor),
            },
            Transform::Merge {
                outer,
                inner,
                output,
            } => Transform::Merge {
                outer: self.map_id(outer),
                inner: self.map_id(inner),
                output: self.map_id(output),
            },
        }
    }

    fn clone_domain(&mut self, domain: &TensorDomain) -> TensorDomain {
        TensorDomain {
            root: self.map_ids(&domain.root),
            rfactor: domain.rfactor.as_ref().map(|ids| self.map_ids(ids)),
            leaf: self.map_ids(&domain.leaf),
            history: domain
                .history
                .iter()
                .map(|t| self.clone_transform(t))
                .collect(),
        }
    }

    fn clone_value(&mut self, value: &Value) -> Value {
        let kind = match &value.kind {
            ValueKind::Scalar(s) => ValueKind::Scalar(s.clone()),
            ValueKind::Tensor(tv) => ValueKind::Tensor(TensorView {
                dtype: tv.dtype,
                domain: self.clone_domain(&tv.domain),
                compute_at: tv.compute_at.as_ref().map(|ca| ComputeAt {
                    view: self.map_val(ca.view),
                    axis: ca.axis,
                    this_axis: ca.this_axis,
                    positions: ca.positions.clone(),
                }),
            }),
        };
        Value {
            name: value.name,
            kind,
        }
    }

    fn clone_expr(&mut self, expr: &Expr) -> Expr {
        let kind = match &expr.kind {
            ExprKind::Reduction { op, init } => ExprKind::Reduction {
                op: *op,
                init: self.map_val(*init),
            },
            other => other.clone(),
        };
        Expr {
            name: expr.name,
            kind,
            inputs: expr.inputs.iter().map(|v| self.map_val(*v)).collect(),
            outputs: expr.outputs.iter().map(|v| self.map_val(*v)).collect(),
        }
    }

    fn clone_iter_domain(&mut self, id: &IterDomain) -> IterDomain {
        IterDomain {
            start: self.map_val(id.start),
            extent: self.map_val(id.extent),
            ..id.clone()
        }
    }
}

impl Fusion {
    /// Copies the whole graph into a fresh fusion with new node identities.
    ///
    /// Topology, names, inputs/outputs, schedules and compute-at links are
    /// preserved; the returned map translates handles of `self` into handles
    /// of the copy.
    pub fn clone_fusion(&self) -> (Fusion, CloneMap) {
        let mut copy = Fusion::new();
        let mut map = CloneMap::new(self.id, copy.id);

        copy.vals = self
            .vals
            .iter()
            .map(|slot| slot.as_ref().map(|v| map.clone_value(v)))
            .collect();
        copy.exprs = self
            .exprs
            .iter()
            .map(|slot| slot.as_ref().map(|e| map.clone_expr(e)))
            .collect();
        copy.iter_domains = self
            .iter_domains
            .iter()
            .map(|id| map.clone_iter_domain(id))
            .collect();
        for (index, slot) in self.vals.iter().enumerate() {
            if slot.is_some() {
                map.map_val(ValId::new(self.id, index));
            }
        }
        for (index, slot) in self.exprs.iter().enumerate() {
            if slot.is_some() {
                map.map_expr(ExprId::new(self.id, index));
            }
        }
        for index in 0..self.iter_domains.len() {
            map.map_id(IterDomainId::new(self.id, index));
        }

        copy.origin = self
            .origin
            .iter()
            .map(|(v, e)| (map.map_val(*v), map.map_expr(*e)))
            .collect();
        copy.uses = self
            .uses
            .iter()
            .map(|(v, uses)| {
                let uses: SmallVec<[ExprId; 4]> = uses.iter().map(|e| map.map_expr(*e)).collect();
                (map.map_val(*v), uses)
            })
            .collect();
        copy.inputs = self.inputs.iter().map(|v| map.map_val(*v)).collect();
        copy.outputs = self.outputs.iter().map(|v| map.map_val(*v)).collect();
        copy.deterministic_vals = self
            .deterministic_vals
            .iter()
            .map(|v| map.map_val(*v))
            .collect();
        copy.counters = self.counters;
        (copy, map)
    }
}
