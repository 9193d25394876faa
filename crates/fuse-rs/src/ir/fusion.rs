//! The [`Fusion`] container: sole owner of every node of one compilation unit.
//!
//! Values, operations and axis descriptors are stored in per-kind arenas and
//! addressed by handle. Removed values and operations leave a tombstone so
//! handles never get reused within the lifetime of a fusion.
//!
//! ## Maps
//!
//! - `origin`: value -> the operation producing it (at most one)
//! - `uses`: value -> operations consuming it, in registration order
//!
//! Both maps are updated by registration and removal only; traversals borrow
//! the fusion immutably, so the graph cannot change underneath a walk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use smallvec::SmallVec;

use crate::error::{FusionError, FusionResult};
use crate::ir::node::{
    Expr, ExprId, ExprKind, FusionId, IterDomain, IterDomainId, ParallelType, Scalar, Statement,
    TensorView, ValId, Value, ValueKind,
};
use crate::traversal;

static FUSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_fusion_id() -> FusionId {
    FusionId(FUSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Per-kind name counters. Scalars of every data type share one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct NameCounters {
    pub(crate) tensor: usize,
    pub(crate) scalar: usize,
    pub(crate) iter_domain: usize,
    pub(crate) expr: usize,
}

/// Arena lengths recorded by [`Fusion::checkpoint`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    vals: usize,
    exprs: usize,
    iter_domains: usize,
    inputs: usize,
    outputs: usize,
    counters: NameCounters,
}

#[derive(Debug)]
pub struct Fusion {
    pub(crate) id: FusionId,
    pub(crate) vals: Vec<Option<Value>>,
    pub(crate) exprs: Vec<Option<Expr>>,
    pub(crate) iter_domains: Vec<IterDomain>,
    pub(crate) origin: HashMap<ValId, ExprId>,
    pub(crate) uses: HashMap<ValId, SmallVec<[ExprId; 4]>>,
    pub(crate) inputs: Vec<ValId>,
    pub(crate) outputs: Vec<ValId>,
    pub(crate) deterministic_vals: Vec<ValId>,
    pub(crate) counters: NameCounters,
}

impl Default for Fusion {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Fusion {
    fn clone(&self) -> Self {
        self.clone_fusion().0
    }
}

impl Fusion {
    pub fn new() -> Self {
        Self {
            id: next_fusion_id(),
            vals: Vec::new(),
            exprs: Vec::new(),
            iter_domains: Vec::new(),
            origin: HashMap::new(),
            uses: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            deterministic_vals: Vec::new(),
            counters: NameCounters::default(),
        }
    }

    pub fn id(&self) -> FusionId {
        self.id
    }

    /// Deletes every owned node and resets names and maps.
    ///
    /// The fusion gets a fresh id, so handles taken before the call are
    /// rejected instead of addressing the nodes created after it.
    pub fn clear(&mut self) {
        self.id = next_fusion_id();
        self.vals.clear();
        self.exprs.clear();
        self.iter_domains.clear();
        self.origin.clear();
        self.uses.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.deterministic_vals.clear();
        self.counters = NameCounters::default();
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            vals: self.vals.len(),
            exprs: self.exprs.len(),
            iter_domains: self.iter_domains.len(),
            inputs: self.inputs.len(),
            outputs: self.outputs.len(),
            counters: self.counters,
        }
    }

    /// Drops every node, input and output added since `checkpoint`.
    ///
    /// Only additions are undone; older nodes must not have been removed or
    /// rescheduled in between.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            vals,
            exprs,
            iter_domains,
            inputs,
            outputs,
            counters,
        } = checkpoint;
        self.vals.truncate(vals);
        self.exprs.truncate(exprs);
        self.iter_domains.truncate(iter_domains);
        self.inputs.truncate(inputs);
        self.outputs.truncate(outputs);
        self.deterministic_vals.retain(|v| v.index() < vals);
        self.origin.retain(|v, e| v.index() < vals && e.index() < exprs);
        self.uses.retain(|v, _| v.index() < vals);
        for uses in self.uses.values_mut() {
            uses.retain(|e| e.index() < exprs);
        }
        self.counters = counters;
        debug!("rolled fusion back to {vals} values and {exprs} operations");
    }

    /// Moves the whole graph out, leaving `self` valid and empty.
    ///
    /// Handles created before the move keep addressing the returned fusion.
    pub fn take(&mut self) -> Fusion {
        std::mem::take(self)
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    pub(crate) fn push_val(&mut self, kind: ValueKind) -> ValId {
        let name = match &kind {
            ValueKind::Tensor(_) => {
                self.counters.tensor += 1;
                self.counters.tensor - 1
            }
            ValueKind::Scalar(_) => {
                self.counters.scalar += 1;
                self.counters.scalar - 1
            }
        };
        let id = ValId::new(self.id, self.vals.len());
        self.vals.push(Some(Value { name, kind }));
        self.deterministic_vals.push(id);
        id
    }

    pub(crate) fn push_scalar(&mut self, scalar: Scalar) -> ValId {
        self.push_val(ValueKind::Scalar(scalar))
    }

    pub(crate) fn push_tensor(&mut self, tv: TensorView) -> ValId {
        self.push_val(ValueKind::Tensor(tv))
    }

    pub(crate) fn push_iter_domain(
        &mut self,
        start: ValId,
        extent: ValId,
        iter_type: crate::ir::node::IterType,
        parallel: ParallelType,
        rfactor_product: bool,
    ) -> IterDomainId {
        let id = IterDomainId::new(self.id, self.iter_domains.len());
        self.iter_domains.push(IterDomain {
            name: self.counters.iter_domain,
            start,
            extent,
            iter_type,
            parallel,
            rfactor_product,
        });
        self.counters.iter_domain += 1;
        id
    }

    /// Allocates and registers an operation.
    pub(crate) fn push_expr(
        &mut self,
        kind: ExprKind,
        inputs: SmallVec<[ValId; 3]>,
        outputs: SmallVec<[ValId; 1]>,
    ) -> FusionResult<ExprId> {
        for val in inputs.iter().chain(outputs.iter()) {
            self.register_val(*val)?;
        }
        let id = ExprId::new(self.id, self.exprs.len());
        self.exprs.push(Some(Expr {
            name: self.counters.expr,
            kind,
            inputs,
            outputs,
        }));
        self.counters.expr += 1;
        self.register_expr(id)?;
        Ok(id)
    }

    /// Confirms `val` is owned by this fusion. Registering an already
    /// registered value is a no-op.
    pub fn register_val(&self, val: ValId) -> FusionResult<ValId> {
        if val.fusion != self.id {
            return Err(FusionError::integrity(format!(
                "value #{} belongs to a different fusion",
                val.index
            )));
        }
        if !self.in_fusion(val) {
            return Err(FusionError::integrity(format!(
                "value #{} is not registered in this fusion",
                val.index
            )));
        }
        Ok(val)
    }

    /// Links an operation into the origin and use maps.
    ///
    /// A value can only have one origin: if an output already has one, the
    /// previous producer is removed first. Registering twice is a no-op.
    pub fn register_expr(&mut self, expr: ExprId) -> FusionResult<()> {
        if expr.fusion != self.id {
            return Err(FusionError::integrity(format!(
                "operation #{} belongs to a different fusion",
                expr.index
            )));
        }
        let (inputs, outputs) = {
            let node = self.expr(expr)?;
            (node.inputs.clone(), node.outputs.clone())
        };
        if outputs
            .iter()
            .all(|out| self.origin.get(out) == Some(&expr))
        {
            return Ok(());
        }
        for out in &outputs {
            if let Some(previous) = self.origin.get(out).copied() {
                if previous != expr {
                    debug!(
                        "replacing origin of {} (expr {}) with expr {}",
                        self.label(*out),
                        previous.index,
                        expr.index
                    );
                    self.remove_expr(previous)?;
                }
            }
        }
        for input in &inputs {
            let uses = self.uses.entry(*input).or_default();
            if !uses.contains(&expr) {
                uses.push(expr);
            }
        }
        for out in &outputs {
            self.origin.insert(*out, expr);
        }
        Ok(())
    }

    /// Removes an operation and unlinks it from both maps.
    pub fn remove_expr(&mut self, expr: ExprId) -> FusionResult<()> {
        let node = self
            .exprs
            .get_mut(expr.index())
            .filter(|_| expr.fusion == self.id)
            .and_then(Option::take)
            .ok_or_else(|| {
                FusionError::integrity(format!("operation #{} is not registered", expr.index))
            })?;
        for out in &node.outputs {
            if self.origin.get(out) == Some(&expr) {
                self.origin.remove(out);
            }
        }
        for input in &node.inputs {
            if let Some(uses) = self.uses.get_mut(input) {
                uses.retain(|u| *u != expr);
            }
        }
        debug!("removed expr {} ({:?})", node.name, node.kind);
        Ok(())
    }

    /// Removes a value together with its origin and every operation using it.
    pub fn remove_val(&mut self, val: ValId) -> FusionResult<()> {
        self.register_val(val)?;
        if self.is_input(val) || self.is_output(val) {
            return Err(FusionError::integrity(format!(
                "cannot remove {}: it is a declared fusion input or output",
                self.label(val)
            )));
        }
        if let Some(origin) = self.origin.get(&val).copied() {
            self.remove_expr(origin)?;
        }
        let uses: Vec<ExprId> = self
            .uses
            .remove(&val)
            .map(|u| u.into_iter().collect())
            .unwrap_or_default();
        for expr in uses {
            if self.expr_exists(expr) {
                self.remove_expr(expr)?;
            }
        }
        debug!("removed value {}", self.label(val));
        self.deterministic_vals.retain(|v| *v != val);
        self.vals[val.index()] = None;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inputs and outputs
    // ---------------------------------------------------------------------

    pub fn add_input(&mut self, val: ValId) -> FusionResult<()> {
        self.register_val(val)?;
        if self.origin.contains_key(&val) {
            return Err(FusionError::invalid_input(format!(
                "{} cannot be a fusion input: it is produced by an operation",
                self.label(val)
            )));
        }
        if let Some(tv) = self.val(val)?.as_tensor() {
            if self.domain_has_reduction(&tv.domain.root) {
                warn!(
                    "registering {} as input although its root domain carries a reduction axis",
                    self.label(val)
                );
            }
        }
        if !self.inputs.contains(&val) {
            self.inputs.push(val);
        }
        Ok(())
    }

    pub fn add_output(&mut self, val: ValId) -> FusionResult<()> {
        self.check_output(val)?;
        if !self.outputs.contains(&val) {
            self.outputs.push(val);
        }
        Ok(())
    }

    fn check_output(&self, val: ValId) -> FusionResult<()> {
        self.register_val(val)?;
        if let Some(tv) = self.val(val)?.as_tensor() {
            if tv
                .domain
                .root
                .iter()
                .any(|id| self.iter_domains[id.index()].is_broadcast())
            {
                return Err(FusionError::invalid_input(format!(
                    "{} cannot be a fusion output: its root domain has a broadcast axis",
                    self.label(val)
                )));
            }
        }
        Ok(())
    }

    /// Swaps a declared input, keeping its position.
    pub fn replace_input(&mut self, old: ValId, new: ValId) -> FusionResult<()> {
        let pos = self.inputs.iter().position(|v| *v == old).ok_or_else(|| {
            FusionError::invalid_input(format!("{} is not a fusion input", self.label(old)))
        })?;
        self.register_val(new)?;
        if self.origin.contains_key(&new) {
            return Err(FusionError::invalid_input(format!(
                "{} cannot be a fusion input: it is produced by an operation",
                self.label(new)
            )));
        }
        if self.inputs.contains(&new) {
            self.inputs.remove(pos);
        } else {
            self.inputs[pos] = new;
        }
        Ok(())
    }

    /// Swaps a declared output, keeping its position.
    pub fn replace_output(&mut self, old: ValId, new: ValId) -> FusionResult<()> {
        let pos = self.outputs.iter().position(|v| *v == old).ok_or_else(|| {
            FusionError::invalid_input(format!("{} is not a fusion output", self.label(old)))
        })?;
        self.check_output(new)?;
        if self.outputs.contains(&new) {
            self.outputs.remove(pos);
        } else {
            self.outputs[pos] = new;
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.outputs
    }

    pub fn is_input(&self, val: ValId) -> bool {
        self.inputs.contains(&val)
    }

    pub fn is_output(&self, val: ValId) -> bool {
        self.outputs.contains(&val)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn in_fusion(&self, val: ValId) -> bool {
        val.fusion == self.id && matches!(self.vals.get(val.index()), Some(Some(_)))
    }

    pub fn expr_exists(&self, expr: ExprId) -> bool {
        expr.fusion == self.id && matches!(self.exprs.get(expr.index()), Some(Some(_)))
    }

    pub fn val(&self, val: ValId) -> FusionResult<&Value> {
        self.register_val(val)?;
        self.vals[val.index()]
            .as_ref()
            .ok_or_else(|| FusionError::integrity(format!("value #{} was removed", val.index)))
    }

    pub(crate) fn val_mut(&mut self, val: ValId) -> FusionResult<&mut Value> {
        self.register_val(val)?;
        self.vals[val.index()]
            .as_mut()
            .ok_or_else(|| FusionError::integrity(format!("value #{} was removed", val.index)))
    }

    pub fn expr(&self, expr: ExprId) -> FusionResult<&Expr> {
        if expr.fusion != self.id {
            return Err(FusionError::integrity(format!(
                "operation #{} belongs to a different fusion",
                expr.index
            )));
        }
        self.exprs
            .get(expr.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| FusionError::integrity(format!("operation #{} is not registered", expr.index)))
    }

    pub fn iter_domain(&self, id: IterDomainId) -> FusionResult<&IterDomain> {
        if id.fusion != self.id {
            return Err(FusionError::integrity(format!(
                "iter domain #{} belongs to a different fusion",
                id.index
            )));
        }
        self.iter_domains.get(id.index()).ok_or_else(|| {
            FusionError::integrity(format!("iter domain #{} is not registered", id.index))
        })
    }

    pub(crate) fn iter_domain_mut(&mut self, id: IterDomainId) -> FusionResult<&mut IterDomain> {
        if id.fusion != self.id {
            return Err(FusionError::integrity(format!(
                "iter domain #{} belongs to a different fusion",
                id.index
            )));
        }
        self.iter_domains.get_mut(id.index()).ok_or_else(|| {
            FusionError::integrity(format!("iter domain #{} is not registered", id.index))
        })
    }

    pub fn tensor_view(&self, val: ValId) -> FusionResult<&TensorView> {
        let value = self.val(val)?;
        value.as_tensor().ok_or_else(|| {
            FusionError::invalid_input(format!("{} is not a tensor view", value.label()))
        })
    }

    pub(crate) fn tensor_view_mut(&mut self, val: ValId) -> FusionResult<&mut TensorView> {
        let label = self.label(val);
        self.val_mut(val)?
            .as_tensor_mut()
            .ok_or_else(|| FusionError::invalid_input(format!("{label} is not a tensor view")))
    }

    pub fn scalar(&self, val: ValId) -> FusionResult<&Scalar> {
        let value = self.val(val)?;
        value
            .as_scalar()
            .ok_or_else(|| FusionError::invalid_input(format!("{} is not a scalar", value.label())))
    }

    pub fn is_tensor(&self, val: ValId) -> bool {
        self.val(val).map(Value::is_tensor).unwrap_or(false)
    }

    /// Printed handle of a value, or `#<slot>` when it is unknown here.
    pub fn label(&self, val: ValId) -> String {
        match self.val(val) {
            Ok(value) => value.label(),
            Err(_) => format!("#{}", val.index),
        }
    }

    pub fn origin(&self, val: ValId) -> Option<ExprId> {
        self.origin.get(&val).copied()
    }

    pub fn unordered_uses(&self, val: ValId) -> &[ExprId] {
        self.uses.get(&val).map(|u| u.as_slice()).unwrap_or(&[])
    }

    pub fn used(&self, val: ValId) -> bool {
        !self.unordered_uses(val).is_empty()
    }

    /// Live values in registration order.
    pub fn deterministic_vals(&self) -> &[ValId] {
        &self.deterministic_vals
    }

    /// Live values with their handles, in arena order.
    pub fn vals(&self) -> impl Iterator<Item = (ValId, &Value)> + '_ {
        self.vals
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|v| (ValId::new(self.id, index), v)))
    }

    /// Values the declared outputs depend on, in topological order.
    pub fn used_math_vals(&self) -> Vec<ValId> {
        traversal::all_vals(self, &self.outputs)
    }

    /// Live operations in registration order.
    pub fn registered_exprs(&self) -> Vec<ExprId> {
        self.exprs
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(index, _)| ExprId::new(self.id, index))
            .collect()
    }

    /// Operations in topological order; see [`traversal::topological_order`].
    pub fn exprs(
        &self,
        from_outputs_only: bool,
        respect_compute_at: bool,
    ) -> FusionResult<Vec<ExprId>> {
        traversal::topological_order(self, from_outputs_only, respect_compute_at)
    }

    /// Declared outputs that do not feed any operation needed by another output.
    pub fn terminating_outputs(&self) -> Vec<ValId> {
        let used: HashSet<ValId> = traversal::required_exprs(self, &self.outputs)
            .into_iter()
            .filter_map(|e| self.expr(e).ok())
            .flat_map(|e| e.inputs.iter().copied())
            .collect();
        self.outputs
            .iter()
            .copied()
            .filter(|out| !used.contains(out))
            .collect()
    }

    pub(crate) fn domain_has_reduction(&self, ids: &[IterDomainId]) -> bool {
        ids.iter()
            .any(|id| self.iter_domains[id.index()].is_reduction())
    }

    fn output_tensors(&self) -> Vec<&TensorView> {
        traversal::required_exprs(self, &self.outputs)
            .into_iter()
            .filter_map(|e| self.expr(e).ok())
            .flat_map(|e| e.outputs.iter())
            .filter_map(|out| self.tensor_view(*out).ok())
            .collect()
    }

    fn leaf_matches(&self, tv: &TensorView, pred: impl Fn(&IterDomain) -> bool) -> bool {
        tv.domain
            .leaf
            .iter()
            .any(|id| pred(&self.iter_domains[id.index()]))
    }

    pub fn tv_has_reduction(&self, tv: ValId) -> FusionResult<bool> {
        let tv = self.tensor_view(tv)?;
        Ok(self.leaf_matches(tv, |id| id.is_reduction()))
    }

    pub fn tv_has_broadcast(&self, tv: ValId) -> FusionResult<bool> {
        let tv = self.tensor_view(tv)?;
        Ok(self.leaf_matches(tv, |id| id.is_broadcast()))
    }

    pub fn has_reduction(&self) -> bool {
        self.output_tensors()
            .into_iter()
            .any(|tv| self.leaf_matches(tv, |id| id.is_reduction()))
    }

    pub fn has_block_reduction(&self) -> bool {
        self.output_tensors()
            .into_iter()
            .any(|tv| self.leaf_matches(tv, |id| id.is_reduction() && id.parallel.is_thread()))
    }

    pub fn has_grid_reduction(&self) -> bool {
        self.output_tensors()
            .into_iter()
            .any(|tv| self.leaf_matches(tv, |id| id.is_reduction() && id.parallel.is_block()))
    }

    pub fn has_rng(&self) -> bool {
        traversal::required_exprs(self, &self.outputs)
            .into_iter()
            .any(|e| {
                matches!(
                    self.expr(e).map(|e| &e.kind),
                    Ok(ExprKind::Unary(crate::ir::node::UnaryOp::RandLike))
                )
            })
    }

    /// Fails if an output depends on a leaf that is neither a declared input
    /// nor a constant scalar.
    pub fn validate_inputs(&self) -> FusionResult<()> {
        for leaf in traversal::inputs_of(self, &self.outputs) {
            if self.is_input(leaf) {
                continue;
            }
            let is_const = self
                .val(leaf)?
                .as_scalar()
                .map(Scalar::is_const)
                .unwrap_or(false);
            if !is_const {
                return Err(FusionError::invalid_input(format!(
                    "{} is required by the fusion outputs but is not a declared input or constant",
                    self.label(leaf)
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn statement_label(&self, stmt: Statement) -> String {
        match stmt {
            Statement::Val(v) => self.label(v),
            Statement::Expr(e) => format!("expr#{}", e.index),
        }
    }
}
