//! Lowering of a scheduled [`Fusion`] to kernel IR.
//!
//! Every tensor operation becomes a statement inside the loop nest of its
//! output. A tensor computed at another one shares the outer loops of its
//! host; consecutive operations reuse every loop their nests have in common.
//! Loops over axes bound to a thread or block index, or over broadcast axes,
//! are not materialised.
//!
//! Indices are rebuilt per axis: leaf indices come from loop variables (or
//! the parallel index), root indices from walking the split/merge history
//! backwards, and a producer read from the consumer's root indices mapped
//! through the producer's logical axes.
//!
//! Tensors that are neither fusion inputs nor outputs live in per-thread
//! buffers allocated at their compute-at position and sized by their own
//! serial axes.

mod kir;

use std::collections::{HashMap, HashSet};

use log::{debug, info};

pub use kir::{
    count_stmts, Buffer, KExpr, Kernel, KernelParam, ParamKind, ReduceTarget, Stmt, Storage,
    TensorRef,
};

use crate::env::Config;
use crate::error::{FusionError, FusionResult};
use crate::eval::EvaluationContext;
use crate::ir::{
    BinaryOp, DataType, ExprId, ExprKind, Fusion, IterDomain, IterDomainId, ParallelType,
    ScalarValue, Transform, UnaryOp, ValId,
};
use crate::printer;

/// Knobs of a lowering run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOptions {
    pub config: Config,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            config: Config::from_env(),
        }
    }
}

/// Identity of a loop: leaf axis `.1` of tensor `.0`.
type LoopKey = (ValId, usize);

struct Frame {
    key: Option<LoopKey>,
    /// `(index, start, extent, unroll)` of a materialised loop.
    header: Option<(usize, KExpr, KExpr, bool)>,
    body: Vec<Stmt>,
}

impl Frame {
    fn root() -> Self {
        Self {
            key: None,
            header: None,
            body: Vec::new(),
        }
    }
}

struct Lowering<'a> {
    fusion: &'a Fusion,
    statics: EvaluationContext<'a>,
    params: Vec<KernelParam>,
    scalars: HashMap<ValId, KExpr>,
    globals: HashMap<ValId, usize>,
    nests: HashMap<ValId, Vec<LoopKey>>,
    frames: Vec<Frame>,
    loop_vars: HashMap<LoopKey, usize>,
    next_index: usize,
    reduction_ops: Vec<(BinaryOp, DataType)>,
    has_block_reduction: bool,
    has_grid_reduction: bool,
}

fn constant_expr(value: ScalarValue) -> KExpr {
    match value {
        ScalarValue::Int(v) => KExpr::Int(v),
        ScalarValue::Float(v) => KExpr::Float(v),
        ScalarValue::Bool(v) => KExpr::Bool(v),
    }
}

fn dim_flags(axes: &[&IterDomain], pred: impl Fn(ParallelType) -> bool) -> [bool; 3] {
    let mut flags = [false; 3];
    for axis in axes {
        if pred(axis.parallel) {
            if let Some(slot) = axis.parallel.dim_slot() {
                flags[slot] = true;
            }
        }
    }
    flags
}

fn wrap_predicate(stmt: Stmt, pred: Option<KExpr>) -> Stmt {
    match pred {
        Some(cond) => Stmt::IfThenElse {
            cond,
            then_body: vec![stmt],
            else_body: Vec::new(),
        },
        None => stmt,
    }
}

impl<'a> Lowering<'a> {
    fn new(fusion: &'a Fusion) -> FusionResult<Self> {
        let mut lowering = Self {
            fusion,
            statics: EvaluationContext::new(fusion),
            params: Vec::new(),
            scalars: HashMap::new(),
            globals: HashMap::new(),
            nests: HashMap::new(),
            frames: vec![Frame::root()],
            loop_vars: HashMap::new(),
            next_index: fusion.counters.scalar,
            reduction_ops: Vec::new(),
            has_block_reduction: false,
            has_grid_reduction: false,
        };
        let args: Vec<(ValId, bool)> = fusion
            .inputs()
            .iter()
            .map(|v| (*v, false))
            .chain(fusion.outputs().iter().map(|v| (*v, true)))
            .collect();
        for (arg, (val, is_output)) in args.into_iter().enumerate() {
            lowering.declare_param(arg, val, is_output)?;
        }
        Ok(lowering)
    }

    fn declare_param(&mut self, arg: usize, val: ValId, is_output: bool) -> FusionResult<()> {
        let fusion = self.fusion;
        let value = fusion.val(val)?;
        let label = value.label();
        let kind = if value.is_tensor() {
            let logical = fusion.no_reduction_logical(val)?;
            for (dim, id) in logical.iter().enumerate() {
                let extent = fusion.iter_domain(*id)?.extent;
                let symbolic = fusion.scalar(extent)?.is_symbolic() && fusion.origin(extent).is_none();
                if symbolic && !self.scalars.contains_key(&extent) {
                    self.scalars.insert(
                        extent,
                        KExpr::Size {
                            arg,
                            name: value.name,
                            dim,
                        },
                    );
                }
            }
            self.globals.insert(val, arg);
            ParamKind::Tensor {
                dtype: value.dtype(),
                ndims: logical.len(),
            }
        } else {
            if is_output {
                return Err(FusionError::unsupported(format!(
                    "scalar output {label} cannot be written by a kernel"
                )));
            }
            self.scalars.insert(
                val,
                KExpr::ScalarArg {
                    arg,
                    label: label.clone(),
                },
            );
            ParamKind::Scalar {
                dtype: value.dtype(),
            }
        };
        self.params.push(KernelParam {
            label,
            kind,
            is_output,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Scalars
    // ---------------------------------------------------------------------

    fn lower_scalar(&self, val: ValId) -> FusionResult<KExpr> {
        if let Some(known) = self.scalars.get(&val) {
            return Ok(known.clone());
        }
        let fusion = self.fusion;
        let value = fusion.val(val)?;
        let scalar = value.as_scalar().ok_or_else(|| {
            FusionError::unsupported(format!("{} is used where a scalar is expected", value.label()))
        })?;
        if let Some(constant) = scalar.value {
            return Ok(constant_expr(constant));
        }
        let Some(origin) = fusion.origin(val) else {
            return Err(FusionError::unsupported(format!(
                "cannot resolve {} in the kernel: it is neither an argument nor derived from one",
                value.label()
            )));
        };
        if scalar.dtype == DataType::Int {
            if let Some(folded) = self.statics.evaluate(val) {
                return Ok(KExpr::Int(folded));
            }
        }
        let expr = fusion.expr(origin)?;
        Ok(match (&expr.kind, expr.inputs.as_slice()) {
            (ExprKind::Unary(UnaryOp::RandLike), _) => KExpr::Rand,
            (ExprKind::Unary(op), [input]) => {
                KExpr::Unary(*op, scalar.dtype, Box::new(self.lower_scalar(*input)?))
            }
            (ExprKind::Binary(op), [lhs, rhs]) => {
                KExpr::binary(*op, self.lower_scalar(*lhs)?, self.lower_scalar(*rhs)?)
            }
            (ExprKind::Ternary(op), [cond, on_true, on_false]) => KExpr::Ternary(
                *op,
                Box::new(self.lower_scalar(*cond)?),
                Box::new(self.lower_scalar(*on_true)?),
                Box::new(self.lower_scalar(*on_false)?),
            ),
            _ => {
                return Err(FusionError::unsupported(format!(
                    "{} is produced by an operation that has no scalar form",
                    value.label()
                )))
            }
        })
    }

    fn extent_of(&self, id: IterDomainId) -> FusionResult<KExpr> {
        self.lower_scalar(self.fusion.iter_domain(id)?.extent)
    }

    // ---------------------------------------------------------------------
    // Loop structure
    // ---------------------------------------------------------------------

    fn loop_nest(&mut self, tv: ValId) -> FusionResult<Vec<LoopKey>> {
        if let Some(nest) = self.nests.get(&tv) {
            return Ok(nest.clone());
        }
        let view = self.fusion.tensor_view(tv)?;
        let mut nest = Vec::with_capacity(view.n_dims());
        let own_from = match &view.compute_at {
            Some(ca) => {
                let host = self.loop_nest(ca.view)?;
                if ca.axis > host.len() {
                    return Err(FusionError::integrity(format!(
                        "{} is computed at axis {} of {}, which has {} loops",
                        self.fusion.label(tv),
                        ca.axis,
                        self.fusion.label(ca.view),
                        host.len()
                    )));
                }
                nest.extend_from_slice(&host[..ca.axis]);
                ca.this_axis
            }
            None => 0,
        };
        nest.extend((own_from..view.n_dims()).map(|pos| (tv, pos)));
        self.nests.insert(tv, nest.clone());
        Ok(nest)
    }

    /// Loop iterating leaf `pos` of `tv`.
    fn leaf_key(&mut self, tv: ValId, pos: usize) -> FusionResult<LoopKey> {
        let link = self.fusion.tensor_view(tv)?.compute_at.clone();
        match link {
            Some(ca) if pos < ca.this_axis => {
                let host = self.loop_nest(ca.view)?;
                host.get(ca.positions[pos]).copied().ok_or_else(|| {
                    FusionError::integrity(format!(
                        "shared axis {pos} of {} points past the loops of {}",
                        self.fusion.label(tv),
                        self.fusion.label(ca.view)
                    ))
                })
            }
            _ => Ok((tv, pos)),
        }
    }

    fn key_axis(&self, key: LoopKey) -> FusionResult<&'a IterDomain> {
        let fusion = self.fusion;
        let id = fusion
            .tensor_view(key.0)?
            .domain
            .leaf
            .get(key.1)
            .copied()
            .ok_or_else(|| {
                FusionError::integrity(format!(
                    "{} has no leaf axis {}",
                    fusion.label(key.0),
                    key.1
                ))
            })?;
        fusion.iter_domain(id)
    }

    fn is_elided(axis: &IterDomain) -> bool {
        axis.is_thread_or_block() || axis.is_broadcast()
    }

    fn key_index(&self, key: LoopKey) -> FusionResult<KExpr> {
        let axis = self.key_axis(key)?;
        if axis.is_thread_or_block() {
            return Ok(KExpr::ParallelIndex(axis.parallel));
        }
        if axis.is_broadcast() {
            return Ok(KExpr::Int(0));
        }
        self.loop_vars
            .get(&key)
            .map(|index| KExpr::Index(*index))
            .ok_or_else(|| {
                FusionError::integrity(format!(
                    "loop over axis {} of {} is not open",
                    key.1,
                    self.fusion.label(key.0)
                ))
            })
    }

    fn open_keys(&self) -> Vec<LoopKey> {
        self.frames.iter().filter_map(|f| f.key).collect()
    }

    fn open(&mut self, key: LoopKey) -> FusionResult<()> {
        let axis = self.key_axis(key)?;
        let header = if Self::is_elided(axis) {
            None
        } else {
            let index = self.next_index;
            self.next_index += 1;
            self.loop_vars.insert(key, index);
            Some((
                index,
                self.lower_scalar(axis.start)?,
                self.lower_scalar(axis.extent)?,
                axis.parallel == ParallelType::Unroll,
            ))
        };
        self.frames.push(Frame {
            key: Some(key),
            header,
            body: Vec::new(),
        });
        Ok(())
    }

    fn close(&mut self) -> FusionResult<()> {
        if self.frames.len() < 2 {
            return Err(FusionError::integrity("closing a loop that was never opened"));
        }
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        if let Some(key) = frame.key {
            self.loop_vars.remove(&key);
        }
        let parent = self
            .frames
            .last_mut()
            .ok_or_else(|| FusionError::integrity("kernel body frame is missing"))?;
        match frame.header {
            Some((index, start, extent, unroll)) => parent.body.push(Stmt::ForLoop {
                index,
                start,
                extent,
                unroll,
                body: frame.body,
            }),
            None => parent.body.extend(frame.body),
        }
        Ok(())
    }

    /// Makes the open loops exactly `nest`, reusing the common prefix.
    fn sync_to(&mut self, nest: &[LoopKey]) -> FusionResult<()> {
        let open = self.open_keys();
        let common = open
            .iter()
            .zip(nest)
            .take_while(|(a, b)| a == b)
            .count();
        while self.frames.len() - 1 > common {
            self.close()?;
        }
        for key in &nest[common..] {
            self.open(*key)?;
        }
        Ok(())
    }

    /// Frame whose body runs once per iteration of the loops in `prefix`.
    ///
    /// When `prefix` is already open, statements pushed there land before the
    /// loops currently open below it.
    fn frame_at(&mut self, prefix: &[LoopKey]) -> FusionResult<usize> {
        let open = self.open_keys();
        if !open.starts_with(prefix) {
            self.sync_to(prefix)?;
        }
        Ok(prefix.len())
    }

    fn push(&mut self, frame: usize, stmt: Stmt) -> FusionResult<()> {
        self.frames
            .get_mut(frame)
            .ok_or_else(|| FusionError::integrity(format!("no open frame at depth {frame}")))?
            .body
            .push(stmt);
        Ok(())
    }

    fn push_innermost(&mut self, stmt: Stmt) -> FusionResult<()> {
        let depth = self.frames.len() - 1;
        self.push(depth, stmt)
    }

    // ---------------------------------------------------------------------
    // Indexing
    // ---------------------------------------------------------------------

    /// Leaf axis indices of `tv` at the current point of the nest.
    fn leaf_indices(
        &mut self,
        tv: ValId,
        skip_reduction: bool,
    ) -> FusionResult<HashMap<IterDomainId, KExpr>> {
        let leaf = self.fusion.tensor_view(tv)?.domain.leaf.clone();
        let mut indices = HashMap::with_capacity(leaf.len());
        for (pos, id) in leaf.into_iter().enumerate() {
            if skip_reduction && self.fusion.iter_domain(id)?.is_reduction() {
                continue;
            }
            let key = self.leaf_key(tv, pos)?;
            indices.insert(id, self.key_index(key)?);
        }
        Ok(indices)
    }

    /// Extends leaf indices toward the root by inverting the history.
    fn root_indices(&self, tv: ValId, indices: &mut HashMap<IterDomainId, KExpr>) -> FusionResult<()> {
        for t in self.fusion.tensor_view(tv)?.domain.history.iter().rev() {
            match *t {
                Transform::Split {
                    input,
                    outer,
                    inner,
                    ..
                } => {
                    let (Some(o), Some(i)) = (indices.get(&outer), indices.get(&inner)) else {
                        continue;
                    };
                    let index = KExpr::add(KExpr::mul(o.clone(), self.extent_of(inner)?), i.clone());
                    indices.insert(input, index);
                }
                Transform::Merge {
                    outer,
                    inner,
                    output,
                } => {
                    let Some(merged) = indices.get(&output).cloned() else {
                        continue;
                    };
                    let inner_extent = self.extent_of(inner)?;
                    indices.insert(outer, KExpr::div(merged.clone(), inner_extent.clone()));
                    indices.insert(inner, KExpr::rem(merged, inner_extent));
                }
            }
        }
        Ok(())
    }

    /// Extends logical indices toward the leaf by replaying the history.
    fn forward_indices(
        &self,
        tv: ValId,
        indices: &mut HashMap<IterDomainId, KExpr>,
    ) -> FusionResult<()> {
        for t in &self.fusion.tensor_view(tv)?.domain.history {
            match *t {
                Transform::Split {
                    input,
                    outer,
                    inner,
                    ..
                } => {
                    let Some(source) = indices.get(&input).cloned() else {
                        continue;
                    };
                    let factor = self.extent_of(inner)?;
                    indices.insert(outer, KExpr::div(source.clone(), factor.clone()));
                    indices.insert(inner, KExpr::rem(source, factor));
                }
                Transform::Merge {
                    outer,
                    inner,
                    output,
                } => {
                    let (Some(o), Some(i)) = (indices.get(&outer), indices.get(&inner)) else {
                        continue;
                    };
                    let index = KExpr::add(KExpr::mul(o.clone(), self.extent_of(inner)?), i.clone());
                    indices.insert(output, index);
                }
            }
        }
        Ok(())
    }

    /// Root axes of `tv` that a non-divisible split can push out of range.
    fn predicated_roots(&self, tv: ValId) -> FusionResult<HashSet<IterDomainId>> {
        let domain = &self.fusion.tensor_view(tv)?.domain;
        let mut sources: HashMap<IterDomainId, Vec<IterDomainId>> =
            domain.root.iter().map(|id| (*id, vec![*id])).collect();
        let mut marked = HashSet::new();
        for t in &domain.history {
            let roots: Vec<IterDomainId> = t
                .inputs()
                .iter()
                .filter_map(|id| sources.get(id))
                .flatten()
                .copied()
                .collect();
            if let Transform::Split { input, factor, .. } = *t {
                let extent = self.fusion.iter_domain(input)?.extent;
                let divisible = match (self.statics.evaluate(extent), self.statics.evaluate(factor)) {
                    (Some(e), Some(f)) => f != 0 && e % f == 0,
                    _ => false,
                };
                if !divisible {
                    marked.extend(roots.iter().copied());
                }
            }
            for out in t.outputs() {
                sources.insert(out, roots.clone());
            }
        }
        Ok(marked)
    }

    fn predicate(
        &self,
        tv: ValId,
        indices: &HashMap<IterDomainId, KExpr>,
        skip_reduction: bool,
    ) -> FusionResult<Option<KExpr>> {
        let marked = self.predicated_roots(tv)?;
        let mut terms = Vec::new();
        for id in &self.fusion.tensor_view(tv)?.domain.root {
            let axis = self.fusion.iter_domain(*id)?;
            if !marked.contains(id) || (skip_reduction && axis.is_reduction()) {
                continue;
            }
            let Some(index) = indices.get(id) else {
                continue;
            };
            terms.push(KExpr::binary(
                BinaryOp::Lt,
                index.clone(),
                self.lower_scalar(axis.extent)?,
            ));
        }
        Ok(match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(KExpr::All(terms)),
        })
    }

    /// Leaf positions of `tv` that its per-thread buffer spans.
    fn allocated_axes(&self, tv: ValId) -> FusionResult<Vec<IterDomainId>> {
        let view = self.fusion.tensor_view(tv)?;
        let mut axes = Vec::new();
        for id in view.domain.leaf.iter().skip(view.this_compute_at_axis()) {
            let axis = self.fusion.iter_domain(*id)?;
            if !(axis.is_reduction() || Self::is_elided(axis)) {
                axes.push(*id);
            }
        }
        Ok(axes)
    }

    fn tensor_name(&self, tv: ValId) -> FusionResult<usize> {
        Ok(self.fusion.val(tv)?.name)
    }

    fn tensor_ref(&self, tv: ValId, indices: &HashMap<IterDomainId, KExpr>) -> FusionResult<TensorRef> {
        let name = self.tensor_name(tv)?;
        let missing = |what: &str| {
            FusionError::integrity(format!(
                "no index for {what} axis of {} at this point of the kernel",
                self.fusion.label(tv)
            ))
        };
        if let Some(&arg) = self.globals.get(&tv) {
            let mut terms = Vec::new();
            for (dim, id) in self.fusion.no_reduction_logical(tv)?.iter().enumerate() {
                let index = indices.get(id).cloned().ok_or_else(|| missing("a logical"))?;
                terms.push(KExpr::mul(index, KExpr::Stride { arg, name, dim }));
            }
            return Ok(TensorRef {
                name,
                storage: Storage::Global { arg },
                terms,
            });
        }
        let axes = self.allocated_axes(tv)?;
        let mut terms = Vec::with_capacity(axes.len());
        for (pos, id) in axes.iter().enumerate() {
            let mut term = indices.get(id).cloned().ok_or_else(|| missing("an allocated"))?;
            for later in &axes[pos + 1..] {
                term = KExpr::mul(term, self.extent_of(*later)?);
            }
            terms.push(term);
        }
        Ok(TensorRef {
            name,
            storage: Storage::Local,
            terms,
        })
    }

    fn allocation_size(&self, tv: ValId) -> FusionResult<KExpr> {
        let mut size = KExpr::Int(1);
        for id in self.allocated_axes(tv)? {
            size = KExpr::mul(size, self.extent_of(id)?);
        }
        Ok(size)
    }

    /// Fails unless the loops `producer` is computed in enclose `consumer`.
    fn check_enclosed(&mut self, producer: ValId, consumer: ValId) -> FusionResult<()> {
        let depth = self
            .fusion
            .tensor_view(producer)?
            .compute_at_axis()
            .unwrap_or(0);
        let producer_nest = self.loop_nest(producer)?;
        let consumer_nest = self.loop_nest(consumer)?;
        if !consumer_nest.starts_with(&producer_nest[..depth]) {
            return Err(FusionError::unsupported(format!(
                "{} is computed inside {} loops that do not enclose its consumer {}",
                self.fusion.label(producer),
                depth,
                self.fusion.label(consumer)
            )));
        }
        Ok(())
    }

    /// Value of `producer` as read by `consumer` at root indices `indices`.
    fn read(
        &mut self,
        producer: ValId,
        consumer: ValId,
        indices: &HashMap<IterDomainId, KExpr>,
    ) -> FusionResult<KExpr> {
        if !self.fusion.is_tensor(producer) {
            return self.lower_scalar(producer);
        }
        let mut mapped = HashMap::new();
        for (p, c) in self.fusion.root_map(producer, consumer)? {
            let index = if self.fusion.iter_domain(p)?.is_broadcast() {
                KExpr::Int(0)
            } else {
                indices.get(&c).cloned().ok_or_else(|| {
                    FusionError::integrity(format!(
                        "{} reads {} through an axis it has no index for",
                        self.fusion.label(consumer),
                        self.fusion.label(producer)
                    ))
                })?
            };
            mapped.insert(p, index);
        }
        if !self.globals.contains_key(&producer) {
            self.check_enclosed(producer, consumer)?;
            self.forward_indices(producer, &mut mapped)?;
        }
        Ok(KExpr::Load(self.tensor_ref(producer, &mapped)?))
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    /// Loop nest writing `value` to every element of the non-reduction axes
    /// `out` owns, placed at the current point.
    fn init_nest(&mut self, out: ValId, value: KExpr) -> FusionResult<Stmt> {
        let fusion = self.fusion;
        let view = fusion.tensor_view(out)?;
        let mut headers = Vec::new();
        for pos in view.this_compute_at_axis()..view.n_dims() {
            let axis = fusion.iter_domain(view.domain.leaf[pos])?;
            if axis.is_reduction() || Self::is_elided(axis) {
                continue;
            }
            let index = self.next_index;
            self.next_index += 1;
            let shadowed = self.loop_vars.insert((out, pos), index);
            headers.push((
                (out, pos),
                shadowed,
                index,
                self.lower_scalar(axis.start)?,
                self.lower_scalar(axis.extent)?,
                axis.parallel == ParallelType::Unroll,
            ));
        }
        let mut indices = self.leaf_indices(out, true)?;
        self.root_indices(out, &mut indices)?;
        let target = self.tensor_ref(out, &indices)?;
        let pred = self.predicate(out, &indices, true)?;
        let mut stmt = wrap_predicate(Stmt::Assign { target, value }, pred);
        for (key, shadowed, index, start, extent, unroll) in headers.into_iter().rev() {
            // The consumer loop over the same axis may already be open.
            match shadowed {
                Some(open) => self.loop_vars.insert(key, open),
                None => self.loop_vars.remove(&key),
            };
            stmt = Stmt::ForLoop {
                index,
                start,
                extent,
                unroll,
                body: vec![stmt],
            };
        }
        Ok(stmt)
    }

    fn lower_expr(&mut self, id: ExprId) -> FusionResult<()> {
        let fusion = self.fusion;
        let expr = fusion.expr(id)?;
        let Some(out) = expr.output() else {
            return Err(FusionError::unsupported(format!(
                "operation {} has {} outputs; kernels support one",
                expr.name,
                expr.outputs.len()
            )));
        };
        if !fusion.is_tensor(out) {
            return Ok(());
        }
        let view = fusion.tensor_view(out)?;
        let nest = self.loop_nest(out)?;
        let alloc_depth = view.compute_at_axis().unwrap_or(0);
        let is_global = self.globals.contains_key(&out);
        let reduction_init = match &expr.kind {
            ExprKind::Reduction { op, init } => Some((*op, self.lower_scalar(*init)?)),
            _ => None,
        };

        if !is_global || reduction_init.is_some() {
            let frame = self.frame_at(&nest[..alloc_depth])?;
            if !is_global {
                let stmt = Stmt::Allocate {
                    buffer: Buffer::Tensor(self.tensor_name(out)?),
                    dtype: view.dtype,
                    size: self.allocation_size(out)?,
                    init: None,
                };
                self.push(frame, stmt)?;
            }
            if let Some((_, init)) = &reduction_init {
                let stmt = self.init_nest(out, init.clone())?;
                self.push(frame, stmt)?;
            }
        }

        self.sync_to(&nest)?;
        let mut indices = self.leaf_indices(out, false)?;
        self.root_indices(out, &mut indices)?;
        let target = self.tensor_ref(out, &indices)?;
        let pred = self.predicate(out, &indices, false)?;

        let value = match (&expr.kind, expr.inputs.as_slice()) {
            (ExprKind::Unary(UnaryOp::RandLike), _) => KExpr::Rand,
            (ExprKind::Unary(op), [input]) => {
                KExpr::Unary(*op, view.dtype, Box::new(self.read(*input, out, &indices)?))
            }
            (ExprKind::Binary(op), [lhs, rhs]) => KExpr::binary(
                *op,
                self.read(*lhs, out, &indices)?,
                self.read(*rhs, out, &indices)?,
            ),
            (ExprKind::Ternary(op), [cond, on_true, on_false]) => KExpr::Ternary(
                *op,
                Box::new(self.read(*cond, out, &indices)?),
                Box::new(self.read(*on_true, out, &indices)?),
                Box::new(self.read(*on_false, out, &indices)?),
            ),
            (ExprKind::Broadcast { .. }, [input]) => self.read(*input, out, &indices)?,
            (ExprKind::Reduction { op, .. }, [input]) => {
                let input = self.read(*input, out, &indices)?;
                let init = reduction_init.map(|(_, init)| init).unwrap_or(KExpr::Int(0));
                return self.lower_reduction(out, *op, init, target, input, pred);
            }
            (kind, inputs) => {
                return Err(FusionError::integrity(format!(
                    "operation {} ({kind:?}) has {} inputs",
                    expr.name,
                    inputs.len()
                )))
            }
        };
        self.push_innermost(wrap_predicate(Stmt::Assign { target, value }, pred))
    }

    fn lower_reduction(
        &mut self,
        out: ValId,
        op: BinaryOp,
        init: KExpr,
        target: TensorRef,
        input: KExpr,
        pred: Option<KExpr>,
    ) -> FusionResult<()> {
        let fusion = self.fusion;
        let view = fusion.tensor_view(out)?;
        if !self.reduction_ops.contains(&(op, view.dtype)) {
            self.reduction_ops.push((op, view.dtype));
        }
        let reduced: Vec<&IterDomain> = view
            .domain
            .leaf
            .iter()
            .map(|id| fusion.iter_domain(*id))
            .collect::<FusionResult<Vec<_>>>()?
            .into_iter()
            .filter(|axis| axis.is_reduction())
            .collect();
        let threads = dim_flags(&reduced, ParallelType::is_thread);
        let blocks = dim_flags(&reduced, ParallelType::is_block);
        let block_reduce = threads.iter().any(|f| *f);
        let grid_reduce = blocks.iter().any(|f| *f);
        let dtype = view.dtype;

        match (block_reduce, grid_reduce) {
            (false, false) => {
                let value = KExpr::binary(op, KExpr::Load(target.clone()), input);
                self.push_innermost(wrap_predicate(Stmt::Assign { target, value }, pred))
            }
            (true, false) => {
                self.has_block_reduction = true;
                self.push_innermost(Stmt::BlockReduce {
                    op,
                    dtype,
                    threads,
                    target: ReduceTarget::Tensor(target),
                    input,
                    pred,
                })
            }
            (false, true) => {
                self.has_grid_reduction = true;
                self.push_innermost(Stmt::GridReduce {
                    op,
                    dtype,
                    blocks,
                    threads: [true; 3],
                    target,
                    input: Some(input),
                    pred,
                })
            }
            (true, true) => {
                self.has_block_reduction = true;
                self.has_grid_reduction = true;
                self.push_innermost(Stmt::Allocate {
                    buffer: Buffer::BlockResult,
                    dtype,
                    size: KExpr::Int(1),
                    init: Some(init),
                })?;
                self.push_innermost(Stmt::BlockReduce {
                    op,
                    dtype,
                    threads,
                    target: ReduceTarget::BlockResult,
                    input,
                    pred: pred.clone(),
                })?;
                self.push_innermost(Stmt::GridReduce {
                    op,
                    dtype,
                    blocks,
                    threads: threads.map(|reduced| !reduced),
                    target,
                    input: None,
                    pred,
                })
            }
        }
    }

    fn finish(mut self, name: &str) -> FusionResult<Kernel> {
        self.sync_to(&[])?;
        let root = self
            .frames
            .pop()
            .ok_or_else(|| FusionError::integrity("kernel body frame is missing"))?;
        Ok(Kernel {
            name: name.to_string(),
            params: self.params,
            reduction_ops: self.reduction_ops,
            has_rng: self.fusion.has_rng(),
            has_block_reduction: self.has_block_reduction,
            has_grid_reduction: self.has_grid_reduction,
            body: root.body,
        })
    }
}

/// Lowers the operations the outputs of `fusion` depend on into a kernel.
pub fn lower_fusion(fusion: &Fusion, name: &str, options: &KernelOptions) -> FusionResult<Kernel> {
    fusion.validate_inputs()?;
    if options.config.dump_fusion {
        debug!("lowering fusion {name}:\n{}", printer::print_math(fusion)?);
    }
    let mut lowering = Lowering::new(fusion)?;
    for expr in fusion.exprs(true, true)? {
        lowering.lower_expr(expr)?;
    }
    let kernel = lowering.finish(name)?;
    debug!(
        "lowered {name}: {} params, {} loops, {} predicates",
        kernel.params.len(),
        kernel.count_loops(),
        kernel.count_predicates()
    );
    Ok(kernel)
}

/// Kernel source text for `fusion`, using the environment's debug switches.
pub fn generate_kernel(fusion: &Fusion, name: &str) -> FusionResult<String> {
    generate_kernel_with(fusion, name, &KernelOptions::default())
}

pub fn generate_kernel_with(
    fusion: &Fusion,
    name: &str,
    options: &KernelOptions,
) -> FusionResult<String> {
    let kernel = lower_fusion(fusion, name, options)?;
    let source = printer::kernel_source(&kernel);
    if options.config.dump_kernel {
        info!("generated kernel {name}:\n{source}");
    }
    Ok(source)
}
