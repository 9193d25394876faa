//! Graph walks over a [`Fusion`]: forward (output to input) and backward
//! visitors, topological ordering and dependency queries.
//!
//! ## Forward walk
//!
//! [`traverse_from`] keeps an explicit stack of statement lists instead of
//! recursing. Each frame holds the not-yet-finished siblings of one level; the
//! last element of every frame is the statement currently being expanded.
//! A statement is handed to [`IterVisitor::handle`] when the walk returns to it
//! after all of its inputs have been handled, so handle order is a valid
//! topological order.
//!
//! The frames are passed to `handle`, which lets dependency analysis read the
//! current path without keeping its own bookkeeping.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;

use log::trace;

use crate::error::{FusionError, FusionResult};
use crate::ir::{ExprId, Fusion, Statement, ValId};

/// Callbacks of the forward walk.
pub trait IterVisitor {
    /// Called once per statement (once per path with `traverse_all_paths`).
    fn handle(&mut self, _fusion: &Fusion, _stmt: Statement, _stack: &[Vec<Statement>]) {}

    /// Statements to visit before `stmt`.
    fn next(
        &self,
        fusion: &Fusion,
        stmt: Statement,
        respect_compute_at: bool,
    ) -> FusionResult<Vec<Statement>> {
        default_next(fusion, stmt, respect_compute_at)
    }

    /// Stops the walk early once it returns `true`.
    fn is_done(&self) -> bool {
        false
    }
}

/// Producer-ward neighbours: a value's origin, an operation's inputs.
///
/// With `respect_compute_at`, inputs are stably sorted by how deep they are
/// computed inside the operation's output, so deeper nested producers come
/// later. Operations with several outputs have no single nest to sort against
/// and fail with [`FusionError::UnsupportedTransform`].
pub fn default_next(
    fusion: &Fusion,
    stmt: Statement,
    respect_compute_at: bool,
) -> FusionResult<Vec<Statement>> {
    let mut next = producers(fusion, stmt);
    let Statement::Expr(expr) = stmt else {
        return Ok(next);
    };
    if !respect_compute_at || next.is_empty() {
        return Ok(next);
    }
    let node = fusion.expr(expr)?;
    let Some(out) = node.output() else {
        return Err(FusionError::unsupported(format!(
            "operation {} has {} outputs; compute-at ordering needs exactly one",
            expr.index,
            node.outputs.len()
        )));
    };
    next.sort_by_key(|s| match s {
        Statement::Val(input) => compute_at_depth(fusion, *input, out),
        Statement::Expr(_) => -1,
    });
    Ok(next)
}

fn producers(fusion: &Fusion, stmt: Statement) -> Vec<Statement> {
    match stmt {
        Statement::Val(val) => fusion
            .origin(val)
            .map(|e| vec![Statement::Expr(e)])
            .unwrap_or_default(),
        Statement::Expr(expr) => fusion
            .expr(expr)
            .map(|node| node.inputs.iter().map(|v| Statement::Val(*v)).collect())
            .unwrap_or_default(),
    }
}

fn compute_at_depth(fusion: &Fusion, input: ValId, out: ValId) -> i64 {
    fusion
        .tensor_view(input)
        .ok()
        .and_then(|tv| tv.compute_at.as_ref())
        .filter(|ca| ca.view == out)
        .map_or(-1, |ca| ca.axis as i64)
}

fn walk_forward<V, E>(
    visitor: &mut V,
    fusion: &Fusion,
    from: &[ValId],
    traverse_all_paths: bool,
    mut next_of: impl FnMut(&V, Statement) -> Result<Vec<Statement>, E>,
) -> Result<(), E>
where
    V: IterVisitor + ?Sized,
{
    let mut visited: HashSet<Statement> = HashSet::new();
    let mut stack: Vec<Vec<Statement>> = vec![from.iter().rev().map(|v| Statement::Val(*v)).collect()];
    let mut all_inputs_visited = false;

    while !visitor.is_done() {
        let Some(frame) = stack.last_mut() else {
            break;
        };
        let Some(&stmt) = frame.last() else {
            stack.pop();
            all_inputs_visited = true;
            continue;
        };
        if !traverse_all_paths && visited.contains(&stmt) {
            frame.pop();
            all_inputs_visited = false;
            continue;
        }
        if all_inputs_visited {
            visited.insert(stmt);
            trace!("forward visit {}", fusion.statement_label(stmt));
            visitor.handle(fusion, stmt, &stack);
            if let Some(frame) = stack.last_mut() {
                frame.pop();
            }
            all_inputs_visited = false;
        } else {
            let mut next = next_of(&*visitor, stmt)?;
            if !traverse_all_paths {
                next.retain(|s| !visited.contains(s));
            }
            if next.is_empty() {
                all_inputs_visited = true;
            } else {
                stack.push(next.into_iter().rev().collect());
                all_inputs_visited = false;
            }
        }
    }
    Ok(())
}

/// Forward walk in plain input order; the visitor's `next` is not consulted.
fn walk_producers<V: IterVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    from: &[ValId],
    traverse_all_paths: bool,
) {
    let walked: Result<(), Infallible> =
        walk_forward(visitor, fusion, from, traverse_all_paths, |_, stmt| {
            Ok(producers(fusion, stmt))
        });
    if let Err(never) = walked {
        match never {}
    }
}

/// Walks from `from` toward the fusion inputs.
pub fn traverse_from<V: IterVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    from: &[ValId],
    traverse_all_paths: bool,
    respect_compute_at: bool,
) -> FusionResult<()> {
    walk_forward(visitor, fusion, from, traverse_all_paths, |v, stmt| {
        v.next(fusion, stmt, respect_compute_at)
    })
}

fn walk_roots(fusion: &Fusion, from_outputs_only: bool) -> Vec<ValId> {
    if from_outputs_only {
        fusion.terminating_outputs()
    } else {
        fusion
            .deterministic_vals()
            .iter()
            .copied()
            .filter(|v| !fusion.used(*v))
            .collect()
    }
}

/// Walks from the terminating outputs, or from every unused value.
pub fn traverse<V: IterVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    from_outputs_only: bool,
    traverse_all_paths: bool,
    respect_compute_at: bool,
) -> FusionResult<()> {
    let from = walk_roots(fusion, from_outputs_only);
    if from.is_empty() {
        return Ok(());
    }
    traverse_from(visitor, fusion, &from, traverse_all_paths, respect_compute_at)
}

#[derive(Default)]
struct ExprCollector {
    exprs: Vec<ExprId>,
}

impl IterVisitor for ExprCollector {
    fn handle(&mut self, _fusion: &Fusion, stmt: Statement, _stack: &[Vec<Statement>]) {
        if let Statement::Expr(e) = stmt {
            self.exprs.push(e);
        }
    }
}

/// Operations in topological order.
///
/// From the declared outputs only those required by the outputs appear;
/// otherwise every operation reachable from an unused value does.
pub fn topological_order(
    fusion: &Fusion,
    from_outputs_only: bool,
    respect_compute_at: bool,
) -> FusionResult<Vec<ExprId>> {
    let mut collector = ExprCollector::default();
    traverse(
        &mut collector,
        fusion,
        from_outputs_only,
        false,
        respect_compute_at,
    )?;
    Ok(collector.exprs)
}

/// Operations needed to compute `from`, in topological order.
pub fn exprs_from(
    fusion: &Fusion,
    from: &[ValId],
    respect_compute_at: bool,
) -> FusionResult<Vec<ExprId>> {
    let mut collector = ExprCollector::default();
    traverse_from(&mut collector, fusion, from, false, respect_compute_at)?;
    Ok(collector.exprs)
}

/// [`exprs_from`] in plain input order, which cannot fail.
pub fn required_exprs(fusion: &Fusion, from: &[ValId]) -> Vec<ExprId> {
    let mut collector = ExprCollector::default();
    walk_producers(&mut collector, fusion, from, false);
    collector.exprs
}

#[derive(Default)]
struct LeafCollector {
    leaves: Vec<ValId>,
}

impl IterVisitor for LeafCollector {
    fn handle(&mut self, fusion: &Fusion, stmt: Statement, _stack: &[Vec<Statement>]) {
        if let Statement::Val(v) = stmt {
            if fusion.origin(v).is_none() && !self.leaves.contains(&v) {
                self.leaves.push(v);
            }
        }
    }
}

/// Values without an origin that `vals` depend on, in discovery order.
pub fn inputs_of(fusion: &Fusion, vals: &[ValId]) -> Vec<ValId> {
    let mut collector = LeafCollector::default();
    walk_producers(&mut collector, fusion, vals, false);
    collector.leaves
}

#[derive(Default)]
struct ValCollector {
    vals: Vec<ValId>,
}

impl IterVisitor for ValCollector {
    fn handle(&mut self, _fusion: &Fusion, stmt: Statement, _stack: &[Vec<Statement>]) {
        if let Statement::Val(v) = stmt {
            self.vals.push(v);
        }
    }
}

/// Every value `from` depends on (including `from`), in topological order.
pub fn all_vals(fusion: &Fusion, from: &[ValId]) -> Vec<ValId> {
    let mut collector = ValCollector::default();
    walk_producers(&mut collector, fusion, from, false);
    collector.vals
}

// -------------------------------------------------------------------------
// Backward walk
// -------------------------------------------------------------------------

/// Callbacks of the backward walk.
pub trait BackwardVisitor {
    fn handle(&mut self, fusion: &Fusion, stmt: Statement, stack: &[Vec<Statement>]);
}

struct BackwardWalk {
    positions: HashMap<ExprId, usize>,
}

impl BackwardWalk {
    fn next(&self, fusion: &Fusion, stmt: Statement) -> Vec<Statement> {
        match stmt {
            Statement::Expr(expr) => fusion
                .expr(expr)
                .map(|e| e.outputs.iter().map(|v| Statement::Val(*v)).collect())
                .unwrap_or_default(),
            Statement::Val(val) => {
                let mut uses: Vec<(usize, ExprId)> = fusion
                    .unordered_uses(val)
                    .iter()
                    .filter_map(|e| self.positions.get(e).map(|pos| (*pos, *e)))
                    .collect();
                uses.sort_by_key(|(pos, _)| *pos);
                uses.into_iter().map(|(_, e)| Statement::Expr(e)).collect()
            }
        }
    }
}

/// Walks from the inputs of `from` toward `from`.
///
/// Statements are handed to the visitor consumers first: a value is handled
/// after every operation using it on the way to `from`. Sibling branches are
/// explored in forward topological order.
pub fn traverse_backward<V: BackwardVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    from: &[ValId],
    traverse_all_paths: bool,
) -> FusionResult<()> {
    if from.is_empty() {
        return Ok(());
    }
    let vals: HashSet<ValId> = all_vals(fusion, from).into_iter().collect();
    let exprs = required_exprs(fusion, from);
    for expr in &exprs {
        for out in &fusion.expr(*expr)?.outputs {
            if !vals.contains(out) {
                return Err(FusionError::integrity(format!(
                    "invalid backward traversal: output {} of a traversed operation is not reachable from the targets",
                    fusion.label(*out)
                )));
            }
        }
    }
    let walk = BackwardWalk {
        positions: exprs.iter().enumerate().map(|(pos, e)| (*e, pos)).collect(),
    };

    let inputs = inputs_of(fusion, from);
    let mut stack: Vec<Vec<Statement>> =
        vec![inputs.into_iter().rev().map(Statement::Val).collect()];
    let mut visited: HashSet<Statement> = HashSet::new();

    let prune = |next: &mut Vec<Statement>, visited: &HashSet<Statement>| {
        if !traverse_all_paths {
            next.retain(|s| !visited.contains(s));
        }
    };

    while let Some(&top) = stack.last().and_then(|frame| frame.last()) {
        let mut next = walk.next(fusion, top);
        prune(&mut next, &visited);
        while !next.is_empty() {
            stack.push(next.into_iter().rev().collect());
            let Some(&deeper) = stack.last().and_then(|frame| frame.last()) else {
                break;
            };
            next = walk.next(fusion, deeper);
            prune(&mut next, &visited);
        }

        handle_top(visitor, fusion, &mut stack, &mut visited, traverse_all_paths);
        while stack.last().is_some_and(|frame| frame.is_empty()) {
            stack.pop();
            if !stack.is_empty() {
                handle_top(visitor, fusion, &mut stack, &mut visited, traverse_all_paths);
            }
        }
    }
    Ok(())
}

fn handle_top<V: BackwardVisitor + ?Sized>(
    visitor: &mut V,
    fusion: &Fusion,
    stack: &mut [Vec<Statement>],
    visited: &mut HashSet<Statement>,
    traverse_all_paths: bool,
) {
    let Some(&stmt) = stack.last().and_then(|frame| frame.last()) else {
        return;
    };
    if traverse_all_paths || visited.insert(stmt) {
        trace!("backward visit {}", fusion.statement_label(stmt));
        visitor.handle(fusion, stmt, stack);
    }
    if let Some(frame) = stack.last_mut() {
        frame.pop();
    }
}

// -------------------------------------------------------------------------
// Dependency analysis
// -------------------------------------------------------------------------

struct DependencyChains {
    dependencies: HashSet<ValId>,
    chains: Vec<Vec<ValId>>,
    stop_at_first: bool,
}

impl DependencyChains {
    fn new(dependencies: impl IntoIterator<Item = ValId>, stop_at_first: bool) -> Self {
        Self {
            dependencies: dependencies.into_iter().collect(),
            chains: Vec::new(),
            stop_at_first,
        }
    }
}

impl IterVisitor for DependencyChains {
    fn handle(&mut self, _fusion: &Fusion, stmt: Statement, stack: &[Vec<Statement>]) {
        let Statement::Val(val) = stmt else {
            return;
        };
        if !self.dependencies.contains(&val) {
            return;
        }
        // Frame backs run from the walk origin down to `val`; chains are
        // reported dependency first.
        let chain: Vec<ValId> = stack
            .iter()
            .rev()
            .filter_map(|frame| match frame.last() {
                Some(Statement::Val(v)) => Some(*v),
                _ => None,
            })
            .collect();
        self.chains.push(chain);
    }

    fn is_done(&self) -> bool {
        self.stop_at_first && !self.chains.is_empty()
    }
}

/// Dependency queries between values of one fusion.
pub struct DependencyCheck;

impl DependencyCheck {
    /// True when `of` is computed from `dependency` (or is `dependency`).
    pub fn is_dependency_of(fusion: &Fusion, dependency: ValId, of: ValId) -> bool {
        !Self::single_dependency_chain(fusion, dependency, of).is_empty()
    }

    /// One path `dependency -> ... -> of`, both ends included; empty when
    /// `of` does not depend on `dependency`.
    pub fn single_dependency_chain(fusion: &Fusion, dependency: ValId, of: ValId) -> Vec<ValId> {
        let mut chains = DependencyChains::new([dependency], true);
        walk_producers(&mut chains, fusion, &[of], false);
        chains.chains.into_iter().next().unwrap_or_default()
    }

    /// Every path from `dependency` to `of`.
    pub fn all_dependency_chains(fusion: &Fusion, dependency: ValId, of: ValId) -> Vec<Vec<ValId>> {
        let mut chains = DependencyChains::new([dependency], false);
        walk_producers(&mut chains, fusion, &[of], true);
        chains.chains
    }

    /// Every maximal path obtained by repeatedly following uses of `dependency`.
    pub fn all_use_chains(fusion: &Fusion, dependency: ValId) -> Vec<Vec<ValId>> {
        Self::all_use_chains_of(fusion, &[dependency])
    }

    /// [`all_use_chains`](Self::all_use_chains) for several starting values.
    pub fn all_use_chains_of(fusion: &Fusion, dependencies: &[ValId]) -> Vec<Vec<ValId>> {
        if dependencies.is_empty() {
            return Vec::new();
        }
        let mut chains = DependencyChains::new(dependencies.iter().copied(), false);
        walk_producers(&mut chains, fusion, &walk_roots(fusion, false), true);
        chains.chains
    }

    /// Values lying on some path from one of `dependencies` to one of `of`,
    /// endpoints included, in topological order.
    pub fn all_vals_between(fusion: &Fusion, dependencies: &[ValId], of: &[ValId]) -> Vec<ValId> {
        let deps: HashSet<ValId> = dependencies.iter().copied().collect();
        let mut reaches: HashSet<ValId> = HashSet::new();
        let mut between = Vec::new();
        for val in all_vals(fusion, of) {
            let from_dep = deps.contains(&val)
                || fusion
                    .origin(val)
                    .and_then(|e| fusion.expr(e).ok())
                    .is_some_and(|e| e.inputs.iter().any(|i| reaches.contains(i)));
            if from_dep {
                reaches.insert(val);
                between.push(val);
            }
        }
        between
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::ir::{DataType, ExprKind, UnaryOp};

    #[test]
    fn compute_at_order_rejects_multi_output_operations() {
        let mut fusion = Fusion::new();
        let a = fusion.new_dims_tensor(1, DataType::Float);
        fusion.add_input(a).expect("input");
        let b = fusion.new_dims_tensor(1, DataType::Float);
        let c = fusion.new_dims_tensor(1, DataType::Float);
        fusion
            .push_expr(ExprKind::Unary(UnaryOp::Neg), smallvec![a], smallvec![b, c])
            .expect("expr");
        fusion.add_output(b).expect("output");
        fusion.add_output(c).expect("output");

        assert_eq!(topological_order(&fusion, true, false).expect("order").len(), 1);
        assert!(matches!(
            topological_order(&fusion, true, true),
            Err(FusionError::UnsupportedTransform(_))
        ));
        assert_eq!(required_exprs(&fusion, &[b]).len(), 1);
    }
}
