//! Loop-nest sharing between producers and consumers.
//!
//! `compute_at(tv, target, axis)` computes `tv` inside the first `axis` loops
//! of `target`. Every tensor on a dependency path from `tv` to `target` is
//! replayed as its successor on that path and nested in it, `tv` itself is
//! linked straight to `target`, and producers of `tv` are then pulled in as
//! deep as their deepest linked consumer allows.
//!
//! Only `tv` itself can be moved to a shallower position. Chain members and
//! propagated producers already nested in the same consumer at least as deep
//! as a new requirement keep their link. A propagated producer is never
//! nested deeper than the loops all of its consumers share; a link that no
//! longer satisfies this is pulled back out to the shared depth.

use std::collections::HashSet;

use log::debug;

use crate::error::{FusionError, FusionResult};
use crate::ir::{ComputeAt, Fusion, Statement, ValId};
use crate::traversal::{traverse_backward, BackwardVisitor, DependencyCheck};

/// Resolves a compute-at position; `-1` means "all axes".
fn resolve_depth(axis: i64, ndims: usize) -> FusionResult<usize> {
    let resolved = if axis < 0 {
        axis + ndims as i64 + 1
    } else {
        axis
    };
    if resolved < 0 || resolved > ndims as i64 {
        return Err(FusionError::unsupported(format!(
            "compute-at axis {axis} is out of range for a target with {ndims} axes"
        )));
    }
    Ok(resolved as usize)
}

#[derive(Default)]
struct ProducerOrder {
    vals: Vec<ValId>,
}

impl BackwardVisitor for ProducerOrder {
    fn handle(&mut self, _fusion: &Fusion, stmt: Statement, _stack: &[Vec<Statement>]) {
        if let Statement::Val(v) = stmt {
            self.vals.push(v);
        }
    }
}

impl Fusion {
    /// Position in the loop nest of `tv` of the loop iterating leaf `leaf_pos`.
    pub(crate) fn loop_position(&self, tv: ValId, leaf_pos: usize) -> FusionResult<usize> {
        Ok(match &self.tensor_view(tv)?.compute_at {
            Some(ca) if leaf_pos < ca.this_axis => ca.positions[leaf_pos],
            Some(ca) => ca.axis + (leaf_pos - ca.this_axis),
            None => leaf_pos,
        })
    }

    /// Number of loops of `tv` that enclose its first `depth` leaf axes.
    pub(crate) fn loop_depth(&self, tv: ValId, depth: usize) -> FusionResult<usize> {
        if depth == 0 {
            return Ok(0);
        }
        Ok(self.loop_position(tv, depth - 1)? + 1)
    }

    fn link(
        &mut self,
        tv: ValId,
        view: ValId,
        leaf_positions: &[usize],
        depth: usize,
    ) -> FusionResult<()> {
        let positions = leaf_positions
            .iter()
            .map(|pos| self.loop_position(view, *pos))
            .collect::<FusionResult<Vec<_>>>()?;
        let axis = self.loop_depth(view, depth)?;
        debug!(
            "{} computed at {} axis {axis} ({} shared axes)",
            self.label(tv),
            self.label(view),
            positions.len()
        );
        self.tensor_view_mut(tv)?.compute_at = Some(ComputeAt {
            view,
            axis,
            this_axis: positions.len(),
            positions,
        });
        Ok(())
    }

    /// Computes `tv` inside the first `axis` loops of `target`.
    ///
    /// A negative `axis` counts from the innermost loop: `-1` shares every
    /// loop of `target`. Returns `tv`.
    pub fn compute_at(&mut self, tv: ValId, target: ValId, axis: i64) -> FusionResult<ValId> {
        self.tensor_view(tv)?;
        let ndims = self.tensor_view(target)?.n_dims();
        if tv == target {
            return Err(FusionError::unsupported(format!(
                "cannot compute {} at itself",
                self.label(tv)
            )));
        }
        if self.is_output(tv) {
            return Err(FusionError::unsupported(format!(
                "{} is a fusion output and cannot be computed inside another tensor",
                self.label(tv)
            )));
        }
        if !DependencyCheck::is_dependency_of(self, tv, target) {
            return Err(FusionError::invalid_input(format!(
                "{} does not depend on {}",
                self.label(target),
                self.label(tv)
            )));
        }
        let depth = resolve_depth(axis, ndims)?;

        let mut seen = HashSet::new();
        let chains: Vec<Vec<ValId>> = DependencyCheck::all_dependency_chains(self, tv, target)
            .into_iter()
            .filter(|chain| seen.insert(chain.clone()))
            .collect();
        for chain in &chains {
            let mut inner = chain.iter().skip(1).take(chain.len().saturating_sub(2));
            if let Some(out) = inner.find(|v| self.is_output(**v)) {
                return Err(FusionError::unsupported(format!(
                    "cannot compute {} at {}: intermediate {} is a fusion output",
                    self.label(tv),
                    self.label(target),
                    self.label(*out)
                )));
            }
        }

        let requested = self.loop_depth(target, depth)?;
        let keep_existing = self
            .tensor_view(tv)?
            .compute_at
            .as_ref()
            .is_some_and(|ca| ca.view == target && ca.axis >= requested);
        if keep_existing {
            debug!(
                "{} already computed at {} deeper than axis {depth}",
                self.label(tv),
                self.label(target)
            );
        }
        for chain in &chains {
            self.link_chain(chain, depth, keep_existing)?;
        }
        self.propagate_to_producers(tv)?;
        Ok(tv)
    }

    /// Links every member of `tv -> ... -> target` to its successor, and the
    /// head straight to `target` with positions composed along the chain.
    fn link_chain(&mut self, chain: &[ValId], depth: usize, keep_head: bool) -> FusionResult<()> {
        let (Some(&head), Some(&target)) = (chain.first(), chain.last()) else {
            return Ok(());
        };
        let mut consumer = target;
        let mut consumer_depth = depth;
        let mut to_target: Vec<usize> = (0..depth).collect();
        for &producer in chain[..chain.len() - 1].iter().rev() {
            if producer == head && keep_head {
                break;
            }
            let positions = match self.deeper_link(producer, consumer, consumer_depth)? {
                Some(kept) if producer != head => kept,
                _ => {
                    let positions = self.replay_as_consumer(producer, consumer, consumer_depth)?;
                    if producer != head {
                        self.link(producer, consumer, &positions, consumer_depth)?;
                    }
                    positions
                }
            };
            let composed: Vec<usize> = positions.iter().map(|pos| to_target[*pos]).collect();
            if producer == head {
                self.link(producer, target, &composed, depth)?;
            }
            consumer = producer;
            consumer_depth = positions.len();
            to_target = composed;
        }
        Ok(())
    }

    /// Consumer leaf positions mirrored by `producer` when it is already
    /// computed inside `consumer` at least `depth` leaf axes deep.
    fn deeper_link(
        &self,
        producer: ValId,
        consumer: ValId,
        depth: usize,
    ) -> FusionResult<Option<Vec<usize>>> {
        let requested = self.loop_depth(consumer, depth)?;
        let Some(ca) = &self.tensor_view(producer)?.compute_at else {
            return Ok(None);
        };
        if ca.view != consumer || ca.axis < requested {
            return Ok(None);
        }
        let loops = (0..depth)
            .map(|leaf| self.loop_position(consumer, leaf))
            .collect::<FusionResult<Vec<_>>>()?;
        Ok(Some(
            ca.positions
                .iter()
                .map_while(|pos| loops.iter().position(|l| l == pos))
                .collect(),
        ))
    }

    /// Nests every computed producer of `tv` in its deepest linked consumer.
    fn propagate_to_producers(&mut self, tv: ValId) -> FusionResult<()> {
        let mut order = ProducerOrder::default();
        traverse_backward(&mut order, self, &[tv], false)?;
        let members: HashSet<ValId> = order.vals.iter().copied().collect();
        for producer in order.vals {
            if producer == tv
                || !self.is_tensor(producer)
                || self.origin(producer).is_none()
                || self.is_output(producer)
            {
                continue;
            }
            let Some((consumer, mut depth)) = self.deepest_linked_consumer(producer, &members)?
            else {
                continue;
            };
            let loops = self.loop_keys(consumer)?;
            let wanted = self.loop_depth(consumer, depth)?;
            let shared = self.shared_by_consumers(producer, &loops[..wanted])?;
            while depth > 0 && self.loop_depth(consumer, depth)? > shared {
                depth -= 1;
            }
            let requested = self.loop_depth(consumer, depth)?;
            let existing = self.tensor_view(producer)?.compute_at_axis();
            let enclosed = self.link_is_enclosed(producer)?;
            if enclosed && existing.is_some_and(|axis| axis >= requested) {
                continue;
            }
            if depth == 0 {
                if !enclosed {
                    debug!(
                        "{} no longer fits inside the loops of all its consumers; unlinked",
                        self.label(producer)
                    );
                    self.tensor_view_mut(producer)?.compute_at = None;
                }
                continue;
            }
            let positions = self.replay_as_consumer(producer, consumer, depth)?;
            self.link(producer, consumer, &positions, depth)?;
        }
        Ok(())
    }

    /// Loops around every leaf of `tv`, outermost first, each named by the
    /// tensor and leaf position that opens it.
    fn loop_keys(&self, tv: ValId) -> FusionResult<Vec<(ValId, usize)>> {
        let view = self.tensor_view(tv)?;
        let mut keys = match &view.compute_at {
            Some(ca) => {
                let mut host = self.loop_keys(ca.view)?;
                host.truncate(ca.axis);
                host
            }
            None => Vec::new(),
        };
        keys.extend((view.this_compute_at_axis()..view.n_dims()).map(|pos| (tv, pos)));
        Ok(keys)
    }

    /// Length of the prefix of `loops` that every tensor consumer of
    /// `producer` runs inside.
    fn shared_by_consumers(&self, producer: ValId, loops: &[(ValId, usize)]) -> FusionResult<usize> {
        let mut shared = loops.len();
        for expr in self.unordered_uses(producer) {
            for out in &self.expr(*expr)?.outputs {
                if !self.is_tensor(*out) {
                    continue;
                }
                let keys = self.loop_keys(*out)?;
                let common = keys.iter().zip(loops).take_while(|(a, b)| a == b).count();
                shared = shared.min(common);
            }
        }
        Ok(shared)
    }

    /// Whether the loops `tv` is currently computed in enclose all of its
    /// consumers.
    fn link_is_enclosed(&self, tv: ValId) -> FusionResult<bool> {
        let Some(ca) = self.tensor_view(tv)?.compute_at.clone() else {
            return Ok(true);
        };
        let mut loops = self.loop_keys(ca.view)?;
        loops.truncate(ca.axis);
        Ok(self.shared_by_consumers(tv, &loops)? == loops.len())
    }

    /// Direct consumer among `members` with the most shared axes; the first
    /// one found wins ties.
    fn deepest_linked_consumer(
        &self,
        producer: ValId,
        members: &HashSet<ValId>,
    ) -> FusionResult<Option<(ValId, usize)>> {
        let mut best: Option<(ValId, usize)> = None;
        for expr in self.unordered_uses(producer) {
            for out in &self.expr(*expr)?.outputs {
                if !members.contains(out) {
                    continue;
                }
                let Ok(consumer) = self.tensor_view(*out) else {
                    continue;
                };
                let shared = consumer.this_compute_at_axis();
                if consumer.compute_at.is_some()
                    && shared > 0
                    && best.map_or(true, |(_, deepest)| shared > deepest)
                {
                    best = Some((*out, shared));
                }
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::resolve_depth;

    #[test]
    fn negative_depth_counts_from_the_innermost_loop() {
        assert_eq!(resolve_depth(-1, 3).unwrap(), 3);
        assert_eq!(resolve_depth(-4, 3).unwrap(), 0);
        assert_eq!(resolve_depth(2, 3).unwrap(), 2);
        assert!(resolve_depth(4, 3).is_err());
        assert!(resolve_depth(-5, 3).is_err());
    }
}
