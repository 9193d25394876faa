//! Replaying the schedule of a consumer onto one of its producers.
//!
//! A producer and its consumer line up through their root axes: the
//! producer's logical non-reduction axes pair positionally with the consumer's
//! root axes (minus the axes a broadcast inserted). Starting from that pairing
//! the consumer's splits and merges are re-applied to the producer's axes so
//! that both end up with identical outer loops.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::{FusionError, FusionResult};
use crate::ir::{ExprKind, Fusion, IterType, IterDomainId, Transform, ValId};

/// Marks the transforms of `history` that lead to any of `targets`.
fn ancestors_of(history: &[Transform], targets: &[IterDomainId]) -> Vec<bool> {
    let mut wanted: HashSet<IterDomainId> = targets.iter().copied().collect();
    let mut needed = vec![false; history.len()];
    for (index, t) in history.iter().enumerate().rev() {
        if t.outputs().iter().any(|out| wanted.contains(out)) {
            needed[index] = true;
            wanted.extend(t.inputs());
        }
    }
    needed
}

/// Applies `t` to `frontier` if all of its inputs are present.
fn apply_to_frontier(frontier: &mut Vec<IterDomainId>, t: &Transform) -> bool {
    match *t {
        Transform::Split {
            input,
            outer,
            inner,
            ..
        } => match frontier.iter().position(|id| *id == input) {
            Some(pos) => {
                frontier.splice(pos..=pos, [outer, inner]);
                true
            }
            None => false,
        },
        Transform::Merge {
            outer,
            inner,
            output,
        } => {
            let (Some(o), Some(i)) = (
                frontier.iter().position(|id| *id == outer),
                frontier.iter().position(|id| *id == inner),
            ) else {
                return false;
            };
            frontier[o] = output;
            frontier.remove(i);
            true
        }
    }
}

impl Fusion {
    /// Pairs `(producer axis, consumer root axis)` for a direct producer.
    pub(crate) fn root_map(
        &self,
        producer: ValId,
        consumer: ValId,
    ) -> FusionResult<Vec<(IterDomainId, IterDomainId)>> {
        let producer_axes = self.no_reduction_logical(producer)?;
        let consumer_root = &self.tensor_view(consumer)?.domain.root;
        let mut inserted = vec![false; consumer_root.len()];
        if let Some(origin) = self.origin(consumer) {
            let expr = self.expr(origin)?;
            if let ExprKind::Broadcast { is_broadcast_dim } = &expr.kind {
                if expr.inputs.contains(&producer) {
                    inserted.clone_from(is_broadcast_dim);
                }
            }
        }
        let consumer_axes: Vec<IterDomainId> = consumer_root
            .iter()
            .zip(inserted)
            .filter(|(_, inserted)| !inserted)
            .map(|(id, _)| *id)
            .collect();
        if consumer_axes.len() != producer_axes.len() {
            return Err(FusionError::integrity(format!(
                "{} has {} logical axes but its consumer {} maps {}",
                self.label(producer),
                producer_axes.len(),
                self.label(consumer),
                consumer_axes.len()
            )));
        }
        Ok(producer_axes.into_iter().zip(consumer_axes).collect())
    }

    /// Rewrites the leaf domain of `producer` so that its leading axes repeat
    /// the first `depth` leaf axes of `consumer`.
    ///
    /// Returns, for every shared leading producer axis, the consumer leaf
    /// position it mirrors. Consumer axes with no producer counterpart (for
    /// example broadcast axes) are skipped, so the result can be shorter than
    /// `depth`. Producer axes outside the shared prefix keep their previous
    /// schedule where it is still reachable.
    pub(crate) fn replay_as_consumer(
        &mut self,
        producer: ValId,
        consumer: ValId,
        depth: usize,
    ) -> FusionResult<Vec<usize>> {
        let consumer_domain = self.tensor_view(consumer)?.domain.clone();
        if depth > consumer_domain.n_dims() {
            return Err(FusionError::unsupported(format!(
                "cannot replay {} at depth {depth}: {} has {} axes",
                self.label(producer),
                self.label(consumer),
                consumer_domain.n_dims()
            )));
        }
        let producer_domain = self.tensor_view(producer)?.domain.clone();

        // consumer axis -> producer axis
        let mut image: HashMap<IterDomainId, IterDomainId> = self
            .root_map(producer, consumer)?
            .into_iter()
            .map(|(p, c)| (c, p))
            .collect();

        let mut frontier = producer_domain.root.clone();
        let mut history = Vec::new();
        let mut applied = vec![false; producer_domain.history.len()];
        if let Some(rfactor) = &producer_domain.rfactor {
            let needed = ancestors_of(&producer_domain.history, rfactor);
            for (index, t) in producer_domain.history.iter().enumerate() {
                if needed[index] && apply_to_frontier(&mut frontier, t) {
                    applied[index] = true;
                    history.push(*t);
                }
            }
        }

        let needed = ancestors_of(&consumer_domain.history, &consumer_domain.leaf[..depth]);
        for (t, needed) in consumer_domain.history.iter().zip(needed) {
            if !needed {
                continue;
            }
            let mapped = |id: IterDomainId| image.get(&id).copied().filter(|p| frontier.contains(p));
            match *t {
                Transform::Split {
                    input,
                    outer,
                    inner,
                    factor,
                } => {
                    let Some(source) = mapped(input) else {
                        continue;
                    };
                    let source_dom = self.iter_domain(source)?.clone();
                    let outer_dom = self.iter_domain(outer)?.clone();
                    let inner_dom = self.iter_domain(inner)?.clone();
                    let new_outer = self.push_iter_domain(
                        source_dom.start,
                        outer_dom.extent,
                        source_dom.iter_type,
                        outer_dom.parallel,
                        source_dom.rfactor_product,
                    );
                    let new_inner = self.push_iter_domain(
                        source_dom.start,
                        inner_dom.extent,
                        source_dom.iter_type,
                        inner_dom.parallel,
                        source_dom.rfactor_product,
                    );
                    let replayed = Transform::Split {
                        input: source,
                        outer: new_outer,
                        inner: new_inner,
                        factor,
                    };
                    apply_to_frontier(&mut frontier, &replayed);
                    history.push(replayed);
                    image.insert(outer, new_outer);
                    image.insert(inner, new_inner);
                }
                Transform::Merge {
                    outer,
                    inner,
                    output,
                } => match (mapped(outer), mapped(inner)) {
                    (Some(p_outer), Some(p_inner)) => {
                        let outer_dom = self.iter_domain(p_outer)?.clone();
                        let inner_dom = self.iter_domain(p_inner)?.clone();
                        let output_dom = self.iter_domain(output)?.clone();
                        let iter_type = if outer_dom.is_broadcast() && inner_dom.is_broadcast() {
                            IterType::Broadcast
                        } else {
                            IterType::Iteration
                        };
                        let merged = self.push_iter_domain(
                            outer_dom.start,
                            output_dom.extent,
                            iter_type,
                            output_dom.parallel,
                            outer_dom.rfactor_product || inner_dom.rfactor_product,
                        );
                        let replayed = Transform::Merge {
                            outer: p_outer,
                            inner: p_inner,
                            output: merged,
                        };
                        apply_to_frontier(&mut frontier, &replayed);
                        history.push(replayed);
                        image.insert(output, merged);
                    }
                    (Some(only), None) | (None, Some(only)) => {
                        image.insert(output, only);
                    }
                    (None, None) => {}
                },
            }
        }

        let mut prefix = Vec::new();
        let mut positions = Vec::new();
        for (pos, id) in consumer_domain.leaf[..depth].iter().enumerate() {
            if let Some(p) = image.get(id) {
                if frontier.contains(p) && !prefix.contains(p) {
                    prefix.push(*p);
                    positions.push(pos);
                }
            }
        }

        // Keep whatever part of the producer's own schedule is untouched.
        for (index, t) in producer_domain.history.iter().enumerate() {
            if applied[index] || t.inputs().iter().any(|id| prefix.contains(id)) {
                continue;
            }
            if apply_to_frontier(&mut frontier, t) {
                history.push(*t);
            }
        }

        let old_positions: HashMap<IterDomainId, usize> = producer_domain
            .leaf
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect();
        let mut rest: Vec<IterDomainId> = frontier
            .into_iter()
            .filter(|id| !prefix.contains(id))
            .collect();
        rest.sort_by_key(|id| old_positions.get(id).copied().unwrap_or(usize::MAX));
        let leaf: Vec<IterDomainId> = prefix.into_iter().chain(rest).collect();

        let domain = &mut self.tensor_view_mut(producer)?.domain;
        domain.leaf = leaf;
        domain.history = history;
        self.drop_links_into(producer)?;
        debug!(
            "replayed {} as {} at depth {depth}: shared positions {positions:?}",
            self.label(producer),
            self.label(consumer)
        );
        Ok(positions)
    }

    /// Clears compute-at links hosted by `view`, whose leaf domain changed.
    fn drop_links_into(&mut self, view: ValId) -> FusionResult<()> {
        let linked: Vec<ValId> = self
            .deterministic_vals()
            .iter()
            .copied()
            .filter(|v| {
                self.tensor_view(*v)
                    .is_ok_and(|tv| tv.compute_at_view() == Some(view))
            })
            .collect();
        for tv in linked {
            debug!(
                "dropping compute-at link of {} into rescheduled {}",
                self.label(tv),
                self.label(view)
            );
            self.tensor_view_mut(tv)?.compute_at = None;
        }
        Ok(())
    }
}
