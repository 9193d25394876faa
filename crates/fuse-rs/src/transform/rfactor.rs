//! Reduction factorisation.
//!
//! `rfactor(tv, axes)` splits the reduction producing `tv` in two. A new
//! producer reduces every reduction axis of `tv` except the selected leaf
//! axes, which it keeps as iteration axes; `tv` then reduces the selected
//! axes of that partial result. The producer exposes the kept axes through
//! its rfactor domain so consumers see them as logical axes.

use std::collections::{HashMap, HashSet};

use log::debug;
use smallvec::smallvec;

use crate::error::{FusionError, FusionResult};
use crate::ir::{
    ExprKind, Fusion, IterDomainId, IterType, TensorDomain, TensorView, Transform, ValId,
};
use crate::transform::resolve_axis;

impl Fusion {
    /// Copies `id` as a fresh axis, optionally retyped.
    fn copy_axis(&mut self, id: IterDomainId, iter_type: Option<IterType>) -> FusionResult<IterDomainId> {
        let source = self.iter_domain(id)?.clone();
        Ok(self.push_iter_domain(
            source.start,
            source.extent,
            iter_type.unwrap_or(source.iter_type),
            source.parallel,
            source.rfactor_product,
        ))
    }

    /// Replays `history` on the axes already present in `map`, copying every
    /// produced axis. Transforms with unmapped inputs are skipped.
    fn copy_history(
        &mut self,
        history: &[Transform],
        map: &mut HashMap<IterDomainId, IterDomainId>,
    ) -> FusionResult<Vec<Transform>> {
        let mut replayed = Vec::new();
        for t in history {
            match *t {
                Transform::Split {
                    input,
                    outer,
                    inner,
                    factor,
                } => {
                    let Some(&new_input) = map.get(&input) else {
                        continue;
                    };
                    let new_outer = self.copy_axis(outer, None)?;
                    let new_inner = self.copy_axis(inner, None)?;
                    map.insert(outer, new_outer);
                    map.insert(inner, new_inner);
                    replayed.push(Transform::Split {
                        input: new_input,
                        outer: new_outer,
                        inner: new_inner,
                        factor,
                    });
                }
                Transform::Merge {
                    outer,
                    inner,
                    output,
                } => {
                    let (Some(&new_outer), Some(&new_inner)) = (map.get(&outer), map.get(&inner))
                    else {
                        continue;
                    };
                    let new_output = self.copy_axis(output, None)?;
                    map.insert(output, new_output);
                    replayed.push(Transform::Merge {
                        outer: new_outer,
                        inner: new_inner,
                        output: new_output,
                    });
                }
            }
        }
        Ok(replayed)
    }

    /// Factors the reduction producing `tv` over the reduction leaf `axes`.
    ///
    /// Returns the new producer, which keeps `axes` as iteration axes and
    /// reduces the remaining reduction axes; `tv` is rewired to reduce only
    /// over `axes`. The result can itself be factored again.
    pub fn rfactor(&mut self, tv: ValId, axes: &[i64]) -> FusionResult<ValId> {
        let origin = self.origin(tv).ok_or_else(|| {
            FusionError::unsupported(format!(
                "cannot rfactor {}: it is not produced by a reduction",
                self.label(tv)
            ))
        })?;
        let (op, init, input) = {
            let expr = self.expr(origin)?;
            match (&expr.kind, expr.output(), expr.inputs.as_slice()) {
                (ExprKind::Reduction { op, init }, Some(out), [input]) if out == tv => {
                    (*op, *init, *input)
                }
                _ => {
                    return Err(FusionError::unsupported(format!(
                        "cannot rfactor {}: it is not the sole output of a reduction",
                        self.label(tv)
                    )))
                }
            }
        };
        if self.compute_at_limit(tv)? > 0 {
            return Err(FusionError::unsupported(format!(
                "cannot rfactor {}: it already takes part in compute-at",
                self.label(tv)
            )));
        }
        let view = self.tensor_view(tv)?.clone();
        let domain = view.domain.clone();
        let ndims = domain.n_dims();

        let mut selected: HashSet<IterDomainId> = HashSet::new();
        for &axis in axes {
            let pos = resolve_axis(axis, ndims, &self.label(tv))?;
            let id = domain.leaf[pos];
            if !self.iter_domain(id)?.is_reduction() {
                return Err(FusionError::unsupported(format!(
                    "cannot rfactor axis {axis} of {}: it is not a reduction axis",
                    self.label(tv)
                )));
            }
            selected.insert(id);
        }
        if selected.is_empty() {
            return Err(FusionError::unsupported("rfactor needs at least one axis"));
        }
        let reduction_leaves = domain
            .leaf
            .iter()
            .filter(|id| self.iter_domains[id.index()].is_reduction())
            .count();
        if selected.len() == reduction_leaves {
            return Err(FusionError::unsupported(format!(
                "cannot rfactor every reduction axis of {}",
                self.label(tv)
            )));
        }

        // Producer: same schedule, selected axes turned into iteration axes.
        let mut to_producer: HashMap<IterDomainId, IterDomainId> = HashMap::new();
        let mut producer_root = Vec::with_capacity(domain.root.len());
        for id in &domain.root {
            let copy = self.copy_axis(*id, None)?;
            to_producer.insert(*id, copy);
            producer_root.push(copy);
        }
        let producer_history = self.copy_history(&domain.history, &mut to_producer)?;
        let mut producer_leaf = Vec::with_capacity(ndims);
        for id in &domain.leaf {
            let copy = to_producer.get(id).copied().ok_or_else(|| {
                FusionError::integrity(format!(
                    "leaf axis of {} is not derived from its root",
                    self.label(tv)
                ))
            })?;
            if selected.contains(id) {
                let axis = self.iter_domain_mut(copy)?;
                axis.iter_type = IterType::Iteration;
                axis.rfactor_product = true;
            }
            producer_leaf.push(copy);
        }

        // Logical axes of the producer, in root order.
        let root_position: HashMap<IterDomainId, usize> = domain
            .root
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect();
        let mut first_root: HashMap<IterDomainId, usize> = root_position.clone();
        for t in &domain.history {
            let from = t
                .inputs()
                .iter()
                .filter_map(|id| first_root.get(id).copied())
                .min()
                .unwrap_or(usize::MAX);
            for out in t.outputs() {
                first_root.insert(out, from);
            }
        }
        let mut logical: Vec<(usize, IterDomainId)> = Vec::new();
        for id in &domain.root {
            if !self.iter_domains[id.index()].is_reduction() {
                logical.push((root_position[id], *id));
            }
        }
        for id in &domain.leaf {
            if selected.contains(id) {
                logical.push((first_root.get(id).copied().unwrap_or(usize::MAX), *id));
            }
        }
        logical.sort_by_key(|(pos, _)| *pos);
        let producer_rfactor: Vec<IterDomainId> =
            logical.iter().map(|(_, id)| to_producer[id]).collect();

        // Consumer: reduces the selected axes of the producer's logical domain.
        let mut to_consumer: HashMap<IterDomainId, IterDomainId> = HashMap::new();
        let mut consumer_root = Vec::with_capacity(logical.len());
        for (_, id) in &logical {
            let iter_type = if selected.contains(id) {
                IterType::Reduction
            } else {
                self.iter_domain(*id)?.iter_type
            };
            let copy = self.copy_axis(*id, Some(iter_type))?;
            self.iter_domain_mut(copy)?.rfactor_product = false;
            to_consumer.insert(*id, copy);
            consumer_root.push(copy);
        }
        let consumer_history = self.copy_history(&domain.history, &mut to_consumer)?;
        let consumer_leaf: Vec<IterDomainId> = domain
            .leaf
            .iter()
            .filter_map(|id| to_consumer.get(id).copied())
            .collect();

        let producer = self.push_tensor(TensorView {
            dtype: view.dtype,
            domain: TensorDomain {
                root: producer_root,
                rfactor: Some(producer_rfactor),
                leaf: producer_leaf,
                history: producer_history,
            },
            compute_at: None,
        });
        self.tensor_view_mut(tv)?.domain = TensorDomain {
            root: consumer_root,
            rfactor: None,
            leaf: consumer_leaf,
            history: consumer_history,
        };

        self.remove_expr(origin)?;
        self.push_expr(
            ExprKind::Reduction { op, init },
            smallvec![input],
            smallvec![producer],
        )?;
        self.push_expr(
            ExprKind::Reduction { op, init },
            smallvec![producer],
            smallvec![tv],
        )?;
        debug!(
            "rfactored {} over {} axes into {}",
            self.label(tv),
            selected.len(),
            self.label(producer)
        );
        Ok(producer)
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{DataType, Fusion, ParallelType};

    #[test]
    fn rfactor_keeps_selected_axes_as_iteration() {
        let mut fusion = Fusion::new();
        let input = fusion.new_dims_tensor(2, DataType::Float);
        fusion.add_input(input).expect("input");
        let out = fusion.sum(input, &[1]).expect("sum");
        fusion.add_output(out).expect("output");
        fusion.split(out, 1, 128).expect("split");
        fusion.parallelize(out, 2, ParallelType::TIDx).expect("bind");

        let partial = fusion.rfactor(out, &[2]).expect("rfactor");
        let partial_tv = fusion.tensor_view(partial).expect("tensor");
        assert!(partial_tv.has_rfactor());
        let kinds: Vec<(bool, bool)> = partial_tv
            .domain
            .leaf
            .iter()
            .map(|id| {
                let axis = fusion.iter_domain(*id).expect("axis");
                (axis.is_reduction(), axis.rfactor_product)
            })
            .collect();
        assert_eq!(kinds, vec![(false, false), (true, false), (false, true)]);

        let out_tv = fusion.tensor_view(out).expect("tensor");
        assert_eq!(out_tv.n_dims(), 2);
        let reduced = fusion.iter_domain(out_tv.domain.leaf[1]).expect("axis");
        assert!(reduced.is_reduction());
        assert_eq!(reduced.parallel, ParallelType::TIDx);
    }

    #[test]
    fn rfactor_rejects_iteration_axes_and_full_selection() {
        let mut fusion = Fusion::new();
        let input = fusion.new_dims_tensor(2, DataType::Float);
        let out = fusion.sum(input, &[1]).expect("sum");
        assert!(fusion.rfactor(out, &[0]).is_err());
        assert!(fusion.rfactor(out, &[1]).is_err());
        assert!(fusion.rfactor(input, &[0]).is_err());
    }
}
