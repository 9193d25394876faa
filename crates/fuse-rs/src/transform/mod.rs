//! Scheduling transforms on tensor domains.
//!
//! `split`, `merge` and `reorder` rewrite the leaf axes of one tensor and
//! record split/merge steps in its domain history so the same iteration
//! structure can later be replayed on related tensors. [`compute_at`] and
//! [`rfactor`] build on that replay.
//!
//! Axes that are shared with another tensor's loop nest through a compute-at
//! link are frozen: rewriting them would silently desynchronise the two loop
//! nests.

pub mod compute_at;
pub mod replay;
pub mod rfactor;

use log::debug;

use crate::error::{FusionError, FusionResult};
use crate::ir::{Fusion, IterType, ParallelType, Transform, ValId};

/// Resolves a possibly negative axis against `ndims` axes.
pub(crate) fn resolve_axis(axis: i64, ndims: usize, what: &str) -> FusionResult<usize> {
    let resolved = if axis < 0 { axis + ndims as i64 } else { axis };
    if resolved < 0 || resolved >= ndims as i64 {
        return Err(FusionError::unsupported(format!(
            "axis {axis} is out of range for {what} with {ndims} axes"
        )));
    }
    Ok(resolved as usize)
}

/// Leaf permutation described by an `old -> new` map; unspecified axes keep
/// their relative order and fill the remaining slots.
pub(crate) fn reorder_permutation(ndims: usize, map: &[(i64, i64)]) -> FusionResult<Vec<usize>> {
    let mut new_to_old: Vec<Option<usize>> = vec![None; ndims];
    let mut old_used = vec![false; ndims];
    for &(old, new) in map {
        let old = resolve_axis(old, ndims, "reorder source")?;
        let new = resolve_axis(new, ndims, "reorder target")?;
        if old_used[old] || new_to_old[new].is_some() {
            return Err(FusionError::unsupported(format!(
                "reorder map moves axis {old} or fills slot {new} more than once"
            )));
        }
        old_used[old] = true;
        new_to_old[new] = Some(old);
    }
    let mut remaining = (0..ndims).filter(|old| !old_used[*old]);
    new_to_old
        .into_iter()
        .map(|slot| {
            slot.or_else(|| remaining.next())
                .ok_or_else(|| FusionError::unsupported("reorder map is inconsistent"))
        })
        .collect()
}

impl Fusion {
    /// Number of leading leaf axes of `tv` that take part in a compute-at
    /// relation, inbound or outbound.
    pub(crate) fn compute_at_limit(&self, tv: ValId) -> FusionResult<usize> {
        let own = self.tensor_view(tv)?.this_compute_at_axis();
        let inbound = self
            .deterministic_vals()
            .iter()
            .filter_map(|v| self.val(*v).ok()?.as_tensor())
            .filter_map(|other| other.compute_at.as_ref())
            .filter(|ca| ca.view == tv)
            .map(|ca| ca.axis)
            .max()
            .unwrap_or(0);
        Ok(own.max(inbound))
    }

    fn check_free_axis(&self, tv: ValId, axis: usize, op: &str) -> FusionResult<()> {
        if axis < self.compute_at_limit(tv)? {
            return Err(FusionError::unsupported(format!(
                "cannot {op} axis {axis} of {}: it is shared through compute-at",
                self.label(tv)
            )));
        }
        Ok(())
    }

    /// Splits leaf `axis` of `tv` into `[ceilDiv(extent, factor), factor]`.
    pub fn split(&mut self, tv: ValId, axis: i64, factor: i64) -> FusionResult<ValId> {
        let ndims = self.tensor_view(tv)?.n_dims();
        let axis = resolve_axis(axis, ndims, &self.label(tv))?;
        if factor <= 0 {
            return Err(FusionError::unsupported(format!(
                "split factor must be positive, got {factor}"
            )));
        }
        self.check_free_axis(tv, axis, "split")?;
        let input = self.tensor_view(tv)?.domain.leaf[axis];
        let source = self.iter_domain(input)?.clone();
        if self.scalar(source.start)?.as_int() != Some(0) {
            return Err(FusionError::unsupported(format!(
                "cannot split axis {axis} of {}: it has a non-zero start",
                self.label(tv)
            )));
        }
        let factor_val = self.new_int(factor);
        let outer_extent = self.ceil_div(source.extent, factor_val)?;
        let outer = self.push_iter_domain(
            source.start,
            outer_extent,
            source.iter_type,
            source.parallel,
            source.rfactor_product,
        );
        let inner = self.push_iter_domain(
            source.start,
            factor_val,
            source.iter_type,
            source.parallel,
            source.rfactor_product,
        );
        let domain = &mut self.tensor_view_mut(tv)?.domain;
        domain.leaf.splice(axis..=axis, [outer, inner]);
        domain.history.push(Transform::Split {
            input,
            outer,
            inner,
            factor: factor_val,
        });
        debug!("split {} axis {axis} by {factor}", self.label(tv));
        Ok(tv)
    }

    /// Merges leaf axes `axis` and `axis + 1` of `tv` into one.
    pub fn merge(&mut self, tv: ValId, axis: i64) -> FusionResult<ValId> {
        let ndims = self.tensor_view(tv)?.n_dims();
        let axis = resolve_axis(axis, ndims, &self.label(tv))?;
        if axis + 1 >= ndims {
            return Err(FusionError::unsupported(format!(
                "cannot merge axis {axis} of {}: there is no following axis",
                self.label(tv)
            )));
        }
        self.check_free_axis(tv, axis, "merge")?;
        let (outer, inner, history_split) = {
            let domain = &self.tensor_view(tv)?.domain;
            let outer = domain.leaf[axis];
            let inner = domain.leaf[axis + 1];
            let split_source = domain.history.iter().find_map(|t| match *t {
                Transform::Split {
                    input,
                    outer: o,
                    inner: i,
                    ..
                } if o == outer && i == inner => Some(input),
                _ => None,
            });
            (outer, inner, split_source)
        };
        let outer_dom = self.iter_domain(outer)?.clone();
        let inner_dom = self.iter_domain(inner)?.clone();
        if outer_dom.is_reduction() != inner_dom.is_reduction() {
            return Err(FusionError::unsupported(format!(
                "cannot merge a reduction axis with an iteration axis in {}",
                self.label(tv)
            )));
        }
        let iter_type = match (outer_dom.iter_type, inner_dom.iter_type) {
            (IterType::Broadcast, IterType::Broadcast) => IterType::Broadcast,
            (IterType::Reduction, _) => IterType::Reduction,
            _ => IterType::Iteration,
        };
        let extent = match history_split {
            Some(source) => self.iter_domain(source)?.extent,
            None => self.mul(outer_dom.extent, inner_dom.extent)?,
        };
        let output = self.push_iter_domain(
            outer_dom.start,
            extent,
            iter_type,
            ParallelType::Serial,
            outer_dom.rfactor_product || inner_dom.rfactor_product,
        );
        let domain = &mut self.tensor_view_mut(tv)?.domain;
        domain.leaf.splice(axis..=axis + 1, [output]);
        domain.history.push(Transform::Merge {
            outer,
            inner,
            output,
        });
        debug!("merged {} axes {axis} and {}", self.label(tv), axis + 1);
        Ok(tv)
    }

    /// Permutes the leaf axes of `tv` by an `old -> new` position map.
    pub fn reorder(&mut self, tv: ValId, map: &[(i64, i64)]) -> FusionResult<ValId> {
        let ndims = self.tensor_view(tv)?.n_dims();
        let permutation = reorder_permutation(ndims, map)?;
        let frozen = self.compute_at_limit(tv)?;
        if let Some(moved) = (0..frozen.min(ndims)).find(|pos| permutation[*pos] != *pos) {
            return Err(FusionError::unsupported(format!(
                "cannot reorder axis {moved} of {}: it is shared through compute-at",
                self.label(tv)
            )));
        }
        let domain = &mut self.tensor_view_mut(tv)?.domain;
        domain.leaf = permutation.iter().map(|old| domain.leaf[*old]).collect();
        Ok(tv)
    }

    /// Binds leaf `axis` of `tv` to a parallel dimension or loop kind.
    pub fn parallelize(
        &mut self,
        tv: ValId,
        axis: i64,
        parallel: ParallelType,
    ) -> FusionResult<ValId> {
        let ndims = self.tensor_view(tv)?.n_dims();
        let axis = resolve_axis(axis, ndims, &self.label(tv))?;
        let id = self.tensor_view(tv)?.domain.leaf[axis];
        self.iter_domain_mut(id)?.parallel = parallel;
        Ok(tv)
    }
}

#[cfg(test)]
mod tests {
    use super::reorder_permutation;

    #[test]
    fn reorder_fills_unspecified_slots_in_order() {
        assert_eq!(reorder_permutation(3, &[(0, -1)]).unwrap(), vec![1, 2, 0]);
        assert_eq!(reorder_permutation(3, &[(-1, 0)]).unwrap(), vec![2, 0, 1]);
        assert_eq!(
            reorder_permutation(3, &[(0, 2), (2, 0)]).unwrap(),
            vec![2, 1, 0]
        );
        assert_eq!(
            reorder_permutation(4, &[(1, 3)]).unwrap(),
            vec![0, 2, 3, 1]
        );
    }

    #[test]
    fn reorder_rejects_conflicting_targets() {
        assert!(reorder_permutation(3, &[(0, 1), (2, 1)]).is_err());
        assert!(reorder_permutation(3, &[(0, 3)]).is_err());
    }
}
