use fuse_rs::ir::{IterDomainId, Transform, ValId};
use fuse_rs::printer::{print_tensor_view, print_transforms};
use fuse_rs::{generate_kernel, DataType, Fusion, FusionError, ParallelType};

fn leaf(fusion: &Fusion, tv: ValId) -> Vec<IterDomainId> {
    fusion.tensor_view(tv).expect("tensor").domain.leaf.clone()
}

/// `T3 = abs(exp(neg(T0)))` over a rank-2 input.
fn unary_chain() -> (Fusion, [ValId; 4]) {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.neg(tv0).expect("neg");
    let tv2 = fusion.exp(tv1).expect("exp");
    let tv3 = fusion.abs(tv2).expect("abs");
    fusion.add_output(tv3).expect("output");
    (fusion, [tv0, tv1, tv2, tv3])
}

#[test]
fn split_produces_outer_and_factor_axes() {
    let (mut fusion, [_, _, _, tv3]) = unary_chain();
    let before = leaf(&fusion, tv3);
    fusion.split(tv3, -1, 4).expect("split");
    let after = leaf(&fusion, tv3);
    assert_eq!(after.len(), 3);
    assert_eq!(after[0], before[0]);

    let view = fusion.tensor_view(tv3).expect("tensor");
    match view.domain.history.as_slice() {
        [Transform::Split { input, outer, inner, .. }] => {
            assert_eq!(*input, before[1]);
            assert_eq!(*outer, after[1]);
            assert_eq!(*inner, after[2]);
        }
        other => panic!("unexpected history {other:?}"),
    }
    let inner = fusion.iter_domain(after[2]).expect("axis");
    assert_eq!(fusion.scalar(inner.extent).expect("scalar").as_int(), Some(4));

    let printed = print_transforms(&fusion).expect("print");
    assert!(printed.contains("T3:"), "got {printed}");
    assert!(printed.contains("Split: iS{i3} by factor 4 -> "), "got {printed}");
}

#[test]
fn split_rejects_bad_arguments() {
    let (mut fusion, [_, _, _, tv3]) = unary_chain();
    assert!(matches!(
        fusion.split(tv3, 2, 4),
        Err(FusionError::UnsupportedTransform(_))
    ));
    assert!(fusion.split(tv3, 0, 0).is_err());
    assert!(fusion.split(tv3, -3, 2).is_err());
}

#[test]
fn merge_of_a_split_restores_the_original_extent() {
    let (mut fusion, [_, _, _, tv3]) = unary_chain();
    let original = fusion.iter_domain(leaf(&fusion, tv3)[1]).expect("axis").extent;
    fusion.split(tv3, 1, 8).expect("split");
    fusion.merge(tv3, 1).expect("merge");
    let merged = fusion.iter_domain(leaf(&fusion, tv3)[1]).expect("axis").clone();
    assert_eq!(merged.extent, original);
    assert!(fusion.merge(tv3, 1).is_err(), "no axis follows the last one");

    fusion.merge(tv3, 0).expect("merge");
    assert_eq!(leaf(&fusion, tv3).len(), 1);
    let flat = fusion.iter_domain(leaf(&fusion, tv3)[0]).expect("axis");
    assert!(fusion.origin(flat.extent).is_some(), "merged extent is a product");
}

#[test]
fn merge_keeps_reduction_and_iteration_apart() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(3, DataType::Float);
    let tv1 = fusion.sum(tv0, &[1]).expect("sum");
    assert!(fusion.merge(tv1, 0).is_err());
    assert!(fusion.merge(tv1, 1).is_err());
}

#[test]
fn reorder_moves_axes_and_fills_the_rest_in_order() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(4, DataType::Float);
    let before = leaf(&fusion, tv0);
    fusion.reorder(tv0, &[(0, -1)]).expect("reorder");
    assert_eq!(
        leaf(&fusion, tv0),
        vec![before[1], before[2], before[3], before[0]]
    );
    fusion.reorder(tv0, &[(3, 0), (0, 3)]).expect("reorder");
    assert_eq!(
        leaf(&fusion, tv0),
        vec![before[0], before[2], before[3], before[1]]
    );
    assert!(fusion.reorder(tv0, &[(0, 1), (1, 1)]).is_err());
}

#[test]
fn compute_at_replays_the_consumer_schedule() {
    let (mut fusion, [_, tv1, tv2, tv3]) = unary_chain();
    fusion.split(tv3, 1, 4).expect("split");
    fusion.compute_at(tv1, tv3, 2).expect("compute_at");

    let t1 = fusion.tensor_view(tv1).expect("tensor");
    let t2 = fusion.tensor_view(tv2).expect("tensor");
    assert_eq!(t1.compute_at_view(), Some(tv3));
    assert_eq!(t1.compute_at_axis(), Some(2));
    assert_eq!(t2.compute_at_view(), Some(tv3));
    assert_eq!(t2.compute_at_axis(), Some(2));
    assert_eq!(t1.n_dims(), 3, "the split is replayed onto the producer");
    assert_eq!(t2.n_dims(), 3);

    let printed = print_tensor_view(&fusion, tv1).expect("print");
    assert!(printed.starts_with("T1[ iS{i1}, "), "got {printed}");
    assert!(printed.ends_with(" compute_at( T3, 2 )"), "got {printed}");
}

#[test]
fn shared_axes_are_frozen() {
    let (mut fusion, [_, tv1, _, tv3]) = unary_chain();
    fusion.split(tv3, 1, 4).expect("split");
    fusion.compute_at(tv1, tv3, 2).expect("compute_at");

    assert!(fusion.split(tv3, 0, 2).is_err());
    assert!(fusion.merge(tv3, 0).is_err());
    assert!(fusion.reorder(tv3, &[(0, 1)]).is_err());
    assert!(fusion.split(tv1, 1, 2).is_err());
    fusion.split(tv3, 2, 2).expect("innermost axis is still free");
    fusion.reorder(tv3, &[(2, 3)]).expect("free axes can move");
    assert!(fusion.rfactor(tv3, &[0]).is_err());
}

#[test]
fn compute_at_validates_its_arguments() {
    let (mut fusion, [tv0, tv1, tv2, tv3]) = unary_chain();
    let err = fusion.compute_at(tv3, tv1, 1).expect_err("outputs stay at the top level");
    assert!(matches!(err, FusionError::UnsupportedTransform(_)), "got {err:?}");
    assert!(fusion.compute_at(tv2, tv2, 1).is_err());
    assert!(fusion.compute_at(tv2, tv1, 1).is_err(), "T1 does not depend on T2");
    assert!(fusion.compute_at(tv1, tv3, 3).is_err(), "T3 has two axes");
    fusion.compute_at(tv0, tv3, -1).expect("inputs may share loops");
}

#[test]
fn compute_at_never_makes_a_link_shallower() {
    let (mut fusion, [_, tv1, tv2, tv3]) = unary_chain();
    fusion.compute_at(tv2, tv3, -1).expect("compute_at");
    fusion.compute_at(tv1, tv3, 1).expect("compute_at");
    let t2 = fusion.tensor_view(tv2).expect("tensor");
    assert_eq!(t2.compute_at_axis(), Some(2));
    let t1 = fusion.tensor_view(tv1).expect("tensor");
    assert_eq!(t1.compute_at_view(), Some(tv3));
    assert_eq!(t1.compute_at_axis(), Some(1));
}

/// `T4 = exp(T1) + abs(T1)` with `T1 = neg(T0)` read by both branches.
fn shared_producer() -> (Fusion, [ValId; 5]) {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.neg(tv0).expect("neg");
    let tv2 = fusion.exp(tv1).expect("exp");
    let tv3 = fusion.abs(tv1).expect("abs");
    let tv4 = fusion.add(tv2, tv3).expect("add");
    fusion.add_output(tv4).expect("output");
    (fusion, [tv0, tv1, tv2, tv3, tv4])
}

#[test]
fn shared_producer_stays_outside_loops_one_branch_owns() {
    let (mut fusion, [_, tv1, tv2, tv3, tv4]) = shared_producer();
    fusion.compute_at(tv2, tv4, 1).expect("compute_at");
    let t1 = fusion.tensor_view(tv1).expect("tensor");
    assert_eq!(t1.compute_at_view(), None, "T3 is not linked yet");

    fusion.compute_at(tv3, tv4, 2).expect("compute_at");
    let t1 = fusion.tensor_view(tv1).expect("tensor");
    assert_eq!(t1.compute_at_view(), Some(tv3));
    assert_eq!(t1.compute_at_axis(), Some(1), "only the outer loop is shared with T2");
    assert_eq!(fusion.tensor_view(tv2).expect("tensor").compute_at_axis(), Some(1));
    assert_eq!(fusion.tensor_view(tv3).expect("tensor").compute_at_axis(), Some(2));

    generate_kernel(&fusion, "kernel").expect("both branches see T1");
}

#[test]
fn compute_at_through_an_intermediate_output_is_rejected() {
    let (mut fusion, [_, tv1, tv2, tv3]) = unary_chain();
    fusion.add_output(tv2).expect("output");
    let err = fusion.compute_at(tv1, tv3, 1).expect_err("T2 is an output");
    assert!(matches!(err, FusionError::UnsupportedTransform(_)), "got {err:?}");
}

#[test]
fn parallelize_binds_leaf_axes() {
    let (mut fusion, [_, _, _, tv3]) = unary_chain();
    fusion.split(tv3, 1, 128).expect("split");
    fusion
        .parallelize(tv3, 0, ParallelType::BIDx)
        .expect("parallelize");
    fusion
        .parallelize(tv3, -1, ParallelType::TIDx)
        .expect("parallelize");
    let axes = leaf(&fusion, tv3);
    let kinds: Vec<ParallelType> = axes
        .iter()
        .map(|id| fusion.iter_domain(*id).expect("axis").parallel)
        .collect();
    assert_eq!(
        kinds,
        vec![ParallelType::BIDx, ParallelType::Serial, ParallelType::TIDx]
    );
    let printed = print_tensor_view(&fusion, tv3).expect("print");
    assert!(printed.starts_with("T3[ iblockIdx.x{i1}, "), "got {printed}");
    assert!(printed.ends_with(", ithreadIdx.x{128} ]"), "got {printed}");
}

#[test]
fn rfactor_partial_result_feeds_the_original_reduction() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.sum(tv0, &[1]).expect("sum");
    fusion.add_output(tv1).expect("output");
    fusion.split(tv1, 1, 128).expect("split");
    let partial = fusion.rfactor(tv1, &[1]).expect("rfactor");

    let origin = fusion.origin(tv1).expect("origin");
    assert_eq!(
        fusion.expr(origin).expect("expr").inputs.as_slice(),
        &[partial]
    );
    let partial_origin = fusion.origin(partial).expect("origin");
    assert_eq!(
        fusion.expr(partial_origin).expect("expr").inputs.as_slice(),
        &[tv0]
    );
    assert!(fusion.tv_has_reduction(partial).expect("tensor"));
    let printed = print_tensor_view(&fusion, partial).expect("print");
    assert!(printed.contains("rf"), "got {printed}");
    assert_eq!(fusion.exprs(true, false).expect("order").len(), 2);
}
