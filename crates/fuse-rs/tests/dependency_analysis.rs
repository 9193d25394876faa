use std::collections::HashSet;

use fuse_rs::ir::{Statement, ValId};
use fuse_rs::traversal::{
    self, traverse_backward, traverse_from, BackwardVisitor, DependencyCheck, IterVisitor,
};
use fuse_rs::{DataType, Fusion};

/// ```text
/// T0 -> neg -> T1 -> add(T1, T0) -> T2 -> exp -> T3
/// T0 -> abs -> T4
/// ```
fn diamond() -> (Fusion, [ValId; 5]) {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(1, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.neg(tv0).expect("neg");
    let tv2 = fusion.add(tv1, tv0).expect("add");
    let tv3 = fusion.exp(tv2).expect("exp");
    let tv4 = fusion.abs(tv0).expect("abs");
    fusion.add_output(tv3).expect("output");
    fusion.add_output(tv4).expect("output");
    (fusion, [tv0, tv1, tv2, tv3, tv4])
}

#[test]
fn dependency_queries() {
    let (fusion, [tv0, tv1, tv2, tv3, tv4]) = diamond();
    assert!(DependencyCheck::is_dependency_of(&fusion, tv0, tv3));
    assert!(DependencyCheck::is_dependency_of(&fusion, tv1, tv2));
    assert!(DependencyCheck::is_dependency_of(&fusion, tv3, tv3));
    assert!(!DependencyCheck::is_dependency_of(&fusion, tv3, tv0));
    assert!(!DependencyCheck::is_dependency_of(&fusion, tv1, tv4));
    assert!(DependencyCheck::single_dependency_chain(&fusion, tv4, tv3).is_empty());
}

#[test]
fn single_chain_follows_first_operands() {
    let (fusion, [tv0, tv1, tv2, tv3, _]) = diamond();
    assert_eq!(
        DependencyCheck::single_dependency_chain(&fusion, tv0, tv3),
        vec![tv0, tv1, tv2, tv3]
    );
}

#[test]
fn all_chains_enumerate_every_path() {
    let (fusion, [tv0, tv1, tv2, tv3, tv4]) = diamond();
    let chains: HashSet<Vec<ValId>> =
        DependencyCheck::all_dependency_chains(&fusion, tv0, tv3)
            .into_iter()
            .collect();
    let expected: HashSet<Vec<ValId>> = [vec![tv0, tv1, tv2, tv3], vec![tv0, tv2, tv3]]
        .into_iter()
        .collect();
    assert_eq!(chains, expected);

    assert_eq!(
        DependencyCheck::all_use_chains(&fusion, tv1),
        vec![vec![tv1, tv2, tv3]]
    );
    let uses: HashSet<Vec<ValId>> = DependencyCheck::all_use_chains(&fusion, tv0)
        .into_iter()
        .collect();
    assert_eq!(uses.len(), 3, "got {uses:?}");
    assert!(uses.contains(&vec![tv0, tv4]));
    assert!(DependencyCheck::all_use_chains_of(&fusion, &[]).is_empty());
}

#[test]
fn values_between_are_topologically_ordered() {
    let (fusion, [tv0, tv1, tv2, tv3, tv4]) = diamond();
    assert_eq!(
        DependencyCheck::all_vals_between(&fusion, &[tv1], &[tv3]),
        vec![tv1, tv2, tv3]
    );
    assert_eq!(
        DependencyCheck::all_vals_between(&fusion, &[tv0], &[tv4]),
        vec![tv0, tv4]
    );
    assert!(DependencyCheck::all_vals_between(&fusion, &[tv4], &[tv3]).is_empty());
}

#[test]
fn topological_order_respects_operands() {
    let (mut fusion, [tv0, tv1, _, tv3, tv4]) = diamond();
    let dangling = fusion.sqrt(tv1).expect("sqrt");

    let used = fusion.exprs(true, false).expect("order");
    assert_eq!(used.len(), 4);
    let all = fusion.exprs(false, false).expect("order");
    assert_eq!(all.len(), 5);
    assert!(all.contains(&fusion.origin(dangling).expect("origin")));

    let mut produced: HashSet<ValId> = fusion.inputs().iter().copied().collect();
    for expr in &all {
        let node = fusion.expr(*expr).expect("expr");
        for input in &node.inputs {
            assert!(
                produced.contains(input) || !fusion.is_tensor(*input),
                "{} is read before it is produced",
                fusion.label(*input)
            );
        }
        produced.extend(node.outputs.iter().copied());
    }

    assert_eq!(traversal::inputs_of(&fusion, &[tv3]), vec![tv0]);
    assert_eq!(
        traversal::exprs_from(&fusion, &[tv4], false).expect("order"),
        vec![fusion.origin(tv4).expect("origin")]
    );
    assert_eq!(fusion.terminating_outputs(), vec![tv3, tv4]);
    assert_eq!(fusion.used_math_vals().len(), 5);
}

#[derive(Default)]
struct FirstTensors {
    seen: Vec<ValId>,
    limit: usize,
}

impl IterVisitor for FirstTensors {
    fn handle(&mut self, fusion: &Fusion, stmt: Statement, _stack: &[Vec<Statement>]) {
        if let Statement::Val(v) = stmt {
            if fusion.is_tensor(v) {
                self.seen.push(v);
            }
        }
    }

    fn is_done(&self) -> bool {
        self.seen.len() >= self.limit
    }
}

#[test]
fn visitors_can_stop_early() {
    let (fusion, [tv0, tv1, ..]) = diamond();
    let mut visitor = FirstTensors {
        limit: 2,
        ..Default::default()
    };
    traverse_from(&mut visitor, &fusion, fusion.outputs(), false, false).expect("walk");
    assert_eq!(visitor.seen, vec![tv0, tv1]);
}

#[derive(Default)]
struct Order {
    vals: Vec<ValId>,
}

impl BackwardVisitor for Order {
    fn handle(&mut self, _fusion: &Fusion, stmt: Statement, _stack: &[Vec<Statement>]) {
        if let Statement::Val(v) = stmt {
            self.vals.push(v);
        }
    }
}

#[test]
fn backward_walk_visits_consumers_first() {
    let (fusion, [tv0, tv1, tv2, tv3, _]) = diamond();
    let mut order = Order::default();
    traverse_backward(&mut order, &fusion, &[tv3], false).expect("walk");
    let pos = |v: ValId| {
        order
            .vals
            .iter()
            .position(|x| *x == v)
            .expect("value is visited")
    };
    assert_eq!(order.vals.len(), 4);
    assert!(pos(tv3) < pos(tv2));
    assert!(pos(tv2) < pos(tv1));
    assert!(pos(tv1) < pos(tv0));
}
