use std::cell::RefCell;
use std::rc::Rc;

use fuse_rs::frontend::{parse_fusion, parse_into_active, FrontendError};
use fuse_rs::{generate_kernel, DataType, Fusion, FusionGuard, ParallelType};

const ADD_TWO: &str = r#"
fusion add_two(T0: tensor<f32, 2>, T1: tensor<f32, 2>) {
  // T2 = T1 + 2
  %2 = add(T1, 2.0)
  %3 = add(T0, %2);
  output %3
}
"#;

#[test]
fn parses_parameters_statements_and_outputs() {
    let parsed = parse_fusion(ADD_TWO).expect("valid fusion");
    let fusion = &parsed.fusion;
    assert_eq!(parsed.symbols.name, "add_two");
    assert_eq!(fusion.inputs().len(), 2);

    let t0 = parsed.symbols.get("T0").expect("T0");
    let out = parsed.symbols.get("%3").expect("%3");
    assert_eq!(parsed.symbols.get("3"), Some(out), "the `%` is optional");
    assert_eq!(fusion.outputs(), &[out]);
    assert_eq!(fusion.inputs()[0], t0);
    assert_eq!(fusion.tensor_view(out).expect("tensor").n_dims(), 2);
    assert_eq!(fusion.exprs(true, false).expect("order").len(), 2);
}

#[test]
fn parsed_fusions_can_be_scheduled_and_lowered() {
    let mut parsed = parse_fusion(ADD_TWO).expect("valid fusion");
    let out = parsed.symbols.get("3").expect("output");
    let fusion = &mut parsed.fusion;
    fusion.merge(out, 0).expect("merge");
    fusion.split(out, 0, 128).expect("split");
    fusion
        .parallelize(out, 0, ParallelType::BIDx)
        .expect("parallelize");
    fusion
        .parallelize(out, 1, ParallelType::TIDx)
        .expect("parallelize");

    let source = generate_kernel(fusion, "add_two").expect("generate");
    assert!(
        source.contains("__global__ void add_two(Tensor<float, 2> T0, Tensor<float, 2> T1, Tensor<float, 2> T3){"),
        "got {source}"
    );
}

#[test]
fn reductions_broadcasts_and_casts() {
    let parsed = parse_fusion(
        r#"
fusion norm(x: tensor<f32, 2>, n: i64) {
  %total = sum(x, [1])
  %wide = broadcast(%total, [false, true])
  %count = cast(n, f32)
  %mean = div(%wide, %count)
  %centered = sub(x, %mean)
  %keep = lt(%centered, 0.5)
  %clipped = where(%keep, %centered, 0.5)
  output %clipped, %total
}
"#,
    )
    .expect("valid fusion");
    let fusion = &parsed.fusion;
    assert_eq!(fusion.inputs().len(), 2);
    assert_eq!(fusion.outputs().len(), 2);
    let total = parsed.symbols.get("total").expect("total");
    assert!(fusion.tv_has_reduction(total).expect("tensor"));
    let wide = parsed.symbols.get("wide").expect("wide");
    assert!(fusion.tv_has_broadcast(wide).expect("tensor"));
    let count = parsed.symbols.get("count").expect("count");
    assert_eq!(fusion.val(count).expect("value").dtype(), DataType::Float);
    let keep = parsed.symbols.get("keep").expect("keep");
    assert_eq!(fusion.val(keep).expect("value").dtype(), DataType::Bool);
}

#[test]
fn errors_name_the_offending_line() {
    let err = parse_fusion(
        "fusion f(T0: tensor<f32, 1>) {\n  %1 = neg(T0)\n  %2 = add(%1, %missing)\n  output %2\n}",
    )
    .expect_err("unknown operand");
    match err {
        FrontendError::Statement { line, message } => {
            assert_eq!(line, 3);
            assert!(message.contains("missing"), "got {message}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = parse_fusion("fusion f(T0: tensor<f32, 1>) {\n  %1 = neg(T0, T0)\n  output %1\n}")
        .expect_err("wrong arity");
    assert!(matches!(err, FrontendError::Statement { line: 2, .. }), "got {err:?}");

    let err = parse_fusion("fusion f(T0: tensor<f32, 1>) {\n  %1 = neg(T0)\n  %1 = abs(T0)\n  output %1\n}")
        .expect_err("redefinition");
    assert!(matches!(err, FrontendError::Statement { line: 3, .. }), "got {err:?}");
}

#[test]
fn malformed_fusions_are_rejected() {
    for src in [
        "",
        "fusion f(T0: tensor<f32, 1>)",
        "kernel f(T0: tensor<f32, 1>) { output T0 }",
        "fusion f(T0: tensor<f32, 1>) {\n  %1 = neg(T0)\n}",
        "fusion f(T0: tensor<f16, 1>) {\n  output T0\n}",
        "fusion f(T0: tensor<f32, 1>, T0: f32) {\n  output T0\n}",
        "fusion f(T0: tensor<f32, 1>) {\n  output T0\n} trailing",
    ] {
        assert!(parse_fusion(src).is_err(), "accepted {src:?}");
    }
}

#[test]
fn graph_errors_pass_through() {
    let err = parse_fusion(
        "fusion f(a: tensor<f32, 1>, b: tensor<f32, 2>) {\n  %c = add(a, b)\n  output %c\n}",
    )
    .expect_err("rank mismatch");
    assert!(matches!(err, FrontendError::Fusion(_)), "got {err:?}");
}

#[test]
fn parse_into_active_extends_the_guarded_fusion() {
    assert!(matches!(
        parse_into_active(ADD_TWO),
        Err(FrontendError::Fusion(_))
    ));

    let fusion = Rc::new(RefCell::new(Fusion::new()));
    let symbols = {
        let _guard = FusionGuard::new(fusion.clone());
        parse_into_active(ADD_TWO).expect("valid fusion")
    };
    let fusion = fusion.borrow();
    let out = symbols.get("3").expect("output");
    assert!(fusion.in_fusion(out));
    assert_eq!(fusion.outputs(), &[out]);
    assert_eq!(fusion.label(out), "T3");
}

#[test]
fn failed_parse_into_active_leaves_the_fusion_untouched() {
    let fusion = Rc::new(RefCell::new(Fusion::new()));
    let existing = {
        let mut fusion = fusion.borrow_mut();
        let tv = fusion.new_dims_tensor(1, DataType::Float);
        fusion.add_input(tv).expect("input");
        tv
    };
    let vals_before = fusion.borrow().deterministic_vals().len();

    let err = {
        let _guard = FusionGuard::new(fusion.clone());
        parse_into_active(
            "fusion f(a: tensor<f32, 1>) {\n  %b = neg(a)\n  %c = add(%b, %missing)\n  output %c\n}",
        )
        .expect_err("unknown operand")
    };
    assert!(matches!(err, FrontendError::Statement { line: 3, .. }), "got {err:?}");

    let mut fusion = fusion.borrow_mut();
    assert_eq!(fusion.deterministic_vals().len(), vals_before);
    assert_eq!(fusion.inputs(), &[existing]);
    assert!(fusion.outputs().is_empty());
    assert!(fusion.registered_exprs().is_empty());
    let next = fusion.new_dims_tensor(1, DataType::Float);
    assert_eq!(fusion.label(next), "T1");
}
