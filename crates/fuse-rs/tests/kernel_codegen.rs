use std::sync::Once;

use fuse_rs::lower::{lower_fusion, Stmt};
use fuse_rs::printer::{print_expr, print_inline, print_math};
use fuse_rs::{
    generate_kernel, Config, DataType, Fusion, FusionError, KernelOptions, ParallelType, ValId,
};

static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn options() -> KernelOptions {
    KernelOptions {
        config: Config::default(),
    }
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
fn unscheduled_producers_get_their_own_loop_nests() {
    init_logger();
    let (fusion, _) = unary_chain();
    let kernel = lower_fusion(&fusion, "kernel", &options()).expect("lower");
    assert_eq!(kernel.count_loops(), 6);
    let allocations = kernel
        .body
        .iter()
        .filter(|s| matches!(s, Stmt::Allocate { .. }))
        .count();
    assert_eq!(allocations, 2, "T1 and T2 live in local buffers");
}

#[test]
fn computing_at_every_axis_fuses_into_one_nest() {
    init_logger();
    let (mut fusion, [_, tv1, _, tv3]) = unary_chain();
    fusion.compute_at(tv1, tv3, -1).expect("compute_at");

    let kernel = lower_fusion(&fusion, "kernel", &options()).expect("lower");
    assert_eq!(kernel.count_loops(), 2);
    assert_eq!(kernel.body.len(), 1, "a single outer loop");

    let source = generate_kernel(&fusion, "kernel").expect("generate");
    assert!(
        source.contains("__global__ void kernel(Tensor<float, 2> T0, Tensor<float, 2> T3){"),
        "got {source}"
    );
    assert_eq!(source.matches("for(size_t i").count(), 2, "got {source}");
    assert!(source.contains("float T1[1];"), "got {source}");
    assert!(source.contains("expf("), "got {source}");
}

#[test]
fn producer_computed_at_a_reduction_shares_its_outer_loop() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.neg(tv0).expect("neg");
    let tv2 = fusion.sum(tv1, &[1]).expect("sum");
    fusion.add_output(tv2).expect("output");
    fusion.compute_at(tv1, tv2, 1).expect("compute_at");

    let kernel = lower_fusion(&fusion, "kernel", &options()).expect("lower");
    assert_eq!(kernel.count_loops(), 4);
    assert_eq!(kernel.body.len(), 2, "the init nest, then the row loop");
    assert!(matches!(kernel.body[0], Stmt::ForLoop { .. }));
    let Stmt::ForLoop { body: row, .. } = &kernel.body[1] else {
        panic!("expected the row loop, got {:?}", kernel.body[1]);
    };
    assert!(
        row.iter().any(|s| matches!(s, Stmt::Allocate { .. })),
        "T1 is allocated per row"
    );
}

#[test]
fn shared_producer_is_computed_where_both_branches_read_it() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.neg(tv0).expect("neg");
    let tv2 = fusion.exp(tv1).expect("exp");
    let tv3 = fusion.abs(tv1).expect("abs");
    let tv4 = fusion.add(tv2, tv3).expect("add");
    fusion.add_output(tv4).expect("output");
    fusion.compute_at(tv2, tv4, 1).expect("compute_at");
    fusion.compute_at(tv3, tv4, 2).expect("compute_at");

    let kernel = lower_fusion(&fusion, "kernel", &options()).expect("lower");
    assert_eq!(kernel.body.len(), 1, "everything runs inside the outer loop of T4");
    let Stmt::ForLoop { body: outer, .. } = &kernel.body[0] else {
        panic!("expected the outer loop, got {:?}", kernel.body[0]);
    };
    assert!(outer.iter().any(|s| matches!(s, Stmt::Allocate { .. })));
}

#[test]
fn thread_and_block_axes_become_indices() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(1, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let two = fusion.new_float(2.0);
    let tv1 = fusion.mul(tv0, two).expect("mul");
    fusion.add_output(tv1).expect("output");
    fusion.split(tv1, 0, 128).expect("split");
    fusion
        .parallelize(tv1, 0, ParallelType::BIDx)
        .expect("parallelize");
    fusion
        .parallelize(tv1, 1, ParallelType::TIDx)
        .expect("parallelize");

    let kernel = lower_fusion(&fusion, "kernel", &options()).expect("lower");
    assert_eq!(kernel.count_loops(), 0);
    assert_eq!(kernel.count_predicates(), 1, "the tail of the split is guarded");

    let source = generate_kernel(&fusion, "kernel").expect("generate");
    assert!(source.contains("blockIdx.x"), "got {source}");
    assert!(source.contains("threadIdx.x"), "got {source}");
    assert!(source.contains("if ( "), "got {source}");
    assert!(!source.contains("shared_mem"), "got {source}");
}

#[test]
fn block_reduction_emits_helper_and_shared_memory() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.sum(tv0, &[1]).expect("sum");
    fusion.add_output(tv1).expect("output");
    fusion
        .parallelize(tv1, 1, ParallelType::TIDx)
        .expect("parallelize");
    fusion
        .parallelize(tv1, 0, ParallelType::BIDx)
        .expect("parallelize");
    assert!(fusion.has_block_reduction());
    assert!(!fusion.has_grid_reduction());

    let source = generate_kernel(&fusion, "reduce").expect("generate");
    assert!(
        source.contains("__device__ void reduction_add_float(float& a, const float b) {"),
        "got {source}"
    );
    assert!(source.contains("__shared__ float shared_mem[1024];"), "got {source}");
    assert!(source.contains("blockReduce< true, false, false >"), "got {source}");
    assert!(!source.contains("gridReduce"), "got {source}");
}

#[test]
fn integer_block_reduction_sizes_shared_memory_for_int64() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Int);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.sum(tv0, &[1]).expect("sum");
    fusion.add_output(tv1).expect("output");
    fusion
        .parallelize(tv1, 1, ParallelType::TIDx)
        .expect("parallelize");

    let source = generate_kernel(&fusion, "reduce").expect("generate");
    assert!(source.contains("__shared__ int64_t shared_mem[1024];"), "got {source}");
    assert!(source.contains("reinterpret_cast<int64_t*>(shared_mem)"), "got {source}");
}

#[test]
fn block_and_grid_reduction_stage_through_block_result() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.sum(tv0, &[1]).expect("sum");
    fusion.add_output(tv1).expect("output");
    fusion.split(tv1, 1, 128).expect("split");
    fusion
        .parallelize(tv1, 1, ParallelType::BIDx)
        .expect("parallelize");
    fusion
        .parallelize(tv1, 2, ParallelType::TIDx)
        .expect("parallelize");
    assert!(fusion.has_grid_reduction());

    let kernel = lower_fusion(&fusion, "reduce", &options()).expect("lower");
    assert!(kernel.has_block_reduction);
    assert!(kernel.has_grid_reduction);

    let source = generate_kernel(&fusion, "reduce").expect("generate");
    assert!(source.contains("float block_result = float(0);"), "got {source}");
    assert!(source.contains("blockReduce< true, false, false > ( block_result"), "got {source}");
    assert!(
        source.contains("reduction::gridReduce< true, false, false, false, true, true >"),
        "got {source}"
    );
    assert!(source.contains("void* work_buf, unsigned* sync_flags"), "got {source}");
}

#[test]
fn random_fill_adds_rng_parameters() {
    init_logger();
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(1, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let tv1 = fusion.rand_like(tv0).expect("rand_like");
    fusion.add_output(tv1).expect("output");

    let source = generate_kernel(&fusion, "noise").expect("generate");
    assert!(source.contains("unsigned long long seed"), "got {source}");
    assert!(source.contains("Philox rnd(seed, idx, offset);"), "got {source}");
    assert!(source.contains("randLike(rnd)"), "got {source}");
}

#[test]
fn scalar_outputs_are_rejected() {
    let mut fusion = Fusion::new();
    let n = fusion.new_scalar(DataType::Int);
    fusion.add_input(n).expect("input");
    let two = fusion.new_int(2);
    let m = fusion.mul(n, two).expect("mul");
    fusion.add_output(m).expect("output");
    let err = lower_fusion(&fusion, "kernel", &options()).expect_err("scalar output");
    assert!(matches!(err, FusionError::UnsupportedTransform(_)), "got {err:?}");
}

#[test]
fn scalar_inputs_become_kernel_arguments() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(1, DataType::Float);
    let scale = fusion.new_scalar(DataType::Float);
    fusion.add_input(tv0).expect("input");
    fusion.add_input(scale).expect("input");
    let tv1 = fusion.mul(tv0, scale).expect("mul");
    fusion.add_output(tv1).expect("output");

    let source = generate_kernel(&fusion, "scale").expect("generate");
    assert!(
        source.contains("__global__ void scale(Tensor<float, 1> T0, float f2, Tensor<float, 1> T1){"),
        "got {source}"
    );
}

#[test]
fn math_listing_prints_every_used_operation() {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(1, DataType::Float);
    fusion.add_input(tv0).expect("input");
    let two = fusion.new_float(2.0);
    let tv1 = fusion.add(tv0, two).expect("add");
    let tv2 = fusion.sum(tv1, &[0]).expect("sum");
    fusion.add_output(tv2).expect("output");

    let math = print_math(&fusion).expect("print");
    assert!(math.starts_with("\n%kernel_math {\n"), "got {math}");
    assert!(math.ends_with("}\n"), "got {math}");
    assert!(math.contains("+ float(2);"), "got {math}");
    assert!(
        math.contains("T2[ rS{i1} ] = reduction( T1[ iS{i1} ], op = add, initial value = float(0) );"),
        "got {math}"
    );
}

#[test]
fn scalar_operations_print_inline() {
    let mut fusion = Fusion::new();
    let n = fusion.new_scalar(DataType::Int);
    let four = fusion.new_int(4);
    let outer = fusion.ceil_div(n, four).expect("ceil_div");
    let doubled = fusion.mul(outer, four).expect("mul");

    assert_eq!(
        print_inline(&fusion, doubled).expect("print"),
        "( ( ceilDiv(i0, 4) ) * 4 )"
    );
    let origin = fusion.origin(outer).expect("origin");
    assert_eq!(
        print_expr(&fusion, origin).expect("print"),
        "i2 = ceilDiv(i0, 4);"
    );
}
