use std::sync::Once;

use fuse_rs::lower::{count_stmts, KExpr, Stmt};
use fuse_rs::runtime::{compile_kernel, run_fusion};
use fuse_rs::{DataType, Fusion, HostTensor, KernelArg, KernelRuntime, LaunchConfig, ParallelType};
use fuse_rs_backend_ref_cpu::CpuRuntime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> HostTensor {
    let numel = shape.iter().product();
    let data = (0..numel).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    HostTensor::from_vec(shape, data).expect("valid tensor")
}

fn output(args: &[KernelArg]) -> &HostTensor {
    args.last()
        .and_then(KernelArg::as_tensor)
        .expect("last argument is the output tensor")
}

fn row_sums(input: &HostTensor) -> Vec<f32> {
    let cols = input.shape[1];
    input.data.chunks(cols).map(|row| row.iter().sum()).collect()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= 1e-3 * e.abs().max(1.0),
            "element {i}: got {a}, expected {e}"
        );
    }
}

/// `T3 = T0 + (T1 + 2)` with the consumer merged, split twice and bound to
/// blocks, an unrolled loop and threads.
fn scheduled_add() -> Fusion {
    let mut fusion = Fusion::new();
    let tv0 = fusion.new_dims_tensor(2, DataType::Float);
    let tv1 = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(tv0).expect("input");
    fusion.add_input(tv1).expect("input");
    let two = fusion.new_float(2.0);
    let tv2 = fusion.add(tv1, two).expect("add");
    let tv3 = fusion.add(tv0, tv2).expect("add");
    fusion.add_output(tv3).expect("output");

    fusion.merge(tv3, 0).expect("merge");
    fusion.split(tv3, 0, 128).expect("split");
    fusion.split(tv3, 0, 4).expect("split");

    fusion.compute_at(tv0, tv3, 1).expect("compute_at");
    fusion.compute_at(tv1, tv3, 1).expect("compute_at");

    fusion
        .parallelize(tv3, 0, ParallelType::BIDx)
        .expect("parallelize");
    for tv in [tv2, tv3] {
        fusion.parallelize(tv, 1, ParallelType::Unroll).expect("unroll");
        fusion.parallelize(tv, -1, ParallelType::TIDx).expect("bind");
    }
    fusion
}

#[test]
fn scheduled_elementwise_kernel_adds_constant() -> anyhow::Result<()> {
    init_logger();
    let fusion = scheduled_add();
    let runtime = CpuRuntime::new();
    let mut args = vec![
        KernelArg::Tensor(HostTensor::full(&[1, 128], 1.0)),
        KernelArg::Tensor(HostTensor::full(&[1, 128], 1.0)),
        KernelArg::Tensor(HostTensor::zeros(&[1, 128])),
    ];
    let config = LaunchConfig::new([1, 1, 1], [128, 1, 1]);
    run_fusion(&runtime, &fusion, "kernel", &config, &mut args)?;

    let out = output(&args);
    assert_eq!(out.shape, vec![1, 128]);
    assert!(
        out.data.iter().all(|v| *v == 4.0),
        "every element should be 1 + 1 + 2"
    );
    Ok(())
}

#[test]
fn scheduled_elementwise_kernel_unrolls_inside_thread_and_block_indices() {
    init_logger();
    let compiled = compile_kernel(&scheduled_add(), "kernel").expect("compile");
    let kernel = &compiled.kernel;

    // Block and thread axes carry no loop; T2 and T3 each unroll 4 steps.
    assert_eq!(kernel.count_loops(), 2);
    let unrolled = count_stmts(&kernel.body, &|s| {
        matches!(
            s,
            Stmt::ForLoop {
                unroll: true,
                extent: KExpr::Int(4),
                ..
            }
        )
    });
    assert_eq!(unrolled, 2);
    assert_eq!(kernel.count_predicates(), 2, "the merged extent is only known at launch");
    assert!(
        kernel.body.iter().any(|s| matches!(
            s,
            Stmt::Allocate {
                size: KExpr::Int(4),
                ..
            }
        )),
        "T2 holds one value per unrolled step"
    );

    let source = &compiled.source;
    assert!(source.contains("blockIdx.x"), "got {source}");
    assert!(source.contains("threadIdx.x"), "got {source}");
    assert_eq!(source.matches("#pragma unroll").count(), 2, "got {source}");
}

#[test]
fn scheduled_elementwise_kernel_guards_the_tail() {
    init_logger();
    let fusion = scheduled_add();
    let mut rng = StdRng::seed_from_u64(42);
    let a = random_tensor(&mut rng, &[3, 200]);
    let b = random_tensor(&mut rng, &[3, 200]);
    let expected: Vec<f32> = a.data.iter().zip(&b.data).map(|(x, y)| x + (y + 2.0)).collect();

    // 600 elements, 128 threads and 4 unrolled iterations per block.
    let mut args = vec![
        KernelArg::Tensor(a),
        KernelArg::Tensor(b),
        KernelArg::Tensor(HostTensor::full(&[3, 200], -7.0)),
    ];
    let config = LaunchConfig::new([2, 1, 1], [128, 1, 1]);
    run_fusion(&CpuRuntime::new(), &fusion, "kernel", &config, &mut args).expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

fn row_sum_fusion() -> (Fusion, fuse_rs::ValId) {
    let mut fusion = Fusion::new();
    let input = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(input).expect("input");
    let out = fusion.sum(input, &[1]).expect("sum");
    fusion.add_output(out).expect("output");
    (fusion, out)
}

#[test]
fn producer_computed_at_reduction_matches_negated_sum() {
    init_logger();
    let mut fusion = Fusion::new();
    let input = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(input).expect("input");
    let negated = fusion.neg(input).expect("neg");
    let out = fusion.sum(negated, &[1]).expect("sum");
    fusion.add_output(out).expect("output");
    fusion.compute_at(negated, out, 1).expect("compute_at");

    let mut rng = StdRng::seed_from_u64(7);
    let input = random_tensor(&mut rng, &[3, 50]);
    let expected: Vec<f32> = row_sums(&input).into_iter().map(|v| -v).collect();
    let mut args = vec![KernelArg::Tensor(input), KernelArg::Tensor(HostTensor::zeros(&[3]))];
    run_fusion(&CpuRuntime::new(), &fusion, "kernel", &LaunchConfig::default(), &mut args)
        .expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

#[test]
fn producer_computed_at_rfactor_matches_negated_sum() {
    init_logger();
    let mut fusion = Fusion::new();
    let input = fusion.new_dims_tensor(2, DataType::Float);
    fusion.add_input(input).expect("input");
    let negated = fusion.neg(input).expect("neg");
    let out = fusion.sum(negated, &[1]).expect("sum");
    fusion.add_output(out).expect("output");
    fusion.split(out, 1, 32).expect("split");
    let partial = fusion.rfactor(out, &[2]).expect("rfactor");
    fusion.compute_at(negated, partial, 1).expect("compute_at");
    fusion.compute_at(partial, out, 1).expect("compute_at");

    let mut rng = StdRng::seed_from_u64(8);
    let input = random_tensor(&mut rng, &[3, 100]);
    let expected: Vec<f32> = row_sums(&input).into_iter().map(|v| -v).collect();
    let mut args = vec![KernelArg::Tensor(input), KernelArg::Tensor(HostTensor::zeros(&[3]))];
    run_fusion(&CpuRuntime::new(), &fusion, "kernel", &LaunchConfig::default(), &mut args)
        .expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

#[test]
fn serial_rfactor_matches_direct_sum() {
    init_logger();
    let (mut fusion, out) = row_sum_fusion();
    fusion.split(out, 1, 128).expect("split");
    fusion.rfactor(out, &[2]).expect("rfactor");

    let mut rng = StdRng::seed_from_u64(0);
    let input = random_tensor(&mut rng, &[3, 1025]);
    let expected = row_sums(&input);
    let mut args = vec![KernelArg::Tensor(input), KernelArg::Tensor(HostTensor::zeros(&[3]))];
    run_fusion(&CpuRuntime::new(), &fusion, "kernel", &LaunchConfig::default(), &mut args)
        .expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

#[test]
fn block_rfactor_matches_direct_sum() {
    init_logger();
    let (mut fusion, out) = row_sum_fusion();
    fusion.split(out, 1, 128).expect("split");
    fusion
        .parallelize(out, 2, ParallelType::TIDx)
        .expect("parallelize");
    fusion.rfactor(out, &[2]).expect("rfactor");

    let compiled = compile_kernel(&fusion, "kernel").expect("compile");
    assert!(compiled.kernel.has_block_reduction);
    assert!(!compiled.kernel.has_grid_reduction);
    assert!(compiled.source.contains("blockReduce< true, false, false >"));

    let mut rng = StdRng::seed_from_u64(1);
    let input = random_tensor(&mut rng, &[4, 1025]);
    let expected = row_sums(&input);
    let mut args = vec![KernelArg::Tensor(input), KernelArg::Tensor(HostTensor::zeros(&[4]))];
    let config = LaunchConfig::new([1, 1, 1], [128, 1, 1]);
    CpuRuntime::new()
        .launch(&compiled, &config, &mut args)
        .expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

#[test]
fn block_and_grid_reduction_matches_direct_sum() {
    init_logger();
    let (mut fusion, out) = row_sum_fusion();
    fusion.split(out, 1, 128).expect("split");
    fusion
        .parallelize(out, 2, ParallelType::TIDx)
        .expect("parallelize");
    fusion
        .parallelize(out, 1, ParallelType::BIDx)
        .expect("parallelize");

    let compiled = compile_kernel(&fusion, "kernel").expect("compile");
    assert!(compiled.kernel.has_block_reduction);
    assert!(compiled.kernel.has_grid_reduction);
    assert!(compiled.source.contains("reduction::gridReduce<"));

    let mut rng = StdRng::seed_from_u64(2);
    let input = random_tensor(&mut rng, &[3, 1000]);
    let expected = row_sums(&input);
    let mut args = vec![KernelArg::Tensor(input), KernelArg::Tensor(HostTensor::zeros(&[3]))];
    let config = LaunchConfig::new([1000usize.div_ceil(128), 1, 1], [128, 1, 1]);
    CpuRuntime::new()
        .launch(&compiled, &config, &mut args)
        .expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

#[test]
fn grid_only_reduction_matches_direct_sum() {
    init_logger();
    let (mut fusion, out) = row_sum_fusion();
    fusion
        .parallelize(out, 1, ParallelType::BIDx)
        .expect("parallelize");

    let mut rng = StdRng::seed_from_u64(3);
    let input = random_tensor(&mut rng, &[2, 37]);
    let expected = row_sums(&input);
    let mut args = vec![KernelArg::Tensor(input), KernelArg::Tensor(HostTensor::zeros(&[2]))];
    let config = LaunchConfig::new([37, 1, 1], [1, 1, 1]);
    run_fusion(&CpuRuntime::new(), &fusion, "kernel", &config, &mut args).expect("kernel runs");
    assert_close(&output(&args).data, &expected);
}

#[test]
fn mismatched_arguments_are_rejected() {
    init_logger();
    let (fusion, _) = row_sum_fusion();
    let compiled = compile_kernel(&fusion, "kernel").expect("compile");
    let runtime = CpuRuntime::new();

    let mut too_few = vec![KernelArg::Tensor(HostTensor::zeros(&[2, 2]))];
    assert!(runtime
        .launch(&compiled, &LaunchConfig::default(), &mut too_few)
        .is_err());

    let mut wrong_rank = vec![
        KernelArg::Tensor(HostTensor::zeros(&[4])),
        KernelArg::Tensor(HostTensor::zeros(&[4])),
    ];
    assert!(runtime
        .launch(&compiled, &LaunchConfig::default(), &mut wrong_rank)
        .is_err());

    let mut empty_block = vec![
        KernelArg::Tensor(HostTensor::zeros(&[2, 2])),
        KernelArg::Tensor(HostTensor::zeros(&[2])),
    ];
    assert!(runtime
        .launch(&compiled, &LaunchConfig::new([1, 1, 1], [0, 1, 1]), &mut empty_block)
        .is_err());
}
