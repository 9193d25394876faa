use std::collections::HashMap;

use fuse_rs::ir::{BinaryOp, DataType, ParallelType, TernaryOp, UnaryOp};
use fuse_rs::lower::{Buffer, KExpr, Kernel, ParamKind, ReduceTarget, Stmt, Storage, TensorRef};
use fuse_rs::runtime::{
    CompiledKernel, HostTensor, KernelArg, KernelRuntime, LaunchConfig, RuntimeError,
    RuntimeResult,
};
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Interprets lowered kernels on the host.
///
/// Every thread of every block runs in lockstep: a statement executes for
/// all active threads before the next one starts, so block and grid
/// reductions see the contributions of the whole launch. Loop indices are
/// uniform; `if` statements narrow the set of active threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuRuntime;

impl CpuRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl KernelRuntime for CpuRuntime {
    fn runtime_name(&self) -> &str {
        "ref-cpu"
    }

    fn launch(
        &self,
        kernel: &CompiledKernel,
        config: &LaunchConfig,
        args: &mut [KernelArg],
    ) -> RuntimeResult<()> {
        kernel.check_args(args)?;
        if config.grid.contains(&0) || config.block.contains(&0) {
            return Err(RuntimeError::arguments(format!(
                "launch dimensions must be positive, got grid {:?} block {:?}",
                config.grid, config.block
            )));
        }
        let mut machine = Machine::new(&kernel.kernel, config, args);
        let mask = vec![true; machine.lanes.len()];
        machine.exec_block(&kernel.kernel.body, &mask)?;
        debug!(
            "{} on {} threads: {} statements, {} loads, {} stores, {} reductions",
            kernel.name,
            machine.lanes.len(),
            machine.stats.statements,
            machine.stats.loads,
            machine.stats.stores,
            machine.stats.reductions
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Value {
    fn zero(dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Value::Bool(false),
            DataType::Int => Value::Int(0),
            DataType::Float => Value::Float(0.0),
        }
    }

    fn from_element(element: f32, dtype: DataType) -> Self {
        Value::Float(f64::from(element)).cast(dtype)
    }

    fn as_f64(self) -> f64 {
        match self {
            Value::Bool(v) => f64::from(u8::from(v)),
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Value::Bool(v) => i64::from(v),
            Value::Int(v) => v,
            Value::Float(v) => v as i64,
        }
    }

    fn as_bool(self) -> bool {
        match self {
            Value::Bool(v) => v,
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
        }
    }

    fn cast(self, dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Value::Bool(self.as_bool()),
            DataType::Int => Value::Int(self.as_i64()),
            DataType::Float => Value::Float(self.as_f64()),
        }
    }
}

fn apply_unary(op: UnaryOp, dtype: DataType, input: Value) -> RuntimeResult<Value> {
    let result = match (op, input) {
        (UnaryOp::Neg, Value::Float(v)) => Value::Float(-v),
        (UnaryOp::Neg, other) => Value::Int(other.as_i64().checked_neg().ok_or_else(|| {
            RuntimeError::execution(format!("negating {} overflows", other.as_i64()))
        })?),
        (UnaryOp::Abs, Value::Float(v)) => Value::Float(v.abs()),
        (UnaryOp::Abs, other) => Value::Int(other.as_i64().checked_abs().ok_or_else(|| {
            RuntimeError::execution(format!("absolute value of {} overflows", other.as_i64()))
        })?),
        (UnaryOp::Exp, v) => Value::Float(v.as_f64().exp()),
        (UnaryOp::Sqrt, v) => Value::Float(v.as_f64().sqrt()),
        (UnaryOp::Cast | UnaryOp::Set, v) => v,
        (UnaryOp::RandLike, _) => {
            return Err(RuntimeError::execution(
                "random values must be drawn through the kernel's random stream",
            ))
        }
    };
    Ok(result.cast(dtype))
}

fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    let value = match (lhs, rhs) {
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let v = op.apply_f64(lhs.as_f64(), rhs.as_f64());
            if op.is_logical() {
                Value::Bool(v != 0.0)
            } else {
                Value::Float(v)
            }
        }
        _ => {
            let (a, b) = (lhs.as_i64(), rhs.as_i64());
            let v = op.apply_i64(a, b).ok_or_else(|| {
                RuntimeError::execution(format!("integer {op} of {a} and {b} is undefined"))
            })?;
            if op.is_logical() {
                Value::Bool(v != 0)
            } else {
                Value::Int(v)
            }
        }
    };
    Ok(value)
}

/// Per-thread buffer declared by an `Allocate`.
#[derive(Debug, Clone)]
struct LocalBuffer {
    dtype: DataType,
    values: Vec<Value>,
}

/// One simulated thread.
#[derive(Debug)]
struct Lane {
    block: [usize; 3],
    thread: [usize; 3],
    locals: HashMap<usize, LocalBuffer>,
    block_result: Option<Value>,
}

#[derive(Debug, Default)]
struct ExecStats {
    statements: usize,
    loads: usize,
    stores: usize,
    reductions: usize,
}

/// Threads whose partial results are folded together, in lane order.
#[derive(Debug, Default)]
struct ReductionGroup {
    members: Vec<usize>,
    writer: Option<usize>,
    total: Option<Value>,
}

fn unravel(linear: usize, dims: [usize; 3]) -> [usize; 3] {
    [
        linear % dims[0],
        (linear / dims[0]) % dims[1],
        linear / (dims[0] * dims[1]),
    ]
}

/// Zeroes the coordinates whose flag is `false`.
fn keep(coords: [usize; 3], flags: [bool; 3]) -> [usize; 3] {
    let mut kept = coords;
    for (coord, flag) in kept.iter_mut().zip(flags) {
        if !flag {
            *coord = 0;
        }
    }
    kept
}

struct Machine<'k, 'a> {
    kernel: &'k Kernel,
    config: LaunchConfig,
    args: &'a mut [KernelArg],
    lanes: Vec<Lane>,
    loop_vars: HashMap<usize, i64>,
    rng: StdRng,
    stats: ExecStats,
}

impl<'k, 'a> Machine<'k, 'a> {
    fn new(kernel: &'k Kernel, config: &LaunchConfig, args: &'a mut [KernelArg]) -> Self {
        let threads = config.threads_per_block();
        let mut lanes = Vec::with_capacity(config.num_blocks() * threads);
        for b in 0..config.num_blocks() {
            for t in 0..threads {
                lanes.push(Lane {
                    block: unravel(b, config.grid),
                    thread: unravel(t, config.block),
                    locals: HashMap::new(),
                    block_result: None,
                });
            }
        }
        Self {
            kernel,
            config: *config,
            args,
            lanes,
            loop_vars: HashMap::new(),
            rng: StdRng::seed_from_u64(config.rng_seed),
            stats: ExecStats::default(),
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], mask: &[bool]) -> RuntimeResult<()> {
        for stmt in stmts {
            self.exec(stmt, mask)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, mask: &[bool]) -> RuntimeResult<()> {
        let active: Vec<usize> = (0..mask.len()).filter(|lane| mask[*lane]).collect();
        if active.is_empty() {
            return Ok(());
        }
        self.stats.statements += 1;
        match stmt {
            Stmt::ForLoop {
                index,
                start,
                extent,
                body,
                ..
            } => {
                let start = self.uniform(&active, start)?;
                let extent = self.uniform(&active, extent)?;
                trace!("loop i{index} over [{start}, {extent})");
                for value in start..extent {
                    self.loop_vars.insert(*index, value);
                    self.exec_block(body, mask)?;
                }
                self.loop_vars.remove(index);
            }
            Stmt::IfThenElse {
                cond,
                then_body,
                else_body,
            } => {
                let mut then_mask = vec![false; mask.len()];
                let mut else_mask = vec![false; mask.len()];
                for &lane in &active {
                    if self.eval(lane, cond)?.as_bool() {
                        then_mask[lane] = true;
                    } else {
                        else_mask[lane] = true;
                    }
                }
                self.exec_block(then_body, &then_mask)?;
                self.exec_block(else_body, &else_mask)?;
            }
            Stmt::Allocate {
                buffer,
                dtype,
                size,
                init,
            } => {
                for &lane in &active {
                    let fill = match init {
                        Some(init) => self.eval(lane, init)?.cast(*dtype),
                        None => Value::zero(*dtype),
                    };
                    match buffer {
                        Buffer::Tensor(name) => {
                            let size = usize::try_from(self.eval(lane, size)?.as_i64())
                                .map_err(|_| {
                                    RuntimeError::execution(format!("T{name} has a negative size"))
                                })?;
                            self.lanes[lane].locals.insert(
                                *name,
                                LocalBuffer {
                                    dtype: *dtype,
                                    values: vec![fill; size],
                                },
                            );
                        }
                        Buffer::BlockResult => self.lanes[lane].block_result = Some(fill),
                    }
                }
            }
            Stmt::Assign { target, value } => {
                for &lane in &active {
                    let value = self.eval(lane, value)?;
                    self.store(lane, target, value)?;
                }
            }
            Stmt::BlockReduce {
                op,
                dtype,
                threads,
                target,
                input,
                pred,
            } => self.block_reduce(&active, *op, *dtype, *threads, target, input, pred.as_ref())?,
            Stmt::GridReduce {
                op,
                dtype,
                blocks,
                threads,
                target,
                input,
                pred,
            } => self.grid_reduce(
                &active,
                *op,
                *dtype,
                (*blocks, *threads),
                target,
                input.as_ref(),
                pred.as_ref(),
            )?,
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn block_reduce(
        &mut self,
        active: &[usize],
        op: BinaryOp,
        dtype: DataType,
        threads: [bool; 3],
        target: &ReduceTarget,
        input: &KExpr,
        pred: Option<&KExpr>,
    ) -> RuntimeResult<()> {
        self.stats.reductions += 1;
        let mut order: Vec<([usize; 3], [usize; 3])> = Vec::new();
        let mut groups: HashMap<([usize; 3], [usize; 3]), ReductionGroup> = HashMap::new();
        for &lane in active {
            let key = (
                self.lanes[lane].block,
                keep(self.lanes[lane].thread, threads.map(|reduced| !reduced)),
            );
            let contributes = self.predicate(lane, pred)?;
            let partial = if contributes {
                Some(self.eval(lane, input)?.cast(dtype))
            } else {
                None
            };
            let group = groups.entry(key).or_insert_with(|| {
                order.push(key);
                ReductionGroup::default()
            });
            group.members.push(lane);
            if let Some(partial) = partial {
                group.writer.get_or_insert(lane);
                group.total = Some(match group.total {
                    Some(total) => apply_binary(op, total, partial)?.cast(dtype),
                    None => partial,
                });
            }
        }

        for key in order {
            let Some(group) = groups.remove(&key) else {
                continue;
            };
            let Some(total) = group.total else {
                continue;
            };
            match target {
                ReduceTarget::Tensor(tensor) => {
                    if let Some(writer) = group.writer {
                        let current = self.load(writer, tensor)?;
                        let combined = apply_binary(op, current, total)?.cast(dtype);
                        self.store(writer, tensor, combined)?;
                    }
                }
                ReduceTarget::BlockResult => {
                    for lane in group.members {
                        let current = self.lanes[lane].block_result.ok_or_else(|| {
                            RuntimeError::execution("block_result is used before it is declared")
                        })?;
                        self.lanes[lane].block_result =
                            Some(apply_binary(op, current, total)?.cast(dtype));
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn grid_reduce(
        &mut self,
        active: &[usize],
        op: BinaryOp,
        dtype: DataType,
        (blocks, threads): ([bool; 3], [bool; 3]),
        target: &TensorRef,
        input: Option<&KExpr>,
        pred: Option<&KExpr>,
    ) -> RuntimeResult<()> {
        self.stats.reductions += 1;
        let mut order: Vec<([usize; 3], [usize; 3])> = Vec::new();
        let mut groups: HashMap<([usize; 3], [usize; 3]), ReductionGroup> = HashMap::new();
        for &lane in active {
            let Lane { block, thread, .. } = self.lanes[lane];
            let key = (keep(block, blocks.map(|reduced| !reduced)), keep(thread, threads));
            let writes = self.predicate(lane, pred)?;
            let partial = match input {
                Some(input) if writes => Some(self.eval(lane, input)?.cast(dtype)),
                Some(_) => None,
                // Threads folded by the block reduction are represented by
                // the one at coordinate zero of every folded dimension.
                None if keep(thread, threads.map(|kept| !kept)) == [0; 3] => {
                    Some(self.lanes[lane].block_result.ok_or_else(|| {
                        RuntimeError::execution("block_result is used before it is declared")
                    })?)
                }
                None => None,
            };
            let group = groups.entry(key).or_insert_with(|| {
                order.push(key);
                ReductionGroup::default()
            });
            group.members.push(lane);
            if writes {
                group.writer.get_or_insert(lane);
            }
            if let Some(partial) = partial {
                group.total = Some(match group.total {
                    Some(total) => apply_binary(op, total, partial)?.cast(dtype),
                    None => partial,
                });
            }
        }

        for key in order {
            let Some(group) = groups.remove(&key) else {
                continue;
            };
            if let (Some(writer), Some(total)) = (group.writer, group.total) {
                let current = self.load(writer, target)?;
                let combined = apply_binary(op, current, total)?.cast(dtype);
                self.store(writer, target, combined)?;
            }
        }
        Ok(())
    }

    fn predicate(&mut self, lane: usize, pred: Option<&KExpr>) -> RuntimeResult<bool> {
        match pred {
            Some(pred) => Ok(self.eval(lane, pred)?.as_bool()),
            None => Ok(true),
        }
    }

    /// Evaluates an expression that must agree across the active threads.
    fn uniform(&mut self, active: &[usize], expr: &KExpr) -> RuntimeResult<i64> {
        let mut uniform = None;
        for &lane in active {
            let value = self.eval(lane, expr)?.as_i64();
            match uniform {
                Some(previous) if previous != value => {
                    return Err(RuntimeError::execution(format!(
                        "loop bound differs across threads ({previous} vs {value})"
                    )))
                }
                _ => uniform = Some(value),
            }
        }
        uniform.ok_or_else(|| RuntimeError::execution("loop bound evaluated without threads"))
    }

    fn eval(&mut self, lane: usize, expr: &KExpr) -> RuntimeResult<Value> {
        let value = match expr {
            KExpr::Int(v) => Value::Int(*v),
            KExpr::Float(v) => Value::Float(*v),
            KExpr::Bool(v) => Value::Bool(*v),
            KExpr::Index(index) => Value::Int(*self.loop_vars.get(index).ok_or_else(|| {
                RuntimeError::execution(format!("loop index i{index} is not in scope"))
            })?),
            KExpr::ParallelIndex(parallel) => {
                let slot = parallel_slot(*parallel)?;
                let lane = &self.lanes[lane];
                let coords = if parallel.is_block() {
                    lane.block
                } else {
                    lane.thread
                };
                Value::Int(coords[slot] as i64)
            }
            KExpr::ParallelDim(parallel) => {
                let slot = parallel_slot(*parallel)?;
                let dims = if parallel.is_block() {
                    self.config.grid
                } else {
                    self.config.block
                };
                Value::Int(dims[slot] as i64)
            }
            KExpr::Size { arg, name, dim } => {
                let size = self.tensor_arg(*arg)?.shape.get(*dim).copied();
                Value::Int(size.ok_or_else(|| {
                    RuntimeError::execution(format!("T{name} has no dimension {dim}"))
                })? as i64)
            }
            KExpr::Stride { arg, name, dim } => {
                let stride = self.tensor_arg(*arg)?.strides.get(*dim).copied();
                Value::Int(stride.ok_or_else(|| {
                    RuntimeError::execution(format!("T{name} has no dimension {dim}"))
                })? as i64)
            }
            KExpr::ScalarArg { arg, label } => {
                let dtype = self.param_dtype(*arg)?;
                match self.args.get(*arg) {
                    Some(KernelArg::Scalar(v)) => Value::Float(*v).cast(dtype),
                    _ => {
                        return Err(RuntimeError::arguments(format!(
                            "{label} expects a scalar argument"
                        )))
                    }
                }
            }
            KExpr::Unary(UnaryOp::RandLike, dtype, _) => self.sample().cast(*dtype),
            KExpr::Unary(op, dtype, input) => {
                let input = self.eval(lane, input)?;
                apply_unary(*op, *dtype, input)?
            }
            KExpr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lane, lhs)?;
                let rhs = self.eval(lane, rhs)?;
                apply_binary(*op, lhs, rhs)?
            }
            KExpr::Ternary(op, cond, on_true, on_false) => match op {
                TernaryOp::Where => {
                    if self.eval(lane, cond)?.as_bool() {
                        self.eval(lane, on_true)?
                    } else {
                        self.eval(lane, on_false)?
                    }
                }
            },
            KExpr::All(terms) => {
                for term in terms {
                    if !self.eval(lane, term)?.as_bool() {
                        return Ok(Value::Bool(false));
                    }
                }
                Value::Bool(true)
            }
            KExpr::Load(tensor) => self.load(lane, tensor)?,
            KExpr::Rand => self.sample(),
        };
        Ok(value)
    }

    fn sample(&mut self) -> Value {
        Value::Float(f64::from(self.rng.gen::<f32>()))
    }

    fn offset(&mut self, lane: usize, tensor: &TensorRef) -> RuntimeResult<usize> {
        let mut offset = 0i64;
        for term in &tensor.terms {
            offset += self.eval(lane, term)?.as_i64();
        }
        usize::try_from(offset).map_err(|_| {
            RuntimeError::execution(format!("T{} accessed at negative offset {offset}", tensor.name))
        })
    }

    fn load(&mut self, lane: usize, tensor: &TensorRef) -> RuntimeResult<Value> {
        let offset = self.offset(lane, tensor)?;
        self.stats.loads += 1;
        match tensor.storage {
            Storage::Global { arg } => {
                let dtype = self.param_dtype(arg)?;
                let element = self.tensor_arg(arg)?.data.get(offset).copied();
                let element = element.ok_or_else(|| out_of_bounds(tensor.name, offset))?;
                Ok(Value::from_element(element, dtype))
            }
            Storage::Local => {
                let buffer = self.lanes[lane].locals.get(&tensor.name).ok_or_else(|| {
                    RuntimeError::execution(format!("T{} is read before it is allocated", tensor.name))
                })?;
                buffer
                    .values
                    .get(offset)
                    .copied()
                    .ok_or_else(|| out_of_bounds(tensor.name, offset))
            }
        }
    }

    fn store(&mut self, lane: usize, tensor: &TensorRef, value: Value) -> RuntimeResult<()> {
        let offset = self.offset(lane, tensor)?;
        self.stats.stores += 1;
        match tensor.storage {
            Storage::Global { arg } => {
                let dtype = self.param_dtype(arg)?;
                let element = match self.args.get_mut(arg) {
                    Some(KernelArg::Tensor(host)) => host.data.get_mut(offset),
                    _ => {
                        return Err(RuntimeError::arguments(format!(
                            "T{} expects a tensor argument",
                            tensor.name
                        )))
                    }
                };
                let element = element.ok_or_else(|| out_of_bounds(tensor.name, offset))?;
                *element = value.cast(dtype).as_f64() as f32;
            }
            Storage::Local => {
                let buffer = self.lanes[lane].locals.get_mut(&tensor.name).ok_or_else(|| {
                    RuntimeError::execution(format!(
                        "T{} is written before it is allocated",
                        tensor.name
                    ))
                })?;
                let dtype = buffer.dtype;
                let slot = buffer
                    .values
                    .get_mut(offset)
                    .ok_or_else(|| out_of_bounds(tensor.name, offset))?;
                *slot = value.cast(dtype);
            }
        }
        Ok(())
    }

    fn tensor_arg(&self, arg: usize) -> RuntimeResult<&HostTensor> {
        self.args
            .get(arg)
            .and_then(KernelArg::as_tensor)
            .ok_or_else(|| RuntimeError::arguments(format!("argument {arg} is not a tensor")))
    }

    fn param_dtype(&self, arg: usize) -> RuntimeResult<DataType> {
        match self.kernel.params.get(arg).map(|p| p.kind) {
            Some(ParamKind::Tensor { dtype, .. } | ParamKind::Scalar { dtype }) => Ok(dtype),
            None => Err(RuntimeError::arguments(format!(
                "{} has no argument {arg}",
                self.kernel.name
            ))),
        }
    }
}

fn parallel_slot(parallel: ParallelType) -> RuntimeResult<usize> {
    parallel
        .dim_slot()
        .ok_or_else(|| RuntimeError::execution(format!("{parallel:?} has no launch dimension")))
}

fn out_of_bounds(name: usize, offset: usize) -> RuntimeError {
    RuntimeError::execution(format!("T{name} accessed out of bounds at offset {offset}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_stays_integral() {
        let v = apply_binary(BinaryOp::CeilDiv, Value::Int(7), Value::Int(2)).expect("ceil div");
        assert_eq!(v, Value::Int(4));
        let v = apply_binary(BinaryOp::Lt, Value::Int(1), Value::Float(0.5)).expect("lt");
        assert_eq!(v, Value::Bool(false));
        assert!(apply_binary(BinaryOp::Div, Value::Int(1), Value::Int(0)).is_err());
    }

    #[test]
    fn unary_results_take_the_output_dtype() {
        let v = apply_unary(UnaryOp::Cast, DataType::Int, Value::Float(2.75)).expect("cast");
        assert_eq!(v, Value::Int(2));
        let v = apply_unary(UnaryOp::Neg, DataType::Float, Value::Int(3)).expect("neg");
        assert_eq!(v, Value::Float(-3.0));
    }

    #[test]
    fn lanes_are_numbered_x_fastest() {
        assert_eq!(unravel(5, [4, 2, 1]), [1, 1, 0]);
        assert_eq!(keep([3, 2, 1], [true, false, true]), [3, 0, 1]);
    }
}
