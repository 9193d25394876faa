//! Execution boundary: compiled kernels, host tensors and launch settings.
//!
//! A [`KernelRuntime`] receives a [`CompiledKernel`] (source text plus the
//! lowered statement tree) together with arguments in declaration order:
//! fusion inputs first, then pre-allocated outputs. Runtimes are registered
//! by name so callers can pick one without depending on its crate.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{FusionError, FusionResult};
use crate::ir::Fusion;
use crate::lower::{self, Kernel, KernelOptions, KernelParam, ParamKind};
use crate::printer;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("argument mismatch: {0}")]
    Arguments(String),
    #[error("kernel execution failure: {0}")]
    Execution(String),
    #[error(transparent)]
    Fusion(#[from] FusionError),
}

impl RuntimeError {
    pub fn arguments(msg: impl Into<String>) -> Self {
        RuntimeError::Arguments(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        RuntimeError::Execution(msg.into())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Strided host buffer of `f32` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub data: Vec<f32>,
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }
    strides
}

impl HostTensor {
    /// Row-major tensor over `data`.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> RuntimeResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(RuntimeError::arguments(format!(
                "shape {shape:?} holds {numel} elements but {} were given",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            data,
        })
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            data: vec![value; numel],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.rank() || index.iter().zip(&self.shape).any(|(i, n)| i >= n) {
            return None;
        }
        let offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        self.data.get(offset).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Tensor(HostTensor),
    Scalar(f64),
}

impl KernelArg {
    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            KernelArg::Tensor(t) => Some(t),
            KernelArg::Scalar(_) => None,
        }
    }
}

/// Grid and block dimensions of a launch, `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub grid: [usize; 3],
    pub block: [usize; 3],
    #[serde(default)]
    pub rng_seed: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            grid: [1, 1, 1],
            block: [1, 1, 1],
            rng_seed: 0,
        }
    }
}

impl LaunchConfig {
    pub fn new(grid: [usize; 3], block: [usize; 3]) -> Self {
        Self {
            grid,
            block,
            rng_seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn threads_per_block(&self) -> usize {
        self.block.iter().product()
    }

    pub fn num_blocks(&self) -> usize {
        self.grid.iter().product()
    }
}

/// Kernel text plus everything a runtime needs to bind arguments.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub name: String,
    pub source: String,
    pub kernel: Kernel,
}

impl CompiledKernel {
    pub fn params(&self) -> &[KernelParam] {
        &self.kernel.params
    }

    /// Checks argument count, kinds and tensor ranks against the schema.
    pub fn check_args(&self, args: &[KernelArg]) -> RuntimeResult<()> {
        let params = self.params();
        if args.len() != params.len() {
            return Err(RuntimeError::arguments(format!(
                "{} expects {} arguments, got {}",
                self.name,
                params.len(),
                args.len()
            )));
        }
        for (param, arg) in params.iter().zip(args) {
            match (param.kind, arg) {
                (ParamKind::Tensor { ndims, .. }, KernelArg::Tensor(t)) => {
                    if t.rank() != ndims || t.strides.len() != ndims {
                        return Err(RuntimeError::arguments(format!(
                            "{} has {ndims} dimensions, got a tensor of rank {}",
                            param.label,
                            t.rank()
                        )));
                    }
                }
                (ParamKind::Scalar { .. }, KernelArg::Scalar(_)) => {}
                (ParamKind::Tensor { .. }, KernelArg::Scalar(_)) => {
                    return Err(RuntimeError::arguments(format!(
                        "{} is a tensor but a scalar was passed",
                        param.label
                    )))
                }
                (ParamKind::Scalar { .. }, KernelArg::Tensor(_)) => {
                    return Err(RuntimeError::arguments(format!(
                        "{} is a scalar but a tensor was passed",
                        param.label
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Lowers `fusion` and prints the result under `name`.
pub fn compile_kernel(fusion: &Fusion, name: &str) -> FusionResult<CompiledKernel> {
    compile_kernel_with(fusion, name, &KernelOptions::default())
}

pub fn compile_kernel_with(
    fusion: &Fusion,
    name: &str,
    options: &KernelOptions,
) -> FusionResult<CompiledKernel> {
    let kernel = lower::lower_fusion(fusion, name, options)?;
    let source = printer::kernel_source(&kernel);
    if options.config.dump_kernel {
        log::info!("compiled kernel {name}:\n{source}");
    }
    Ok(CompiledKernel {
        name: name.to_string(),
        source,
        kernel,
    })
}

/// A device (or emulator) able to run compiled kernels.
pub trait KernelRuntime: Send + Sync {
    fn runtime_name(&self) -> &str;

    /// Runs `kernel` once; output tensors in `args` are written in place.
    fn launch(
        &self,
        kernel: &CompiledKernel,
        config: &LaunchConfig,
        args: &mut [KernelArg],
    ) -> RuntimeResult<()>;
}

/// Compiles and launches `fusion` in one step.
pub fn run_fusion(
    runtime: &dyn KernelRuntime,
    fusion: &Fusion,
    name: &str,
    config: &LaunchConfig,
    args: &mut [KernelArg],
) -> anyhow::Result<()> {
    let compiled =
        compile_kernel(fusion, name).with_context(|| format!("failed to compile {name}"))?;
    runtime.launch(&compiled, config, args).with_context(|| {
        format!(
            "failed to launch {name} on {} with grid {:?} block {:?}",
            runtime.runtime_name(),
            config.grid,
            config.block
        )
    })
}

// -------------------------------------------------------------------------
// Registry
// -------------------------------------------------------------------------

/// Factory creating a fresh runtime instance.
pub type RuntimeConstructor = Box<dyn Fn() -> Box<dyn KernelRuntime> + Send + Sync>;

struct RuntimeRegistry {
    runtimes: RwLock<HashMap<String, RuntimeConstructor>>,
}

impl RuntimeRegistry {
    fn new() -> Self {
        Self {
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: RuntimeConstructor) {
        self.runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Box<dyn KernelRuntime>> {
        let registry = self.runtimes.read().unwrap_or_else(PoisonError::into_inner);
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn has(&self, name: &str) -> bool {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<RuntimeRegistry> = OnceLock::new();

fn global_registry() -> &'static RuntimeRegistry {
    GLOBAL_REGISTRY.get_or_init(RuntimeRegistry::new)
}

/// Registers a runtime under `name`; a later registration replaces it.
pub fn register_runtime<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Box<dyn KernelRuntime> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// New instance of the runtime registered under `name`.
pub fn create_runtime(name: &str) -> Option<Box<dyn KernelRuntime>> {
    global_registry().create(name)
}

/// Registered runtime names, sorted.
pub fn list_runtimes() -> Vec<String> {
    global_registry().list()
}

pub fn has_runtime(name: &str) -> bool {
    global_registry().has(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl KernelRuntime for Noop {
        fn runtime_name(&self) -> &str {
            "noop"
        }

        fn launch(&self, _: &CompiledKernel, _: &LaunchConfig, _: &mut [KernelArg]) -> RuntimeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn registered_runtimes_can_be_created_by_name() {
        register_runtime("noop-test", || Box::new(Noop));
        assert!(has_runtime("noop-test"));
        assert!(list_runtimes().contains(&"noop-test".to_string()));
        let runtime = create_runtime("noop-test").expect("registered");
        assert_eq!(runtime.runtime_name(), "noop");
        assert!(create_runtime("missing").is_none());
    }

    #[test]
    fn host_tensors_are_row_major() {
        let t = HostTensor::from_vec(&[2, 3], (0..6).map(|v| v as f32).collect()).expect("tensor");
        assert_eq!(t.strides, vec![3, 1]);
        assert_eq!(t.get(&[1, 2]), Some(5.0));
        assert_eq!(t.get(&[2, 0]), None);
        assert!(HostTensor::from_vec(&[2, 2], vec![0.0; 3]).is_err());
    }

    #[test]
    fn launch_config_roundtrips_through_json() {
        let config = LaunchConfig::new([4, 1, 1], [128, 1, 1]).with_seed(7);
        let text = serde_json::to_string(&config).expect("serialize");
        let back: LaunchConfig = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, config);
        assert_eq!(back.threads_per_block(), 128);
        assert_eq!(back.num_blocks(), 4);
    }
}
