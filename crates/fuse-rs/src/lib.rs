//! Tensor fusion compiler.
//!
//! A [`Fusion`] owns a dataflow graph of tensor and scalar values. Tensors
//! are scheduled by rewriting their iteration domains (split, merge,
//! reorder, compute-at, rFactor, parallelize) and the scheduled graph is
//! lowered to a loop nest printed as GPU kernel source.

pub mod env;
pub mod error;
pub mod eval;
pub mod frontend;
pub mod ir;
pub mod lower;
pub mod printer;
pub mod runtime;
pub mod transform;
pub mod traversal;

pub use env::Config;
pub use error::{FusionError, FusionResult};
pub use eval::EvaluationContext;
pub use ir::{DataType, Fusion, FusionGuard, ParallelType, ValId};
pub use lower::{generate_kernel, KernelOptions};
pub use runtime::{CompiledKernel, HostTensor, KernelArg, KernelRuntime, LaunchConfig};
