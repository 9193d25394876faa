//! Host interpreter for lowered fuse-rs kernels.
//!
//! [`CpuRuntime`] walks the statement tree produced by lowering and runs
//! every simulated thread of every block in lockstep, so block and grid
//! reductions see the same partial values a device would.

pub mod cpu;

pub use cpu::CpuRuntime;

const RUNTIME_NAMES: [&str; 2] = ["cpu", "ref-cpu"];

/// Makes the interpreter available through `fuse_rs::runtime::create_runtime`
/// as `cpu` and `ref-cpu`.
///
/// Loading the library already does this on targets with `.init_array`;
/// calling it again only replaces the constructors.
pub fn register_cpu_runtime() {
    for name in RUNTIME_NAMES {
        fuse_rs::runtime::register_runtime(name, || Box::new(CpuRuntime::new()));
    }
}

#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_RUNTIME: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_runtime();
    }
    register
};
