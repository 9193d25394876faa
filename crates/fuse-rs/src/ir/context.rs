//! Thread-local active-fusion context.
//!
//! Builders that do not receive a fusion explicitly (the textual front-end,
//! scripted schedules) target the fusion installed on the current thread.
//! Installing one pushes it on a per-thread stack; dropping the returned
//! [`FusionGuard`] restores the previously active fusion.
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use fuse_rs::ir::context::{with_active_fusion, FusionGuard};
//! use fuse_rs::ir::{DataType, Fusion};
//!
//! let fusion = Rc::new(RefCell::new(Fusion::new()));
//! {
//!     let _guard = FusionGuard::new(fusion.clone());
//!     with_active_fusion(|f| Ok(f.new_float(1.0))).expect("fusion is active");
//! }
//! assert_eq!(fusion.borrow().deterministic_vals().len(), 1);
//! ```
//!
//! Different threads never observe each other's stacks, so independent
//! fusions can be built concurrently.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{FusionError, FusionResult};
use crate::ir::fusion::Fusion;

/// Fusion shared between its owner and the context stack.
pub type SharedFusion = Rc<RefCell<Fusion>>;

thread_local! {
    static FUSION_STACK: RefCell<Vec<SharedFusion>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard that restores the previously active fusion when dropped.
///
/// Guards must be dropped in reverse creation order, which scoping enforces.
pub struct FusionGuard {
    active: bool,
    _not_send: PhantomData<Rc<()>>,
}

impl FusionGuard {
    /// Makes `fusion` the active fusion of the current thread.
    pub fn new(fusion: SharedFusion) -> Self {
        FUSION_STACK.with(|stack| stack.borrow_mut().push(fusion));
        Self {
            active: true,
            _not_send: PhantomData,
        }
    }
}

impl Drop for FusionGuard {
    fn drop(&mut self) {
        if self.active {
            FUSION_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

/// Runs `f` with `fusion` installed as the active fusion.
pub fn with_fusion<F, R>(fusion: SharedFusion, f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = FusionGuard::new(fusion);
    let result = f();
    drop(guard);
    result
}

/// Currently active fusion of this thread, if any.
pub fn active_fusion() -> Option<SharedFusion> {
    FUSION_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Depth of the active-fusion stack of this thread.
pub fn depth() -> usize {
    FUSION_STACK.with(|stack| stack.borrow().len())
}

/// Mutably borrows the active fusion for the duration of `f`.
///
/// Fails when no fusion is active or when the active fusion is already
/// borrowed further up the call stack.
pub fn with_active_fusion<F, R>(f: F) -> FusionResult<R>
where
    F: FnOnce(&mut Fusion) -> FusionResult<R>,
{
    let fusion = active_fusion()
        .ok_or_else(|| FusionError::integrity("no fusion is active on this thread"))?;
    let mut borrowed = fusion
        .try_borrow_mut()
        .map_err(|_| FusionError::integrity("the active fusion is already borrowed"))?;
    f(&mut borrowed)
}
