use thiserror::Error;

/// Failures raised while building, scheduling or lowering a [`Fusion`](crate::ir::Fusion).
///
/// Every variant carries a message naming the offending node in its printed
/// form (`T3`, `f5`, `i7`, ...). Evaluating a scalar whose inputs are not bound
/// is not an error: the evaluator reports it as `None`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FusionError {
    /// A node is unknown to, removed from, or owned by a different fusion, or a
    /// declared input/output was about to be removed.
    #[error("graph integrity violation: {0}")]
    GraphIntegrity(String),
    /// A value cannot play the role it was declared for.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A scheduling or printing request the IR cannot express.
    #[error("unsupported transform: {0}")]
    UnsupportedTransform(String),
    /// A bind request on a derived or constant scalar.
    #[error("binding error: {0}")]
    Binding(String),
}

impl FusionError {
    pub fn integrity(msg: impl Into<String>) -> Self {
        FusionError::GraphIntegrity(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        FusionError::InvalidInput(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        FusionError::UnsupportedTransform(msg.into())
    }

    pub fn binding(msg: impl Into<String>) -> Self {
        FusionError::Binding(msg.into())
    }
}

pub type FusionResult<T> = Result<T, FusionError>;
