//! Failure taxonomy for runtime supervision.

use thiserror::Error;

use promptdock_sandbox::SandboxError;

use crate::llm::LlmError;
use crate::store::StoreError;
use crate::validator::ValidationError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime not found: {0}")]
    NotFound(String),
    #[error("failed to get code from model: {0}")]
    Llm(#[from] LlmError),
    #[error("code validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("runtime {0} has no live interpreter")]
    NotExecutable(String),
    #[error("runtime {0} entered error state")]
    CandidateError(String),
    #[error("runtime failed after {0} attempts")]
    RetriesExhausted(u32),
    #[error("all concurrent execution attempts failed, last error: {0}")]
    AllCandidatesFailed(String),
    #[error("context canceled")]
    Cancelled,
}

impl RuntimeError {
    /// Cancellation is propagated for control flow but is not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            RuntimeError::Cancelled | RuntimeError::Sandbox(SandboxError::Cancelled)
        )
    }
}
