use crate::types::PromptId;

/// Errors raised synchronously to a caller that misused an operation.
///
/// Execution failures reported by the backend are never represented here;
/// they travel as lifecycle events instead.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Previous run {prompt_id} still in progress")]
    SessionActive { prompt_id: PromptId },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),
}
