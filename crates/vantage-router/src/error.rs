use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No candidate model satisfies the request: {0}")]
    NoCandidate(String),

    #[error("Circuit open for provider: {0}")]
    CircuitOpen(String),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("All candidates failed: {0}")]
    AllCandidatesFailed(String),

    #[error("Budget exceeded for workspace {workspace_id}: spent {spent:.4} of {total:.4}")]
    BudgetExceeded {
        workspace_id: String,
        spent: f64,
        total: f64,
    },
}

pub type RouterResult<T> = Result<T, RouterError>;
