use thiserror::Error;

use vantage_types::MissionStatus;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Queue full (capacity {0})")]
    QueueFull(usize),

    #[error("Mission not found: {0}")]
    NotFound(String),

    #[error("Invalid state for {op}: mission {id} is {status}")]
    InvalidState {
        id: String,
        status: MissionStatus,
        op: &'static str,
    },

    #[error("Budget exceeded for mission {0}")]
    BudgetExceeded(String),

    #[error("No candidate agent: {0}")]
    NoCandidate(String),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Approval request not found: {0}")]
    NotFound(String),

    #[error("Request already {0}")]
    InvalidState(String),

    #[error("Approval request expired: {0}")]
    Expired(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
