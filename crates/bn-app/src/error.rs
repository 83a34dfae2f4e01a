use bn_core::JobId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Job submission failed: {0}")]
    SubmissionFailed(String),
    #[error("A job is already active")]
    AlreadyActive,
    #[error("Invalid poller state: {0}")]
    InvalidState(&'static str),
    #[error("Job {0} is already being polled elsewhere")]
    AlreadyTracked(JobId),
    #[error("Submission was cancelled")]
    Cancelled,
}
