//! Job runner error types.

use thiserror::Error;

use crate::job::JobId;
use crate::status::JobStatus;

/// Result alias for job runner operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors surfaced by the job runner.
#[derive(Debug, Error)]
pub enum JobError {
    /// No job with the given id exists.
    #[error("unknown job id {0}")]
    UnknownJob(JobId),

    /// The operation requires a terminal job.
    #[error("job {0} is not in a terminal state")]
    NotTerminal(JobId),

    /// The operation requires a non-terminal job.
    #[error("job {0} already reached a terminal state")]
    Terminal(JobId),

    /// A second cancel was attempted; cancel requests are one-shot.
    #[error("job {0} already has a cancel request")]
    AlreadyCanceled(JobId),

    /// The pipeline contains no commands.
    #[error("pipeline has no commands")]
    EmptyPipeline,

    /// A pipeline word or path cannot be passed to `exec`.
    #[error("pipeline contains an empty command or an interior nul byte")]
    InvalidPipeline,

    /// A state transition is not valid for the current status.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: JobStatus,
        /// Attempted target status.
        to: JobStatus,
    },

    /// An OS primitive (`fork`, `pipe`, `sigaction`, ...) failed.
    #[error("os failure: {0}")]
    Os(#[from] nix::errno::Errno),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_job_display() {
        let err = JobError::UnknownJob(JobId::from_raw(3));
        assert_eq!(err.to_string(), "unknown job id 3");
    }

    #[test]
    fn os_error_from_errno() {
        let err = JobError::from(nix::errno::Errno::ECHILD);
        assert!(err.to_string().starts_with("os failure:"));
    }

    #[test]
    fn empty_pipeline_display() {
        assert_eq!(
            JobError::EmptyPipeline.to_string(),
            "pipeline has no commands"
        );
    }
}
