//! State machine transition validation for job statuses.

use crate::error::JobError;
use crate::status::JobStatus;

/// Returns `true` if the transition from `from` to `to` is valid.
///
/// Transitions out of `Running` are monotonic and one-shot; terminal states
/// have no successors.
#[must_use]
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::New, JobStatus::Running)
            | (JobStatus::Running, JobStatus::Completed)
            | (JobStatus::Running, JobStatus::Aborted)
            | (JobStatus::Running, JobStatus::Canceled)
    )
}

/// Validate a transition, returning an error if invalid.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), JobError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(JobError::InvalidTransition { from, to })
    }
}
