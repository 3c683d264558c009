//! Job lifecycle status.

use serde::{Deserialize, Serialize};

/// The lifecycle state of a pipeline job.
///
/// `New` exists only between construction and publication: by the time
/// [`run`](crate::JobTable::run) returns a job id, the job is `Running`.
/// Terminal states are reached exactly once, by observing the leader
/// process's death.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobStatus {
    /// Constructed but not yet published.
    New = 0,
    /// The leader process is alive (or dead but not yet reaped).
    Running = 1,
    /// The leader exited normally.
    Completed = 2,
    /// The last stage died by a signal other than `SIGKILL`, so the leader
    /// aborted itself.
    Aborted = 3,
    /// The leader was killed after a cancel request.
    Canceled = 4,
}

impl JobStatus {
    /// Returns `true` once the job has reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Canceled)
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Aborted,
            _ => Self::Canceled,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}
