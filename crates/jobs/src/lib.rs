#![allow(unsafe_code)] // fork/exec plumbing and the async-signal-safe reap path
#![warn(missing_docs)]

//! # skiff-jobs
//!
//! A signal-driven pipeline job runner:
//!
//! - [`Pipeline`] / [`Command`] — owned descriptions of multi-stage pipe
//!   chains with optional redirection and output capture
//! - [`JobTable`] — the process-wide table behind `run` / `wait` / `poll` /
//!   `cancel` / `expunge` / `output` / `show` / `pause`
//! - [`JobStatus`] — the five-state lifecycle, with transitions validated by
//!   the [`transition`] module
//!
//! Each job is one **leader** process (its own process group) that forks one
//! child per stage, wires the pipes, reaps its stages, and reports the last
//! stage's fate: the leader exits with its code on a normal exit and aborts
//! itself when the stage died by a signal. The parent observes leader deaths
//! through SIGCHLD alone; cancellation (SIGKILL to the group) is recognised
//! at reap time from the termination signal plus the job's one-shot cancel
//! flag.
//!
//! The job list is append-only and intrusive: handlers walk it and flip
//! status atoms, but never unlink. All operations belong to a single main
//! thread; none is safe under concurrent invocation.

pub mod error;
mod job;
mod leader;
pub mod pipeline;
mod signal;
pub mod status;
mod table;
pub mod transition;

pub use error::{JobError, JobResult};
pub use job::JobId;
pub use pipeline::{Command, Pipeline};
pub use status::JobStatus;
pub use table::JobTable;
