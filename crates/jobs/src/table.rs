//! The process-wide job table.

use std::fs::File;
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{ForkResult, Pid, fork, setpgid};
use tracing::debug;

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobList};
use crate::leader;
use crate::pipeline::Pipeline;
use crate::signal;
use crate::status::JobStatus;

static TABLE: OnceLock<JobTable> = OnceLock::new();

/// Launches, observes, cancels, waits on, and reaps pipeline jobs.
///
/// One table exists per process: leaders are observed through process-wide
/// SIGCHLD delivery, so there is nothing to scope narrower. All operations
/// are meant for a single main thread; the only cross-context mutation is
/// the handler flipping a job's status atom (see [`crate`] docs).
pub struct JobTable {
    jobs: JobList,
}

impl JobTable {
    /// One-shot setup: publish the table and install the SIGCHLD/SIGABRT
    /// dispositions. Idempotent within the process lifetime.
    pub fn init() -> JobResult<&'static JobTable> {
        let table = TABLE.get_or_init(|| JobTable {
            jobs: JobList::new(),
        });
        signal::install_handlers()?;
        Ok(table)
    }

    /// The table, if [`init`](Self::init) has run.
    pub fn get() -> Option<&'static JobTable> {
        TABLE.get()
    }

    /// Fork a leader for `pipeline` and track it as a new `Running` job.
    ///
    /// When the pipeline asks for capture, a pipe is created first and the
    /// leader's stdout is pointed at its write end; the read end stays with
    /// the job record.
    pub fn run(&self, pipeline: Pipeline) -> JobResult<JobId> {
        if pipeline.is_empty() {
            return Err(JobError::EmptyPipeline);
        }
        // Everything that allocates happens before the fork.
        let plan = leader::ExecPlan::prepare(&pipeline)?;
        let capture_pipe = if pipeline.captures_output() {
            Some(nix::unistd::pipe()?)
        } else {
            None
        };

        let _guard = signal::block_sigchld();
        // SAFETY: the child immediately enters the leader protocol, which
        // sticks to exec-safe plumbing; argv CStrings were prepared above.
        match unsafe { fork() }? {
            ForkResult::Child => {
                if let Some((read_end, write_end)) = capture_pipe {
                    drop(read_end);
                    leader::redirect_stdout(write_end);
                }
                leader::run(&plan)
            }
            ForkResult::Parent { child } => {
                // Mirror the leader's own setpgid to close the startup race.
                let _ = setpgid(child, child);
                let capture_source = capture_pipe.map(|(read_end, write_end)| {
                    drop(write_end);
                    File::from(read_end)
                });
                let id = self.jobs.next_id();
                self.jobs.push_front(Box::new(Job::new(
                    id,
                    child.as_raw(),
                    pipeline,
                    capture_source,
                )));
                debug!(id = %id, pgid = child.as_raw(), "job launched");
                Ok(id)
            }
        }
    }

    /// Block until the leader of `id` is reaped and return its raw wait
    /// status.
    ///
    /// The capture pipe is drained first, so a pipeline that fills the pipe
    /// buffer cannot deadlock against its own observer. Reaping races
    /// benignly with the SIGCHLD handler: whichever side gets the status
    /// records the transition.
    pub fn wait(&self, id: JobId) -> JobResult<i32> {
        let job = self.jobs.find(id).ok_or(JobError::UnknownJob(id))?;
        job.drain_capture();
        loop {
            if job.status().is_terminal() {
                return Ok(job.wait_status());
            }
            let mut raw: libc::c_int = 0;
            // SAFETY: blocking wait on the leader pid with a stack out-param.
            let pid = unsafe { libc::waitpid(job.pgid(), &mut raw, 0) };
            if pid == job.pgid() {
                job.record_exit(raw);
                continue;
            }
            match Errno::last() {
                Errno::EINTR => {}
                Errno::ECHILD => {
                    // The handler reaped first; its status store is imminent.
                    while !job.status().is_terminal() {
                        std::thread::yield_now();
                    }
                    return Ok(job.wait_status());
                }
                other => return Err(other.into()),
            }
        }
    }

    /// Current status of `id`. Callers test
    /// [`is_terminal`](JobStatus::is_terminal); transitions observed here are
    /// monotonic.
    pub fn poll(&self, id: JobId) -> JobResult<JobStatus> {
        self.jobs
            .find(id)
            .map(Job::status)
            .ok_or(JobError::UnknownJob(id))
    }

    /// Request cancellation: SIGKILL the job's process group. One-shot per
    /// job; terminal and repeat requests fail.
    ///
    /// `Canceled` is not observed until the leader is reaped; SIGKILL cannot
    /// be trapped, so termination is guaranteed eventually.
    pub fn cancel(&self, id: JobId) -> JobResult<()> {
        let job = self.jobs.find(id).ok_or(JobError::UnknownJob(id))?;
        if job.status().is_terminal() {
            return Err(JobError::Terminal(id));
        }
        if job.mark_canceled() {
            return Err(JobError::AlreadyCanceled(id));
        }
        killpg(Pid::from_raw(job.pgid()), Signal::SIGKILL)?;
        debug!(id = %id, "cancel requested");
        Ok(())
    }

    /// Drop a terminal job and everything it owns; its id stops being
    /// observable.
    pub fn expunge(&self, id: JobId) -> JobResult<()> {
        let job = self.jobs.find(id).ok_or(JobError::UnknownJob(id))?;
        if !job.status().is_terminal() {
            return Err(JobError::NotTerminal(id));
        }
        let _guard = signal::block_sigchld();
        drop(self.jobs.unlink(id));
        debug!(id = %id, "job expunged");
        Ok(())
    }

    /// The captured stdout of a terminal job; `None` for unknown or
    /// non-terminal jobs and for jobs that never asked for capture.
    pub fn output(&self, id: JobId) -> Option<Vec<u8>> {
        let job = self.jobs.find(id)?;
        if !job.status().is_terminal() {
            return None;
        }
        // Writers are dead, so this finishes at EOF without blocking.
        job.drain_capture();
        job.captured()
    }

    /// Write one `<id>\t<pgid>\t<status>\t<pipeline>` line per job, newest
    /// first.
    pub fn show<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for job in self.jobs.iter() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                job.id(),
                job.pgid(),
                job.status(),
                job.pipeline()
            )?;
        }
        Ok(())
    }

    /// Suspend until a signal of interest (SIGCHLD or SIGABRT) is delivered.
    pub fn pause(&self) -> JobResult<()> {
        signal::suspend_for_signal()
    }

    /// Cancel every non-terminal job, wait for all of them, and release every
    /// job record and capture buffer.
    pub fn fini(&self) {
        for job in self.jobs.iter() {
            if !job.status().is_terminal() && !job.mark_canceled() {
                let _ = killpg(Pid::from_raw(job.pgid()), Signal::SIGKILL);
            }
        }
        let ids: Vec<JobId> = self.jobs.iter().map(Job::id).collect();
        for id in ids {
            let _ = self.wait(id);
        }
        let _guard = signal::block_sigchld();
        self.jobs.clear();
        debug!("job table finalized");
    }

    /// Handler-side hook: route a reaped leader pid to its job.
    pub(crate) fn record_reap(&self, pid: libc::pid_t, raw: i32) {
        self.jobs.record_reap(pid, raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Command;

    #[test]
    fn init_is_idempotent() {
        let a = JobTable::init().unwrap() as *const JobTable;
        let b = JobTable::init().unwrap() as *const JobTable;
        assert_eq!(a, b);
        assert!(JobTable::get().is_some());
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let table = JobTable::init().unwrap();
        assert!(matches!(
            table.run(Pipeline::new()),
            Err(JobError::EmptyPipeline)
        ));
    }

    #[test]
    fn unknown_ids_error() {
        let table = JobTable::init().unwrap();
        let ghost = JobId::from_raw(u32::MAX);
        assert!(matches!(table.poll(ghost), Err(JobError::UnknownJob(_))));
        assert!(matches!(table.wait(ghost), Err(JobError::UnknownJob(_))));
        assert!(matches!(table.cancel(ghost), Err(JobError::UnknownJob(_))));
        assert!(matches!(table.expunge(ghost), Err(JobError::UnknownJob(_))));
        assert!(table.output(ghost).is_none());
    }

    #[test]
    fn nul_bytes_are_rejected_before_forking() {
        let table = JobTable::init().unwrap();
        let pipeline = Pipeline::new().command(Command::new("ec\0ho"));
        assert!(matches!(
            table.run(pipeline),
            Err(JobError::InvalidPipeline)
        ));
    }
}
