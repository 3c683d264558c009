//! The leader process: first child of `run`, owner of the job's process
//! group, and assembler of the stage pipe chain.
//!
//! The argv and path `CString`s are prepared in the parent before the leader
//! is forked, so the allocation-free post-fork path sticks to
//! `pipe`/`fork`/`dup2`/`open`/`exec`/`waitpid`. The leader exits with the
//! last stage's exit code, aborts itself when the last stage died by a
//! signal, and on any OS failure SIGKILLs its own group and aborts.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, killpg, raise,
                       sigaction, sigprocmask};
use nix::unistd::{ForkResult, Pid, execvp, fork, getpgrp, getpid, setpgid};

use crate::error::{JobError, JobResult};
use crate::pipeline::Pipeline;

/// One stage's exec arguments, NUL-terminated ahead of the fork.
pub(crate) struct Stage {
    program: CString,
    argv: Vec<CString>,
}

/// A pipeline lowered to exec-ready form.
pub(crate) struct ExecPlan {
    stages: Vec<Stage>,
    input: Option<CString>,
    output: Option<CString>,
}

impl ExecPlan {
    /// Lower `pipeline` into `CString`s. Fails on interior NUL bytes; the
    /// runner reports those before any fork happens.
    pub(crate) fn prepare(pipeline: &Pipeline) -> JobResult<Self> {
        let mut stages = Vec::with_capacity(pipeline.commands().len());
        for command in pipeline.commands() {
            if command.words().is_empty() {
                return Err(JobError::InvalidPipeline);
            }
            let argv = command
                .words()
                .iter()
                .map(|word| CString::new(word.as_str()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| JobError::InvalidPipeline)?;
            stages.push(Stage {
                program: argv[0].clone(),
                argv,
            });
        }
        let path_cstring = |path: &std::path::Path| {
            CString::new(path.as_os_str().as_bytes()).map_err(|_| JobError::InvalidPipeline)
        };
        Ok(Self {
            stages,
            input: pipeline.input_file().map(path_cstring).transpose()?,
            output: pipeline.output_file().map(path_cstring).transpose()?,
        })
    }
}

/// Point the calling process's stdout at `fd` (the capture pipe's write
/// end). Called in the freshly forked leader, before any stage exists.
pub(crate) fn redirect_stdout(fd: OwnedFd) {
    // SAFETY: plain dup2 onto stdout; the original is closed by drop.
    unsafe { libc::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO) };
    drop(fd);
}

/// Leader entry point; never returns.
pub(crate) fn run(plan: &ExecPlan) -> ! {
    // Establish the job's process group; the parent mirrors this call.
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    reset_inherited_signals();

    match run_stages(plan) {
        Ok(last_raw) => {
            if libc::WIFEXITED(last_raw) {
                // SAFETY: _exit is the only sane way out of a forked child.
                unsafe { libc::_exit(libc::WEXITSTATUS(last_raw)) }
            }
            // The last stage died by a signal: abort so the parent can tell
            // this apart from a normal exit.
            let _ = raise(Signal::SIGABRT);
            // SAFETY: unreachable unless SIGABRT was somehow suppressed.
            unsafe { libc::_exit(1) }
        }
        Err(_) => bail_group(),
    }
}

/// The parent's SIGCHLD handler and mask must not leak into the job: the
/// leader reaps its own stages synchronously, and a raised SIGABRT has to
/// actually terminate.
fn reset_inherited_signals() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: restoring default dispositions in a single-threaded child.
    unsafe {
        let _ = sigaction(Signal::SIGCHLD, &default);
        let _ = sigaction(Signal::SIGABRT, &default);
    }
    let mut unblock = SigSet::empty();
    unblock.add(Signal::SIGCHLD);
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None);
}

/// OS failure while assembling the chain: take the whole group down.
fn bail_group() -> ! {
    let _ = killpg(getpgrp(), Signal::SIGKILL);
    std::process::abort();
}

/// Fork and wire every stage, then reap them all; returns the last stage's
/// raw wait status.
fn run_stages(plan: &ExecPlan) -> Result<i32, Errno> {
    let leader_pgid = getpid();
    let stage_count = plan.stages.len();

    // Inbound fd for the next stage's stdin; -1 means inherit.
    let mut prev_in: libc::c_int = -1;
    if let Some(input) = &plan.input {
        // SAFETY: NUL-terminated path prepared before the fork.
        prev_in = unsafe { libc::open(input.as_ptr(), libc::O_RDONLY) };
        if prev_in < 0 {
            return Err(Errno::last());
        }
    }

    let mut last_pid: libc::pid_t = -1;
    for (index, stage) in plan.stages.iter().enumerate() {
        let last = index + 1 == stage_count;

        let mut pipe_fds: [libc::c_int; 2] = [-1, -1];
        if !last {
            // SAFETY: out-param array lives across the call.
            if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
                return Err(Errno::last());
            }
        }

        // The last stage writes to the output file when one was named, and
        // otherwise inherits the leader's stdout, which under capture the
        // parent already pointed at the capture pipe.
        let out_fd: libc::c_int = if last {
            match &plan.output {
                Some(output) => {
                    // SAFETY: NUL-terminated path prepared before the fork.
                    let fd = unsafe {
                        libc::open(
                            output.as_ptr(),
                            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                            0o644,
                        )
                    };
                    if fd < 0 {
                        return Err(Errno::last());
                    }
                    fd
                }
                None => -1,
            }
        } else {
            pipe_fds[1]
        };

        // SAFETY: the child only redirects fds and execs.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let _ = setpgid(Pid::from_raw(0), leader_pgid);
                // SAFETY: raw fd plumbing on just-inherited descriptors.
                unsafe {
                    if prev_in >= 0 {
                        libc::dup2(prev_in, libc::STDIN_FILENO);
                        libc::close(prev_in);
                    }
                    if out_fd >= 0 {
                        libc::dup2(out_fd, libc::STDOUT_FILENO);
                        libc::close(out_fd);
                    }
                    if !last {
                        libc::close(pipe_fds[0]);
                    }
                }
                let _ = execvp(&stage.program, &stage.argv);
                // SAFETY: exec failed; leave without running any Rust
                // cleanup in the forked image.
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                // SAFETY: closing our copies of fds the stage now owns.
                unsafe {
                    if prev_in >= 0 {
                        libc::close(prev_in);
                    }
                    if out_fd >= 0 {
                        libc::close(out_fd);
                    }
                }
                prev_in = if last { -1 } else { pipe_fds[0] };
                if last {
                    last_pid = child.as_raw();
                }
            }
        }
    }

    // Reap every stage; only the last one's status decides the job outcome.
    let mut last_raw: libc::c_int = 0;
    loop {
        let mut raw: libc::c_int = 0;
        // SAFETY: blocking reap with an out-param on the stack.
        let pid = unsafe { libc::waitpid(-1, &mut raw, 0) };
        if pid < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                _ => break, // ECHILD: every stage is accounted for
            }
        }
        if pid == last_pid {
            last_raw = raw;
        }
    }
    Ok(last_raw)
}
