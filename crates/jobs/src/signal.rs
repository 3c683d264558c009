//! Signal dispositions and the SIGCHLD reap path.
//!
//! The parent observes every leader death through SIGCHLD; the handler reaps
//! with `WNOHANG`, routes the raw status to the matching job, and touches
//! nothing but atomics. SIGABRT gets a no-op handler so it can wake
//! [`pause`](crate::JobTable::pause) alongside SIGCHLD. Cancellation is
//! *not* observed via a SIGKILL handler (SIGKILL cannot be caught) but at
//! reap time, from the termination signal plus the job's cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction,
                       sigprocmask};

use crate::error::JobResult;
use crate::table::JobTable;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the SIGCHLD and SIGABRT dispositions once per process.
pub(crate) fn install_handlers() -> JobResult<()> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    let reap = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: the handler is async-signal-safe: waitpid, atomics, errno.
    unsafe { sigaction(Signal::SIGCHLD, &reap)? };

    let interest = SigAction::new(
        SigHandler::Handler(handle_interest),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler body is empty.
    unsafe { sigaction(Signal::SIGABRT, &interest)? };

    Ok(())
}

extern "C" fn handle_sigchld(_signo: libc::c_int) {
    let saved = read_errno();
    loop {
        let mut raw: libc::c_int = 0;
        // SAFETY: plain non-blocking reap; `raw` outlives the call.
        let pid = unsafe { libc::waitpid(-1, &mut raw, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        if let Some(table) = JobTable::get() {
            table.record_reap(pid, raw);
        }
    }
    write_errno(saved);
}

/// Wake-up channel only; the state machine runs off SIGCHLD.
extern "C" fn handle_interest(_signo: libc::c_int) {}

fn read_errno() -> libc::c_int {
    // SAFETY: thread-local errno location.
    unsafe { *errno_location() }
}

fn write_errno(value: libc::c_int) {
    // SAFETY: as above.
    unsafe { *errno_location() = value };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: always valid to call.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    // SAFETY: always valid to call.
    unsafe { libc::__error() }
}

/// RAII block of SIGCHLD delivery on the calling thread; restores the prior
/// mask on drop. Held across job-list mutation and fork/publish windows.
pub(crate) struct SigchldGuard {
    prior: SigSet,
}

pub(crate) fn block_sigchld() -> SigchldGuard {
    let mut block = SigSet::empty();
    block.add(Signal::SIGCHLD);
    let mut prior = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&block), Some(&mut prior));
    SigchldGuard { prior }
}

impl Drop for SigchldGuard {
    fn drop(&mut self) {
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.prior), None);
    }
}

/// Suspend until any handled signal arrives. `sigsuspend` reports EINTR by
/// design; that is the success path here.
pub(crate) fn suspend_for_signal() -> JobResult<()> {
    match SigSet::empty().suspend() {
        Ok(()) | Err(nix::errno::Errno::EINTR) => Ok(()),
        Err(other) => Err(other.into()),
    }
}
