//! Job records and the append-only job list.
//!
//! Each job is a leaked node on an intrusive singly-linked list published
//! through an atomic head pointer. The SIGCHLD handler walks the list and
//! touches only the immutable `pgid` and the atomic fields; every other
//! mutation (insertion, unlinking, capture draining) happens on the main
//! control flow, with SIGCHLD blocked wherever the list itself changes.

use std::fs::File;
use std::io::Read;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::pipeline::Pipeline;
use crate::status::JobStatus;

/// Dense, non-negative job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(u32);

impl JobId {
    /// Wrap a raw id value.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw id value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Captured-output state; main-thread only, never touched by handlers.
struct Capture {
    requested: bool,
    source: Option<File>,
    buf: Vec<u8>,
}

/// One tracked pipeline job.
pub(crate) struct Job {
    id: JobId,
    pgid: libc::pid_t,
    pipeline: Pipeline,
    status: AtomicU8,
    wait_status: AtomicI32,
    canceled: AtomicBool,
    capture: Mutex<Capture>,
    next: AtomicPtr<Job>,
}

impl Job {
    /// Build a job already in the `Running` state; `New` is a
    /// construction-time-only state with no observable window.
    pub(crate) fn new(
        id: JobId,
        pgid: libc::pid_t,
        pipeline: Pipeline,
        capture_source: Option<File>,
    ) -> Self {
        Self {
            id,
            pgid,
            pipeline,
            status: AtomicU8::new(JobStatus::Running.as_u8()),
            wait_status: AtomicI32::new(0),
            canceled: AtomicBool::new(false),
            capture: Mutex::new(Capture {
                requested: capture_source.is_some(),
                source: capture_source,
                buf: Vec::new(),
            }),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn pgid(&self) -> libc::pid_t {
        self.pgid
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Raw wait status recorded when the leader was reaped.
    pub(crate) fn wait_status(&self) -> i32 {
        self.wait_status.load(Ordering::Acquire)
    }

    /// Flip the one-shot cancel flag; `true` if it was already set.
    pub(crate) fn mark_canceled(&self) -> bool {
        self.canceled.swap(true, Ordering::AcqRel)
    }

    /// Record the leader's death from its raw wait status. Async-signal-safe:
    /// atomics only. The transition out of `Running` is one-shot; later calls
    /// are ignored.
    pub(crate) fn record_exit(&self, raw: i32) {
        let next = if libc::WIFEXITED(raw) {
            JobStatus::Completed
        } else if libc::WIFSIGNALED(raw)
            && libc::WTERMSIG(raw) == libc::SIGKILL
            && self.canceled.load(Ordering::Acquire)
        {
            JobStatus::Canceled
        } else {
            JobStatus::Aborted
        };
        self.wait_status.store(raw, Ordering::Release);
        let _ = self.status.compare_exchange(
            JobStatus::Running.as_u8(),
            next.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Read the capture pipe to EOF, tolerating partial reads, and append to
    /// the job's buffer. A no-op once the pipe has been consumed or when
    /// capture was never requested. Blocks until every writer has exited.
    pub(crate) fn drain_capture(&self) {
        let mut capture = self.capture.lock();
        let Some(mut source) = capture.source.take() else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => capture.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }

    /// The captured bytes, if capture was requested.
    pub(crate) fn captured(&self) -> Option<Vec<u8>> {
        let capture = self.capture.lock();
        capture.requested.then(|| capture.buf.clone())
    }
}

/// Append-only intrusive list of leaked job nodes.
///
/// Publication is a release store of the head pointer; the handler's walk is
/// acquire loads. Unlinking frees the node and is only sound with SIGCHLD
/// blocked and the single-main-thread contract upheld.
pub(crate) struct JobList {
    head: AtomicPtr<Job>,
}

impl JobList {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish a job at the head of the list.
    pub(crate) fn push_front(&self, job: Box<Job>) {
        let node = Box::into_raw(job);
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: `node` is freshly leaked and not yet visible to anyone.
        unsafe { (*node).next.store(head, Ordering::Relaxed) };
        self.head.store(node, Ordering::Release);
    }

    pub(crate) fn iter(&self) -> JobIter<'_> {
        JobIter {
            next: self.head.load(Ordering::Acquire),
            _list: std::marker::PhantomData,
        }
    }

    pub(crate) fn find(&self, id: JobId) -> Option<&Job> {
        self.iter().find(|job| job.id() == id)
    }

    /// Route a reaped pid to its job, if any. Called from the SIGCHLD
    /// handler: reads and atomics only.
    pub(crate) fn record_reap(&self, pid: libc::pid_t, raw: i32) {
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: nodes are leaked boxes, unlinked only with SIGCHLD
            // blocked on the single main thread.
            let job = unsafe { &*node };
            if job.pgid() == pid {
                job.record_exit(raw);
                return;
            }
            node = job.next.load(Ordering::Acquire);
        }
    }

    /// Next dense id: one past the maximum in use, or 0 when empty.
    pub(crate) fn next_id(&self) -> JobId {
        JobId::from_raw(
            self.iter()
                .map(|job| job.id().as_u32())
                .max()
                .map_or(0, |max| max + 1),
        )
    }

    /// Unlink the job with `id` and reclaim its node.
    ///
    /// The caller must hold the SIGCHLD block so no handler walks the list
    /// while the node is freed.
    pub(crate) fn unlink(&self, id: JobId) -> Option<Box<Job>> {
        let mut prev: *mut Job = ptr::null_mut();
        let mut node = self.head.load(Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: as in `record_reap`, plus the SIGCHLD block held by the
            // caller.
            let job = unsafe { &*node };
            let next = job.next.load(Ordering::Acquire);
            if job.id() == id {
                if prev.is_null() {
                    self.head.store(next, Ordering::Release);
                } else {
                    // SAFETY: `prev` is a live node we just traversed.
                    unsafe { (*prev).next.store(next, Ordering::Release) };
                }
                // SAFETY: the node is unreachable from the list now.
                return Some(unsafe { Box::from_raw(node) });
            }
            prev = node;
            node = next;
        }
        None
    }

    /// Unlink and drop every node. Same caller contract as
    /// [`unlink`](Self::unlink).
    pub(crate) fn clear(&self) {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !node.is_null() {
            // SAFETY: the whole chain was just detached and is ours.
            let job = unsafe { Box::from_raw(node) };
            node = job.next.load(Ordering::Acquire);
        }
    }
}

pub(crate) struct JobIter<'a> {
    next: *mut Job,
    _list: std::marker::PhantomData<&'a JobList>,
}

impl<'a> Iterator for JobIter<'a> {
    type Item = &'a Job;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: nodes stay alive until unlinked, and unlinking requires the
        // single main thread not to be mid-iteration.
        let job = unsafe { &*self.next };
        self.next = job.next.load(Ordering::Acquire);
        Some(job)
    }
}
