//! End-to-end job runner scenarios against real child processes.
//!
//! The table is process-wide and the contract is single-threaded, so every
//! test serializes on one lock.

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use skiff_jobs::{Command, JobError, JobStatus, JobTable, Pipeline};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serialized() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn table() -> &'static JobTable {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    JobTable::init().expect("job table init")
}

/// Spin on `poll` until the job goes terminal, with a hard deadline.
fn poll_until_terminal(table: &JobTable, id: skiff_jobs::JobId) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = table.poll(id).expect("job vanished while polling");
        if status.is_terminal() {
            return status;
        }
        assert!(Instant::now() < deadline, "job never reached a terminal state");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn capture_returns_exactly_the_last_stage_output() {
    let _guard = serialized();
    let table = table();

    let pipeline = Pipeline::new()
        .command(Command::new("echo").arg("hi"))
        .command(Command::new("tr").arg("h").arg("H"))
        .capture(true);
    let id = table.run(pipeline).unwrap();

    let raw = table.wait(id).unwrap();
    assert!(libc::WIFEXITED(raw));
    assert_eq!(libc::WEXITSTATUS(raw), 0);
    assert!(table.poll(id).unwrap().is_terminal());

    assert_eq!(table.output(id).unwrap(), b"Hi\n".to_vec());
    table.expunge(id).unwrap();
}

#[test]
fn cancel_is_one_shot_and_ends_canceled() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(Pipeline::new().command(Command::new("sleep").arg("30")))
        .unwrap();
    assert!(!table.poll(id).unwrap().is_terminal());

    table.cancel(id).unwrap();
    assert!(matches!(
        table.cancel(id),
        Err(JobError::AlreadyCanceled(_) | JobError::Terminal(_))
    ));

    let raw = table.wait(id).unwrap();
    assert!(libc::WIFSIGNALED(raw));
    assert_eq!(libc::WTERMSIG(raw), libc::SIGKILL);
    assert_eq!(table.poll(id).unwrap(), JobStatus::Canceled);

    // Cancel of a terminal job also fails.
    assert!(matches!(table.cancel(id), Err(JobError::Terminal(_))));
    table.expunge(id).unwrap();
}

#[test]
fn poll_is_monotonic() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(Pipeline::new().command(Command::new("echo").arg("done")).capture(true))
        .unwrap();

    let status = poll_until_terminal(table, id);
    assert_eq!(status, JobStatus::Completed);
    // Once terminal, always terminal.
    for _ in 0..50 {
        assert_eq!(table.poll(id).unwrap(), JobStatus::Completed);
    }
    table.expunge(id).unwrap();
}

#[test]
fn wait_reports_the_last_stage_exit_code() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(Pipeline::new().command(Command::new("sh").arg("-c").arg("exit 7")))
        .unwrap();
    let raw = table.wait(id).unwrap();
    assert!(libc::WIFEXITED(raw));
    assert_eq!(libc::WEXITSTATUS(raw), 7);
    assert_eq!(table.poll(id).unwrap(), JobStatus::Completed);
    table.expunge(id).unwrap();
}

#[test]
fn signalled_last_stage_ends_aborted() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(Pipeline::new().command(Command::new("sh").arg("-c").arg("kill -TERM $$")))
        .unwrap();
    let raw = table.wait(id).unwrap();
    // The leader observed the stage's death and aborted itself.
    assert!(libc::WIFSIGNALED(raw));
    assert_eq!(libc::WTERMSIG(raw), libc::SIGABRT);
    assert_eq!(table.poll(id).unwrap(), JobStatus::Aborted);
    table.expunge(id).unwrap();
}

#[test]
fn expunge_requires_a_terminal_job_and_removes_the_id() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(Pipeline::new().command(Command::new("sleep").arg("30")))
        .unwrap();
    assert!(matches!(table.expunge(id), Err(JobError::NotTerminal(_))));

    table.cancel(id).unwrap();
    table.wait(id).unwrap();
    table.expunge(id).unwrap();

    assert!(matches!(table.poll(id), Err(JobError::UnknownJob(_))));
    assert!(matches!(table.expunge(id), Err(JobError::UnknownJob(_))));
    assert!(table.output(id).is_none());
}

#[test]
fn file_redirections_feed_and_collect_the_chain() {
    let _guard = serialized();
    let table = table();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    std::fs::File::create(&input)
        .unwrap()
        .write_all(b"banana\n")
        .unwrap();

    let pipeline = Pipeline::new()
        .command(Command::new("tr").arg("a").arg("o"))
        .command(Command::new("cat"))
        .input(&input)
        .output(&output);
    let id = table.run(pipeline).unwrap();
    let raw = table.wait(id).unwrap();
    assert!(libc::WIFEXITED(raw));

    assert_eq!(std::fs::read(&output).unwrap(), b"bonono\n".to_vec());
    // Nothing was captured: the output went to the file.
    assert!(table.output(id).is_none());
    table.expunge(id).unwrap();
}

#[test]
fn output_is_gated_on_terminal_state_and_capture() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(
            Pipeline::new()
                .command(Command::new("sleep").arg("30"))
                .capture(true),
        )
        .unwrap();
    // Running jobs expose nothing.
    assert!(table.output(id).is_none());

    table.cancel(id).unwrap();
    table.wait(id).unwrap();
    // Capture was requested but the stage wrote nothing before dying.
    assert_eq!(table.output(id).unwrap(), Vec::<u8>::new());
    table.expunge(id).unwrap();
}

#[test]
fn show_prints_one_tabbed_line_per_job() {
    let _guard = serialized();
    let table = table();

    let id = table
        .run(Pipeline::new().command(Command::new("sleep").arg("30")))
        .unwrap();

    let mut rendered = Vec::new();
    table.show(&mut rendered).unwrap();
    let text = String::from_utf8(rendered).unwrap();
    let line = text
        .lines()
        .find(|l| l.starts_with(&format!("{id}\t")))
        .expect("job line missing from show output");

    let fields: Vec<&str> = line.split('\t').collect();
    assert_eq!(fields.len(), 4);
    assert_eq!(fields[0], id.to_string());
    assert!(fields[1].parse::<i32>().unwrap() > 0);
    assert_eq!(fields[2], "running");
    assert_eq!(fields[3], "sleep 30");

    table.cancel(id).unwrap();
    table.wait(id).unwrap();

    let mut rendered = Vec::new();
    table.show(&mut rendered).unwrap();
    let text = String::from_utf8(rendered).unwrap();
    let line = text
        .lines()
        .find(|l| l.starts_with(&format!("{id}\t")))
        .unwrap();
    assert!(line.contains("\tcanceled\t"));

    table.expunge(id).unwrap();
}

#[test]
fn job_ids_are_dense_across_expunge() {
    let _guard = serialized();
    let table = table();

    let a = table
        .run(Pipeline::new().command(Command::new("echo").arg("a")).capture(true))
        .unwrap();
    let b = table
        .run(Pipeline::new().command(Command::new("echo").arg("b")).capture(true))
        .unwrap();
    assert_eq!(b.as_u32(), a.as_u32() + 1);

    table.wait(a).unwrap();
    table.wait(b).unwrap();
    table.expunge(a).unwrap();

    // b is still live, so the next id goes one past it.
    let c = table
        .run(Pipeline::new().command(Command::new("echo").arg("c")).capture(true))
        .unwrap();
    assert_eq!(c.as_u32(), b.as_u32() + 1);

    table.wait(c).unwrap();
    table.expunge(b).unwrap();
    table.expunge(c).unwrap();
}

#[test]
fn fini_cancels_waits_and_releases_everything() {
    let _guard = serialized();
    let table = table();

    let running = table
        .run(Pipeline::new().command(Command::new("sleep").arg("30")))
        .unwrap();
    let finished = table
        .run(Pipeline::new().command(Command::new("echo").arg("x")).capture(true))
        .unwrap();
    table.wait(finished).unwrap();

    table.fini();

    assert!(matches!(table.poll(running), Err(JobError::UnknownJob(_))));
    assert!(matches!(table.poll(finished), Err(JobError::UnknownJob(_))));

    // The table keeps working after fini; ids restart from zero.
    let fresh = table
        .run(Pipeline::new().command(Command::new("echo").arg("y")).capture(true))
        .unwrap();
    assert_eq!(fresh.as_u32(), 0);
    table.wait(fresh).unwrap();
    table.expunge(fresh).unwrap();
}
