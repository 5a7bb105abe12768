//! Process supervision integration: async pumping, sync exec, reaping.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use alioth::proc::ExecFlags;
use alioth::proc::ExecOutcome;
use alioth::proc::Process;
use alioth::proc::ProcessState;
use alioth::proc::SpawnError;
use alioth::reactor::EventLoop;
use alioth::reactor::ExecStatus;
use alioth::reactor::LoopFlags;
use alioth::reactor::TimerFlags;

mod common;

#[test]
fn test_async_capture_and_exit_code() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let process: Process = Process::new();

  let code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

  {
    let code: Arc<Mutex<Option<i32>>> = Arc::clone(&code);
    let handle = event_loop.handle();

    process.set_on_finished(move |status| {
      *code.lock().unwrap() = Some(status);
      handle.quit();
    });
  }

  process
    .start("/bin/sh", &["-c", "printf out; printf err 1>&2; exit 3"])
    .unwrap();

  assert_eq!(event_loop.exec(Some(10_000)), ExecStatus::Success);

  assert_eq!(*code.lock().unwrap(), Some(3));
  assert_eq!(process.read_all_stdout(), b"out");
  assert_eq!(process.read_all_stderr(), b"err");
  assert_eq!(process.return_code(), Some(3));
  assert_eq!(process.state(), ProcessState::Finished);
  assert_eq!(process.pid(), None);
}

#[test]
fn test_sync_exec_runs_to_completion() {
  common::init();

  let process: Process = Process::new();

  let outcome: ExecOutcome = process
    .exec(
      "/bin/sh",
      &["-c", "printf hello; exit 5"],
      Some(5_000),
      ExecFlags::empty(),
    )
    .unwrap();

  assert_eq!(outcome, ExecOutcome::Done);
  assert_eq!(process.read_all_stdout(), b"hello");
  assert_eq!(process.return_code(), Some(5));
  assert_eq!(process.state(), ProcessState::Finished);
}

#[test]
fn test_sync_exec_timeout_kills_child() {
  common::init();

  let process: Process = Process::new();
  let started: Instant = Instant::now();

  let outcome: ExecOutcome = process
    .exec("/bin/sh", &["-c", "sleep 5"], Some(100), ExecFlags::empty())
    .unwrap();

  assert_eq!(outcome, ExecOutcome::TimedOut);
  assert!(started.elapsed() < Duration::from_secs(2));

  // SIGTERM death is reaped in the background with code -1.
  for _ in 0..100 {
    if process.state() == ProcessState::Finished {
      break;
    }

    thread::sleep(Duration::from_millis(20));
  }

  assert_eq!(process.state(), ProcessState::Finished);
  assert_eq!(process.return_code(), Some(-1));
}

#[test]
fn test_async_stdin_echo_with_backpressure() {
  common::init();

  const TOTAL: usize = 1_024 * 1_024;
  const CHUNK: usize = 4_096;

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let process: Process = Process::new();

  let expected: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
  let echoed: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

  {
    let echoed: Arc<Mutex<Vec<u8>>> = Arc::clone(&echoed);
    let feedback: Process = process.clone();

    process.set_on_ready_read_stdout(move || {
      let mut echoed = echoed.lock().unwrap();
      echoed.extend_from_slice(&feedback.read_all_stdout());

      // Everything came back: let the child see EOF and exit.
      if echoed.len() == TOTAL {
        feedback.close_stdin();
      }
    });
  }

  {
    let handle = event_loop.handle();
    process.set_on_finished(move |_| handle.quit());
  }

  process.start("/bin/cat", &[]).unwrap();

  // Queue the stream in pipe-sized chunks; the write path flushes what
  // it can and drains the rest on write readiness.
  for chunk in expected.chunks(CHUNK) {
    process.write(chunk);
  }

  assert_eq!(event_loop.exec(Some(30_000)), ExecStatus::Success);

  assert_eq!(process.return_code(), Some(0));

  let echoed: std::sync::MutexGuard<'_, Vec<u8>> = echoed.lock().unwrap();
  assert_eq!(echoed.len(), TOTAL);
  assert_eq!(*echoed, expected);
}

#[test]
fn test_signal_death_reports_minus_one() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let process: Process = Process::new();

  let code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

  {
    let code: Arc<Mutex<Option<i32>>> = Arc::clone(&code);
    let handle = event_loop.handle();

    process.set_on_finished(move |status| {
      *code.lock().unwrap() = Some(status);
      handle.quit();
    });
  }

  process.start("/bin/sh", &["-c", "kill -9 $$"]).unwrap();

  assert_eq!(event_loop.exec(Some(10_000)), ExecStatus::Success);
  assert_eq!(*code.lock().unwrap(), Some(-1));
}

#[test]
fn test_command_not_found() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let process: Process = Process::new();

  assert!(matches!(
    process.start("alioth-test-no-such-command", &[]),
    Err(SpawnError::CommandNotFound),
  ));

  drop(event_loop);
}

#[test]
fn test_explicit_environment_replaces_parent() {
  common::init();

  let process: Process = Process::new();

  let environ: Vec<String> = vec![String::from("ALIOTH_PROBE=marker")];

  let outcome: ExecOutcome = process
    .exec_with_environ(
      "/bin/sh",
      &["-c", "printf \"$ALIOTH_PROBE:$ALIOTH_ABSENT\""],
      &environ,
      Some(5_000),
      ExecFlags::empty(),
    )
    .unwrap();

  assert_eq!(outcome, ExecOutcome::Done);
  assert_eq!(process.read_all_stdout(), b"marker:");
}

#[test]
fn test_inherited_environment_is_visible() {
  common::init();

  // SAFETY: test-local variable, no concurrent reader depends on it.
  unsafe { std::env::set_var("ALIOTH_INHERIT_PROBE", "inherited") };

  let process: Process = Process::new();

  let outcome: ExecOutcome = process
    .exec(
      "/bin/sh",
      &["-c", "printf \"$ALIOTH_INHERIT_PROBE\""],
      Some(5_000),
      ExecFlags::empty(),
    )
    .unwrap();

  assert_eq!(outcome, ExecOutcome::Done);
  assert_eq!(process.read_all_stdout(), b"inherited");
}

#[test]
fn test_working_directory_applies_before_exec() {
  common::init();

  let process: Process = Process::new();

  process.set_cwd("/");

  let outcome: ExecOutcome = process
    .exec("/bin/sh", &["-c", "pwd"], Some(5_000), ExecFlags::empty())
    .unwrap();

  assert_eq!(outcome, ExecOutcome::Done);
  assert_eq!(process.read_all_stdout(), b"/\n");
}

#[test]
fn test_environment_snapshot_matches_parent() {
  common::init();

  let environ: Vec<String> = Process::environment();

  assert!(environ.iter().any(|entry| entry.starts_with("PATH=")));
}

#[test]
fn test_stop_terminates_async_child() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let process: Process = Process::new();

  let code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

  {
    let code: Arc<Mutex<Option<i32>>> = Arc::clone(&code);
    let handle = event_loop.handle();

    process.set_on_finished(move |status| {
      *code.lock().unwrap() = Some(status);
      handle.quit();
    });
  }

  process.start("/bin/sh", &["-c", "sleep 30"]).unwrap();
  assert!(process.pid().is_some());
  assert_eq!(process.state(), ProcessState::Running);

  {
    let stopper: Process = process.clone();
    event_loop.register_timer(50, TimerFlags::SINGLE_SHOT, move |_| {
      stopper.stop();
    });
  }

  assert_eq!(event_loop.exec(Some(10_000)), ExecStatus::Success);
  assert_eq!(*code.lock().unwrap(), Some(-1));
}
