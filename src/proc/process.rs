use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::consts::MAX_OUTPUT_BUFFER;
use crate::consts::PIPE_READ_CHUNK;
use crate::proc::command;
use crate::proc::reaper;
use crate::reactor::EventLoop;
use crate::reactor::Interest;
use crate::reactor::LoopHandle;
use crate::sys;
use crate::utils::now_ms;

// -----------------------------------------------------------------------------
// Spawn Errors
// -----------------------------------------------------------------------------

/// Errors surfaced by process spawning.
#[derive(Debug, Error)]
pub enum SpawnError {
  /// The command was not found on `PATH`.
  #[error("command not found")]
  CommandNotFound,

  /// The process already has a live child.
  #[error("process is already running")]
  AlreadyRunning,

  /// `fork(2)` failed.
  #[error("fork failed: {0}")]
  Fork(io::Error),

  /// A command, argument, or environment entry contained a NUL byte.
  #[error("argument contains an interior NUL byte")]
  NulByte(#[from] std::ffi::NulError),

  /// Async spawn requires a current event loop on the calling thread.
  #[error("no event loop on this thread")]
  NoEventLoop,

  /// Pipe setup or the sync dispatch loop failed.
  #[error(transparent)]
  Io(#[from] io::Error),
}

// -----------------------------------------------------------------------------
// Process Types
// -----------------------------------------------------------------------------

bitflags! {
  /// Behavior flags for the synchronous exec path.
  #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
  pub struct ExecFlags: u32 {
    /// Keep stdin open past spawn instead of closing it up front.
    ///
    /// Closing first is the default: a child that reads before writing
    /// would otherwise deadlock against a caller that never writes.
    const NO_CLOSE_STDIN = 0x1;
  }
}

/// Outcome of a synchronous exec.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ExecOutcome {
  /// The child ran to completion and was reaped.
  Done,
  /// The timeout elapsed; the child was sent `SIGTERM`.
  TimedOut,
}

/// Lifecycle of a process record.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ProcessState {
  /// No child has been spawned yet.
  Initial,
  /// Pipes are set up and the fork is in flight.
  Spawning,
  /// The child is alive.
  Running,
  /// `stop` delivered `SIGTERM`; the reap is pending.
  Finishing,
  /// The child was reaped; the return code is recorded.
  Finished,
  /// Spawning failed.
  Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SpawnMode {
  Sync,
  Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipeRole {
  Stdin,
  Stdout,
  Stderr,
}

// -----------------------------------------------------------------------------
// Output Buffer
// -----------------------------------------------------------------------------

/// Per-stream child output buffer, bounded at 16 MiB.
///
/// When appending would exceed the bound the consumed prefix is
/// compacted away first; only if the unread bytes still do not fit is
/// the buffer dropped, with a warning.
struct OutputBuffer {
  data: Vec<u8>,
  /// Consumed prefix length.
  index: usize,
}

impl OutputBuffer {
  const fn new() -> Self {
    Self {
      data: Vec::new(),
      index: 0,
    }
  }

  fn append(&mut self, chunk: &[u8]) {
    if self.data.len() + chunk.len() > MAX_OUTPUT_BUFFER {
      if self.data.len() + chunk.len() - self.index > MAX_OUTPUT_BUFFER {
        tracing::warn!("child output buffer over limit, dropping data");
        self.data.clear();
        self.index = 0;
      } else {
        self.data.drain(..self.index);
        self.index = 0;
      }
    }

    self.data.extend_from_slice(chunk);
  }

  fn take_all(&mut self) -> Vec<u8> {
    self.index = 0;
    std::mem::take(&mut self.data)
  }
}

// -----------------------------------------------------------------------------
// Process State
// -----------------------------------------------------------------------------

struct ProcState {
  pid: libc::pid_t,
  return_code: Option<i32>,
  phase: ProcessState,
  mode: SpawnMode,
  cwd: Option<PathBuf>,
  stdin: Option<OwnedFd>,
  stdout: Option<OwnedFd>,
  stderr: Option<OwnedFd>,
  sync_read: Option<OwnedFd>,
  sync_write: Option<OwnedFd>,
  stdin_queue: VecDeque<Vec<u8>>,
  stdin_cursor: usize,
  stdin_armed: bool,
  stdout_buf: OutputBuffer,
  stderr_buf: OutputBuffer,
  loop_handle: Option<LoopHandle>,
}

impl ProcState {
  const fn new() -> Self {
    Self {
      pid: -1,
      return_code: None,
      phase: ProcessState::Initial,
      mode: SpawnMode::Sync,
      cwd: None,
      stdin: None,
      stdout: None,
      stderr: None,
      sync_read: None,
      sync_write: None,
      stdin_queue: VecDeque::new(),
      stdin_cursor: 0,
      stdin_armed: false,
      stdout_buf: OutputBuffer::new(),
      stderr_buf: OutputBuffer::new(),
      loop_handle: None,
    }
  }

  fn role_of(&self, fd: RawFd) -> Option<PipeRole> {
    let matches = |owned: &Option<OwnedFd>| owned.as_ref().map(OwnedFd::as_raw_fd) == Some(fd);

    if matches(&self.stdin) {
      Some(PipeRole::Stdin)
    } else if matches(&self.stdout) {
      Some(PipeRole::Stdout)
    } else if matches(&self.stderr) {
      Some(PipeRole::Stderr)
    } else {
      None
    }
  }
}

struct ProcHooks {
  on_stdout: Option<Box<dyn FnMut() + Send>>,
  on_stderr: Option<Box<dyn FnMut() + Send>>,
  on_finished: Option<Box<dyn FnMut(i32) + Send>>,
}

pub(crate) struct ProcInner {
  state: Mutex<ProcState>,
  hooks: Mutex<ProcHooks>,
}

// -----------------------------------------------------------------------------
// Process
// -----------------------------------------------------------------------------

/// A supervised child process with redirected stdio.
///
/// Two dispatch modes exist. [`start`] spawns asynchronously: stdout
/// and stderr are pumped through the calling thread's event loop and
/// the exit code arrives through the `finished` hook once the reaper
/// collects the child. [`exec`] spawns synchronously: the calling
/// thread drives a select loop over the child pipes until completion or
/// timeout.
///
/// Clones share the same underlying process record.
///
/// [`start`]: Process::start
/// [`exec`]: Process::exec
#[derive(Clone)]
pub struct Process {
  inner: Arc<ProcInner>,
}

impl Process {
  /// Creates an empty process record.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(ProcInner {
        state: Mutex::new(ProcState::new()),
        hooks: Mutex::new(ProcHooks {
          on_stdout: None,
          on_stderr: None,
          on_finished: None,
        }),
      }),
    }
  }

  /// Sets the working directory the child switches to before exec.
  pub fn set_cwd<P>(&self, cwd: P)
  where
    P: Into<PathBuf>,
  {
    self.inner.state.lock().cwd = Some(cwd.into());
  }

  /// Snapshots the parent environment as `KEY=VALUE` entries.
  pub fn environment() -> Vec<String> {
    command::environment()
  }

  // ---------------------------------------------------------------------------
  // Hook Setters
  // ---------------------------------------------------------------------------

  /// Sets the hook invoked after every successful stdout read.
  pub fn set_on_ready_read_stdout<F>(&self, hook: F)
  where
    F: FnMut() + Send + 'static,
  {
    self.inner.hooks.lock().on_stdout = Some(Box::new(hook));
  }

  /// Sets the hook invoked after every successful stderr read.
  pub fn set_on_ready_read_stderr<F>(&self, hook: F)
  where
    F: FnMut() + Send + 'static,
  {
    self.inner.hooks.lock().on_stderr = Some(Box::new(hook));
  }

  /// Sets the hook invoked with the exit code once the child is reaped
  /// and its streams are drained.
  pub fn set_on_finished<F>(&self, hook: F)
  where
    F: FnMut(i32) + Send + 'static,
  {
    self.inner.hooks.lock().on_finished = Some(Box::new(hook));
  }

  // ---------------------------------------------------------------------------
  // Spawning
  // ---------------------------------------------------------------------------

  /// Spawns asynchronously with the parent's environment.
  pub fn start(&self, command: &str, args: &[&str]) -> Result<(), SpawnError> {
    self.start_async(command, args, None)
  }

  /// Spawns asynchronously with an explicit environment.
  pub fn start_with_environ(
    &self,
    command: &str,
    args: &[&str],
    environ: &[String],
  ) -> Result<(), SpawnError> {
    self.start_async(command, args, Some(environ))
  }

  /// Spawns synchronously with the parent's environment and drives the
  /// child to completion or `timeout` milliseconds.
  pub fn exec(
    &self,
    command: &str,
    args: &[&str],
    timeout: Option<u64>,
    flags: ExecFlags,
  ) -> Result<ExecOutcome, SpawnError> {
    self.exec_sync(command, args, None, timeout, flags)
  }

  /// Spawns synchronously with an explicit environment.
  pub fn exec_with_environ(
    &self,
    command: &str,
    args: &[&str],
    environ: &[String],
    timeout: Option<u64>,
    flags: ExecFlags,
  ) -> Result<ExecOutcome, SpawnError> {
    self.exec_sync(command, args, Some(environ), timeout, flags)
  }

  // ---------------------------------------------------------------------------
  // Child Interaction
  // ---------------------------------------------------------------------------

  /// Queues bytes for the child's stdin and flushes as much as the pipe
  /// accepts; the rest drains on write readiness.
  pub fn write(&self, data: &[u8]) {
    if data.is_empty() {
      return;
    }

    {
      let mut state = self.inner.state.lock();

      if state.stdin.is_none() {
        tracing::warn!("stdin write ignored, pipe is closed");
        return;
      }

      state.stdin_queue.push_back(data.to_vec());
    }

    ProcInner::pump_stdin(&self.inner);
  }

  /// Closes the child's stdin, discarding anything still queued.
  pub fn close_stdin(&self) {
    ProcInner::close_stdin(&self.inner);
  }

  /// Takes everything the child wrote to stdout so far.
  pub fn read_all_stdout(&self) -> Vec<u8> {
    self.inner.state.lock().stdout_buf.take_all()
  }

  /// Takes everything the child wrote to stderr so far.
  pub fn read_all_stderr(&self) -> Vec<u8> {
    self.inner.state.lock().stderr_buf.take_all()
  }

  /// Requests termination by delivering `SIGTERM`.
  pub fn stop(&self) {
    let mut state = self.inner.state.lock();

    if state.pid == -1 {
      return;
    }

    state.phase = ProcessState::Finishing;

    tracing::debug!(pid = state.pid, "stopping child");
    unsafe { libc::kill(state.pid, libc::SIGTERM) };
  }

  /// The live child's pid, if one is running.
  pub fn pid(&self) -> Option<i32> {
    let pid: libc::pid_t = self.inner.state.lock().pid;
    (pid != -1).then_some(pid)
  }

  /// The exit code recorded at reap: the child's `exit` status, or `-1`
  /// for signal death.
  pub fn return_code(&self) -> Option<i32> {
    self.inner.state.lock().return_code
  }

  /// The current lifecycle state.
  pub fn state(&self) -> ProcessState {
    self.inner.state.lock().phase
  }

  // ---------------------------------------------------------------------------
  // Spawn Internals
  // ---------------------------------------------------------------------------

  fn start_async(
    &self,
    command: &str,
    args: &[&str],
    environ: Option<&[String]>,
  ) -> Result<(), SpawnError> {
    let event_loop = EventLoop::current().ok_or(SpawnError::NoEventLoop)?;

    self.spawn(command, args, environ, SpawnMode::Async, Some(&event_loop))?;

    let (stdout_fd, stderr_fd) = {
      let state = self.inner.state.lock();

      (
        state.stdout.as_ref().map(OwnedFd::as_raw_fd),
        state.stderr.as_ref().map(OwnedFd::as_raw_fd),
      )
    };

    for fd in [stdout_fd, stderr_fd].into_iter().flatten() {
      let inner: Arc<ProcInner> = Arc::clone(&self.inner);

      event_loop
        .register_socket(fd, Interest::READ, move |fd, ready| {
          ProcInner::on_pipe_ready(&inner, fd, ready);
        })
        .map_err(|error| SpawnError::Io(io::Error::other(error)))?;
    }

    Ok(())
  }

  fn exec_sync(
    &self,
    command: &str,
    args: &[&str],
    environ: Option<&[String]>,
    timeout: Option<u64>,
    flags: ExecFlags,
  ) -> Result<ExecOutcome, SpawnError> {
    self.spawn(command, args, environ, SpawnMode::Sync, None)?;

    if !flags.contains(ExecFlags::NO_CLOSE_STDIN) {
      self.close_stdin();
    }

    let deadline: Option<u64> = timeout.map(|ms| now_ms().saturating_add(ms));

    loop {
      let (stdout_fd, stderr_fd, sync_fd, stdin_fd) = {
        let state = self.inner.state.lock();
        let stdin_pending: bool = !state.stdin_queue.is_empty();

        (
          state.stdout.as_ref().map(OwnedFd::as_raw_fd),
          state.stderr.as_ref().map(OwnedFd::as_raw_fd),
          state.sync_read.as_ref().map(OwnedFd::as_raw_fd),
          state
            .stdin
            .as_ref()
            .map(OwnedFd::as_raw_fd)
            .filter(|_| stdin_pending),
        )
      };

      let Some(sync_fd) = sync_fd else {
        return Ok(ExecOutcome::Done);
      };

      let remaining: Option<u64> = match deadline {
        Some(at) => {
          let now: u64 = now_ms();

          if now >= at {
            self.stop();
            return Ok(ExecOutcome::TimedOut);
          }

          Some(at - now)
        }
        None => None,
      };

      let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
      let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
      let mut max_fd: RawFd = sync_fd;

      unsafe {
        libc::FD_ZERO(&mut read_set);
        libc::FD_ZERO(&mut write_set);
        libc::FD_SET(sync_fd, &mut read_set);

        for fd in [stdout_fd, stderr_fd].into_iter().flatten() {
          libc::FD_SET(fd, &mut read_set);
          max_fd = max_fd.max(fd);
        }

        if let Some(fd) = stdin_fd {
          libc::FD_SET(fd, &mut write_set);
          max_fd = max_fd.max(fd);
        }
      }

      let mut tv: libc::timeval;
      let tv_ptr: *mut libc::timeval = match remaining {
        Some(ms) => {
          tv = libc::timeval {
            tv_sec: (ms / 1_000) as libc::time_t,
            tv_usec: ((ms % 1_000) * 1_000) as libc::suseconds_t,
          };
          &mut tv
        }
        None => std::ptr::null_mut(),
      };

      let ready: libc::c_int = unsafe {
        libc::select(
          max_fd + 1,
          &mut read_set,
          &mut write_set,
          std::ptr::null_mut(),
          tv_ptr,
        )
      };

      if ready == -1 {
        let error: io::Error = io::Error::last_os_error();

        if error.kind() == io::ErrorKind::Interrupted {
          continue;
        }

        return Err(SpawnError::Io(error));
      }

      if ready == 0 {
        continue;
      }

      if let Some(fd) = stdout_fd {
        if unsafe { libc::FD_ISSET(fd, &read_set) } {
          ProcInner::pump_output(&self.inner, PipeRole::Stdout);
        }
      }

      if let Some(fd) = stderr_fd {
        if unsafe { libc::FD_ISSET(fd, &read_set) } {
          ProcInner::pump_output(&self.inner, PipeRole::Stderr);
        }
      }

      if let Some(fd) = stdin_fd {
        if unsafe { libc::FD_ISSET(fd, &write_set) } {
          ProcInner::pump_stdin(&self.inner);
        }
      }

      if unsafe { libc::FD_ISSET(sync_fd, &read_set) } {
        // The reaper rang the doorbell: collect the final bytes, then
        // tear the stdio down.
        ProcInner::pump_output(&self.inner, PipeRole::Stdout);
        ProcInner::pump_output(&self.inner, PipeRole::Stderr);
        ProcInner::close_stdin(&self.inner);

        let code: i32 = {
          let mut state = self.inner.state.lock();

          state.stdout = None;
          state.stderr = None;
          state.sync_read = None;
          state.return_code.unwrap_or(-1)
        };

        ProcInner::emit_finished(&self.inner, code);

        return Ok(ExecOutcome::Done);
      }
    }
  }

  /// Shared spawn protocol: resolve the command, wire the pipes, fork,
  /// and register the child with the reaper.
  fn spawn(
    &self,
    command: &str,
    args: &[&str],
    environ: Option<&[String]>,
    mode: SpawnMode,
    event_loop: Option<&std::rc::Rc<EventLoop>>,
  ) -> Result<(), SpawnError> {
    let resolved: PathBuf = match command::find_command(command) {
      Some(resolved) => resolved,
      None => {
        self.inner.state.lock().phase = ProcessState::Error;
        return Err(SpawnError::CommandNotFound);
      }
    };

    // Everything the child touches after fork is prepared up front;
    // only async-signal-safe calls happen between fork and exec.
    let command_c: CString = CString::new(resolved.as_os_str().as_bytes())?;

    let mut argv: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv.push(command_c.clone());

    for arg in args {
      argv.push(CString::new(*arg)?);
    }

    let argv_ptrs: Vec<*const libc::c_char> = argv
      .iter()
      .map(|arg| arg.as_ptr())
      .chain(std::iter::once(std::ptr::null()))
      .collect();

    let envp: Option<Vec<CString>> = match environ {
      Some(entries) => Some(
        entries
          .iter()
          .map(|entry| CString::new(entry.as_str()))
          .collect::<Result<Vec<CString>, std::ffi::NulError>>()?,
      ),
      None => None,
    };

    let envp_ptrs: Option<Vec<*const libc::c_char>> = envp.as_ref().map(|entries| {
      entries
        .iter()
        .map(|entry| entry.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
    });

    let cwd_c: Option<CString> = {
      let state = self.inner.state.lock();

      if state.pid != -1 || state.phase == ProcessState::Spawning {
        tracing::error!("spawn refused, child already live");
        return Err(SpawnError::AlreadyRunning);
      }

      match state.cwd.as_ref() {
        Some(cwd) => Some(CString::new(cwd.as_os_str().as_bytes())?),
        None => None,
      }
    };

    let (stdin_read, stdin_write): (OwnedFd, OwnedFd) = sys::pipe()?;
    let (stdout_read, stdout_write): (OwnedFd, OwnedFd) = sys::pipe()?;
    let (stderr_read, stderr_write): (OwnedFd, OwnedFd) = sys::pipe()?;

    let sync_pipe: Option<(OwnedFd, OwnedFd)> = match mode {
      SpawnMode::Sync => Some(sys::pipe()?),
      SpawnMode::Async => None,
    };

    // The handler must be installed before the first child can exit.
    reaper::ensure_started();

    {
      let mut state = self.inner.state.lock();
      state.phase = ProcessState::Spawning;
      state.mode = mode;
      state.return_code = None;
    }

    let child_stdin: RawFd = stdin_read.as_raw_fd();
    let child_stdout: RawFd = stdout_write.as_raw_fd();
    let child_stderr: RawFd = stderr_write.as_raw_fd();

    let pid: libc::pid_t = unsafe { libc::fork() };

    if pid == -1 {
      self.inner.state.lock().phase = ProcessState::Error;
      return Err(SpawnError::Fork(io::Error::last_os_error()));
    }

    if pid == 0 {
      // Child. Every pipe fd is close-on-exec, so redirecting onto
      // 0/1/2 is the only cleanup required before exec.
      child_dup2(child_stdin, libc::STDIN_FILENO);
      child_dup2(child_stdout, libc::STDOUT_FILENO);
      child_dup2(child_stderr, libc::STDERR_FILENO);

      unsafe {
        if let Some(cwd) = cwd_c.as_ref() {
          libc::chdir(cwd.as_ptr());
        }

        match envp_ptrs.as_ref() {
          Some(envp) => {
            libc::execve(command_c.as_ptr(), argv_ptrs.as_ptr(), envp.as_ptr());
          }
          None => {
            libc::execv(command_c.as_ptr(), argv_ptrs.as_ptr());
          }
        }

        libc::_exit(1);
      }
    }

    // Parent: the child-side ends drop (close) at scope exit.
    sys::set_nonblocking(stdin_write.as_raw_fd(), true)?;
    sys::set_nonblocking(stdout_read.as_raw_fd(), true)?;
    sys::set_nonblocking(stderr_read.as_raw_fd(), true)?;

    {
      let mut state = self.inner.state.lock();

      state.pid = pid;
      state.phase = ProcessState::Running;
      state.stdin = Some(stdin_write);
      state.stdout = Some(stdout_read);
      state.stderr = Some(stderr_read);
      state.stdin_queue.clear();
      state.stdin_cursor = 0;
      state.stdin_armed = false;
      state.loop_handle = event_loop.map(|event_loop| event_loop.handle());

      if let Some((sync_read, sync_write)) = sync_pipe {
        state.sync_read = Some(sync_read);
        state.sync_write = Some(sync_write);
      }
    }

    tracing::debug!(pid, command = %resolved.display(), ?mode, "child spawned");

    reaper::register(pid, Arc::clone(&self.inner));

    Ok(())
  }
}

impl Default for Process {
  fn default() -> Self {
    Self::new()
  }
}

/// `dup2` with `EINTR` retry; async-signal-safe.
fn child_dup2(from: RawFd, to: RawFd) {
  loop {
    if unsafe { libc::dup2(from, to) } != -1 {
      return;
    }

    if unsafe { *sys::errno_location() } != libc::EINTR {
      return;
    }
  }
}

// -----------------------------------------------------------------------------
// Pipe Pumping and Reap Completion
// -----------------------------------------------------------------------------

impl ProcInner {
  /// Readiness callback for the child's pipes in async mode.
  fn on_pipe_ready(inner: &Arc<Self>, fd: RawFd, ready: Interest) {
    // Pure error readiness carries no bytes; the reap path tears the
    // pipes down.
    if !ready.intersects(Interest::READ | Interest::WRITE) {
      return;
    }

    let role: Option<PipeRole> = inner.state.lock().role_of(fd);

    match role {
      Some(PipeRole::Stdin) => Self::pump_stdin(inner),
      Some(role) => {
        Self::pump_output(inner, role);
      }
      None => {}
    }
  }

  /// Drains one output pipe into its buffer and fires the matching
  /// ready-read hook when bytes arrived.
  fn pump_output(inner: &Arc<Self>, role: PipeRole) {
    let mut total: usize = 0;

    {
      let mut state = inner.state.lock();

      let fd: RawFd = {
        let slot: &Option<OwnedFd> = match role {
          PipeRole::Stdout => &state.stdout,
          PipeRole::Stderr => &state.stderr,
          PipeRole::Stdin => return,
        };

        match slot.as_ref() {
          Some(fd) => fd.as_raw_fd(),
          None => return,
        }
      };

      loop {
        let mut chunk: [u8; PIPE_READ_CHUNK] = [0; PIPE_READ_CHUNK];

        match sys::read_fd(fd, &mut chunk) {
          Ok(0) => {
            // Closed write side: stop watching, keep the fd for the
            // final teardown.
            if let Some(event_loop) = EventLoop::current() {
              event_loop.unregister_socket(fd);
            }

            break;
          }
          Ok(count) => {
            let buffer: &mut OutputBuffer = match role {
              PipeRole::Stdout => &mut state.stdout_buf,
              PipeRole::Stderr => &mut state.stderr_buf,
              PipeRole::Stdin => unreachable!(),
            };

            buffer.append(&chunk[..count]);
            total += count;
          }
          Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
          Err(error) => {
            tracing::debug!(fd, %error, "child pipe read failed");
            break;
          }
        }
      }
    }

    if total > 0 {
      Self::emit_output_hook(inner, role);
    }
  }

  /// Flushes queued stdin bytes, arming write readiness for leftovers
  /// and disarming once the queue empties.
  fn pump_stdin(inner: &Arc<Self>) {
    let mut state = inner.state.lock();

    let fd: RawFd = match state.stdin.as_ref() {
      Some(fd) => fd.as_raw_fd(),
      None => return,
    };

    loop {
      if state.stdin_queue.is_empty() {
        if state.stdin_armed {
          if let Some(event_loop) = EventLoop::current() {
            event_loop.unregister_socket(fd);
          }

          state.stdin_armed = false;
        }

        return;
      }

      let (front_len, wrote) = {
        let front: &Vec<u8> = &state.stdin_queue[0];
        (front.len(), sys::write_fd(fd, &front[state.stdin_cursor..]))
      };

      match wrote {
        Ok(count) => {
          state.stdin_cursor += count;

          if state.stdin_cursor == front_len {
            state.stdin_queue.pop_front();
            state.stdin_cursor = 0;
          }
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
          if state.mode == SpawnMode::Async && !state.stdin_armed {
            if let Some(event_loop) = EventLoop::current() {
              let callback_inner: Arc<Self> = Arc::clone(inner);

              let registered = event_loop.register_socket(fd, Interest::WRITE, move |fd, ready| {
                Self::on_pipe_ready(&callback_inner, fd, ready);
              });

              state.stdin_armed = registered.is_ok();
            }
          }

          return;
        }
        Err(error) => {
          // Likely EPIPE from a dead child; the reap path cleans up.
          tracing::debug!(fd, %error, "stdin write failed");
          state.stdin_queue.clear();
          state.stdin_cursor = 0;
          return;
        }
      }
    }
  }

  fn close_stdin(inner: &Arc<Self>) {
    let mut state = inner.state.lock();

    state.stdin_queue.clear();
    state.stdin_cursor = 0;

    if let Some(fd) = state.stdin.take() {
      if state.stdin_armed {
        if let Some(event_loop) = EventLoop::current() {
          event_loop.unregister_socket(fd.as_raw_fd());
        }

        state.stdin_armed = false;
      }

      tracing::trace!(fd = fd.as_raw_fd(), "stdin closed");
    }
  }

  /// Records the reaped exit code and completes the process.
  ///
  /// Called by the supervisor thread with the registry unlocked. Sync
  /// mode wakes the select loop through the sync pipe; async mode
  /// defers the final drain and teardown to the owning loop so the
  /// `finished` hook observes every drained byte on the loop thread.
  pub(crate) fn finish(self: &Arc<Self>, code: i32) {
    let (mode, handle) = {
      let mut state = self.state.lock();

      state.pid = -1;
      state.return_code = Some(code);
      state.phase = ProcessState::Finished;

      tracing::debug!(code, "child finished");

      match state.mode {
        SpawnMode::Sync => {
          if let Some(fd) = state.sync_write.take() {
            let _ = sys::write_fd(fd.as_raw_fd(), &[b'q']);
          }

          (SpawnMode::Sync, None)
        }
        SpawnMode::Async => (SpawnMode::Async, state.loop_handle.clone()),
      }
    };

    if mode == SpawnMode::Async {
      match handle {
        Some(handle) => {
          let inner: Arc<Self> = Arc::clone(self);
          handle.post(move || Self::complete_async(&inner, code));
        }
        None => Self::complete_async(self, code),
      }
    }
  }

  /// Final async teardown, on the owning loop's thread: drain both
  /// output pipes, close the stdio, then fire `finished`.
  fn complete_async(inner: &Arc<Self>, code: i32) {
    Self::pump_output(inner, PipeRole::Stdout);
    Self::pump_output(inner, PipeRole::Stderr);
    Self::close_stdin(inner);

    {
      let mut state = inner.state.lock();

      for fd in [state.stdout.take(), state.stderr.take()].into_iter().flatten() {
        if let Some(event_loop) = EventLoop::current() {
          event_loop.unregister_socket(fd.as_raw_fd());
        }
      }
    }

    Self::emit_finished(inner, code);
  }

  // ---------------------------------------------------------------------------
  // Hook Dispatch
  // ---------------------------------------------------------------------------

  /// Runs a hook with every process lock released so the hook can call
  /// back into the process.
  fn emit_output_hook(inner: &Arc<Self>, role: PipeRole) {
    let hook: Option<Box<dyn FnMut() + Send>> = {
      let mut hooks = inner.hooks.lock();

      match role {
        PipeRole::Stdout => hooks.on_stdout.take(),
        PipeRole::Stderr => hooks.on_stderr.take(),
        PipeRole::Stdin => None,
      }
    };

    if let Some(mut hook) = hook {
      hook();

      let mut hooks = inner.hooks.lock();

      let slot: &mut Option<Box<dyn FnMut() + Send>> = match role {
        PipeRole::Stdout => &mut hooks.on_stdout,
        PipeRole::Stderr => &mut hooks.on_stderr,
        PipeRole::Stdin => return,
      };

      if slot.is_none() {
        *slot = Some(hook);
      }
    }
  }

  fn emit_finished(inner: &Arc<Self>, code: i32) {
    let hook: Option<Box<dyn FnMut(i32) + Send>> = inner.hooks.lock().on_finished.take();

    if let Some(mut hook) = hook {
      hook(code);

      let mut hooks = inner.hooks.lock();

      if hooks.on_finished.is_none() {
        hooks.on_finished = Some(hook);
      }
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::consts::MAX_OUTPUT_BUFFER;
  use crate::proc::process::OutputBuffer;

  #[test]
  fn test_output_buffer_append_and_take() {
    let mut buffer: OutputBuffer = OutputBuffer::new();

    buffer.append(b"abc");
    buffer.append(b"def");

    assert_eq!(buffer.take_all(), b"abcdef");
    assert_eq!(buffer.take_all(), b"");
  }

  #[test]
  fn test_output_buffer_compacts_consumed_prefix() {
    let mut buffer: OutputBuffer = OutputBuffer::new();

    buffer.data = vec![0; MAX_OUTPUT_BUFFER - 8];
    buffer.index = MAX_OUTPUT_BUFFER / 2;

    buffer.append(&[1; 16]);

    // The consumed prefix was compacted away; no unread bytes lost.
    assert_eq!(buffer.index, 0);
    assert_eq!(buffer.data.len(), MAX_OUTPUT_BUFFER - 8 - MAX_OUTPUT_BUFFER / 2 + 16);
    assert_eq!(&buffer.data[buffer.data.len() - 16..], &[1; 16]);
  }

  #[test]
  fn test_output_buffer_drops_when_unread_overflows() {
    let mut buffer: OutputBuffer = OutputBuffer::new();

    buffer.data = vec![0; MAX_OUTPUT_BUFFER];
    buffer.index = 0;

    buffer.append(&[1; 8]);

    assert_eq!(buffer.data, vec![1; 8]);
  }
}
