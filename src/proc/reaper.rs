//! The process supervisor thread and `SIGCHLD` plumbing.
//!
//! One supervisor thread exists per process lifetime, started on first
//! use. The `SIGCHLD` handler's sole action is writing one byte to the
//! signal pipe; all reaping happens on the supervisor thread, which
//! walks the registry with `waitpid(WNOHANG)` so coalesced signals and
//! multiple simultaneous exits stay correct.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use crate::consts::REAP_CHILD_BYTE;
use crate::consts::REAP_STOP_BYTE;
use crate::core::fatal;
use crate::proc::process::ProcInner;
use crate::sys;

// -----------------------------------------------------------------------------
// Process Registry
// -----------------------------------------------------------------------------

/// Live children, strictly one entry per spawned pid.
static REGISTRY: LazyLock<Mutex<HashMap<libc::pid_t, Arc<ProcInner>>>> =
  LazyLock::new(|| Mutex::new(HashMap::new()));

/// Signal-pipe write end; the only state the `SIGCHLD` handler touches.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

/// The running supervisor thread, if any.
static SUPERVISOR: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

// -----------------------------------------------------------------------------
// Signal Handler
// -----------------------------------------------------------------------------

/// `SIGCHLD` handler: one pipe write, nothing else.
extern "C" fn on_sigchld(_signal: libc::c_int) {
  // SAFETY: reading and restoring errno keeps the interrupted code's
  // view intact; `write(2)` is async-signal-safe.
  unsafe {
    let errno: *mut libc::c_int = sys::errno_location();
    let saved: libc::c_int = *errno;

    let fd: libc::c_int = SIGNAL_FD.load(Ordering::SeqCst);

    if fd != -1 {
      let byte: [u8; 1] = [REAP_CHILD_BYTE];

      loop {
        if libc::write(fd, byte.as_ptr().cast(), 1) >= 0 {
          break;
        }

        // A full pipe already has a pending wake queued.
        if *errno != libc::EINTR {
          break;
        }
      }
    }

    *errno = saved;
  }
}

// -----------------------------------------------------------------------------
// Supervisor Lifecycle
// -----------------------------------------------------------------------------

/// Starts the supervisor thread and installs the `SIGCHLD` handler.
///
/// Idempotent; every spawn calls it before forking so the handler is in
/// place before the first child can exit.
pub(crate) fn ensure_started() {
  let mut supervisor = SUPERVISOR.lock();

  if supervisor.is_some() {
    return;
  }

  let (read, write): (OwnedFd, OwnedFd) = match sys::pipe() {
    Ok(pipe) => pipe,
    Err(error) => fatal!("failed to create process signal pipe: {error}"),
  };

  if let Err(error) = sys::set_nonblocking(write.as_raw_fd(), true) {
    fatal!("failed to prepare process signal pipe: {error}");
  }

  // The write end stays open for the process lifetime; the handler may
  // fire at any point from now on.
  SIGNAL_FD.store(write.as_raw_fd(), Ordering::SeqCst);
  std::mem::forget(write);

  install_sigchld_handler();

  let join: JoinHandle<()> = match std::thread::Builder::new()
    .name("alioth-reaper".to_owned())
    .spawn(move || run(read))
  {
    Ok(join) => join,
    Err(error) => fatal!("failed to spawn process supervisor thread: {error}"),
  };

  *supervisor = Some(join);

  tracing::debug!("process supervisor thread started");
}

/// Registers a freshly spawned child.
///
/// The nudge covers a child whose exit beat the registration: the next
/// sweep walks the registry again and reaps it.
pub(crate) fn register(pid: libc::pid_t, process: Arc<ProcInner>) {
  REGISTRY.lock().insert(pid, process);
  nudge(REAP_CHILD_BYTE);
}

/// Stops the supervisor thread and joins it.
///
/// The last-exit teardown hook for embedders; idempotent, and the next
/// spawn restarts the supervisor.
pub fn shutdown() {
  let join: Option<JoinHandle<()>> = SUPERVISOR.lock().take();

  if let Some(join) = join {
    nudge(REAP_STOP_BYTE);

    if join.join().is_err() {
      tracing::error!("process supervisor thread panicked");
    }

    tracing::debug!("process supervisor thread stopped");
  }
}

fn install_sigchld_handler() {
  // SAFETY: the handler performs only async-signal-safe work.
  unsafe {
    // Writes to a dead child's stdin must surface as EPIPE.
    libc::signal(libc::SIGPIPE, libc::SIG_IGN);

    let mut action: libc::sigaction = std::mem::zeroed();
    let handler: extern "C" fn(libc::c_int) = on_sigchld;

    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
  }
}

fn nudge(byte: u8) {
  let fd: libc::c_int = SIGNAL_FD.load(Ordering::SeqCst);

  if fd == -1 {
    return;
  }

  match sys::write_fd(fd, &[byte]) {
    Ok(_) => {}
    Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
    Err(error) => tracing::warn!(%error, "process signal pipe write failed"),
  }
}

// -----------------------------------------------------------------------------
// Supervisor Thread
// -----------------------------------------------------------------------------

fn run(read: OwnedFd) {
  loop {
    let mut byte: [u8; 1] = [0];

    match sys::read_fd(read.as_raw_fd(), &mut byte) {
      Ok(0) => break,
      Ok(_) if byte[0] == REAP_STOP_BYTE => break,
      Ok(_) => sweep(),
      Err(error) => {
        tracing::error!(%error, "process signal pipe read failed");
        break;
      }
    }
  }

  // The handler stays installed and may still write; a reader-less
  // pipe would turn those writes into SIGPIPE, so the read end is
  // deliberately leaked.
  std::mem::forget(read);
}

/// Walks the registry reaping every child `waitpid` reports done.
///
/// `finish` runs with the registry unlocked so it can take per-process
/// locks and touch the owning loop freely.
fn sweep() {
  let mut finished: Vec<(Arc<ProcInner>, i32)> = Vec::new();

  {
    let mut registry = REGISTRY.lock();

    registry.retain(|pid, process| {
      let mut status: libc::c_int = 0;

      match unsafe { libc::waitpid(*pid, &mut status, libc::WNOHANG) } {
        // Still running, or not reapable yet; keep the entry.
        0 | -1 => true,
        _ => {
          let code: i32 = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
          } else {
            -1
          };

          tracing::debug!(pid, code, "child reaped");
          finished.push((Arc::clone(process), code));
          false
        }
      }
    });
  }

  for (process, code) in finished {
    process.finish(code);
  }
}
