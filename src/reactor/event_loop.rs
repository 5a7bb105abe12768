use bitflags::bitflags;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::sync::Weak as SharedWeak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::thread::ThreadId;

use crate::consts::MAX_POLL_EVENTS;
use crate::consts::WAKE_BYTE;
use crate::core::fatal;
use crate::reactor::Interest;
use crate::reactor::LoopError;
use crate::reactor::PollEvent;
use crate::reactor::TimerFlags;
use crate::reactor::TimerId;
use crate::reactor::poller::Poller;
use crate::reactor::queue::EventQueue;
use crate::reactor::queue::PostedEvent;
use crate::reactor::timer::DueTimer;
use crate::reactor::timer::TimerWheel;
use crate::reactor::wake::WakePipe;
use crate::utils::now_ms;

// -----------------------------------------------------------------------------
// Loop Globals
// -----------------------------------------------------------------------------

thread_local! {
  static CURRENT: RefCell<Weak<EventLoop>> = const { RefCell::new(Weak::new()) };
}

/// Weak handle to the shared half of the process-wide main loop.
static MAIN: Mutex<SharedWeak<LoopShared>> = Mutex::new(SharedWeak::new());

/// Set by the `SIGINT`/`SIGTERM` handler; consumed by the installing loop.
static SIGNAL_QUIT: AtomicBool = AtomicBool::new(false);

/// Wake-pipe write end of the loop that installed signal handlers.
static SIGNAL_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Handler installed for `SIGINT`/`SIGTERM`.
///
/// Touches nothing but an atomic flag and one pipe write; both are
/// async-signal-safe.
extern "C" fn request_quit(_signal: libc::c_int) {
  SIGNAL_QUIT.store(true, Ordering::SeqCst);

  let fd: libc::c_int = SIGNAL_WAKE_FD.load(Ordering::SeqCst);

  if fd != -1 {
    let byte: [u8; 1] = [WAKE_BYTE];
    unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
  }
}

// -----------------------------------------------------------------------------
// Loop Flags
// -----------------------------------------------------------------------------

bitflags! {
  /// Construction flags for an event loop.
  ///
  /// The signal-install flags require [`MAIN`]: process-wide handlers
  /// must have exactly one owning loop, and the main loop is the only
  /// singleton-enforced one.
  ///
  /// [`MAIN`]: LoopFlags::MAIN
  #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
  pub struct LoopFlags: u32 {
    /// Tag this loop as the process-wide main loop.
    const MAIN = 0x1;
    /// Install a `SIGINT` handler that requests quit.
    const INSTALL_SIGINT = 0x2;
    /// Install a `SIGTERM` handler that requests quit.
    const INSTALL_SIGTERM = 0x4;
  }
}

/// Outcome of a dispatch run.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ExecStatus {
  /// The loop unwound because `quit` was requested.
  Success,
  /// The poller failed fatally or the loop was misused.
  GeneralError,
  /// The overall or inactivity timeout elapsed.
  Timeout,
}

// -----------------------------------------------------------------------------
// Shared Half
// -----------------------------------------------------------------------------

/// The thread-safe half of a loop: everything `post`, `quit`, and
/// `wakeup` need from any thread or signal context.
struct LoopShared {
  queue: EventQueue,
  wake: WakePipe,
  quit: AtomicBool,
  thread: ThreadId,
}

impl LoopShared {
  #[inline]
  fn on_loop_thread(&self) -> bool {
    std::thread::current().id() == self.thread
  }

  fn post(&self, event: PostedEvent) {
    self.queue.push(event);

    // A same-thread post is drained later in the current iteration; a
    // cross-thread post must interrupt a poll that may be blocking.
    if !self.on_loop_thread() {
      self.wake.notify();
    }
  }

  fn request_quit(&self) {
    self.quit.store(true, Ordering::SeqCst);
    self.wake.notify();
  }
}

// -----------------------------------------------------------------------------
// Loop Handle
// -----------------------------------------------------------------------------

/// Cross-thread handle to an event loop.
///
/// Exposes exactly the operations that are safe away from the loop
/// thread. Everything else lives on [`EventLoop`] itself, which never
/// leaves its thread.
#[derive(Clone)]
pub struct LoopHandle {
  shared: Arc<LoopShared>,
}

impl LoopHandle {
  /// Posts a deferred callable; it runs on the loop thread, in FIFO
  /// order relative to other posts, no later than one poll cycle away.
  pub fn post<F>(&self, event: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.shared.post(Box::new(event));
  }

  /// Posts an event whose sole effect is dropping `object` on the loop
  /// thread.
  pub fn delete_later<T>(&self, object: T)
  where
    T: Send + 'static,
  {
    self.post(move || drop(object));
  }

  /// Requests that the current or next `exec` unwind.
  pub fn quit(&self) {
    self.shared.request_quit();
  }

  /// Interrupts a blocking poll without queueing any work.
  pub fn wakeup(&self) {
    self.shared.wake.notify();
  }
}

// -----------------------------------------------------------------------------
// Socket Registrations
// -----------------------------------------------------------------------------

type SocketCallback = Box<dyn FnMut(RawFd, Interest)>;

struct SocketEntry {
  mask: Interest,
  /// Registration generation; a batch event whose token no longer
  /// matches was registered for a predecessor and is suppressed.
  token: u64,
  callback: Rc<RefCell<SocketCallback>>,
}

struct LoopInner {
  poller: Poller,
  sockets: HashMap<RawFd, SocketEntry>,
  timers: TimerWheel,
  inactivity: Option<u64>,
  next_token: u64,
}

// -----------------------------------------------------------------------------
// Event Loop
// -----------------------------------------------------------------------------

/// Single-threaded cooperative dispatch loop.
///
/// A loop is created per thread and becomes that thread's current loop
/// ([`EventLoop::current`]). All registration and dispatch stays on the
/// creating thread; other threads interact through a [`LoopHandle`].
///
/// Each dispatch iteration, in order: poll, drain the wakeup pipe,
/// invoke ready socket callbacks, fire expired timers, drain one batch
/// of posted events, honor quit and deadline requests.
pub struct EventLoop {
  shared: Arc<LoopShared>,
  flags: LoopFlags,
  inner: RefCell<LoopInner>,
}

impl EventLoop {
  /// Creates a loop and installs it as the calling thread's current
  /// loop.
  ///
  /// At most one loop per process may carry [`LoopFlags::MAIN`];
  /// violating that returns [`LoopError::MainLoopExists`]. The
  /// signal-install flags are accepted only together with `MAIN`, which
  /// keeps the process-global signal wake state owned by exactly one
  /// loop at a time. Failure to acquire the kernel poller or the wakeup
  /// pipe is fatal.
  pub fn new(flags: LoopFlags) -> Result<Rc<Self>, LoopError> {
    let installs: bool = flags.intersects(LoopFlags::INSTALL_SIGINT | LoopFlags::INSTALL_SIGTERM);

    if installs && !flags.contains(LoopFlags::MAIN) {
      tracing::error!(?flags, "signal handlers require the main loop");
      return Err(LoopError::SignalsRequireMain);
    }

    let poller: Poller = match Poller::new() {
      Ok(poller) => poller,
      Err(error) => fatal!("failed to create kernel poller: {error}"),
    };

    let wake: WakePipe = match WakePipe::new() {
      Ok(wake) => wake,
      Err(error) => fatal!("failed to create wakeup pipe: {error}"),
    };

    // Broken-pipe writes must surface as EPIPE, not kill the process.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let shared: Arc<LoopShared> = Arc::new(LoopShared {
      queue: EventQueue::new(),
      wake,
      quit: AtomicBool::new(false),
      thread: std::thread::current().id(),
    });

    if flags.contains(LoopFlags::MAIN) {
      let mut main = MAIN.lock();

      if main.upgrade().is_some() {
        tracing::error!("a main event loop already exists");
        return Err(LoopError::MainLoopExists);
      }

      *main = Arc::downgrade(&shared);
    }

    let event_loop: Rc<Self> = Rc::new(Self {
      inner: RefCell::new(LoopInner {
        poller,
        sockets: HashMap::new(),
        timers: TimerWheel::new(),
        inactivity: None,
        next_token: 1,
      }),
      shared,
      flags,
    });

    {
      let mut inner = event_loop.inner.borrow_mut();
      let wake_fd: RawFd = event_loop.shared.wake.read_fd();

      inner
        .poller
        .add(wake_fd, Interest::READ | Interest::LEVEL_TRIGGERED)?;
    }

    if installs {
      SIGNAL_WAKE_FD.store(event_loop.shared.wake.write_fd(), Ordering::SeqCst);
      install_quit_handlers(flags);
    }

    CURRENT.with(|current| {
      *current.borrow_mut() = Rc::downgrade(&event_loop);
    });

    tracing::debug!(?flags, "event loop created");

    Ok(event_loop)
  }

  /// Returns the calling thread's current loop, if one is alive.
  pub fn current() -> Option<Rc<Self>> {
    CURRENT.with(|current| current.borrow().upgrade())
  }

  /// Returns a cross-thread handle to the process-wide main loop.
  pub fn main_handle() -> Option<LoopHandle> {
    MAIN.lock().upgrade().map(|shared| LoopHandle { shared })
  }

  /// Returns a cross-thread handle to this loop.
  pub fn handle(&self) -> LoopHandle {
    LoopHandle {
      shared: Arc::clone(&self.shared),
    }
  }

  /// Returns the construction flags.
  #[inline]
  pub fn flags(&self) -> LoopFlags {
    self.flags
  }

  // ---------------------------------------------------------------------------
  // Registration
  // ---------------------------------------------------------------------------

  /// Registers a readiness callback for `fd`.
  ///
  /// The callback receives the descriptor and the combined ready mask.
  /// Error readiness is delivered whether requested or not.
  pub fn register_socket<F>(&self, fd: RawFd, mask: Interest, callback: F) -> Result<(), LoopError>
  where
    F: FnMut(RawFd, Interest) + 'static,
  {
    let mut inner = self.inner.borrow_mut();

    if inner.sockets.contains_key(&fd) {
      tracing::error!(fd, "socket is already registered");
      return Err(LoopError::AlreadyRegistered(fd));
    }

    inner.poller.add(fd, mask)?;

    let token: u64 = inner.next_token;
    inner.next_token += 1;

    inner.sockets.insert(
      fd,
      SocketEntry {
        mask,
        token,
        callback: Rc::new(RefCell::new(Box::new(callback))),
      },
    );

    tracing::trace!(fd, ?mask, "socket registered");

    Ok(())
  }

  /// Replaces the interest mask of a registered socket.
  pub fn update_socket(&self, fd: RawFd, mask: Interest) -> Result<(), LoopError> {
    let mut inner = self.inner.borrow_mut();

    if !inner.sockets.contains_key(&fd) {
      tracing::error!(fd, "socket is not registered");
      return Err(LoopError::NotRegistered(fd));
    }

    inner.poller.modify(fd, mask)?;

    if let Some(entry) = inner.sockets.get_mut(&fd) {
      entry.mask = mask;
    }

    tracing::trace!(fd, ?mask, "socket updated");

    Ok(())
  }

  /// Drops a socket registration. Repeat removals are benign.
  pub fn unregister_socket(&self, fd: RawFd) {
    let mut inner = self.inner.borrow_mut();

    if inner.sockets.remove(&fd).is_some() {
      inner.poller.remove(fd);
      tracing::trace!(fd, "socket unregistered");
    }
  }

  /// Registers a timer due `timeout` milliseconds from now.
  ///
  /// The timer repeats unless [`TimerFlags::SINGLE_SHOT`] is set.
  pub fn register_timer<F>(&self, timeout: u64, flags: TimerFlags, callback: F) -> TimerId
  where
    F: FnMut(TimerId) + 'static,
  {
    self
      .inner
      .borrow_mut()
      .timers
      .register(timeout, flags, Box::new(callback))
  }

  /// Drops a timer registration; idempotent and callable from within
  /// any timer callback, including the firing one.
  pub fn unregister_timer(&self, id: TimerId) {
    self.inner.borrow_mut().timers.unregister(id);
  }

  // ---------------------------------------------------------------------------
  // Posting
  // ---------------------------------------------------------------------------

  /// Posts a deferred callable to this loop.
  pub fn post<F>(&self, event: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.shared.post(Box::new(event));
  }

  /// Posts an event whose sole effect is dropping `object` on the loop
  /// thread.
  pub fn delete_later<T>(&self, object: T)
  where
    T: Send + 'static,
  {
    self.post(move || drop(object));
  }

  /// Requests that the current or next `exec` unwind. Thread-safe.
  pub fn quit(&self) {
    self.shared.request_quit();
  }

  /// Interrupts a blocking poll. Thread-safe.
  pub fn wakeup(&self) {
    self.shared.wake.notify();
  }

  /// Sets the inactivity window after which `exec` returns
  /// [`ExecStatus::Timeout`]; `None` disables it.
  ///
  /// Changes made while the loop is running may not be honored until
  /// the next iteration.
  pub fn set_inactivity_timeout(&self, timeout: Option<u64>) {
    self.inner.borrow_mut().inactivity = timeout;
  }

  // ---------------------------------------------------------------------------
  // Dispatch
  // ---------------------------------------------------------------------------

  /// Runs the dispatch loop until quit, a fatal poller error, or a
  /// timeout (overall `timeout` here, or the inactivity window).
  pub fn exec(&self, timeout: Option<u64>) -> ExecStatus {
    if !self.shared.on_loop_thread() {
      debug_assert!(false, "exec invoked off the loop thread");
      tracing::error!("exec invoked off the loop thread");
      return ExecStatus::GeneralError;
    }

    let deadline: Option<u64> = timeout.map(|ms| now_ms().saturating_add(ms));
    let mut events: Vec<PollEvent> = Vec::with_capacity(MAX_POLL_EVENTS);
    let mut last_activity: u64 = now_ms();

    loop {
      if self.take_quit_request() {
        return ExecStatus::Success;
      }

      let now: u64 = now_ms();

      if deadline.is_some_and(|at| now >= at) {
        return ExecStatus::Timeout;
      }

      let wait: Option<u64> = self.poll_timeout(now, deadline);

      let count: usize = {
        let mut inner = self.inner.borrow_mut();

        match inner.poller.wait(&mut events, wait) {
          Ok(count) => count,
          Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
          Err(error) => {
            tracing::error!(%error, "kernel poller failed");
            return ExecStatus::GeneralError;
          }
        }
      };

      let now: u64 = now_ms();

      if count > 0 {
        last_activity = now;
      }

      self.dispatch_sockets(&events);

      if self.fire_timers(now) > 0 {
        last_activity = now;
      }

      if self.drain_posted() > 0 {
        last_activity = now;
      }

      if count == 0 {
        let inactivity: Option<u64> = self.inner.borrow().inactivity;

        if inactivity.is_some_and(|window| now.saturating_sub(last_activity) >= window) {
          return ExecStatus::Timeout;
        }
      }
    }
  }

  /// Blocks on a single registered descriptor and dispatches at most
  /// one readiness delivery for it.
  ///
  /// Used by synchronous flows outside the main dispatch; returns the
  /// mask that fired, or an empty mask on timeout.
  pub fn process_socket(&self, fd: RawFd, timeout: Option<u64>) -> Result<Interest, LoopError> {
    if !self.shared.on_loop_thread() {
      debug_assert!(false, "process_socket invoked off the loop thread");
      return Err(LoopError::NotOnLoopThread);
    }

    let (token, mask, callback) = {
      let inner = self.inner.borrow();

      match inner.sockets.get(&fd) {
        Some(entry) => (entry.token, entry.mask, Rc::clone(&entry.callback)),
        None => return Err(LoopError::NotRegistered(fd)),
      }
    };

    let mut poll: libc::pollfd = libc::pollfd {
      fd,
      events: poll_events(mask),
      revents: 0,
    };

    let timeout_ms: libc::c_int = match timeout {
      Some(ms) => ms.min(libc::c_int::MAX as u64) as libc::c_int,
      None => -1,
    };

    let ready: libc::c_int = loop {
      let ret: libc::c_int = unsafe { libc::poll(&mut poll, 1, timeout_ms) };

      if ret != -1 {
        break ret;
      }

      let error: io::Error = io::Error::last_os_error();

      if error.kind() != io::ErrorKind::Interrupted {
        return Err(LoopError::Io(error));
      }
    };

    if ready == 0 {
      return Ok(Interest::empty());
    }

    let fired: Interest = poll_ready(poll.revents);

    if fired.is_ready() {
      match callback.try_borrow_mut() {
        Ok(mut callback) => callback(fd, fired),
        Err(_) => tracing::warn!(fd, "re-entrant socket callback suppressed"),
      }
    }

    self.rearm_one_shot(fd, token);

    Ok(fired)
  }

  // ---------------------------------------------------------------------------
  // Iteration Steps
  // ---------------------------------------------------------------------------

  /// Computes the poll timeout from the nearest timer deadline, the
  /// inactivity window, and the overall deadline. Pending posted events
  /// force an immediate pass.
  fn poll_timeout(&self, now: u64, deadline: Option<u64>) -> Option<u64> {
    if !self.shared.queue.is_empty() {
      return Some(0);
    }

    let inner = self.inner.borrow();

    let mut wait: Option<u64> = inner
      .timers
      .next_deadline()
      .map(|when| when.saturating_sub(now));

    wait = merge_timeout(wait, inner.inactivity);
    wait = merge_timeout(wait, deadline.map(|at| at.saturating_sub(now)));
    wait
  }

  fn dispatch_sockets(&self, events: &[PollEvent]) {
    let wake_fd: RawFd = self.shared.wake.read_fd();

    // Pin each ready descriptor to the registration generation it was
    // polled under, before any callback can mutate the map.
    let batch: Vec<(RawFd, Interest, u64)> = {
      let inner = self.inner.borrow();

      events
        .iter()
        .filter(|event| event.fd != wake_fd)
        .filter_map(|event| {
          inner
            .sockets
            .get(&event.fd)
            .map(|entry| (event.fd, event.ready, entry.token))
        })
        .collect()
    };

    if events.iter().any(|event| event.fd == wake_fd) {
      self.shared.wake.drain();
    }

    for (fd, ready, token) in batch {
      // A callback that unregistered or re-registered this descriptor
      // earlier in the batch suppresses the remaining deliveries.
      let callback = {
        let inner = self.inner.borrow();

        match inner.sockets.get(&fd) {
          Some(entry) if entry.token == token => Rc::clone(&entry.callback),
          _ => continue,
        }
      };

      match callback.try_borrow_mut() {
        Ok(mut callback) => callback(fd, ready),
        Err(_) => tracing::warn!(fd, "re-entrant socket callback suppressed"),
      }

      self.rearm_one_shot(fd, token);
    }
  }

  /// Re-arms a one-shot registration after a delivery, provided the
  /// callback left the same registration in place.
  fn rearm_one_shot(&self, fd: RawFd, token: u64) {
    let mut inner = self.inner.borrow_mut();

    let rearm: bool = match inner.sockets.get(&fd) {
      Some(entry) => entry.token == token && entry.mask.contains(Interest::ONE_SHOT),
      None => false,
    };

    if rearm {
      if let Err(error) = inner.poller.rearm(fd) {
        tracing::warn!(fd, %error, "one-shot re-arm failed");
      }
    }
  }

  /// Fires every timer due at `now`, bounded to the snapshot taken at
  /// the start of the sweep. Returns the number of callbacks invoked.
  fn fire_timers(&self, now: u64) -> usize {
    let due: Vec<DueTimer> = self.inner.borrow_mut().timers.collect_due(now);
    let fired: usize = due.len();

    for timer in due {
      self.inner.borrow_mut().timers.begin_fire(timer.id);

      match timer.callback.try_borrow_mut() {
        Ok(mut callback) => callback(timer.id),
        Err(_) => tracing::warn!(id = timer.id, "re-entrant timer callback suppressed"),
      }

      let cancelled: bool = self.inner.borrow_mut().timers.end_fire();
      let repeats: bool = !timer.flags.contains(TimerFlags::SINGLE_SHOT);

      if repeats && !cancelled {
        self.inner.borrow_mut().timers.reinsert(timer, now);
      }
    }

    fired
  }

  /// Runs one bounded batch of posted events in enqueue order; returns
  /// the batch size.
  fn drain_posted(&self) -> usize {
    let batch = self.shared.queue.take_batch();
    let count: usize = batch.len();

    for event in batch {
      event();
    }

    count
  }

  fn take_quit_request(&self) -> bool {
    if self.shared.quit.swap(false, Ordering::SeqCst) {
      return true;
    }

    let installed: bool = self
      .flags
      .intersects(LoopFlags::INSTALL_SIGINT | LoopFlags::INSTALL_SIGTERM);

    if installed && SIGNAL_QUIT.swap(false, Ordering::SeqCst) {
      tracing::debug!("quit requested by signal");
      return true;
    }

    false
  }
}

impl Drop for EventLoop {
  fn drop(&mut self) {
    self.inner.borrow_mut().timers.clear();

    if self.flags.contains(LoopFlags::MAIN) {
      *MAIN.lock() = SharedWeak::new();
    }

    if self
      .flags
      .intersects(LoopFlags::INSTALL_SIGINT | LoopFlags::INSTALL_SIGTERM)
    {
      // Clear only while still the owner; a successor loop that has
      // already claimed the slot keeps its wake fd intact.
      let _ = SIGNAL_WAKE_FD.compare_exchange(
        self.shared.wake.write_fd(),
        -1,
        Ordering::SeqCst,
        Ordering::SeqCst,
      );
    }

    CURRENT.with(|current| {
      if current.borrow().upgrade().is_none() {
        *current.borrow_mut() = Weak::new();
      }
    });
  }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn merge_timeout(a: Option<u64>, b: Option<u64>) -> Option<u64> {
  match (a, b) {
    (Some(a), Some(b)) => Some(a.min(b)),
    (Some(a), None) => Some(a),
    (None, b) => b,
  }
}

fn install_quit_handlers(flags: LoopFlags) {
  // SAFETY: the handler performs only async-signal-safe work.
  unsafe {
    let mut action: libc::sigaction = std::mem::zeroed();
    let handler: extern "C" fn(libc::c_int) = request_quit;

    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);

    if flags.contains(LoopFlags::INSTALL_SIGINT) {
      libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }

    if flags.contains(LoopFlags::INSTALL_SIGTERM) {
      libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
    }
  }
}

fn poll_events(mask: Interest) -> libc::c_short {
  let mut events: libc::c_short = 0;

  if mask.contains(Interest::READ) {
    events |= libc::POLLIN;
  }

  if mask.contains(Interest::WRITE) {
    events |= libc::POLLOUT;
  }

  events
}

fn poll_ready(revents: libc::c_short) -> Interest {
  let mut ready: Interest = Interest::empty();

  if revents & libc::POLLIN != 0 {
    ready |= Interest::READ;
  }

  if revents & libc::POLLOUT != 0 {
    ready |= Interest::WRITE;
  }

  if revents & libc::POLLERR != 0 {
    ready |= Interest::ERROR;
  }

  if revents & libc::POLLHUP != 0 {
    ready |= Interest::ERROR | Interest::READ;
  }

  ready
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
