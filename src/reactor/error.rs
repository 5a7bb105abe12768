use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Errors surfaced by the event loop and its poller.
///
/// Lifecycle variants (`AlreadyRegistered`, `NotRegistered`,
/// `NotOnLoopThread`, `NoEventLoop`, `MainLoopExists`) are programmer
/// errors: debug builds assert on them, release builds return them.
#[derive(Debug, Error)]
pub enum LoopError {
  /// The file descriptor already has a registration.
  #[error("file descriptor {0} is already registered")]
  AlreadyRegistered(RawFd),

  /// The file descriptor has no registration.
  #[error("file descriptor {0} is not registered")]
  NotRegistered(RawFd),

  /// A loop-affine operation was invoked off the loop thread.
  #[error("operation requires the thread that runs the event loop")]
  NotOnLoopThread,

  /// The calling thread has no current event loop.
  #[error("no event loop on this thread")]
  NoEventLoop,

  /// A second loop declared itself the main loop.
  #[error("a main event loop already exists in this process")]
  MainLoopExists,

  /// Signal-install flags were requested without the main flag.
  #[error("signal handlers can only be installed by the main loop")]
  SignalsRequireMain,

  /// The underlying readiness mechanism failed.
  #[error(transparent)]
  Io(#[from] io::Error),
}
