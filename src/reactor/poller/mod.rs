//! Abstraction over the native readiness mechanism.
//!
//! Linux hosts poll through epoll, the BSD family through kqueue. The
//! facade keeps its own registration set so duplicate registration and
//! missing-registration misuse report uniformly across backends.

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(
  target_os = "macos",
  target_os = "freebsd",
  target_os = "openbsd",
  target_os = "dragonfly"
))]
mod kqueue;

#[cfg(target_os = "linux")]
use self::epoll::Backend;

#[cfg(any(
  target_os = "macos",
  target_os = "freebsd",
  target_os = "openbsd",
  target_os = "dragonfly"
))]
use self::kqueue::Backend;

use hashbrown::HashMap;
use std::io;
use std::os::fd::RawFd;

use crate::reactor::Interest;
use crate::reactor::LoopError;
use crate::reactor::PollEvent;

// -----------------------------------------------------------------------------
// Poller
// -----------------------------------------------------------------------------

/// Kernel readiness multiplexer with uniform registration bookkeeping.
pub(crate) struct Poller {
  backend: Backend,
  registered: HashMap<RawFd, Interest>,
}

impl Poller {
  /// Creates a new poller instance.
  pub(crate) fn new() -> io::Result<Self> {
    Ok(Self {
      backend: Backend::new()?,
      registered: HashMap::new(),
    })
  }

  /// Registers interest in a file descriptor.
  pub(crate) fn add(&mut self, fd: RawFd, mask: Interest) -> Result<(), LoopError> {
    if self.registered.contains_key(&fd) {
      tracing::error!(fd, "duplicate poller registration");
      return Err(LoopError::AlreadyRegistered(fd));
    }

    self.backend.add(fd, mask)?;
    self.registered.insert(fd, mask);

    Ok(())
  }

  /// Replaces the interest mask of a registered file descriptor.
  pub(crate) fn modify(&mut self, fd: RawFd, mask: Interest) -> Result<(), LoopError> {
    if !self.registered.contains_key(&fd) {
      tracing::error!(fd, "missing poller registration");
      return Err(LoopError::NotRegistered(fd));
    }

    self.backend.modify(fd, mask)?;
    self.registered.insert(fd, mask);

    Ok(())
  }

  /// Drops the registration of a file descriptor.
  ///
  /// Repeat removals are benign, as is removing a descriptor the kernel
  /// already forgot because it was closed.
  pub(crate) fn remove(&mut self, fd: RawFd) {
    if self.registered.remove(&fd).is_some() {
      if let Err(error) = self.backend.remove(fd) {
        tracing::trace!(fd, %error, "poller remove after close");
      }
    }
  }

  /// Re-arms a one-shot registration after a delivery.
  pub(crate) fn rearm(&mut self, fd: RawFd) -> Result<(), LoopError> {
    let mask: Interest = match self.registered.get(&fd) {
      Some(mask) => *mask,
      None => return Err(LoopError::NotRegistered(fd)),
    };

    self.backend.modify(fd, mask)?;

    Ok(())
  }

  /// Waits for readiness, up to `timeout` milliseconds (`None` blocks).
  ///
  /// `EINTR` surfaces as [`io::ErrorKind::Interrupted`]; the caller
  /// decides whether to retry or unwind.
  pub(crate) fn wait(
    &mut self,
    events: &mut Vec<PollEvent>,
    timeout: Option<u64>,
  ) -> io::Result<usize> {
    events.clear();
    self.backend.wait(events, timeout)
  }
}
