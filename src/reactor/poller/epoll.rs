use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use crate::consts::MAX_POLL_EVENTS;
use crate::reactor::Interest;
use crate::reactor::PollEvent;
use crate::sys::cvt;

/// epoll-backed readiness mechanism.
pub(crate) struct Backend {
  epoll: OwnedFd,
}

impl Backend {
  pub(crate) fn new() -> io::Result<Self> {
    let fd: libc::c_int = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

    Ok(Self {
      // SAFETY: `epoll_create1` succeeded, the descriptor is unowned.
      epoll: unsafe { OwnedFd::from_raw_fd(fd) },
    })
  }

  pub(crate) fn add(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
  }

  pub(crate) fn modify(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
    self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
  }

  pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
    cvt(unsafe {
      libc::epoll_ctl(
        self.epoll.as_raw_fd(),
        libc::EPOLL_CTL_DEL,
        fd,
        std::ptr::null_mut(),
      )
    })?;

    Ok(())
  }

  pub(crate) fn wait(
    &self,
    events: &mut Vec<PollEvent>,
    timeout: Option<u64>,
  ) -> io::Result<usize> {
    let timeout: libc::c_int = match timeout {
      Some(ms) => ms.min(libc::c_int::MAX as u64) as libc::c_int,
      None => -1,
    };

    let mut native: [libc::epoll_event; MAX_POLL_EVENTS] = unsafe { std::mem::zeroed() };

    let count: libc::c_int = cvt(unsafe {
      libc::epoll_wait(
        self.epoll.as_raw_fd(),
        native.as_mut_ptr(),
        MAX_POLL_EVENTS as libc::c_int,
        timeout,
      )
    })?;

    for event in native.iter().take(count as usize) {
      events.push(PollEvent {
        fd: event.u64 as RawFd,
        ready: ready_mask(event.events),
      });
    }

    Ok(count as usize)
  }

  fn ctl(&self, op: libc::c_int, fd: RawFd, mask: Interest) -> io::Result<()> {
    let mut event: libc::epoll_event = libc::epoll_event {
      events: interest_mask(mask),
      u64: fd as u64,
    };

    cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) })?;

    Ok(())
  }
}

fn interest_mask(mask: Interest) -> u32 {
  let mut events: u32 = 0;

  if mask.contains(Interest::READ) {
    events |= libc::EPOLLIN as u32;
  }

  if mask.contains(Interest::WRITE) {
    events |= libc::EPOLLOUT as u32;
  }

  if mask.contains(Interest::ONE_SHOT) {
    events |= libc::EPOLLONESHOT as u32;
  }

  if !mask.contains(Interest::LEVEL_TRIGGERED) {
    events |= libc::EPOLLET as u32;
  }

  events
}

fn ready_mask(events: u32) -> Interest {
  let mut ready: Interest = Interest::empty();

  if events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
    ready |= Interest::READ;
  }

  if events & libc::EPOLLOUT as u32 != 0 {
    ready |= Interest::WRITE;
  }

  if events & libc::EPOLLERR as u32 != 0 {
    ready |= Interest::ERROR;
  }

  // Hangup doubles as readable end-of-stream so consumers observe EOF
  // through an ordinary drain.
  if events & libc::EPOLLHUP as u32 != 0 {
    ready |= Interest::ERROR | Interest::READ;
  }

  ready
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::os::fd::AsRawFd;
  use std::os::fd::OwnedFd;

  use crate::reactor::Interest;
  use crate::reactor::PollEvent;
  use crate::reactor::poller::epoll::Backend;
  use crate::sys::pipe;
  use crate::sys::write_fd;

  #[test]
  fn test_readable_pipe_reports_read() {
    let backend: Backend = Backend::new().unwrap();
    let (read, write): (OwnedFd, OwnedFd) = pipe().unwrap();

    backend.add(read.as_raw_fd(), Interest::READ).unwrap();
    write_fd(write.as_raw_fd(), b"x").unwrap();

    let mut events: Vec<PollEvent> = Vec::new();
    let count: usize = backend.wait(&mut events, Some(1_000)).unwrap();

    assert_eq!(count, 1);
    assert_eq!(events[0].fd, read.as_raw_fd());
    assert!(events[0].ready.contains(Interest::READ));
  }

  #[test]
  fn test_empty_pipe_times_out() {
    let backend: Backend = Backend::new().unwrap();
    let (read, _write): (OwnedFd, OwnedFd) = pipe().unwrap();

    backend.add(read.as_raw_fd(), Interest::READ).unwrap();

    let mut events: Vec<PollEvent> = Vec::new();
    let count: usize = backend.wait(&mut events, Some(10)).unwrap();

    assert_eq!(count, 0);
  }
}
