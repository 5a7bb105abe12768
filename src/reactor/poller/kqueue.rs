use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::ptr;

use crate::consts::MAX_POLL_EVENTS;
use crate::reactor::Interest;
use crate::reactor::PollEvent;
use crate::sys::cvt;

/// kqueue-backed readiness mechanism.
pub(crate) struct Backend {
  kqueue: OwnedFd,
}

impl Backend {
  pub(crate) fn new() -> io::Result<Self> {
    let fd: libc::c_int = cvt(unsafe { libc::kqueue() })?;

    Ok(Self {
      // SAFETY: `kqueue()` succeeded, the descriptor is unowned.
      kqueue: unsafe { OwnedFd::from_raw_fd(fd) },
    })
  }

  pub(crate) fn add(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
    self.apply(fd, mask)
  }

  /// kqueue has no in-place update: drop both filters, re-add the mask.
  pub(crate) fn modify(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
    let _ = self.remove(fd);
    self.apply(fd, mask)
  }

  pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
    let changes: [libc::kevent; 2] = [
      filter_event(fd, libc::EVFILT_READ, libc::EV_DELETE),
      filter_event(fd, libc::EVFILT_WRITE, libc::EV_DELETE),
    ];

    // Either filter may be absent; deleting a missing filter is benign.
    unsafe {
      libc::kevent(
        self.kqueue.as_raw_fd(),
        changes.as_ptr(),
        changes.len() as libc::c_int,
        ptr::null_mut(),
        0,
        ptr::null(),
      );
    }

    Ok(())
  }

  pub(crate) fn wait(
    &self,
    events: &mut Vec<PollEvent>,
    timeout: Option<u64>,
  ) -> io::Result<usize> {
    let ts: libc::timespec;
    let ts_ptr: *const libc::timespec = match timeout {
      Some(ms) => {
        ts = libc::timespec {
          tv_sec: (ms / 1_000) as libc::time_t,
          tv_nsec: ((ms % 1_000) * 1_000_000) as libc::c_long,
        };
        &ts
      }
      None => ptr::null(),
    };

    let mut native: [libc::kevent; MAX_POLL_EVENTS] = unsafe { std::mem::zeroed() };

    let count: libc::c_int = cvt(unsafe {
      libc::kevent(
        self.kqueue.as_raw_fd(),
        ptr::null(),
        0,
        native.as_mut_ptr(),
        MAX_POLL_EVENTS as libc::c_int,
        ts_ptr,
      )
    })?;

    for event in native.iter().take(count as usize) {
      let fd: RawFd = event.ident as RawFd;
      let ready: Interest = ready_mask(event);

      // kqueue reports read and write as separate kevents; fold them
      // into one combined delivery per descriptor.
      match events.iter_mut().find(|prior| prior.fd == fd) {
        Some(prior) => prior.ready |= ready,
        None => events.push(PollEvent { fd, ready }),
      }
    }

    Ok(events.len())
  }

  fn apply(&self, fd: RawFd, mask: Interest) -> io::Result<()> {
    let mut flags: u16 = libc::EV_ADD | libc::EV_ENABLE;

    if !mask.contains(Interest::LEVEL_TRIGGERED) {
      flags |= libc::EV_CLEAR;
    }

    if mask.contains(Interest::ONE_SHOT) {
      flags |= libc::EV_ONESHOT;
    }

    let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);

    if mask.contains(Interest::READ) {
      changes.push(filter_event(fd, libc::EVFILT_READ, flags));
    }

    if mask.contains(Interest::WRITE) {
      changes.push(filter_event(fd, libc::EVFILT_WRITE, flags));
    }

    cvt(unsafe {
      libc::kevent(
        self.kqueue.as_raw_fd(),
        changes.as_ptr(),
        changes.len() as libc::c_int,
        ptr::null_mut(),
        0,
        ptr::null(),
      )
    })?;

    Ok(())
  }
}

fn filter_event(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
  // SAFETY: kevent is plain old data; all meaningful fields are set.
  let mut event: libc::kevent = unsafe { std::mem::zeroed() };

  event.ident = fd as usize;
  event.filter = filter;
  event.flags = flags;
  event
}

fn ready_mask(event: &libc::kevent) -> Interest {
  let mut ready: Interest = Interest::empty();

  match event.filter {
    libc::EVFILT_READ => ready |= Interest::READ,
    libc::EVFILT_WRITE => ready |= Interest::WRITE,
    _ => {}
  }

  if event.flags & libc::EV_ERROR != 0 {
    ready |= Interest::ERROR;
  }

  // EOF still drains through an ordinary read; surface the error bit so
  // callers that never read can observe the hangup.
  if event.flags & libc::EV_EOF != 0 {
    ready |= Interest::ERROR;
  }

  ready
}
