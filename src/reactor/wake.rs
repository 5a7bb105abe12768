use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use crate::consts::WAKE_BYTE;
use crate::sys;

/// Self-pipe used to interrupt a blocking poll.
///
/// Any thread (or a signal handler, which is why [`notify`] is a single
/// `write(2)` of one byte) can make the next or current poll return
/// promptly. Spurious wakes are legal; the loop drains and re-evaluates.
///
/// [`notify`]: WakePipe::notify
pub(crate) struct WakePipe {
  read: OwnedFd,
  write: OwnedFd,
}

impl WakePipe {
  pub(crate) fn new() -> io::Result<Self> {
    let (read, write): (OwnedFd, OwnedFd) = sys::pipe()?;

    sys::set_nonblocking(read.as_raw_fd(), true)?;
    sys::set_nonblocking(write.as_raw_fd(), true)?;

    Ok(Self { read, write })
  }

  /// The readable end, registered with the poller.
  #[inline]
  pub(crate) fn read_fd(&self) -> RawFd {
    self.read.as_raw_fd()
  }

  /// The writable end, stashed for signal handlers.
  #[inline]
  pub(crate) fn write_fd(&self) -> RawFd {
    self.write.as_raw_fd()
  }

  /// Queues one wake byte.
  ///
  /// A full pipe already guarantees a pending wake, so `EAGAIN` is
  /// success here.
  pub(crate) fn notify(&self) {
    match sys::write_fd(self.write.as_raw_fd(), &[WAKE_BYTE]) {
      Ok(_) => {}
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
      Err(error) => {
        tracing::warn!(%error, "wakeup pipe write failed");
      }
    }
  }

  /// Reads wake bytes until the pipe is empty.
  pub(crate) fn drain(&self) {
    let mut buf: [u8; 64] = [0; 64];

    loop {
      match sys::read_fd(self.read.as_raw_fd(), &mut buf) {
        Ok(0) => break,
        Ok(_) => continue,
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
        Err(error) => {
          tracing::warn!(%error, "wakeup pipe drain failed");
          break;
        }
      }
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
