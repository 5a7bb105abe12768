use std::io;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

/// Converts a `-1`-on-failure syscall return into an [`io::Result`].
#[inline]
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
  if ret == -1 {
    Err(io::Error::last_os_error())
  } else {
    Ok(ret)
  }
}

/// Runs a syscall closure until it completes without `EINTR`.
pub(crate) fn retry<F>(mut call: F) -> io::Result<libc::ssize_t>
where
  F: FnMut() -> libc::ssize_t,
{
  loop {
    let ret: libc::ssize_t = call();

    if ret != -1 {
      return Ok(ret);
    }

    let error: io::Error = io::Error::last_os_error();

    if error.kind() != io::ErrorKind::Interrupted {
      return Err(error);
    }
  }
}

/// Creates an anonymous pipe with both ends close-on-exec.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
  let mut fds: [libc::c_int; 2] = [-1; 2];

  cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;

  // SAFETY: `pipe(2)` succeeded, both descriptors are live and unowned.
  let read: OwnedFd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
  let write: OwnedFd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

  set_cloexec(fds[0])?;
  set_cloexec(fds[1])?;

  Ok((read, write))
}

/// Toggles `O_NONBLOCK` on a file descriptor.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
  let flags: libc::c_int = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;

  let flags: libc::c_int = if nonblocking {
    flags | libc::O_NONBLOCK
  } else {
    flags & !libc::O_NONBLOCK
  };

  cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;

  Ok(())
}

/// Sets `FD_CLOEXEC` on a file descriptor.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
  let flags: libc::c_int = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD, 0) })?;

  cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;

  Ok(())
}

/// Reads into `buf`, retrying on `EINTR`.
///
/// `EAGAIN` surfaces as [`io::ErrorKind::WouldBlock`]; a return of
/// `Ok(0)` means end-of-stream.
#[inline]
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
  let read: libc::ssize_t =
    retry(|| unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })?;

  Ok(read as usize)
}

/// Writes from `buf`, retrying on `EINTR`.
///
/// `EAGAIN` surfaces as [`io::ErrorKind::WouldBlock`].
#[inline]
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
  let wrote: libc::ssize_t =
    retry(|| unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })?;

  Ok(wrote as usize)
}

/// Location of the calling thread's `errno`.
///
/// Signal handlers that make syscalls must save and restore it so the
/// interrupted code never observes a clobbered value.
#[cfg(target_os = "linux")]
#[inline]
pub(crate) unsafe fn errno_location() -> *mut libc::c_int {
  unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
#[inline]
pub(crate) unsafe fn errno_location() -> *mut libc::c_int {
  unsafe { libc::__error() }
}

#[cfg(target_os = "openbsd")]
#[inline]
pub(crate) unsafe fn errno_location() -> *mut libc::c_int {
  unsafe { libc::__errno() }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::io;
  use std::os::fd::AsRawFd;
  use std::os::fd::OwnedFd;

  use crate::sys::pipe;
  use crate::sys::read_fd;
  use crate::sys::set_nonblocking;
  use crate::sys::write_fd;

  #[test]
  fn test_pipe_round_trip() {
    let (read, write): (OwnedFd, OwnedFd) = pipe().unwrap();

    assert_eq!(write_fd(write.as_raw_fd(), b"ping").unwrap(), 4);

    let mut buf: [u8; 8] = [0; 8];
    assert_eq!(read_fd(read.as_raw_fd(), &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");
  }

  #[test]
  fn test_nonblocking_read_would_block() {
    let (read, _write): (OwnedFd, OwnedFd) = pipe().unwrap();

    set_nonblocking(read.as_raw_fd(), true).unwrap();

    let mut buf: [u8; 8] = [0; 8];
    let error: io::Error = read_fd(read.as_raw_fd(), &mut buf).unwrap_err();

    assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
  }

  #[test]
  fn test_read_after_writer_close_is_eof() {
    let (read, write): (OwnedFd, OwnedFd) = pipe().unwrap();

    drop(write);

    let mut buf: [u8; 8] = [0; 8];
    assert_eq!(read_fd(read.as_raw_fd(), &mut buf).unwrap(), 0);
  }
}
