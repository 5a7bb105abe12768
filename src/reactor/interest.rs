use bitflags::bitflags;
use std::os::fd::RawFd;

// -----------------------------------------------------------------------------
// Interest
// -----------------------------------------------------------------------------

bitflags! {
  /// Readiness interest for a registered file descriptor.
  ///
  /// Registrations are edge-triggered unless [`LEVEL_TRIGGERED`] is
  /// set. [`ERROR`] readiness is always delivered, requested or not.
  ///
  /// [`LEVEL_TRIGGERED`]: Interest::LEVEL_TRIGGERED
  /// [`ERROR`]: Interest::ERROR
  #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
  pub struct Interest: u32 {
    /// The descriptor is readable.
    const READ = 0x1;
    /// The descriptor is writable.
    const WRITE = 0x2;
    /// Deliver at most one event, then require a re-arm.
    const ONE_SHOT = 0x4;
    /// The descriptor is in an error or hangup state.
    const ERROR = 0x8;
    /// Level-triggered delivery instead of the edge-triggered default.
    const LEVEL_TRIGGERED = 0x10;
  }
}

impl Interest {
  /// Returns `true` if any of read, write, or error readiness is set.
  #[inline]
  pub fn is_ready(&self) -> bool {
    self.intersects(Self::READ | Self::WRITE | Self::ERROR)
  }
}

// -----------------------------------------------------------------------------
// Poll Event
// -----------------------------------------------------------------------------

/// A single readiness notification reported by the poller.
///
/// When the native mechanism reports both read and write for one
/// descriptor the event carries the combined mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollEvent {
  /// The ready file descriptor.
  pub fd: RawFd,
  /// The readiness mask; only `READ`, `WRITE`, and `ERROR` bits are set.
  pub ready: Interest,
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::reactor::Interest;

  #[test]
  fn test_wire_values() {
    assert_eq!(Interest::READ.bits(), 0x1);
    assert_eq!(Interest::WRITE.bits(), 0x2);
    assert_eq!(Interest::ONE_SHOT.bits(), 0x4);
    assert_eq!(Interest::ERROR.bits(), 0x8);
    assert_eq!(Interest::LEVEL_TRIGGERED.bits(), 0x10);
  }

  #[test]
  fn test_is_ready() {
    assert!(Interest::READ.is_ready());
    assert!((Interest::WRITE | Interest::ERROR).is_ready());
    assert!(!Interest::ONE_SHOT.is_ready());
    assert!(!Interest::LEVEL_TRIGGERED.is_ready());
    assert!(!Interest::empty().is_ready());
  }
}
