use std::sync::LazyLock;
use std::time::Instant;

/// Clock anchor taken the first time the monotonic clock is consulted.
static ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Returns the current monotonic time in milliseconds.
///
/// The epoch is the first call within the process; only differences
/// between readings are meaningful. Timer deadlines and poll timeouts
/// are computed exclusively against this clock so wall-clock jumps
/// cannot fire or starve timers.
#[inline]
pub(crate) fn now_ms() -> u64 {
  ANCHOR.elapsed().as_millis() as u64
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::thread;
  use std::time::Duration;

  use crate::utils::now_ms;

  #[test]
  fn test_monotonic() {
    let a: u64 = now_ms();
    thread::sleep(Duration::from_millis(5));
    let b: u64 = now_ms();

    assert!(b >= a + 4);
  }
}
