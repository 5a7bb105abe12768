use parking_lot::Mutex;
use std::collections::VecDeque;

/// A deferred callable posted to the loop.
///
/// Captured state moves into the closure; cloning before the post is
/// how callers get copy semantics.
pub(crate) type PostedEvent = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe FIFO of deferred callables.
///
/// Events are delivered exactly once on the loop thread, in enqueue
/// order. The drain is bounded: events posted while a drain runs stay
/// queued for the next iteration so I/O and timers cannot starve.
pub(crate) struct EventQueue {
  events: Mutex<VecDeque<PostedEvent>>,
}

impl EventQueue {
  pub(crate) fn new() -> Self {
    Self {
      events: Mutex::new(VecDeque::new()),
    }
  }

  /// Appends an event, returning `true` if the queue was empty.
  pub(crate) fn push(&self, event: PostedEvent) -> bool {
    let mut events = self.events.lock();
    events.push_back(event);
    events.len() == 1
  }

  /// Returns `true` if no events are pending.
  pub(crate) fn is_empty(&self) -> bool {
    self.events.lock().is_empty()
  }

  /// Detaches everything queued so far as one bounded batch.
  ///
  /// Only invoked on the loop thread; the lock is never held while the
  /// batch executes.
  pub(crate) fn take_batch(&self) -> VecDeque<PostedEvent> {
    std::mem::take(&mut *self.events.lock())
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
