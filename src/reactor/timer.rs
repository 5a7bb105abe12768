use bitflags::bitflags;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::utils::now_ms;

// -----------------------------------------------------------------------------
// Timer Flags
// -----------------------------------------------------------------------------

bitflags! {
  /// Firing behavior of a registered timer.
  #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
  pub struct TimerFlags: u32 {
    /// Fire once, then drop the registration.
    const SINGLE_SHOT = 0x1;
    /// Re-arm after every firing.
    const REPEAT = 0x2;
  }
}

/// Opaque timer identity handed back by registration.
pub type TimerId = u32;

pub(crate) type TimerCallback = Rc<RefCell<Box<dyn FnMut(TimerId)>>>;

// -----------------------------------------------------------------------------
// Timer Records
// -----------------------------------------------------------------------------

/// Deadline-ordered key; the sequence breaks ties in insertion order.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
  when: u64,
  seq: u64,
}

struct TimerRecord {
  id: TimerId,
  interval: u64,
  flags: TimerFlags,
  callback: TimerCallback,
}

/// A record popped out of the wheel for one firing sweep.
pub(crate) struct DueTimer {
  pub(crate) id: TimerId,
  when: u64,
  interval: u64,
  pub(crate) flags: TimerFlags,
  pub(crate) callback: TimerCallback,
}

// -----------------------------------------------------------------------------
// Timer Wheel
// -----------------------------------------------------------------------------

/// Dual-index timer storage: a deadline-ordered map and an id-keyed
/// index that always hold the same records.
///
/// Mutated only on the loop thread. Ids increase monotonically from 1
/// and are never reused; exhausting the id space aborts rather than
/// risking a collision.
pub(crate) struct TimerWheel {
  by_time: BTreeMap<TimerKey, TimerRecord>,
  by_id: HashMap<TimerId, TimerKey>,
  next_id: TimerId,
  next_seq: u64,
  firing: Option<TimerId>,
  firing_cancelled: bool,
}

impl TimerWheel {
  pub(crate) fn new() -> Self {
    Self {
      by_time: BTreeMap::new(),
      by_id: HashMap::new(),
      next_id: 1,
      next_seq: 0,
      firing: None,
      firing_cancelled: false,
    }
  }

  /// Registers a timer due `timeout` milliseconds from now.
  pub(crate) fn register(
    &mut self,
    timeout: u64,
    flags: TimerFlags,
    callback: Box<dyn FnMut(TimerId)>,
  ) -> TimerId {
    let id: TimerId = self.next_id;

    self.next_id = match self.next_id.checked_add(1) {
      Some(next) => next,
      None => crate::core::fatal!("timer id space exhausted"),
    };

    let key: TimerKey = self.key_at(now_ms().saturating_add(timeout));

    self.by_time.insert(
      key,
      TimerRecord {
        id,
        interval: timeout,
        flags,
        callback: Rc::new(RefCell::new(callback)),
      },
    );
    self.by_id.insert(id, key);

    tracing::trace!(id, timeout, ?flags, "timer registered");

    id
  }

  /// Drops a timer registration.
  ///
  /// Idempotent, and safe from within a timer callback: cancelling the
  /// currently firing timer suppresses its re-arm.
  pub(crate) fn unregister(&mut self, id: TimerId) {
    if self.firing == Some(id) {
      self.firing_cancelled = true;
      return;
    }

    if let Some(key) = self.by_id.remove(&id) {
      self.by_time.remove(&key);
      tracing::trace!(id, "timer unregistered");
    }
  }

  /// The earliest deadline, in monotonic milliseconds.
  pub(crate) fn next_deadline(&self) -> Option<u64> {
    self.by_time.keys().next().map(|key| key.when)
  }

  /// Pops every record due at `now` as this sweep's snapshot.
  ///
  /// Timers registered by callbacks during the sweep belong to the next
  /// iteration; they can never invalidate the snapshot.
  pub(crate) fn collect_due(&mut self, now: u64) -> Vec<DueTimer> {
    debug_assert_eq!(
      self.by_time.len(),
      self.by_id.len(),
      "timer wheel indices out of sync",
    );

    let mut due: Vec<DueTimer> = Vec::new();

    while let Some(key) = self.by_time.keys().next().copied() {
      if key.when > now {
        break;
      }

      let record: TimerRecord = match self.by_time.remove(&key) {
        Some(record) => record,
        None => break,
      };

      self.by_id.remove(&record.id);

      due.push(DueTimer {
        id: record.id,
        when: key.when,
        interval: record.interval,
        flags: record.flags,
        callback: record.callback,
      });
    }

    due
  }

  /// Marks `id` as the timer whose callback is about to run.
  pub(crate) fn begin_fire(&mut self, id: TimerId) {
    self.firing = Some(id);
    self.firing_cancelled = false;
  }

  /// Clears the firing mark; returns `true` if the callback cancelled
  /// its own timer.
  pub(crate) fn end_fire(&mut self) -> bool {
    self.firing = None;
    std::mem::take(&mut self.firing_cancelled)
  }

  /// Re-arms a repeating timer after a firing.
  ///
  /// Drift-correcting: the next deadline is the scheduled `when` plus
  /// the interval, clamped forward so it never lies in the past and a
  /// loaded loop cannot enter runaway firing.
  pub(crate) fn reinsert(&mut self, timer: DueTimer, now: u64) {
    let mut when: u64 = timer.when.saturating_add(timer.interval);

    if when <= now {
      when = now.saturating_add(timer.interval);
    }

    let key: TimerKey = self.key_at(when);

    self.by_time.insert(
      key,
      TimerRecord {
        id: timer.id,
        interval: timer.interval,
        flags: timer.flags,
        callback: timer.callback,
      },
    );
    self.by_id.insert(timer.id, key);
  }

  /// Drops every registration.
  pub(crate) fn clear(&mut self) {
    self.by_time.clear();
    self.by_id.clear();
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.by_time.len()
  }

  fn key_at(&mut self, when: u64) -> TimerKey {
    let seq: u64 = self.next_seq;
    self.next_seq += 1;
    TimerKey { when, seq }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::reactor::TimerFlags;
  use crate::reactor::TimerId;
  use crate::reactor::timer::DueTimer;
  use crate::reactor::timer::TimerWheel;
  use crate::utils::now_ms;

  fn noop() -> Box<dyn FnMut(TimerId)> {
    Box::new(|_| {})
  }

  #[test]
  fn test_ids_are_monotonic() {
    let mut wheel: TimerWheel = TimerWheel::new();

    let a: TimerId = wheel.register(10, TimerFlags::SINGLE_SHOT, noop());
    let b: TimerId = wheel.register(5, TimerFlags::SINGLE_SHOT, noop());

    assert!(b > a);
  }

  #[test]
  fn test_due_in_deadline_order() {
    let mut wheel: TimerWheel = TimerWheel::new();

    wheel.register(30, TimerFlags::SINGLE_SHOT, noop());
    let b: TimerId = wheel.register(10, TimerFlags::SINGLE_SHOT, noop());
    let c: TimerId = wheel.register(20, TimerFlags::SINGLE_SHOT, noop());

    let due: Vec<DueTimer> = wheel.collect_due(now_ms() + 25);
    let ids: Vec<TimerId> = due.iter().map(|timer| timer.id).collect();

    assert_eq!(ids, vec![b, c]);
    assert_eq!(wheel.len(), 1);
  }

  #[test]
  fn test_ties_fire_in_insertion_order() {
    let mut wheel: TimerWheel = TimerWheel::new();

    let a: TimerId = wheel.register(10, TimerFlags::SINGLE_SHOT, noop());
    let b: TimerId = wheel.register(10, TimerFlags::SINGLE_SHOT, noop());
    let c: TimerId = wheel.register(10, TimerFlags::SINGLE_SHOT, noop());

    let due: Vec<DueTimer> = wheel.collect_due(now_ms() + 15);
    let ids: Vec<TimerId> = due.iter().map(|timer| timer.id).collect();

    assert_eq!(ids, vec![a, b, c]);
  }

  #[test]
  fn test_unregister_is_idempotent() {
    let mut wheel: TimerWheel = TimerWheel::new();

    let id: TimerId = wheel.register(10, TimerFlags::SINGLE_SHOT, noop());

    wheel.unregister(id);
    wheel.unregister(id);

    assert_eq!(wheel.len(), 0);
    assert!(wheel.collect_due(now_ms() + 20).is_empty());
  }

  #[test]
  fn test_cancel_during_fire_suppresses_rearm() {
    let mut wheel: TimerWheel = TimerWheel::new();

    let id: TimerId = wheel.register(0, TimerFlags::REPEAT, noop());
    let due: Vec<DueTimer> = wheel.collect_due(now_ms() + 1);

    assert_eq!(due.len(), 1);

    wheel.begin_fire(id);
    wheel.unregister(id);
    let cancelled: bool = wheel.end_fire();

    assert!(cancelled);
    assert_eq!(wheel.len(), 0);
  }

  #[test]
  fn test_reinsert_clamps_past_deadlines() {
    let mut wheel: TimerWheel = TimerWheel::new();

    let id: TimerId = wheel.register(20, TimerFlags::REPEAT, noop());
    let now: u64 = now_ms() + 500;

    let mut due: Vec<DueTimer> = wheel.collect_due(now);
    let timer: DueTimer = due.pop().unwrap();

    assert_eq!(timer.id, id);

    wheel.reinsert(timer, now);

    // `when + interval` lies far in the past; the deadline must land
    // strictly after `now` instead.
    assert!(wheel.next_deadline().unwrap() > now);
  }

  #[test]
  fn test_next_deadline_tracks_earliest() {
    let mut wheel: TimerWheel = TimerWheel::new();

    assert_eq!(wheel.next_deadline(), None);

    wheel.register(50, TimerFlags::SINGLE_SHOT, noop());
    let first: u64 = wheel.next_deadline().unwrap();

    wheel.register(10, TimerFlags::SINGLE_SHOT, noop());
    let second: u64 = wheel.next_deadline().unwrap();

    assert!(second < first);
  }
}
