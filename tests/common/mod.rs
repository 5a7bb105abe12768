//! Shared test harness setup.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::MutexGuard;

/// Serializes tests that claim the process-wide main loop.
static MAIN_LOOP: Mutex<()> = Mutex::new(());

/// Installs a test-writer subscriber so `RUST_LOG`-style debugging of a
/// failing test shows the crate's diagnostics. Safe to call from every
/// test; only the first installation wins.
pub fn init() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Takes the main-loop slot for the duration of a test.
pub fn main_loop_guard() -> MutexGuard<'static, ()> {
  MAIN_LOOP.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
