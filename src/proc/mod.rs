//! Child process supervision with loop-driven stdio.
//!
//! # Public API
//!
//! - [`Process`]: spawn, pump, and reap one child process
//! - [`ExecFlags`], [`ExecOutcome`]: synchronous exec surface
//! - [`ProcessState`]: the process lifecycle machine
//! - [`SpawnError`]: spawn failures
//! - [`shutdown`]: last-exit teardown of the supervisor thread
//!
//! # Internal Components
//!
//! - `command`: `PATH` probing and environment snapshots
//! - `reaper`: the `SIGCHLD`-driven supervisor thread and registry
//! - `process`: spawn protocol, buffers, backpressure, sync exec

mod command;
mod process;
mod reaper;

pub use self::process::ExecFlags;
pub use self::process::ExecOutcome;
pub use self::process::Process;
pub use self::process::ProcessState;
pub use self::process::SpawnError;
pub use self::reaper::shutdown;
