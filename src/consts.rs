//! Runtime tuning constants and default values.
//!
//! This module defines the fundamental limits and tuning parameters for
//! the reactor, the connection framer, and the process supervisor.
//!
//! # Categories
//!
//! - **Reactor**: poll batch sizing and wake protocol bytes
//! - **Wire**: frame header layout
//! - **Process**: stdio buffer limits and pipe chunk sizes

// -----------------------------------------------------------------------------
// Reactor
// -----------------------------------------------------------------------------

/// Maximum number of kernel events collected per poll cycle.
pub const MAX_POLL_EVENTS: usize = 64;

/// Byte written to the wakeup pipe to interrupt a blocking poll.
pub const WAKE_BYTE: u8 = b'w';

/// Byte written to the process signal pipe when `SIGCHLD` is delivered.
pub const REAP_CHILD_BYTE: u8 = b'c';

/// Byte written to the process signal pipe to stop the supervisor thread.
pub const REAP_STOP_BYTE: u8 = b's';

// -----------------------------------------------------------------------------
// Wire
// -----------------------------------------------------------------------------

/// Size of the frame header: a little-endian `u32` payload length.
pub const FRAME_HEADER_LEN: usize = 4;

/// Message id that signals graceful close intent.
pub const FINISH_ID: u8 = 0;

/// Bytes read from a socket per `read(2)` call while draining.
pub const SOCKET_READ_CHUNK: usize = 4096;

// -----------------------------------------------------------------------------
// Process
// -----------------------------------------------------------------------------

/// Bytes read from a child pipe per `read(2)` call while draining.
pub const PIPE_READ_CHUNK: usize = 1024;

/// Upper bound on a per-stream child output buffer.
///
/// When appending would exceed this bound the consumed prefix is
/// compacted away first; if the data still does not fit it is dropped
/// and a warning is logged.
pub const MAX_OUTPUT_BUFFER: usize = 16 * 1024 * 1024;
