//! Length-prefixed message framing over byte-stream sockets.
//!
//! # Public API
//!
//! - [`Connection`]: framing state machine bound to a loop-driven socket
//! - [`Message`]: a decoded typed message (one-byte id plus body)
//! - [`WireError`]: framer failures
//!
//! # Wire Format
//!
//! `u32 length (LE)` | `u8 id` | `length - 1` bytes of body. The finish
//! id ([`consts::FINISH_ID`]) denotes graceful close intent.
//!
//! [`consts::FINISH_ID`]: crate::consts::FINISH_ID

mod buffer;
mod connection;
mod message;

pub use self::connection::Connection;
pub use self::connection::WireError;
pub use self::message::Message;
