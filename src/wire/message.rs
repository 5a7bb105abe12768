use crate::consts::FINISH_ID;
use crate::consts::FRAME_HEADER_LEN;

// -----------------------------------------------------------------------------
// Message
// -----------------------------------------------------------------------------

/// A decoded application message: a one-byte type id and its body.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Message {
  id: u8,
  body: Vec<u8>,
}

impl Message {
  /// Creates a message from its id and body.
  #[inline]
  pub fn new(id: u8, body: Vec<u8>) -> Self {
    Self { id, body }
  }

  /// Returns the one-byte message id.
  #[inline]
  pub const fn id(&self) -> u8 {
    self.id
  }

  /// Returns the message body.
  #[inline]
  pub fn body(&self) -> &[u8] {
    self.body.as_slice()
  }

  /// Consumes the message, returning its body.
  #[inline]
  pub fn into_body(self) -> Vec<u8> {
    self.body
  }

  /// Returns `true` if this is the graceful-close message.
  #[inline]
  pub const fn is_finish(&self) -> bool {
    self.id == FINISH_ID
  }
}

// -----------------------------------------------------------------------------
// Frame Codec
// -----------------------------------------------------------------------------

/// Encodes one frame: `u32` little-endian payload length, then the
/// payload (id byte followed by the body).
pub(crate) fn encode_frame(id: u8, body: &[u8]) -> Vec<u8> {
  let payload: usize = body.len() + 1;
  let mut frame: Vec<u8> = Vec::with_capacity(FRAME_HEADER_LEN + payload);

  frame.extend_from_slice(&(payload as u32).to_le_bytes());
  frame.push(id);
  frame.extend_from_slice(body);
  frame
}

/// Decodes the little-endian length header.
#[inline]
pub(crate) fn decode_header(header: [u8; FRAME_HEADER_LEN]) -> u32 {
  u32::from_le_bytes(header)
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
