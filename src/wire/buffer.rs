use std::collections::VecDeque;

/// Ordered sequence of byte buffers forming one inbound stream.
///
/// Chunks land as the socket produced them; consumption crosses chunk
/// boundaries and discards each chunk as it empties, so the queue never
/// copies bytes it has not been asked for.
pub(crate) struct ChunkQueue {
  chunks: VecDeque<Vec<u8>>,
  /// Consumed prefix of the front chunk.
  offset: usize,
  /// Total unconsumed bytes across all chunks.
  len: usize,
}

impl ChunkQueue {
  pub(crate) fn new() -> Self {
    Self {
      chunks: VecDeque::new(),
      offset: 0,
      len: 0,
    }
  }

  /// Total unconsumed bytes queued.
  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Appends a chunk; empty chunks are dropped.
  pub(crate) fn push(&mut self, chunk: Vec<u8>) {
    if !chunk.is_empty() {
      self.len += chunk.len();
      self.chunks.push_back(chunk);
    }
  }

  /// Fills `out` completely, consuming across chunks.
  ///
  /// Returns `false` without consuming anything when fewer than
  /// `out.len()` bytes are queued.
  pub(crate) fn copy_into(&mut self, out: &mut [u8]) -> bool {
    if self.len < out.len() {
      return false;
    }

    let mut copied: usize = 0;

    while copied < out.len() {
      let take: usize = {
        let front: &[u8] = &self.chunks[0][self.offset..];
        front.len().min(out.len() - copied)
      };

      out[copied..copied + take]
        .copy_from_slice(&self.chunks[0][self.offset..self.offset + take]);

      copied += take;
      self.offset += take;
      self.len -= take;

      if self.offset == self.chunks[0].len() {
        self.chunks.pop_front();
        self.offset = 0;
      }
    }

    true
  }

  /// Consumes exactly `count` bytes into a fresh buffer, or `None` when
  /// fewer are queued.
  pub(crate) fn take(&mut self, count: usize) -> Option<Vec<u8>> {
    if self.len < count {
      return None;
    }

    let mut out: Vec<u8> = vec![0; count];
    self.copy_into(&mut out);
    Some(out)
  }

  /// Drops everything queued.
  pub(crate) fn clear(&mut self) {
    self.chunks.clear();
    self.offset = 0;
    self.len = 0;
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
