use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::rc::Weak;
use thiserror::Error;

use crate::consts::FRAME_HEADER_LEN;
use crate::consts::SOCKET_READ_CHUNK;
use crate::reactor::EventLoop;
use crate::reactor::Interest;
use crate::reactor::LoopError;
use crate::sys;
use crate::wire::Message;
use crate::wire::buffer::ChunkQueue;
use crate::wire::message::decode_header;
use crate::wire::message::encode_frame;

// -----------------------------------------------------------------------------
// Wire Errors
// -----------------------------------------------------------------------------

/// Errors surfaced by the connection framer.
#[derive(Debug, Error)]
pub enum WireError {
  /// The socket is disconnected; nothing can be sent.
  #[error("connection is not connected")]
  NotConnected,

  /// The underlying loop registration failed.
  #[error(transparent)]
  Loop(#[from] LoopError),
}

// -----------------------------------------------------------------------------
// Hooks
// -----------------------------------------------------------------------------

type MessageHook = Box<dyn FnMut(Message)>;
type EventHook = Box<dyn FnMut()>;

// -----------------------------------------------------------------------------
// Connection State
// -----------------------------------------------------------------------------

struct ConnInner {
  fd: Option<OwnedFd>,
  event_loop: Weak<EventLoop>,
  write_armed: bool,
  inbound: ChunkQueue,
  outbound: VecDeque<Vec<u8>>,
  out_cursor: usize,
  /// Declared length of the in-progress frame, or 0 awaiting a header.
  pending_read: u32,
  /// Bytes queued but not yet acknowledged by the kernel.
  pending_write: usize,
  on_message: Option<MessageHook>,
  on_finished: Option<EventHook>,
  on_send_finished: Option<EventHook>,
  on_disconnected: Option<EventHook>,
}

enum FrameStep {
  /// A complete frame payload: id byte plus body.
  Payload(Vec<u8>),
  /// A zero-length frame was discarded; try the next one.
  Empty,
  /// Not enough queued bytes for the next header or body.
  Starved,
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

/// Length-prefixed message framing over a byte-stream socket.
///
/// A connection adopts a connected stream socket, registers it with the
/// loop, and decodes inbound bytes into [`Message`] deliveries: a
/// little-endian `u32` payload length, then a one-byte id and the body.
/// The distinguished finish id signals graceful close intent and is
/// surfaced through the `finished` hook instead of `message`.
///
/// The send path queues the framed bytes, flushes as far as the kernel
/// allows, and arms write interest for the rest; once every queued byte
/// is acknowledged the `send_finished` hook fires.
pub struct Connection {
  inner: Rc<RefCell<ConnInner>>,
}

impl Connection {
  /// Adopts a connected stream socket and registers it with `event_loop`.
  pub fn adopt(socket: OwnedFd, event_loop: &Rc<EventLoop>) -> Result<Self, WireError> {
    sys::set_nonblocking(socket.as_raw_fd(), true).map_err(LoopError::from)?;

    let fd: RawFd = socket.as_raw_fd();

    let inner: Rc<RefCell<ConnInner>> = Rc::new(RefCell::new(ConnInner {
      fd: Some(socket),
      event_loop: Rc::downgrade(event_loop),
      write_armed: false,
      inbound: ChunkQueue::new(),
      outbound: VecDeque::new(),
      out_cursor: 0,
      pending_read: 0,
      pending_write: 0,
      on_message: None,
      on_finished: None,
      on_send_finished: None,
      on_disconnected: None,
    }));

    let weak: Weak<RefCell<ConnInner>> = Rc::downgrade(&inner);

    event_loop.register_socket(fd, Interest::READ, move |fd, ready| {
      if let Some(inner) = weak.upgrade() {
        Self::on_ready(&inner, fd, ready);
      }
    })?;

    tracing::debug!(fd, "connection adopted");

    Ok(Self { inner })
  }

  /// Queues one framed message and flushes as much as possible.
  pub fn send(&self, id: u8, body: &[u8]) -> Result<(), WireError> {
    {
      let mut inner = self.inner.borrow_mut();

      if inner.fd.is_none() {
        return Err(WireError::NotConnected);
      }

      let frame: Vec<u8> = encode_frame(id, body);

      inner.pending_write += frame.len();
      inner.outbound.push_back(frame);
    }

    if Self::flush(&self.inner) {
      Self::disconnect(&self.inner, true);
    }

    Ok(())
  }

  /// Sends the graceful-close frame; the peer should answer by closing.
  pub fn send_finish(&self) -> Result<(), WireError> {
    self.send(crate::consts::FINISH_ID, &[])
  }

  /// Bytes queued but not yet acknowledged by the kernel.
  #[inline]
  pub fn pending_write(&self) -> usize {
    self.inner.borrow().pending_write
  }

  /// Returns `true` while the socket is attached.
  #[inline]
  pub fn is_connected(&self) -> bool {
    self.inner.borrow().fd.is_some()
  }

  /// Detaches and closes the socket without firing `disconnected`.
  pub fn close(&self) {
    Self::disconnect(&self.inner, false);
  }

  // ---------------------------------------------------------------------------
  // Hook Setters
  // ---------------------------------------------------------------------------

  /// Sets the hook invoked for every decoded non-finish message.
  pub fn set_on_message<F>(&self, hook: F)
  where
    F: FnMut(Message) + 'static,
  {
    self.inner.borrow_mut().on_message = Some(Box::new(hook));
  }

  /// Sets the hook invoked when the peer signals graceful close.
  pub fn set_on_finished<F>(&self, hook: F)
  where
    F: FnMut() + 'static,
  {
    self.inner.borrow_mut().on_finished = Some(Box::new(hook));
  }

  /// Sets the hook invoked when `pending_write` returns to zero.
  pub fn set_on_send_finished<F>(&self, hook: F)
  where
    F: FnMut() + 'static,
  {
    self.inner.borrow_mut().on_send_finished = Some(Box::new(hook));
  }

  /// Sets the hook invoked when the stream disconnects.
  pub fn set_on_disconnected<F>(&self, hook: F)
  where
    F: FnMut() + 'static,
  {
    self.inner.borrow_mut().on_disconnected = Some(Box::new(hook));
  }

  // ---------------------------------------------------------------------------
  // Readiness
  // ---------------------------------------------------------------------------

  fn on_ready(inner: &Rc<RefCell<ConnInner>>, fd: RawFd, ready: Interest) {
    let mut closed: bool = false;

    if ready.contains(Interest::READ) {
      closed = Self::fill_inbound(inner, fd);
      Self::process_frames(inner);
    }

    if !closed && ready.contains(Interest::WRITE) {
      closed = Self::flush(inner);
    }

    // Pure error readiness with no data path attached.
    if ready.contains(Interest::ERROR) && !ready.intersects(Interest::READ | Interest::WRITE) {
      closed = true;
    }

    if closed {
      Self::disconnect(inner, true);
    }
  }

  /// Drains the socket into the chunk queue; returns `true` on EOF or a
  /// fatal read error.
  fn fill_inbound(inner: &Rc<RefCell<ConnInner>>, fd: RawFd) -> bool {
    loop {
      let mut chunk: Vec<u8> = vec![0; SOCKET_READ_CHUNK];

      match sys::read_fd(fd, &mut chunk) {
        Ok(0) => return true,
        Ok(count) => {
          chunk.truncate(count);
          inner.borrow_mut().inbound.push(chunk);
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => return false,
        Err(error) => {
          tracing::debug!(fd, %error, "socket read failed");
          return true;
        }
      }
    }
  }

  /// Decodes and delivers every complete frame queued so far.
  fn process_frames(inner: &Rc<RefCell<ConnInner>>) {
    loop {
      let step: FrameStep = Self::next_frame(&mut inner.borrow_mut());

      match step {
        FrameStep::Starved => break,
        FrameStep::Empty => continue,
        FrameStep::Payload(payload) => {
          let id: u8 = payload[0];
          let message: Message = Message::new(id, payload[1..].to_vec());

          if message.is_finish() {
            tracing::debug!("finish frame received");
            Self::emit_event(inner, |inner| &mut inner.on_finished);
          } else {
            Self::emit_message(inner, message);
          }
        }
      }
    }
  }

  /// One step of the framing state machine.
  ///
  /// `pending_read == 0` means awaiting a header; otherwise exactly
  /// `pending_read` payload bytes complete the frame. Bytes are never
  /// interpreted as both header and body.
  fn next_frame(inner: &mut ConnInner) -> FrameStep {
    if inner.pending_read == 0 {
      let mut header: [u8; FRAME_HEADER_LEN] = [0; FRAME_HEADER_LEN];

      if !inner.inbound.copy_into(&mut header) {
        return FrameStep::Starved;
      }

      let length: u32 = decode_header(header);

      if length == 0 {
        tracing::warn!("zero-length frame discarded");
        return FrameStep::Empty;
      }

      inner.pending_read = length;
    }

    match inner.inbound.take(inner.pending_read as usize) {
      Some(payload) => {
        inner.pending_read = 0;
        FrameStep::Payload(payload)
      }
      None => FrameStep::Starved,
    }
  }

  // ---------------------------------------------------------------------------
  // Send Path
  // ---------------------------------------------------------------------------

  /// Writes queued frames until the kernel pushes back; manages write
  /// interest and acknowledges written bytes. Returns `true` on a fatal
  /// write error.
  fn flush(inner: &Rc<RefCell<ConnInner>>) -> bool {
    let mut acked: usize = 0;
    let mut closed: bool = false;
    let send_finished: bool;

    {
      let mut inner = inner.borrow_mut();

      let fd: RawFd = match inner.fd.as_ref() {
        Some(fd) => fd.as_raw_fd(),
        None => return false,
      };

      loop {
        let (front_len, wrote) = {
          let Some(front) = inner.outbound.front() else {
            break;
          };

          (front.len(), sys::write_fd(fd, &front[inner.out_cursor..]))
        };

        match wrote {
          Ok(count) => {
            acked += count;
            inner.out_cursor += count;

            if inner.out_cursor == front_len {
              inner.outbound.pop_front();
              inner.out_cursor = 0;
            }
          }
          Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
          Err(error) => {
            tracing::debug!(fd, %error, "socket write failed");
            closed = true;
            break;
          }
        }
      }

      let want_write: bool = !inner.outbound.is_empty() && !closed;

      if want_write != inner.write_armed {
        let mask: Interest = if want_write {
          Interest::READ | Interest::WRITE
        } else {
          Interest::READ
        };

        if let Some(event_loop) = inner.event_loop.upgrade() {
          if event_loop.update_socket(fd, mask).is_ok() {
            inner.write_armed = want_write;
          }
        }
      }

      inner.pending_write -= acked;
      send_finished = acked > 0 && inner.pending_write == 0;
    }

    if send_finished {
      Self::emit_event(inner, |inner| &mut inner.on_send_finished);
    }

    closed
  }

  // ---------------------------------------------------------------------------
  // Teardown
  // ---------------------------------------------------------------------------

  fn disconnect(inner: &Rc<RefCell<ConnInner>>, emit: bool) {
    let (fd, event_loop) = {
      let mut inner = inner.borrow_mut();

      inner.outbound.clear();
      inner.out_cursor = 0;
      inner.write_armed = false;

      (inner.fd.take(), inner.event_loop.clone())
    };

    let Some(fd) = fd else {
      return;
    };

    if let Some(event_loop) = event_loop.upgrade() {
      event_loop.unregister_socket(fd.as_raw_fd());
    }

    tracing::debug!(fd = fd.as_raw_fd(), "connection closed");
    drop(fd);

    if emit {
      Self::emit_event(inner, |inner| &mut inner.on_disconnected);
    }
  }

  // ---------------------------------------------------------------------------
  // Hook Dispatch
  // ---------------------------------------------------------------------------

  /// Runs a hook with the connection state unborrowed so the hook can
  /// call back into the connection.
  fn emit_event(
    inner: &Rc<RefCell<ConnInner>>,
    pick: fn(&mut ConnInner) -> &mut Option<EventHook>,
  ) {
    let hook: Option<EventHook> = pick(&mut inner.borrow_mut()).take();

    if let Some(mut hook) = hook {
      hook();

      let mut inner = inner.borrow_mut();
      let slot: &mut Option<EventHook> = pick(&mut inner);

      if slot.is_none() {
        *slot = Some(hook);
      }
    }
  }

  fn emit_message(inner: &Rc<RefCell<ConnInner>>, message: Message) {
    let hook: Option<MessageHook> = inner.borrow_mut().on_message.take();

    if let Some(mut hook) = hook {
      hook(message);

      let mut inner = inner.borrow_mut();

      if inner.on_message.is_none() {
        inner.on_message = Some(hook);
      }
    } else {
      tracing::debug!(id = message.id(), "message dropped without a hook");
    }
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    Self::disconnect(&self.inner, false);
  }
}
