//! Event loop integration: timers, posted events, socket dispatch.

use std::cell::Cell;
use std::cell::RefCell;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use alioth::reactor::EventLoop;
use alioth::reactor::ExecStatus;
use alioth::reactor::Interest;
use alioth::reactor::LoopError;
use alioth::reactor::LoopFlags;
use alioth::reactor::TimerFlags;

mod common;

#[test]
fn test_single_shot_and_repeat_cadence() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();

  let single: Rc<Cell<u32>> = Rc::new(Cell::new(0));
  let repeat: Rc<Cell<u32>> = Rc::new(Cell::new(0));

  {
    let single: Rc<Cell<u32>> = Rc::clone(&single);
    event_loop.register_timer(50, TimerFlags::SINGLE_SHOT, move |_| {
      single.set(single.get() + 1);
    });
  }

  {
    let repeat: Rc<Cell<u32>> = Rc::clone(&repeat);
    event_loop.register_timer(20, TimerFlags::REPEAT, move |_| {
      repeat.set(repeat.get() + 1);
    });
  }

  assert_eq!(event_loop.exec(Some(110)), ExecStatus::Timeout);

  assert_eq!(single.get(), 1);
  assert!(
    (3..=6).contains(&repeat.get()),
    "repeat timer fired {} times",
    repeat.get(),
  );
}

#[test]
fn test_cross_thread_posts_keep_per_thread_order() {
  common::init();

  const THREADS: usize = 4;
  const EVENTS: usize = 250;

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

  let posters: Vec<thread::JoinHandle<()>> = (0..THREADS)
    .map(|source| {
      let handle = event_loop.handle();
      let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::clone(&seen);
      let quitter = event_loop.handle();

      thread::spawn(move || {
        for seq in 0..EVENTS {
          let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::clone(&seen);
          let quitter = quitter.clone();

          handle.post(move || {
            let mut seen = seen.lock().unwrap();
            seen.push((source, seq));

            if seen.len() == THREADS * EVENTS {
              quitter.quit();
            }
          });
        }
      })
    })
    .collect();

  assert_eq!(event_loop.exec(Some(10_000)), ExecStatus::Success);

  for poster in posters {
    poster.join().unwrap();
  }

  let seen: Vec<(usize, usize)> = Arc::try_unwrap(seen).unwrap().into_inner().unwrap();
  assert_eq!(seen.len(), THREADS * EVENTS);

  for source in 0..THREADS {
    let order: Vec<usize> = seen
      .iter()
      .filter(|(thread, _)| *thread == source)
      .map(|(_, seq)| *seq)
      .collect();

    assert_eq!(order, (0..EVENTS).collect::<Vec<usize>>());
  }
}

#[test]
fn test_socket_callback_receives_read_readiness() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let (reader, mut writer): (UnixStream, UnixStream) = UnixStream::pair().unwrap();

  reader.set_nonblocking(true).unwrap();

  let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

  {
    let got: Rc<RefCell<Vec<u8>>> = Rc::clone(&got);
    let handle = event_loop.handle();
    let reader_fd = reader.as_raw_fd();

    event_loop
      .register_socket(reader_fd, Interest::READ, move |fd, ready| {
        assert_eq!(fd, reader_fd);
        assert!(ready.contains(Interest::READ));

        let mut buf: [u8; 64] = [0; 64];
        let count: usize = unsafe {
          libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) as usize
        };

        got.borrow_mut().extend_from_slice(&buf[..count]);
        handle.quit();
      })
      .unwrap();
  }

  writer.write_all(b"ready").unwrap();

  assert_eq!(event_loop.exec(Some(2_000)), ExecStatus::Success);
  assert_eq!(&*got.borrow(), b"ready");

  event_loop.unregister_socket(reader.as_raw_fd());
}

#[test]
fn test_unregister_is_idempotent() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let (reader, _writer): (UnixStream, UnixStream) = UnixStream::pair().unwrap();

  event_loop
    .register_socket(reader.as_raw_fd(), Interest::READ, |_, _| {})
    .unwrap();

  event_loop.unregister_socket(reader.as_raw_fd());
  event_loop.unregister_socket(reader.as_raw_fd());

  // Double registration after removal works again.
  event_loop
    .register_socket(reader.as_raw_fd(), Interest::READ, |_, _| {})
    .unwrap();

  assert!(
    event_loop
      .register_socket(reader.as_raw_fd(), Interest::READ, |_, _| {})
      .is_err()
  );
}

#[test]
fn test_process_socket_drains_one_fd() {
  common::init();

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let (reader, mut writer): (UnixStream, UnixStream) = UnixStream::pair().unwrap();

  reader.set_nonblocking(true).unwrap();

  let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

  {
    let got: Rc<RefCell<Vec<u8>>> = Rc::clone(&got);

    event_loop
      .register_socket(reader.as_raw_fd(), Interest::READ, move |fd, _ready| {
        let mut buf: [u8; 64] = [0; 64];
        let count: usize = unsafe {
          libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) as usize
        };

        got.borrow_mut().extend_from_slice(&buf[..count]);
      })
      .unwrap();
  }

  writer.write_all(b"direct").unwrap();

  let fired: Interest = event_loop
    .process_socket(reader.as_raw_fd(), Some(2_000))
    .unwrap();

  assert!(fired.contains(Interest::READ));
  assert_eq!(&*got.borrow(), b"direct");

  // Nothing further queued: a short poll times out with an empty mask.
  let fired: Interest = event_loop
    .process_socket(reader.as_raw_fd(), Some(10))
    .unwrap();

  assert_eq!(fired, Interest::empty());
}

#[test]
fn test_main_loop_is_exclusive() {
  common::init();

  let _main = common::main_loop_guard();
  let event_loop = EventLoop::new(LoopFlags::MAIN).unwrap();

  assert!(EventLoop::main_handle().is_some());

  let denied = thread::spawn(|| EventLoop::new(LoopFlags::MAIN).is_err())
    .join()
    .unwrap();

  assert!(denied);

  drop(event_loop);
  assert!(EventLoop::main_handle().is_none());
}

#[test]
fn test_sigint_requests_quit() {
  common::init();

  let _main = common::main_loop_guard();
  let event_loop = EventLoop::new(LoopFlags::MAIN | LoopFlags::INSTALL_SIGINT).unwrap();

  // Raise from inside a running iteration; the handler's wake-pipe
  // write must unwind the loop without waiting out the exec deadline.
  event_loop.register_timer(20, TimerFlags::SINGLE_SHOT, |_| {
    unsafe { libc::raise(libc::SIGINT) };
  });

  let started: Instant = Instant::now();

  assert_eq!(event_loop.exec(Some(10_000)), ExecStatus::Success);
  assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_sigterm_handler_requests_quit_cross_thread() {
  common::init();

  let _main = common::main_loop_guard();
  let event_loop =
    EventLoop::new(LoopFlags::MAIN | LoopFlags::INSTALL_SIGINT | LoopFlags::INSTALL_SIGTERM)
      .unwrap();

  // Deliver the signal while the loop is blocked in the poller; only
  // the handler's self-pipe write can end the wait promptly.
  let pid: libc::pid_t = unsafe { libc::getpid() };

  let signaller = thread::spawn(move || {
    thread::sleep(Duration::from_millis(50));
    unsafe { libc::kill(pid, libc::SIGTERM) };
  });

  assert_eq!(event_loop.exec(Some(10_000)), ExecStatus::Success);

  signaller.join().unwrap();
}

#[test]
fn test_signal_handlers_require_main_loop() {
  common::init();

  assert!(matches!(
    EventLoop::new(LoopFlags::INSTALL_SIGINT),
    Err(LoopError::SignalsRequireMain),
  ));
  assert!(matches!(
    EventLoop::new(LoopFlags::INSTALL_SIGTERM),
    Err(LoopError::SignalsRequireMain),
  ));
}

#[test]
fn test_delete_later_drops_on_loop_thread() {
  common::init();

  struct Tracker(Arc<Mutex<bool>>);

  impl Drop for Tracker {
    fn drop(&mut self) {
      *self.0.lock().unwrap() = true;
    }
  }

  let event_loop = EventLoop::new(LoopFlags::empty()).unwrap();
  let dropped: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));

  event_loop.delete_later(Tracker(Arc::clone(&dropped)));
  event_loop.post({
    let handle = event_loop.handle();
    move || handle.quit()
  });

  assert_eq!(event_loop.exec(Some(2_000)), ExecStatus::Success);
  assert!(*dropped.lock().unwrap());

  // The wakeup path alone is harmless while idle.
  event_loop.wakeup();
  thread::sleep(Duration::from_millis(1));
}
