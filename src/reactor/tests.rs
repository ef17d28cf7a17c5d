use super::*;
use crate::handler::{handler_fn, HandlerHooks};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

type Outcome = Rc<Cell<Option<(ErrorCode, usize)>>>;

fn recorder() -> (Outcome, impl CompletionHandler) {
    let outcome: Outcome = Rc::new(Cell::new(None));
    let slot = Rc::clone(&outcome);
    (outcome, handler_fn(move |ec, n| slot.set(Some((ec, n)))))
}

/// A registered non-blocking client socket and the blocking peer end.
fn socket_pair(reactor: &Reactor) -> (TcpStream, u64, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (peer, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    let token = reactor.register_fd(client.as_raw_fd()).unwrap();
    (client, token, peer)
}

fn run_until(reactor: &Reactor, outcome: &Outcome) -> (ErrorCode, usize) {
    for _ in 0..200 {
        if let Some(result) = outcome.get() {
            return result;
        }
        reactor
            .run_one_timeout(Some(Duration::from_millis(10)))
            .unwrap();
    }
    panic!("operation did not complete");
}

#[test]
fn idle_reactor_returns_immediately() {
    let reactor = Reactor::new().unwrap();
    assert_eq!(reactor.outstanding(), 0);
    assert_eq!(reactor.run_one().unwrap(), 0);
    assert_eq!(reactor.run().unwrap(), 0);
}

#[test]
fn rejects_invalid_config() {
    let config = ReactorConfig {
        max_events: 0,
        ..Default::default()
    };
    assert!(Reactor::with_config(config).is_err());
}

#[test]
fn post_runs_on_a_later_turn() {
    let reactor = Reactor::new().unwrap();
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);

    reactor.post(move || flag.set(true));
    assert!(!ran.get());
    assert_eq!(reactor.outstanding(), 1);

    assert_eq!(reactor.poll_one().unwrap(), 1);
    assert!(ran.get());
    assert_eq!(reactor.outstanding(), 0);
    assert_eq!(reactor.stats().submitted, 0);
}

#[test]
fn post_completion_uses_handler_hooks() {
    struct Counting {
        allocs: Rc<Cell<usize>>,
        frees: Rc<Cell<usize>>,
        outcome: Outcome,
    }

    impl HandlerHooks for Counting {
        fn allocate(&self, layout: std::alloc::Layout) -> std::ptr::NonNull<u8> {
            self.allocs.set(self.allocs.get() + 1);
            crate::handler::default_allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: std::ptr::NonNull<u8>, layout: std::alloc::Layout) {
            self.frees.set(self.frees.get() + 1);
            unsafe { crate::handler::default_deallocate(ptr, layout) }
        }
    }

    impl CompletionHandler for Counting {
        fn complete(self, ec: ErrorCode, n: usize) {
            assert_eq!(self.frees.get(), 1, "storage released before the upcall");
            self.outcome.set(Some((ec, n)));
        }
    }

    let reactor = Reactor::new().unwrap();
    let allocs = Rc::new(Cell::new(0));
    let frees = Rc::new(Cell::new(0));
    let outcome: Outcome = Rc::new(Cell::new(None));

    reactor.post_completion(
        Counting {
            allocs: Rc::clone(&allocs),
            frees: Rc::clone(&frees),
            outcome: Rc::clone(&outcome),
        },
        ErrorCode::eof(),
        3,
    );
    assert_eq!(allocs.get(), 1);
    assert!(outcome.get().is_none());

    reactor.run().unwrap();
    assert_eq!(outcome.get(), Some((ErrorCode::eof(), 3)));
    assert_eq!(frees.get(), 1);

    let stats = reactor.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn write_completes_with_full_length() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, mut peer) = socket_pair(&reactor);
    let (outcome, handler) = recorder();

    reactor.submit_write(token, b"hello\n".to_vec(), handler);
    // Never delivered from inside the initiating call.
    assert!(outcome.get().is_none());

    assert_eq!(run_until(&reactor, &outcome), (ErrorCode::Success, 6));

    let mut received = [0u8; 6];
    peer.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"hello\n");
}

#[test]
fn read_until_reports_delimiter_position() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, mut peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    assert_eq!(buf.handle_count(), 2);

    peer.write_all(b"abc\ndef").unwrap();
    assert_eq!(run_until(&reactor, &outcome), (ErrorCode::Success, 4));
    assert_eq!(buf.handle_count(), 1);
    assert_eq!(buf.consume(4), b"abc\n");
}

#[test]
fn read_until_finds_buffered_delimiter_without_io() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    buf.extend(b"ready\n");
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    assert!(outcome.get().is_none());
    assert_eq!(reactor.stats().speculative_completions, 1);

    reactor.poll_one().unwrap();
    assert_eq!(outcome.get(), Some((ErrorCode::Success, 6)));
}

#[test]
fn read_until_reports_eof() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    peer.shutdown(Shutdown::Both).unwrap();
    drop(peer);

    assert_eq!(run_until(&reactor, &outcome), (ErrorCode::eof(), 0));
}

#[test]
fn read_until_respects_buffer_bound() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, mut peer) = socket_pair(&reactor);
    let buf = StreamBuf::with_max_size(4);
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    peer.write_all(b"too long\n").unwrap();

    assert_eq!(
        run_until(&reactor, &outcome),
        (ErrorCode::Os(libc::ENOBUFS), 0)
    );
    assert_eq!(buf.len(), 4);
}

#[test]
fn read_until_assembles_line_across_chunks() {
    let config = ReactorConfig {
        read_chunk_size: 4,
        ..Default::default()
    };
    let reactor = Reactor::with_config(config).unwrap();
    let (_client, token, mut peer) = socket_pair(&reactor);
    let buf = StreamBuf::with_max_size(64);
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    peer.write_all(b"split over chunks\n").unwrap();

    assert_eq!(run_until(&reactor, &outcome), (ErrorCode::Success, 18));
    assert_eq!(buf.to_vec(), b"split over chunks\n");
}

#[test]
fn second_concurrent_read_is_rejected() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (first, h1) = recorder();
    let (second, h2) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', h1);
    reactor.submit_read_until(token, &buf, b'\n', h2);

    assert_eq!(
        run_until(&reactor, &second),
        (ErrorCode::Os(libc::EALREADY), 0)
    );
    assert!(first.get().is_none());
}

#[test]
fn unknown_token_is_rejected() {
    let reactor = Reactor::new().unwrap();
    let (outcome, handler) = recorder();
    reactor.submit_write(42, b"x".to_vec(), handler);
    assert_eq!(run_until(&reactor, &outcome), (ErrorCode::Os(libc::EBADF), 0));
}

#[test]
fn deregister_destroys_pending_operations() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    assert_eq!(reactor.outstanding(), 1);

    reactor.deregister(token);
    assert_eq!(reactor.outstanding(), 0);
    assert_eq!(reactor.stats().destroyed, 1);
    assert_eq!(buf.handle_count(), 1);
    assert!(outcome.get().is_none());

    // Deregistering twice is harmless.
    reactor.deregister(token);
}

struct Hinted<F> {
    continuation: bool,
    f: F,
}

impl<F> HandlerHooks for Hinted<F> {
    fn is_continuation(&self) -> bool {
        self.continuation
    }
}

impl<F: FnOnce(ErrorCode, usize) + 'static> CompletionHandler for Hinted<F> {
    fn complete(self, ec: ErrorCode, n: usize) {
        (self.f)(ec, n)
    }
}

#[test]
fn continuations_run_in_the_same_turn() {
    let reactor = Reactor::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let inner_reactor = reactor.clone();
    let log = Rc::clone(&order);
    reactor.post_completion(
        handler_fn(move |_, _| {
            log.borrow_mut().push("first");
            let chained = Rc::clone(&log);
            inner_reactor.post_completion(
                Hinted {
                    continuation: true,
                    f: move |_, _| chained.borrow_mut().push("continuation"),
                },
                ErrorCode::Success,
                0,
            );
            let later = Rc::clone(&log);
            inner_reactor.post_completion(
                Hinted {
                    continuation: false,
                    f: move |_, _| later.borrow_mut().push("later"),
                },
                ErrorCode::Success,
                0,
            );
        }),
        ErrorCode::Success,
        0,
    );

    assert_eq!(reactor.poll_one().unwrap(), 2);
    assert_eq!(*order.borrow(), vec!["first", "continuation"]);

    assert_eq!(reactor.poll_one().unwrap(), 1);
    assert_eq!(*order.borrow(), vec!["first", "continuation", "later"]);
    assert_eq!(reactor.stats().continuation_hints, 1);
}

#[test]
fn continuation_behind_ordinary_work_waits_its_turn() {
    let reactor = Reactor::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let inner_reactor = reactor.clone();
    let log = Rc::clone(&order);
    reactor.post_completion(
        handler_fn(move |_, _| {
            let later = Rc::clone(&log);
            inner_reactor.post_completion(
                Hinted {
                    continuation: false,
                    f: move |_, _| later.borrow_mut().push("ordinary"),
                },
                ErrorCode::Success,
                0,
            );
            let chained = Rc::clone(&log);
            inner_reactor.post_completion(
                Hinted {
                    continuation: true,
                    f: move |_, _| chained.borrow_mut().push("continuation"),
                },
                ErrorCode::Success,
                0,
            );
        }),
        ErrorCode::Success,
        0,
    );

    assert_eq!(reactor.poll_one().unwrap(), 1);
    assert!(order.borrow().is_empty());
    assert_eq!(reactor.poll_one().unwrap(), 2);
    assert_eq!(*order.borrow(), vec!["ordinary", "continuation"]);
}

#[test]
fn invoker_reposts_through_reactor() {
    let reactor = Reactor::new().unwrap();
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);

    let invoker = reactor.invoker();
    assert!(!invoker.is_inline());
    invoker.invoke(move || flag.set(true));

    assert!(!ran.get());
    reactor.run().unwrap();
    assert!(ran.get());
}

#[test]
fn shutdown_discards_everything() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (read_outcome, handler) = recorder();
    let (posted_outcome, posted) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    reactor.post_completion(posted, ErrorCode::Success, 1);
    reactor.post(|| panic!("discarded closures never run"));

    assert_eq!(reactor.shutdown(), 3);
    assert_eq!(reactor.outstanding(), 0);
    assert_eq!(reactor.stats().destroyed, 2);
    assert_eq!(reactor.run().unwrap(), 0);
    assert!(read_outcome.get().is_none());
    assert!(posted_outcome.get().is_none());
    assert_eq!(buf.handle_count(), 1);
}

#[test]
fn shutdown_survives_failed_deregistration() {
    let reactor = Reactor::new().unwrap();
    let (client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    // Closing the fd behind the reactor's back makes EPOLL_CTL_DEL fail.
    drop(client);

    assert_eq!(reactor.shutdown(), 1);
    assert_eq!(reactor.outstanding(), 0);
    assert_eq!(reactor.stats().destroyed, 1);
    assert!(outcome.get().is_none());
    assert_eq!(buf.handle_count(), 1);
}

#[test]
fn debug_info_lists_pending_operations() {
    let reactor = Reactor::new().unwrap();
    let (client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (_outcome, handler) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    let info = reactor.debug_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].op_type, OperationType::ReadUntil);
    assert_eq!(info[0].fd, Some(client.as_raw_fd()));
    reactor.shutdown();
}

#[test]
fn weak_handle_does_not_keep_reactor_alive() {
    let reactor = Reactor::new().unwrap();
    let weak = reactor.downgrade();
    assert!(weak.upgrade().is_some_and(|r| r.same_reactor(&reactor)));

    drop(reactor);
    assert!(weak.upgrade().is_none());
}

#[test]
fn invoker_after_drop_discards_the_call() {
    let reactor = Reactor::new().unwrap();
    let invoker = reactor.invoker();
    drop(reactor);

    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    invoker.invoke(move || flag.set(true));
    assert!(!ran.get());
}

#[test]
fn dropping_reactor_destroys_pending_operations() {
    let reactor = Reactor::new().unwrap();
    let (_client, token, _peer) = socket_pair(&reactor);
    let buf = StreamBuf::new();
    let (read_outcome, handler) = recorder();
    let (posted_outcome, posted) = recorder();

    reactor.submit_read_until(token, &buf, b'\n', handler);
    reactor.post_completion(posted, ErrorCode::Success, 1);
    assert_eq!(Rc::strong_count(&read_outcome), 2);
    assert_eq!(Rc::strong_count(&posted_outcome), 2);

    drop(reactor);
    assert_eq!(Rc::strong_count(&read_outcome), 1);
    assert_eq!(Rc::strong_count(&posted_outcome), 1);
    assert!(read_outcome.get().is_none());
    assert_eq!(buf.handle_count(), 1);
}
