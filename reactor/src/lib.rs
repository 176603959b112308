use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::{
    collections::HashMap,
    io,
    os::fd::AsRawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, trace};

/// Token reserved for the wakeup pipe; socket tokens derive from raw fds,
/// which never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Events queue capacity per poll iteration.
const EVENTS_CAPACITY: usize = 128;

/// Readiness direction a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Both,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
            Direction::Both => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

/// Outcome delivered to a registration's callback, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable,
    Writable,
    Timeout,
    Error,
}

/// One-shot readiness callback. Re-registering from inside the callback is
/// allowed; the poll thread never holds the registration lock while invoking.
pub type Callback = Box<dyn FnOnce(Event) + Send + 'static>;

struct Armed {
    callback: Callback,
    deadline: Option<Instant>,
}

/// A source stays registered with the mio registry from its first `register`
/// until `deregister`; the one-shot callback is re-armed on each `register`.
struct Entry {
    armed: Option<Armed>,
}

struct Shared {
    registry: Registry,
    waker: Waker,
    entries: Mutex<HashMap<Token, Entry>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn next_deadline(&self) -> Option<Instant> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter_map(|e| e.armed.as_ref().and_then(|a| a.deadline))
            .min()
    }
}

/// Readiness-polling reactor over a dedicated mio poll thread.
///
/// A process-wide shared service: created once, wrapped in an `Arc`, and
/// outliving every transport that registers sockets with it. Registrations
/// are one-shot — the callback fires exactly once with one of
/// [`Event::Readable`], [`Event::Writable`], [`Event::Timeout`] or
/// [`Event::Error`], and the owner re-registers to keep watching.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Create the poll and spawn the poll thread.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            entries: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("reactor-poll-loop".to_string())
            .spawn(move || Self::poll_loop(poll, loop_shared))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Arm a one-shot readiness watch on `source`.
    ///
    /// A second call for the same source replaces both the watched direction
    /// and the pending callback. `timeout` bounds the wait; when it elapses
    /// first the callback fires with [`Event::Timeout`].
    pub fn register(
        &self,
        source: &mut mio::net::TcpStream,
        direction: Direction,
        timeout: Option<Duration>,
        callback: Callback,
    ) -> io::Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            // The poll thread is gone; a watch armed now would never fire.
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "reactor is shut down",
            ));
        }

        let token = Token(source.as_raw_fd() as usize);
        let interest = direction.interest();
        let armed = Armed {
            callback,
            deadline: timeout.map(|t| Instant::now() + t),
        };

        {
            let mut entries = self.shared.entries.lock().unwrap();
            match entries.get_mut(&token) {
                Some(entry) => {
                    // Re-registration re-arms edge-triggered readiness, so a
                    // condition that is already true is redelivered.
                    self.shared.registry.reregister(source, token, interest)?;
                    entry.armed = Some(armed);
                }
                None => {
                    self.shared.registry.register(source, token, interest)?;
                    entries.insert(token, Entry { armed: Some(armed) });
                }
            }
        }

        trace!(token = token.0, ?direction, ?timeout, "armed registration");
        // Wake the poll thread so it recomputes its deadline.
        self.shared.waker.wake()
    }

    /// Remove `source` from the reactor. Idempotent: unknown sources are not
    /// an error. After this returns no callback for the source will fire.
    pub fn deregister(&self, source: &mut mio::net::TcpStream) -> io::Result<()> {
        let token = Token(source.as_raw_fd() as usize);
        let removed = {
            let mut entries = self.shared.entries.lock().unwrap();
            entries.remove(&token).is_some()
        };

        if removed {
            trace!(token = token.0, "deregistered");
            match self.shared.registry.deregister(source) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop the poll thread and wait for it to exit. Called from `Drop`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn poll_loop(mut poll: Poll, shared: Arc<Shared>) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!("reactor poll loop started");

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let timeout = shared
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()));

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("reactor poll failed: {e}");
                break;
            }

            let mut due: Vec<(Callback, Event)> = Vec::new();
            let now = Instant::now();
            {
                let mut entries = shared.entries.lock().unwrap();

                for event in events.iter() {
                    if event.token() == WAKER_TOKEN {
                        continue;
                    }
                    let Some(entry) = entries.get_mut(&event.token()) else {
                        // Stale readiness for a deregistered source.
                        continue;
                    };
                    if entry.armed.is_none() {
                        continue;
                    }

                    let outcome = if event.is_error() {
                        Event::Error
                    } else if event.is_readable() || event.is_read_closed() {
                        // Peer hangup surfaces as a readable zero-byte read.
                        Event::Readable
                    } else if event.is_writable() || event.is_write_closed() {
                        Event::Writable
                    } else {
                        continue;
                    };

                    if let Some(armed) = entry.armed.take() {
                        due.push((armed.callback, outcome));
                    }
                }

                for entry in entries.values_mut() {
                    let expired = entry
                        .armed
                        .as_ref()
                        .is_some_and(|a| a.deadline.is_some_and(|d| d <= now));
                    if expired {
                        if let Some(armed) = entry.armed.take() {
                            due.push((armed.callback, Event::Timeout));
                        }
                    }
                }
            }

            // Lock released: callbacks are free to register or deregister.
            for (callback, outcome) in due {
                callback(outcome);
            }
        }

        debug!("reactor poll loop stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.shared.entries.lock().unwrap();
        f.debug_struct("Reactor")
            .field("registrations", &entries.len())
            .field("shutdown", &self.shared.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, bounded};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn connected_pair() -> (mio::net::TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(client), server)
    }

    fn event_channel() -> (Callback, Receiver<Event>) {
        let (tx, rx) = bounded(1);
        (Box::new(move |event| tx.send(event).unwrap()), rx)
    }

    #[test]
    fn test_writable_on_connected_stream() {
        let reactor = Reactor::new().unwrap();
        let (mut stream, _server) = connected_pair();
        let (cb, rx) = event_channel();

        reactor
            .register(&mut stream, Direction::Write, None, cb)
            .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, Event::Writable);
    }

    #[test]
    fn test_readable_when_peer_writes() {
        let reactor = Reactor::new().unwrap();
        let (mut stream, mut server) = connected_pair();
        let (cb, rx) = event_channel();

        reactor
            .register(&mut stream, Direction::Read, None, cb)
            .unwrap();
        server.write_all(b"ping").unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, Event::Readable);
    }

    #[test]
    fn test_timeout_fires_when_idle() {
        let reactor = Reactor::new().unwrap();
        let (mut stream, _server) = connected_pair();
        let (cb, rx) = event_channel();

        let start = Instant::now();
        reactor
            .register(
                &mut stream,
                Direction::Read,
                Some(Duration::from_millis(50)),
                cb,
            )
            .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, Event::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_callback_fires_once_per_registration() {
        let reactor = Reactor::new().unwrap();
        let (mut stream, mut server) = connected_pair();
        let (tx, rx) = bounded(4);

        reactor
            .register(
                &mut stream,
                Direction::Read,
                None,
                Box::new(move |event| tx.send(event).unwrap()),
            )
            .unwrap();

        server.write_all(b"one").unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Event::Readable
        );

        // Without re-registration, further readiness does not fire again.
        server.write_all(b"two").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_reregister_replaces_pending_callback() {
        let reactor = Reactor::new().unwrap();
        let (mut stream, mut server) = connected_pair();

        let (first_tx, first_rx) = bounded::<Event>(1);
        reactor
            .register(
                &mut stream,
                Direction::Read,
                None,
                Box::new(move |event| first_tx.send(event).unwrap()),
            )
            .unwrap();

        let (second, second_rx) = event_channel();
        reactor
            .register(&mut stream, Direction::Read, None, second)
            .unwrap();

        server.write_all(b"data").unwrap();
        assert_eq!(
            second_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Event::Readable
        );
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn test_register_after_shutdown_is_rejected() {
        let reactor = Reactor::new().unwrap();
        reactor.shutdown();

        let (mut stream, _server) = connected_pair();
        let (cb, rx) = event_channel();
        let err = reactor
            .register(&mut stream, Direction::Write, None, cb)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let (mut stream, _server) = connected_pair();
        let (cb, rx) = event_channel();

        reactor
            .register(&mut stream, Direction::Read, None, cb)
            .unwrap();
        reactor.deregister(&mut stream).unwrap();
        reactor.deregister(&mut stream).unwrap();

        // Never registered at all is also fine.
        let (mut other, _peer) = connected_pair();
        reactor.deregister(&mut other).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
