use crate::{
    constants::{CONNECT_TIMEOUT_SECS, READ_BUFFER_SIZE},
    error::{TransportError, TransportResult},
    net::resolver::{Resolver, SystemResolver},
    state::{ConnectionState, Incoming},
};
use bytes::{Buf, Bytes};
use crossbeam_channel::Sender;
use logger::{debug, error, info, trace, warn};
use queue::SendQueue;
use reactor::{Direction, Event, Reactor};
use std::{
    fmt,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Tunables for one transport instance.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-candidate connect deadline during address racing.
    pub connect_timeout: Duration,
    /// Scratch buffer size for the read pump.
    pub read_buffer_size: usize,
    /// Steady-state deadline. When it elapses without readiness an idle tick
    /// is delivered upward and the watch is re-armed; `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_buffer_size: READ_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// Socket handle and send queue guarded by one mutex, so the handle can
/// never be closed while a drain holds the front of the queue.
struct IoState {
    socket: Option<mio::net::TcpStream>,
    queue: SendQueue<Bytes>,
}

struct Inner {
    reactor: Arc<Reactor>,
    config: TransportConfig,
    resolver: Box<dyn Resolver>,
    hostname: String,
    service: String,
    is_active: bool,
    io: Mutex<IoState>,
    state: Mutex<ConnectionState>,
    stopped: AtomicBool,
    data_tx: Sender<Incoming>,
    state_tx: Sender<ConnectionState>,
}

/// Non-blocking, reactor-driven TCP transport.
///
/// Owns exactly one socket for its lifetime. All socket calls are
/// non-blocking; anything that cannot complete immediately is deferred
/// through a one-shot reactor registration. Received chunks, idle ticks and
/// the end-of-stream marker are delivered on the data channel as
/// [`Incoming`]; lifecycle transitions on the state channel as
/// [`ConnectionState`].
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Active mode: the transport will resolve `hostname`/`service` and race
    /// the candidates when started.
    pub fn connect_to(
        hostname: impl Into<String>,
        service: impl Into<String>,
        reactor: Arc<Reactor>,
        config: TransportConfig,
        data_tx: Sender<Incoming>,
        state_tx: Sender<ConnectionState>,
    ) -> Self {
        Self::with_resolver(
            hostname,
            service,
            Box::new(SystemResolver),
            reactor,
            config,
            data_tx,
            state_tx,
        )
    }

    /// Active mode with a caller-supplied resolver.
    pub fn with_resolver(
        hostname: impl Into<String>,
        service: impl Into<String>,
        resolver: Box<dyn Resolver>,
        reactor: Arc<Reactor>,
        config: TransportConfig,
        data_tx: Sender<Incoming>,
        state_tx: Sender<ConnectionState>,
    ) -> Self {
        debug!("initializing TCP transport");
        Self {
            inner: Arc::new(Inner {
                reactor,
                config,
                resolver,
                hostname: hostname.into(),
                service: service.into(),
                is_active: true,
                io: Mutex::new(IoState {
                    socket: None,
                    queue: SendQueue::new(),
                }),
                state: Mutex::new(ConnectionState::Disconnected),
                stopped: AtomicBool::new(false),
                data_tx,
                state_tx,
            }),
        }
    }

    /// Passive mode: adopt an already-connected socket.
    ///
    /// The socket is switched to non-blocking mode and its peer address is
    /// reverse-resolved to numeric host/service strings; either failing is
    /// fatal to construction.
    pub fn from_stream(
        stream: std::net::TcpStream,
        reactor: Arc<Reactor>,
        config: TransportConfig,
        data_tx: Sender<Incoming>,
        state_tx: Sender<ConnectionState>,
    ) -> TransportResult<Self> {
        debug!("initializing TCP transport with socket");
        stream.set_nonblocking(true).map_err(TransportError::setup)?;
        let peer = stream.peer_addr().map_err(TransportError::setup)?;
        let socket = mio::net::TcpStream::from_std(stream);

        Ok(Self {
            inner: Arc::new(Inner {
                reactor,
                config,
                resolver: Box::new(SystemResolver),
                hostname: peer.ip().to_string(),
                service: peer.port().to_string(),
                is_active: false,
                io: Mutex::new(IoState {
                    socket: Some(socket),
                    queue: SendQueue::new(),
                }),
                state: Mutex::new(ConnectionState::Disconnected),
                stopped: AtomicBool::new(false),
                data_tx,
                state_tx,
            }),
        })
    }

    /// Begin connecting (active mode) or start pumping the adopted socket.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Close the transport. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.close();
        true
    }

    /// Send a buffer, or flush the backlog when `message` is `None`.
    ///
    /// Returns `Ok(true)` when everything was written synchronously and
    /// `Ok(false)` when (part of) the data was queued for a later drain.
    /// Calling outside the connected window is a usage error and leaves the
    /// queue and socket untouched.
    pub fn send(&self, message: Option<Bytes>) -> TransportResult<bool> {
        self.inner.send(message)
    }

    /// `"host:service"` of the remote peer.
    pub fn remote_address(&self) -> String {
        self.inner.remote_address()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether this instance initiated the session.
    pub fn is_active(&self) -> bool {
        self.inner.is_active
    }

    /// Number of buffers waiting in the send queue.
    pub fn pending(&self) -> usize {
        self.inner.io.lock().unwrap().queue.len()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote", &self.remote_address())
            .field("state", &self.state())
            .field("is_active", &self.is_active())
            .finish()
    }
}

impl Inner {
    fn start(self: &Arc<Self>) {
        let has_socket = self.io.lock().unwrap().socket.is_some();
        if has_socket {
            self.change_state(ConnectionState::Connected);
            self.set_poll(Direction::Read);
        } else {
            self.connect();
        }
    }

    fn remote_address(&self) -> String {
        format!("{}:{}", self.hostname, self.service)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Record a transition and notify the listener. Re-announcing the
    /// current state is suppressed; returns whether a transition happened.
    fn change_state(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == next {
            return false;
        }
        let previous = *state;
        debug!(from = %previous, to = %next, "state changed");
        *state = next;
        // Sent while holding the state lock so the listener observes
        // transitions in the order they occur.
        let _ = self.state_tx.send(next);
        true
    }

    fn deliver(&self, incoming: Incoming) {
        let _ = self.data_tx.send(incoming);
    }

    // --- connection establishment -------------------------------------

    fn connect(self: &Arc<Self>) {
        debug!("connecting to {}:{}", self.hostname, self.service);
        self.change_state(ConnectionState::Connecting);

        let candidates = match self.resolver.resolve(&self.hostname, &self.service) {
            Ok(candidates) => candidates,
            Err(e) => {
                let err = TransportError::resolution(&self.hostname, &self.service, e);
                warn!("{err}");
                self.change_state(ConnectionState::Failed);
                return;
            }
        };

        self.try_next_candidate(candidates.into_iter());
    }

    /// Serial candidate racing: at most one socket is open at a time, and
    /// the remaining candidates travel by ownership into the reactor
    /// callback rather than being captured by reference.
    fn try_next_candidate(self: &Arc<Self>, mut candidates: std::vec::IntoIter<SocketAddr>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return;
            }

            let Some(addr) = candidates.next() else {
                warn!(
                    "connection to {}:{} failed",
                    self.hostname, self.service
                );
                self.change_state(ConnectionState::Failed);
                return;
            };

            debug!("trying address {addr}");
            // Creates a family-matching socket, sets it non-blocking (with
            // SIGPIPE suppressed where the OS wants it) and issues the
            // connect; in-progress is provisional success, not an error.
            let stream = match mio::net::TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TCP connection to {addr} failed: {e}");
                    continue;
                }
            };

            let inner = Arc::clone(self);
            let remaining = candidates;
            let callback: reactor::Callback =
                Box::new(move |event| inner.on_connect_ready(event, remaining));

            // The socket is installed before the watch is armed so the
            // callback always finds it behind the io lock.
            let mut io = self.io.lock().unwrap();
            io.socket = Some(stream);
            let sock = io.socket.as_mut().unwrap();
            match self.reactor.register(
                sock,
                Direction::Write,
                Some(self.config.connect_timeout),
                callback,
            ) {
                Ok(()) => return,
                Err(e) => {
                    error!("failed to arm connect watch: {e}");
                    io.socket = None;
                    self.change_state(ConnectionState::Failed);
                    return;
                }
            }
        }
    }

    fn on_connect_ready(self: &Arc<Self>, event: Event, candidates: std::vec::IntoIter<SocketAddr>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        match self.check_connect(event) {
            Ok(()) => {
                info!("TCP connected to {}:{}", self.hostname, self.service);
                self.change_state(ConnectionState::Connected);
                self.set_poll(Direction::Read);
            }
            Err(e) => {
                debug!("candidate failed: {e}");
                self.drop_candidate_socket();
                self.try_next_candidate(candidates);
            }
        }
    }

    /// Decide whether the in-flight connect completed.
    fn check_connect(&self, event: Event) -> io::Result<()> {
        match event {
            Event::Error => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "TCP connection failed",
            )),
            Event::Timeout => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TCP connection timed out",
            )),
            Event::Readable => Err(io::Error::new(
                io::ErrorKind::Other,
                "unexpected readiness during connect",
            )),
            Event::Writable => {
                let mut io = self.io.lock().unwrap();
                let sock = io.socket.as_mut().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "socket closed during connect")
                })?;
                // Writable after a non-blocking connect: the pending error
                // code decides; zero means the socket is connected.
                if let Some(err) = sock.take_error()? {
                    return Err(err);
                }
                sock.peer_addr()?;
                Ok(())
            }
        }
    }

    fn drop_candidate_socket(&self) {
        let mut io = self.io.lock().unwrap();
        if let Some(mut sock) = io.socket.take() {
            let _ = self.reactor.deregister(&mut sock);
        }
    }

    // --- outgoing path -------------------------------------------------

    fn send(self: &Arc<Self>, message: Option<Bytes>) -> TransportResult<bool> {
        let mut io = self.io.lock().unwrap();
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let Some(message) = message else {
            // Flush request: report whether the backlog fully drained.
            return self
                .try_send_queue(&mut io)
                .map_err(TransportError::closed);
        };

        trace!(size = message.len(), "send");
        self.outgoing(&mut io, message).map_err(TransportError::closed)
    }

    /// Flush the queue, and only if nothing stays pending try to write the
    /// new message directly; otherwise it joins the back of the queue.
    fn outgoing(self: &Arc<Self>, io: &mut IoState, message: Bytes) -> io::Result<bool> {
        if self.try_send_queue(io)? {
            let mut message = message;
            if self.try_send_message(io, &mut message)? {
                return Ok(true);
            }
            // Partial write: only the unsent suffix is queued.
            io.queue.push_back(message);
        } else {
            io.queue.push_back(message);
        }

        // Watch both directions so draining resumes without starving reads.
        // An arming failure surfaces to the caller as a send error.
        self.set_poll_locked(io, Direction::Both)?;
        Ok(false)
    }

    /// Drain the backlog front-first. A partial write puts the shortened
    /// remainder back at the front and stops.
    fn try_send_queue(&self, io: &mut IoState) -> io::Result<bool> {
        loop {
            let Some(front) = io.queue.peek() else {
                return Ok(true);
            };
            let mut message = front.clone();
            if !self.try_send_message(io, &mut message)? {
                io.queue.exchange(message);
                return Ok(false);
            }
            io.queue.pop();
        }
    }

    /// Write the unsent suffix of one message. On WouldBlock the message is
    /// truncated to what remains and `Ok(false)` is returned; any other
    /// error means the connection is gone.
    fn try_send_message(&self, io: &mut IoState, message: &mut Bytes) -> io::Result<bool> {
        let Some(sock) = io.socket.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is closed"));
        };

        while !message.is_empty() {
            match sock.write(&message[..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ));
                }
                Ok(n) => message.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => {
                    error!("connection closed: {e}");
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    // --- event dispatch ------------------------------------------------

    /// Reactor callback for the steady (connected) phase. Every branch ends
    /// in a re-armed watch or the shared teardown tail; nothing escapes to
    /// the reactor.
    fn process(self: &Arc<Self>, event: Event) {
        if self.state() != ConnectionState::Connected {
            // A watch extracted just before close; the handle is gone.
            return;
        }

        match event {
            Event::Timeout => {
                trace!("TCP is idle");
                self.deliver(Incoming::Idle);
                self.rearm_after_read();
            }
            Event::Writable => {
                let mut io = self.io.lock().unwrap();
                if io.socket.is_none() {
                    return;
                }
                let rearmed = match self.try_send_queue(&mut io) {
                    Ok(true) => self.set_poll_locked(&mut io, Direction::Read),
                    Ok(false) => self.set_poll_locked(&mut io, Direction::Both),
                    Err(e) => Err(e),
                };
                if let Err(e) = rearmed {
                    drop(io);
                    warn!("TCP connection lost: {e}");
                    self.teardown();
                }
            }
            Event::Readable => {
                if !self.pump_reads() {
                    self.teardown();
                }
            }
            Event::Error => {
                warn!("TCP connection terminated");
                self.teardown();
            }
        }
    }

    /// Read until the socket would block, delivering each chunk upward.
    /// Returns `false` when the stream ended or failed.
    fn pump_reads(self: &Arc<Self>) -> bool {
        let read_span = tracing::trace_span!("tcp_read", remote = %self.remote_address());
        let _guard = read_span.enter();

        let mut scratch = vec![0u8; self.config.read_buffer_size];
        loop {
            // The lock is taken per read so a concurrent send or close is
            // not starved by a long pump.
            let result = {
                let mut io = self.io.lock().unwrap();
                let Some(sock) = io.socket.as_mut() else {
                    // Closed underneath us; teardown already ran or will.
                    return true;
                };
                sock.read(&mut scratch)
            };

            match result {
                Ok(0) => {
                    debug!("TCP peer closed the stream");
                    return false;
                }
                Ok(n) => {
                    trace!(size = n, "incoming");
                    self.deliver(Incoming::Data(Bytes::copy_from_slice(&scratch[..n])));
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    self.rearm_after_read();
                    return true;
                }
                Err(e) => {
                    warn!("TCP connection lost: {e}");
                    return false;
                }
            }
        }
    }

    /// Re-arm read readiness, keeping the write watch while a backlog is
    /// pending. A connection that cannot be re-armed is torn down; it would
    /// otherwise sit unmonitored forever.
    fn rearm_after_read(self: &Arc<Self>) {
        let mut io = self.io.lock().unwrap();
        let direction = if io.queue.is_empty() {
            Direction::Read
        } else {
            Direction::Both
        };
        if let Err(e) = self.set_poll_locked(&mut io, direction) {
            drop(io);
            warn!("failed to arm reactor watch: {e}");
            self.teardown();
        }
    }

    fn set_poll(self: &Arc<Self>, direction: Direction) {
        let mut io = self.io.lock().unwrap();
        if let Err(e) = self.set_poll_locked(&mut io, direction) {
            drop(io);
            warn!("failed to arm reactor watch: {e}");
            self.teardown();
        }
    }

    fn set_poll_locked(
        self: &Arc<Self>,
        io: &mut IoState,
        direction: Direction,
    ) -> io::Result<()> {
        let Some(sock) = io.socket.as_mut() else {
            return Ok(());
        };
        let inner = Arc::clone(self);
        let callback: reactor::Callback = Box::new(move |event| inner.process(event));
        self.reactor
            .register(sock, direction, self.config.idle_timeout, callback)
    }

    // --- teardown ------------------------------------------------------

    /// Shared tail for clean peer close, read errors and reactor-reported
    /// errors: stop watching, go `Disconnected`, announce end-of-stream.
    /// The socket handle itself is released by `close`.
    fn teardown(self: &Arc<Self>) {
        {
            let mut io = self.io.lock().unwrap();
            if let Some(sock) = io.socket.as_mut() {
                let _ = self.reactor.deregister(sock);
            }
        }
        if self.change_state(ConnectionState::Disconnected) {
            info!("TCP disconnected");
            self.deliver(Incoming::Closed);
        }
    }

    /// Release the socket handle. Safe to call repeatedly and from any
    /// thread; after it returns no reactor callback touches the handle.
    fn close(&self) {
        {
            let mut io = self.io.lock().unwrap();
            if let Some(mut sock) = io.socket.take() {
                debug!("closing TCP socket");
                let _ = self.reactor.deregister(&mut sock);
                // Dropping the stream closes the descriptor; the sentinel
                // `None` is never replaced for this instance.
            }
            // Queued buffers can never reach the wire once the handle is gone.
            io.queue.clear();
        }
        self.change_state(ConnectionState::Disconnected);
    }
}
