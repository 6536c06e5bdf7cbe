//! Overlay connection.
//!
//! A per-node datagram endpoint over the rendezvous-plus-peer substrate.
//! The connection hole-punches through NATs by binding against the
//! rendezvous server, keeps a refreshed local view of the session table,
//! and exposes a datagram [`read`](OverlayConn::read) /
//! [`write`](OverlayConn::write) interface that the gossip protocol runs
//! over.
//!
//! The connection is driven by a single-writer state machine:
//!
//! ```text
//! closed -> opening -> opened -> binding -> listening
//!                         ^          |
//!                         +-- bindError (budget)
//!                         |
//!             listening --+--> processingMessage --> listening
//!                          +--> messageError (budget)
//!                          +--> channelExpired -> binding
//! ```
//!
//! Only the driver task raises events; external callers observe state and
//! request shutdown through a watch channel that the driver folds into
//! its own loop. Entry actions run with no lock held and report their
//! outcome as the next event.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};
use updraft_core::automata::{Automata, Transition};
use updraft_core::config::OverlayConfig;
use updraft_core::peer::{PeerId, Session, SessionTable};
use updraft_core::wire::{
    self, Class, Message, MessageBuilder, Method, TransactionId, WireError, BINDING_REQUEST,
    BINDING_SUCCESS, CHANNEL_BIND_INDICATION, DATA_INDICATION, MAX_PACKET_DATA,
};

/// Receive buffer size for one datagram.
const RECV_BUFFER: usize = 64 * 1024;

/// Overlay connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum OverlayState {
    Closed,
    Opening,
    Opened,
    Binding,
    BindError,
    Listening,
    ProcessingMessage,
    MessageError,
}

impl fmt::Display for OverlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Binding => "binding",
            Self::BindError => "bindError",
            Self::Listening => "listening",
            Self::ProcessingMessage => "processingMessage",
            Self::MessageError => "messageError",
        };
        f.write_str(name)
    }
}

/// Overlay connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum OverlayEvent {
    Open,
    Close,
    Bind,
    Success,
    Error,
    UnderLimit,
    OverLimit,
    ChannelExpired,
}

impl fmt::Display for OverlayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Bind => "bind",
            Self::Success => "success",
            Self::Error => "error",
            Self::UnderLimit => "underLimit",
            Self::OverLimit => "overLimit",
            Self::ChannelExpired => "channelExpired",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the overlay's public API.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Read or write attempted while the connection is not serving.
    #[error("overlay is not ready")]
    NotReady,

    /// Outbound payload exceeds the datagram budget.
    #[error("payload is {len} bytes, maximum {max}")]
    PayloadTooLarge {
        /// Offending length.
        len: usize,
        /// Maximum accepted.
        max: usize,
    },

    /// The next inbound payload was larger than the caller's buffer; the
    /// prefix was copied.
    #[error("buffer holds {copied} of {len} payload bytes")]
    BufferTooSmall {
        /// Bytes copied into the caller's buffer.
        copied: usize,
        /// Full payload length.
        len: usize,
    },

    /// The overlay has shut down.
    #[error("overlay is closed")]
    Closed,

    /// Wire-level failure building an outbound message.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket-level failure.
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
}

fn transitions() -> Vec<Transition<OverlayState, OverlayEvent>> {
    use OverlayEvent as E;
    use OverlayState as S;
    vec![
        Transition { src: S::Closed, event: E::Open, dest: S::Opening },
        Transition { src: S::Closed, event: E::Close, dest: S::Closed },
        Transition { src: S::Opening, event: E::Success, dest: S::Opened },
        Transition { src: S::Opening, event: E::Error, dest: S::Closed },
        Transition { src: S::Opened, event: E::Bind, dest: S::Binding },
        Transition { src: S::Opened, event: E::Close, dest: S::Closed },
        Transition { src: S::Binding, event: E::Success, dest: S::Listening },
        Transition { src: S::Binding, event: E::Error, dest: S::BindError },
        Transition { src: S::Binding, event: E::Close, dest: S::Closed },
        Transition { src: S::BindError, event: E::UnderLimit, dest: S::Binding },
        Transition { src: S::BindError, event: E::OverLimit, dest: S::Opened },
        Transition { src: S::Listening, event: E::Success, dest: S::ProcessingMessage },
        Transition { src: S::Listening, event: E::Error, dest: S::MessageError },
        Transition { src: S::Listening, event: E::ChannelExpired, dest: S::Binding },
        Transition { src: S::Listening, event: E::Close, dest: S::Closed },
        Transition { src: S::ProcessingMessage, event: E::Success, dest: S::Listening },
        Transition { src: S::ProcessingMessage, event: E::Error, dest: S::MessageError },
        Transition { src: S::MessageError, event: E::UnderLimit, dest: S::Listening },
        Transition { src: S::MessageError, event: E::OverLimit, dest: S::Binding },
    ]
}

struct Shared {
    id: PeerId,
    config: OverlayConfig,
    server: SocketAddr,
    fsm: Automata<OverlayState, OverlayEvent>,
    peers: RwLock<SessionTable>,
    external_addr: RwLock<Option<SocketAddr>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    read_deadline: RwLock<Option<Instant>>,
    write_deadline: RwLock<Option<Instant>>,
    last_serving: RwLock<Instant>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn lock<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        lock.read().expect("overlay lock poisoned")
    }

    fn lock_mut<'a, T>(&self, lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        lock.write().expect("overlay lock poisoned")
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.lock(&self.socket).clone()
    }

    fn merge_peers(&self, delta: &SessionTable) {
        self.lock_mut(&self.peers).merge(delta);
    }

    /// Chooses which of a peer's addresses to talk to: its internal
    /// address when we share its NAT (same external IP), its external
    /// address otherwise.
    fn peer_addr(&self, session: &Session) -> SocketAddr {
        match *self.lock(&self.external_addr) {
            Some(external) if session.external.ip() == external.ip() => session.internal,
            _ => session.external,
        }
    }

    fn binding_request(&self, transaction_id: TransactionId) -> Bytes {
        let mut builder = MessageBuilder::with_transaction_id(BINDING_REQUEST, transaction_id)
            .username(&self.id);
        if let Some(socket) = self.current_socket() {
            if let Ok(local) = socket.local_addr() {
                builder = builder.xor_mapped_address(local);
            }
        }
        builder
            .swarm_ports(
                self.config.swarm_external_port,
                self.config.swarm_internal_port,
            )
            .build(&self.config.password)
    }
}

/// A peer-to-peer overlay connection.
///
/// Construct with [`OverlayConn::open`]; the returned handle is shared
/// freely. The internal driver task owns all state transitions.
pub struct OverlayConn {
    shared: Arc<Shared>,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl OverlayConn {
    /// Opens an overlay connection: resolves the rendezvous address,
    /// spawns the FSM driver and the keep-alive timer, and returns the
    /// shared handle. The connection binds in the background; use
    /// [`OverlayConn::ready`] or poll [`OverlayConn::is_ready`].
    ///
    /// # Errors
    ///
    /// Returns an error when the rendezvous address does not resolve.
    pub async fn open(id: PeerId, config: OverlayConfig) -> Result<Arc<Self>, OverlayError> {
        let server = tokio::net::lookup_host(config.server.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("rendezvous address {} did not resolve", config.server),
                )
            })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            server,
            fsm: Automata::new("overlay", OverlayState::Closed, &transitions()),
            peers: RwLock::new(SessionTable::new()),
            external_addr: RwLock::new(None),
            socket: RwLock::new(None),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            read_deadline: RwLock::new(None),
            write_deadline: RwLock::new(None),
            last_serving: RwLock::new(Instant::now()),
            shutdown,
            config,
        });

        debug!(peer = %id, server = %server, "opening overlay connection");

        let driver = Driver {
            shared: shared.clone(),
            shutdown: shutdown_rx.clone(),
            channel_expires: Instant::now(),
            err_count: 0,
            pending: None,
        };
        let driver_task = tokio::spawn(driver.run());
        let keepalive_task = tokio::spawn(keep_alive(shared.clone(), shutdown_rx));

        Ok(Arc::new(Self {
            shared,
            tasks: AsyncMutex::new(vec![driver_task, keepalive_task]),
        }))
    }

    /// This node's peer id.
    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    /// Current FSM state.
    pub fn state(&self) -> OverlayState {
        self.shared.fsm.current()
    }

    /// True while the connection can serve reads (listening, processing,
    /// or riding out a message-error budget).
    pub fn is_ready(&self) -> bool {
        self.shared.fsm.is_any(&[
            OverlayState::Listening,
            OverlayState::ProcessingMessage,
            OverlayState::MessageError,
        ])
    }

    /// Waits until the connection is serving, up to `timeout`.
    pub async fn ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_ready() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.is_ready()
    }

    /// Time since the connection last entered its serving state. Feeds
    /// the cold-start pull fallback.
    pub fn idle_for(&self) -> Duration {
        self.shared.lock(&self.shared.last_serving).elapsed()
    }

    /// A copy of the local session-table view.
    pub fn peers(&self) -> SessionTable {
        self.shared.lock(&self.shared.peers).clone()
    }

    /// Our externally observed address, once bound.
    pub fn external_addr(&self) -> Option<SocketAddr> {
        *self.shared.lock(&self.shared.external_addr)
    }

    /// The local socket address, while a socket is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.current_socket().and_then(|s| s.local_addr().ok())
    }

    /// Sets or clears the deadline applied to subsequent reads.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.shared.lock_mut(&self.shared.read_deadline) = deadline;
    }

    /// Sets or clears the deadline applied to subsequent writes.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.shared.lock_mut(&self.shared.write_deadline) = deadline;
    }

    /// Receives the next multicast payload from a peer.
    ///
    /// # Errors
    ///
    /// [`OverlayError::NotReady`] when the FSM is not serving or the read
    /// deadline passes; [`OverlayError::Closed`] after shutdown.
    pub async fn read_msg(&self) -> Result<Bytes, OverlayError> {
        if !self.is_ready() {
            return Err(OverlayError::NotReady);
        }
        let deadline = *self.shared.lock(&self.shared.read_deadline);
        let mut rx = self.shared.inbound_rx.lock().await;
        let received = match deadline {
            None => rx.recv().await,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(r) => r,
                    Err(_) => return Err(OverlayError::NotReady),
                }
            },
        };
        received.ok_or(OverlayError::Closed)
    }

    /// Receives the next multicast payload into `buf`, returning the
    /// number of bytes copied.
    ///
    /// # Errors
    ///
    /// [`OverlayError::BufferTooSmall`] when the payload exceeds `buf`;
    /// the prefix is copied and the error carries the short count.
    /// Otherwise as [`OverlayConn::read_msg`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, OverlayError> {
        let payload = self.read_msg().await?;
        let copied = payload.len().min(buf.len());
        buf[..copied].copy_from_slice(&payload[..copied]);
        if payload.len() > buf.len() {
            return Err(OverlayError::BufferTooSmall {
                copied,
                len: payload.len(),
            });
        }
        Ok(copied)
    }

    /// Multicasts `payload` to every known peer (excluding self),
    /// preferring internal addresses behind a shared NAT. Returns the
    /// payload length.
    ///
    /// Per-peer send failures are logged, not returned: epidemic spread
    /// tolerates per-hop loss.
    ///
    /// # Errors
    ///
    /// [`OverlayError::PayloadTooLarge`] above the datagram budget;
    /// [`OverlayError::NotReady`] unless the FSM is in listening or
    /// processing, or when the write deadline has passed.
    pub async fn write(&self, payload: &[u8]) -> Result<usize, OverlayError> {
        if payload.len() > MAX_PACKET_DATA {
            return Err(OverlayError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PACKET_DATA,
            });
        }
        if !self
            .shared
            .fsm
            .is_any(&[OverlayState::Listening, OverlayState::ProcessingMessage])
        {
            return Err(OverlayError::NotReady);
        }
        if let Some(deadline) = *self.shared.lock(&self.shared.write_deadline) {
            if Instant::now() >= deadline {
                return Err(OverlayError::NotReady);
            }
        }
        let socket = self.shared.current_socket().ok_or(OverlayError::NotReady)?;
        let datagram = MessageBuilder::new(DATA_INDICATION)
            .username(&self.shared.id)
            .data(payload)?
            .build(&self.shared.config.password);

        let peers = self.peers();
        for (peer, session) in peers.iter() {
            if *peer == self.shared.id {
                continue;
            }
            let addr = self.shared.peer_addr(session);
            match socket.send_to(&datagram, addr).await {
                Ok(_) => trace!(%peer, %addr, len = payload.len(), "multicast sent"),
                Err(e) => warn!(%peer, %addr, error = %e, "multicast send failed"),
            }
        }
        Ok(payload.len())
    }

    /// Shuts the connection down and waits for its tasks to finish.
    pub async fn close(&self) {
        let _ = self.shared.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for OverlayConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConn")
            .field("id", &self.shared.id.to_string())
            .field("state", &self.state().to_string())
            .finish_non_exhaustive()
    }
}

/// FSM driver: the single writer of the overlay automata.
struct Driver {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    channel_expires: Instant,
    err_count: u32,
    pending: Option<(SocketAddr, Bytes)>,
}

impl Driver {
    async fn run(mut self) {
        let mut event = OverlayEvent::Open;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let state = match self.shared.fsm.event(event) {
                Ok(state) => state,
                Err(e) => {
                    // Driver-internal events are always mapped; reaching
                    // this means the table and the driver disagree.
                    warn!(error = %e, "overlay driver raised an unmapped event");
                    break;
                },
            };
            event = match state {
                OverlayState::Closed => {
                    self.cleanup();
                    if *self.shutdown.borrow() {
                        break;
                    }
                    OverlayEvent::Open
                },
                OverlayState::Opening => self.opening().await,
                OverlayState::Opened => OverlayEvent::Bind,
                OverlayState::Binding => self.binding().await,
                OverlayState::BindError => self.bind_error().await,
                OverlayState::Listening => self.listening().await,
                OverlayState::ProcessingMessage => self.processing(),
                OverlayState::MessageError => self.message_error(),
            };
        }
        self.cleanup();
        let _ = self.shared.fsm.event(OverlayEvent::Close);
        debug!("overlay driver stopped");
    }

    fn cleanup(&mut self) {
        *self.shared.lock_mut(&self.shared.socket) = None;
        self.err_count = 0;
        self.pending = None;
    }

    /// Pauses for the error backoff, waking early on shutdown.
    async fn backoff(&mut self) {
        let backoff = self.shared.config.error_backoff;
        tokio::select! {
            () = tokio::time::sleep(backoff) => {},
            _ = self.shutdown.changed() => {},
        }
    }

    async fn opening(&mut self) -> OverlayEvent {
        let local: SocketAddr = match self.shared.config.address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(address = %self.shared.config.address, error = %e, "bad local address");
                self.backoff().await;
                return OverlayEvent::Error;
            },
        };
        match UdpSocket::bind(local).await {
            Ok(socket) => {
                let socket = Arc::new(socket);
                debug!(local = ?socket.local_addr().ok(), "overlay socket opened");
                *self.shared.lock_mut(&self.shared.socket) = Some(socket);
                OverlayEvent::Success
            },
            Err(e) => {
                warn!(error = %e, backoff = ?self.shared.config.error_backoff, "failed opening overlay socket");
                self.backoff().await;
                OverlayEvent::Error
            },
        }
    }

    /// Sends a binding request and waits for the matching success
    /// response, merging the advertised session table.
    async fn binding(&mut self) -> OverlayEvent {
        let Some(socket) = self.shared.current_socket() else {
            return OverlayEvent::Error;
        };
        let transaction_id = TransactionId::random();
        let request = self.shared.binding_request(transaction_id);
        if let Err(e) = socket.send_to(&request, self.shared.server).await {
            warn!(error = %e, "failed sending binding request");
            return OverlayEvent::Error;
        }

        let deadline = Instant::now() + self.shared.config.binding_deadline;
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("binding deadline passed");
                return OverlayEvent::Error;
            }
            let received = tokio::select! {
                r = tokio::time::timeout(remaining, socket.recv_from(&mut buf)) => r,
                _ = self.shutdown.changed() => return OverlayEvent::Close,
            };
            let (n, _from) = match received {
                Err(_) => {
                    warn!("binding deadline passed");
                    return OverlayEvent::Error;
                },
                Ok(Err(e)) => {
                    warn!(error = %e, "binding receive failed");
                    return OverlayEvent::Error;
                },
                Ok(Ok(received)) => received,
            };

            // Only our own response ends the wait; unrelated traffic
            // (stray indications, older responses) is skipped.
            let Ok(message) = Message::parse(&buf[..n]) else {
                continue;
            };
            if message.message_type() != BINDING_SUCCESS
                || message.transaction_id() != transaction_id
            {
                continue;
            }
            return self.accept_binding(&message);
        }
    }

    fn accept_binding(&mut self, message: &Message) -> OverlayEvent {
        if let Err(e) = message.validate(&self.shared.config.password) {
            warn!(error = %e, "binding response failed validation");
            return OverlayEvent::Error;
        }
        let external = match message.xor_mapped_address() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "binding response lacks a mapped address");
                return OverlayEvent::Error;
            },
        };
        if message.has_data() {
            match message.session_table() {
                Ok(table) => self.shared.merge_peers(&table),
                Err(e) => {
                    warn!(error = %e, "binding response carried a bad session table");
                    return OverlayEvent::Error;
                },
            }
        }
        *self.shared.lock_mut(&self.shared.external_addr) = Some(external);
        self.channel_expires = Instant::now() + self.shared.config.channel_lifespan;
        debug!(%external, "binding succeeded");
        OverlayEvent::Success
    }

    async fn bind_error(&mut self) -> OverlayEvent {
        self.err_count += 1;
        if self.err_count >= self.shared.config.binding_max_errors {
            self.err_count = 0;
            warn!(
                budget = self.shared.config.binding_max_errors,
                "binding error budget exhausted, backing off"
            );
            self.backoff().await;
            OverlayEvent::OverLimit
        } else {
            OverlayEvent::UnderLimit
        }
    }

    /// Blocks on one receive with the channel expiry as the deadline.
    async fn listening(&mut self) -> OverlayEvent {
        let Some(socket) = self.shared.current_socket() else {
            return OverlayEvent::Error;
        };
        *self.shared.lock_mut(&self.shared.last_serving) = Instant::now();

        let remaining = self.channel_expires.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("channel lifetime elapsed, rebinding");
            return OverlayEvent::ChannelExpired;
        }

        let mut buf = vec![0u8; RECV_BUFFER];
        let received = tokio::select! {
            r = tokio::time::timeout(remaining, socket.recv_from(&mut buf)) => r,
            _ = self.shutdown.changed() => return OverlayEvent::Close,
        };
        match received {
            Err(_) => {
                debug!("channel lifetime elapsed, rebinding");
                OverlayEvent::ChannelExpired
            },
            Ok(Err(e)) => {
                if Instant::now() >= self.channel_expires {
                    OverlayEvent::ChannelExpired
                } else {
                    warn!(error = %e, "receive failed");
                    OverlayEvent::Error
                }
            },
            Ok(Ok((n, from))) => {
                // Inbound traffic proves the mapping is alive.
                self.channel_expires = Instant::now() + self.shared.config.channel_lifespan;
                self.pending = Some((from, Bytes::copy_from_slice(&buf[..n])));
                OverlayEvent::Success
            },
        }
    }

    /// Validates the stashed datagram and dispatches on (method, class).
    fn processing(&mut self) -> OverlayEvent {
        let Some((from, datagram)) = self.pending.take() else {
            return OverlayEvent::Error;
        };
        let message = match wire::validate(&datagram, &self.shared.config.password, None) {
            Ok(message) => message,
            Err(e) => {
                warn!(%from, error = %e, "discarding bad message");
                return OverlayEvent::Error;
            },
        };
        let peer = match message.username() {
            Ok(peer) => peer,
            Err(e) => {
                warn!(%from, error = %e, "message lacks a sender id");
                return OverlayEvent::Error;
            },
        };

        let message_type = message.message_type();
        match (message_type.method, message_type.class) {
            (Method::Binding, Class::SuccessResponse | Class::Indication) => {
                match message.session_table() {
                    Ok(table) => {
                        trace!(%peer, entries = table.len(), "merging session table delta");
                        self.shared.merge_peers(&table);
                        OverlayEvent::Success
                    },
                    Err(e) => {
                        warn!(%peer, error = %e, "bad session table delta");
                        OverlayEvent::Error
                    },
                }
            },
            (Method::Data, Class::Indication) => {
                let payload = match message.data() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(%peer, error = %e, "data indication without payload");
                        return OverlayEvent::Error;
                    },
                };
                match self.shared.inbound_tx.try_send(payload) {
                    Ok(()) => OverlayEvent::Success,
                    Err(_) => {
                        warn!(%peer, "inbound peer-message queue overflow, dropping");
                        OverlayEvent::Error
                    },
                }
            },
            (Method::ChannelBind, Class::Indication) => {
                // The packet's arrival is the acknowledgement; the hole
                // is open.
                trace!(%peer, %from, "channel bind indication");
                OverlayEvent::Success
            },
            _ => {
                warn!(%peer, %from, r#type = %message_type, "unexpected message type");
                OverlayEvent::Error
            },
        }
    }

    fn message_error(&mut self) -> OverlayEvent {
        self.err_count += 1;
        if self.err_count >= self.shared.config.listening_max_errors {
            self.err_count = 0;
            warn!(
                budget = self.shared.config.listening_max_errors,
                "message error budget exhausted, rebinding"
            );
            OverlayEvent::OverLimit
        } else {
            OverlayEvent::UnderLimit
        }
    }
}

/// Keep-alive timer: every channel lifespan, rebind with the rendezvous
/// server and ping every peer to hold NAT pinholes open.
async fn keep_alive(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.channel_lifespan);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so keep-alives trail the
    // initial binding.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = shutdown.changed() => break,
        }
        let Some(socket) = shared.current_socket() else {
            continue;
        };

        let request = shared.binding_request(TransactionId::random());
        if let Err(e) = socket.send_to(&request, shared.server).await {
            warn!(error = %e, "keep-alive binding request failed");
        }

        if !shared.fsm.is_any(&[
            OverlayState::Listening,
            OverlayState::ProcessingMessage,
            OverlayState::MessageError,
        ]) {
            trace!(state = %shared.fsm.current(), "skipping peer keep-alive");
            continue;
        }

        let ping = MessageBuilder::new(CHANNEL_BIND_INDICATION)
            .username(&shared.id)
            .build(&shared.config.password);
        let peers = shared.lock(&shared.peers).clone();
        for (peer, session) in peers.iter() {
            if *peer == shared.id {
                continue;
            }
            let addr = shared.peer_addr(session);
            if let Err(e) = socket.send_to(&ping, addr).await {
                warn!(%peer, %addr, error = %e, "peer keep-alive failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay_config(server: SocketAddr) -> OverlayConfig {
        OverlayConfig {
            address: "127.0.0.1:0".to_string(),
            server: server.to_string(),
            ..OverlayConfig::default()
        }
    }

    fn session_for(addr: SocketAddr) -> Session {
        Session {
            external: addr,
            internal: addr,
            swarm_external: addr,
            swarm_internal: addr,
        }
    }

    /// Minimal rendezvous stand-in: answers every binding request with a
    /// success response echoing the observed source address and a session
    /// table carrying the peers seen so far. Returns the listen address
    /// and a counter of accepted bindings; the responder task dies with
    /// the test runtime.
    async fn fake_rendezvous(
        password: String,
    ) -> (SocketAddr, Arc<std::sync::atomic::AtomicU32>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let server_id = PeerId::new([0xff; 6]);
        let bindings = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = bindings.clone();
        tokio::spawn(async move {
            let mut table = SessionTable::new();
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(message) = wire::validate(&buf[..n], &password, Some(BINDING_REQUEST))
                else {
                    continue;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let peer = message.username().unwrap();
                table.insert(peer, session_for(from));
                let reply = MessageBuilder::with_transaction_id(
                    BINDING_SUCCESS,
                    message.transaction_id(),
                )
                .username(&server_id)
                .xor_mapped_address(from)
                .session_table(&table)
                .unwrap()
                .build(&password);
                socket.send_to(&reply, from).await.unwrap();
            }
        });
        (addr, bindings)
    }

    #[tokio::test]
    async fn overlay_binds_and_reports_external_address() {
        let config = overlay_config("127.0.0.1:1".parse().unwrap());
        let (server, _task) = fake_rendezvous(config.password.clone()).await;
        let config = OverlayConfig {
            server: server.to_string(),
            ..config
        };

        let overlay = OverlayConn::open(PeerId::new([1; 6]), config).await.unwrap();
        assert!(overlay.ready(Duration::from_secs(5)).await);
        assert_eq!(overlay.external_addr(), overlay.local_addr());
        assert_eq!(overlay.peers().len(), 1);
        overlay.close().await;
    }

    #[tokio::test]
    async fn two_overlays_gossip_through_the_rendezvous() {
        let seed = overlay_config("127.0.0.1:1".parse().unwrap());
        let (server, _task) = fake_rendezvous(seed.password.clone()).await;
        let config = |_: u8| OverlayConfig {
            server: server.to_string(),
            ..seed.clone()
        };

        let a = OverlayConn::open(PeerId::new([0xa; 6]), config(0)).await.unwrap();
        assert!(a.ready(Duration::from_secs(5)).await);
        let b = OverlayConn::open(PeerId::new([0xb; 6]), config(1)).await.unwrap();
        assert!(b.ready(Duration::from_secs(5)).await);

        // B learned about A from the fake server's table; wait until A
        // has re-learned B the same way (keep-alive or reply traffic is
        // not needed: B's table already contains A, so B can write).
        assert_eq!(b.peers().len(), 2);
        let n = b.write(b"new update available").await.unwrap();
        assert_eq!(n, 20);

        let payload = tokio::time::timeout(Duration::from_secs(5), a.read_msg())
            .await
            .expect("gossip delivery timed out")
            .unwrap();
        assert_eq!(&payload[..], b"new update available");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn write_and_read_require_a_serving_state() {
        // Point at a black-hole address: binding can never succeed.
        let config = OverlayConfig {
            address: "127.0.0.1:0".to_string(),
            server: "127.0.0.1:9".to_string(),
            ..OverlayConfig::default()
        };
        let overlay = OverlayConn::open(PeerId::new([2; 6]), config).await.unwrap();

        assert!(matches!(
            overlay.write(b"x").await,
            Err(OverlayError::NotReady)
        ));
        overlay.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        assert!(matches!(
            overlay.read_msg().await,
            Err(OverlayError::NotReady)
        ));
        overlay.close().await;
    }

    #[tokio::test]
    async fn oversized_write_is_rejected() {
        let config = overlay_config("127.0.0.1:1".parse().unwrap());
        let (server, _task) = fake_rendezvous(config.password.clone()).await;
        let config = OverlayConfig {
            server: server.to_string(),
            ..config
        };
        let overlay = OverlayConn::open(PeerId::new([3; 6]), config).await.unwrap();
        assert!(overlay.ready(Duration::from_secs(5)).await);

        let huge = vec![0u8; MAX_PACKET_DATA + 1];
        assert!(matches!(
            overlay.write(&huge).await,
            Err(OverlayError::PayloadTooLarge { .. })
        ));
        overlay.close().await;
    }

    #[tokio::test]
    async fn malformed_datagrams_charge_the_error_budget_without_killing_the_loop() {
        let config = overlay_config("127.0.0.1:1".parse().unwrap());
        let (server, _task) = fake_rendezvous(config.password.clone()).await;
        let config = OverlayConfig {
            server: server.to_string(),
            ..config
        };
        let overlay = OverlayConn::open(PeerId::new([4; 6]), config.clone()).await.unwrap();
        assert!(overlay.ready(Duration::from_secs(5)).await);
        let target = overlay.local_addr().unwrap();

        // Fewer bad datagrams than the budget: the overlay must keep
        // serving.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let forged = MessageBuilder::new(DATA_INDICATION)
            .username(&PeerId::new([9; 6]))
            .data(b"forged")
            .unwrap()
            .build("wrong-password");
        for _ in 0..(config.listening_max_errors - 1) {
            sender.send_to(&forged, target).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(overlay.is_ready());

        // A genuine message still gets through afterwards.
        let genuine = MessageBuilder::new(DATA_INDICATION)
            .username(&PeerId::new([9; 6]))
            .data(b"genuine")
            .unwrap()
            .build(&config.password);
        sender.send_to(&genuine, target).await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), overlay.read_msg())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(&payload[..], b"genuine");
        overlay.close().await;
    }

    #[tokio::test]
    async fn queue_overflow_drops_without_blocking_the_producer() {
        let seed = overlay_config("127.0.0.1:1".parse().unwrap());
        let (server, _bindings) = fake_rendezvous(seed.password.clone()).await;
        let config = OverlayConfig {
            server: server.to_string(),
            inbound_queue: 4,
            ..seed
        };
        let overlay = OverlayConn::open(PeerId::new([6; 6]), config.clone()).await.unwrap();
        assert!(overlay.ready(Duration::from_secs(5)).await);
        let target = overlay.local_addr().unwrap();

        // Flood past the queue capacity without draining. The overflow
        // is charged to the error budget but never blocks the FSM.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for i in 0..8u8 {
            let datagram = MessageBuilder::new(DATA_INDICATION)
                .username(&PeerId::new([9; 6]))
                .data(&[i])
                .unwrap()
                .build(&config.password);
            sender.send_to(&datagram, target).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(overlay.is_ready());

        // Exactly the queue capacity survived; the rest were dropped.
        for _ in 0..4 {
            overlay.read_msg().await.unwrap();
        }
        overlay.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        assert!(matches!(
            overlay.read_msg().await,
            Err(OverlayError::NotReady)
        ));
        overlay.close().await;
    }

    #[tokio::test]
    async fn channel_refresh_rebinds_after_the_lifespan() {
        let seed = overlay_config("127.0.0.1:1".parse().unwrap());
        let (server, bindings) = fake_rendezvous(seed.password.clone()).await;
        let config = OverlayConfig {
            server: server.to_string(),
            channel_lifespan: Duration::from_millis(300),
            ..seed
        };
        let overlay = OverlayConn::open(PeerId::new([5; 6]), config).await.unwrap();
        assert!(overlay.ready(Duration::from_secs(5)).await);
        let external = overlay.external_addr();

        // Idle across several lifespans: bindings are re-performed and
        // the mapped address stays stable.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(overlay.is_ready());
        assert_eq!(overlay.external_addr(), external);
        let seen = bindings.load(std::sync::atomic::Ordering::Relaxed);
        assert!(seen >= 2, "expected rebinding, saw {seen} bindings");
        overlay.close().await;
    }
}
