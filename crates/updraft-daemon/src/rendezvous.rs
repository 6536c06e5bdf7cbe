//! Rendezvous server.
//!
//! The central UDP endpoint peers bind against for NAT reflection and
//! membership bookkeeping - never a relay. Alongside the datagram
//! listener it serves the notification catalog over TCP on the same
//! host:port, so a peer whose UDP path is blocked can still catch up
//! with a pull fetch, and snapshots the catalog to disk so a restart
//! keeps the known notification set.
//!
//! Inbound datagrams are dispatched to a small fixed worker pool through
//! a bounded queue. A worker validates the message and, for binding
//! requests, upserts the session table and answers with the caller's
//! externally observed address. Changed sessions are advertised to the
//! rest of the fleet immediately; a timer re-advertises the full table to
//! heal missed updates. Advertisements go out one table entry per
//! datagram so each message stays inside a typical MTU with its
//! integrity attributes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use updraft_core::config::ServerConfig;
use updraft_core::keys::{load_verifying_key, KeyError};
use updraft_core::notification::Notification;
use updraft_core::peer::{local_peer_id, PeerId, Session, SessionTable};
use updraft_core::wire::{
    self, MessageBuilder, BINDING_INDICATION, BINDING_REQUEST, BINDING_SUCCESS,
};

/// Receive buffer for one datagram; binding requests are small.
const RECV_BUFFER: usize = 2048;

/// Errors from server startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket setup failed.
    #[error("binding {addr}: {source}")]
    Bind {
        /// Address that failed to bind.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The verifying key could not be loaded.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The snapshot file exists but did not load.
    #[error("snapshot {path}: {reason}")]
    Snapshot {
        /// Snapshot path.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

struct ServerState {
    id: PeerId,
    config: ServerConfig,
    public_key: VerifyingKey,
    socket: Arc<UdpSocket>,
    sessions: RwLock<SessionTable>,
    notifications: RwLock<HashMap<String, Notification>>,
    modified: AtomicU64,
    snapshotted: AtomicU64,
}

impl ServerState {
    fn sessions_snapshot(&self) -> SessionTable {
        self.sessions.read().expect("sessions lock poisoned").clone()
    }

    fn catalog_snapshot(&self) -> HashMap<String, Notification> {
        self.notifications
            .read()
            .expect("notifications lock poisoned")
            .clone()
    }
}

/// The rendezvous server: UDP binding endpoint, TCP catalog, snapshot
/// loop.
pub struct RendezvousServer {
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RendezvousServer {
    /// Binds the UDP and TCP listeners, loads the verifying key and any
    /// existing snapshot, and starts all server tasks.
    ///
    /// # Errors
    ///
    /// Fails when a listener cannot bind, the key file is unusable, or a
    /// present snapshot file does not parse.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let public_key = load_verifying_key(&config.public_key_file)?;
        Self::bind_with_key(config, public_key).await
    }

    /// As [`RendezvousServer::bind`], with the verifying key supplied
    /// directly.
    ///
    /// # Errors
    ///
    /// As [`RendezvousServer::bind`], minus key loading.
    pub async fn bind_with_key(
        config: ServerConfig,
        public_key: VerifyingKey,
    ) -> Result<Self, ServerError> {
        let bind_err = |addr: &str| {
            let addr = addr.to_string();
            move |source| ServerError::Bind { addr, source }
        };

        let socket = UdpSocket::bind(&config.address)
            .await
            .map_err(bind_err(&config.address))?;
        let addr = socket.local_addr().map_err(bind_err(&config.address))?;
        // The catalog listens on the same host:port; TCP and UDP port
        // spaces are distinct.
        let tcp = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(bind_err(&addr.to_string()))?;

        let id = local_peer_id().unwrap_or_else(|e| {
            warn!(error = %e, "no stable identity, using a random peer id");
            PeerId::random()
        });

        let notifications = load_snapshot(&config.snapshot_file)?;
        info!(
            %addr,
            %id,
            notifications = notifications.len(),
            "rendezvous server listening"
        );

        let state = Arc::new(ServerState {
            id,
            public_key,
            socket: Arc::new(socket),
            sessions: RwLock::new(SessionTable::new()),
            notifications: RwLock::new(notifications),
            modified: AtomicU64::new(0),
            snapshotted: AtomicU64::new(0),
            config,
        });

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        // Datagram dispatcher feeding the bounded worker queue.
        let (job_tx, job_rx) = mpsc::channel::<(Bytes, SocketAddr)>(state.config.dispatch_queue);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        for worker in 0..state.config.workers.max(1) {
            let state = state.clone();
            let job_rx = job_rx.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = shutdown_rx.changed() => None,
                        }
                    };
                    let Some((datagram, src)) = job else { break };
                    handle_datagram(&state, &datagram, src).await;
                }
                trace!(worker, "rendezvous worker stopped");
            }));
        }

        {
            let state = state.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER];
                loop {
                    let received = tokio::select! {
                        r = state.socket.recv_from(&mut buf) => r,
                        _ = shutdown_rx.changed() => break,
                    };
                    match received {
                        Ok((n, src)) => {
                            let datagram = Bytes::copy_from_slice(&buf[..n]);
                            if job_tx.try_send((datagram, src)).is_err() {
                                warn!(%src, "dispatch queue full, dropping datagram");
                            }
                        },
                        Err(e) => warn!(error = %e, "receive failed"),
                    }
                }
            }));
        }

        // Full-table advertisement timer.
        {
            let state = state.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(state.config.advertise_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {},
                        _ = shutdown_rx.changed() => break,
                    }
                    advertise_session_table(&state).await;
                }
            }));
        }

        // Snapshot timer.
        {
            let state = state.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(state.config.snapshot_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {},
                        _ = shutdown_rx.changed() => break,
                    }
                    snapshot_if_modified(&state).await;
                }
                // One final snapshot on the way out.
                snapshot_if_modified(&state).await;
            }));
        }

        // TCP catalog.
        {
            let state = state.clone();
            let mut shutdown_rx = shutdown.subscribe();
            let app = Router::new()
                .route("/", get(get_catalog).post(post_catalog))
                .with_state(state);
            tasks.push(tokio::spawn(async move {
                let server = axum::serve(tcp, app).with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                });
                if let Err(e) = server.await {
                    warn!(error = %e, "catalog server failed");
                }
            }));
        }

        Ok(Self {
            state,
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    /// The bound UDP/TCP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.state
            .socket
            .local_addr()
            .expect("socket bound at startup")
    }

    /// The server's peer id.
    pub fn id(&self) -> PeerId {
        self.state.id
    }

    /// A copy of the current session table.
    pub fn sessions(&self) -> SessionTable {
        self.state.sessions_snapshot()
    }

    /// Runs until shut down.
    pub async fn wait(&self) {
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stops all server tasks and waits for them to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Validates one datagram and serves it. Only binding requests are
/// answered; anything else that authenticates is dropped silently.
async fn handle_datagram(state: &Arc<ServerState>, datagram: &[u8], src: SocketAddr) {
    let message = match wire::validate(datagram, &state.config.password, None) {
        Ok(message) => message,
        Err(e) => {
            debug!(%src, error = %e, "discarding datagram");
            return;
        },
    };
    if message.message_type() != BINDING_REQUEST {
        trace!(%src, r#type = %message.message_type(), "ignoring non-binding message");
        return;
    }

    let (peer, internal, swarm_ports) = match (
        message.username(),
        message.xor_mapped_address(),
        message.swarm_ports(),
    ) {
        (Ok(peer), Ok(internal), Ok(ports)) => (peer, internal, ports),
        (peer, internal, ports) => {
            debug!(
                %src,
                username = peer.is_ok(),
                internal = internal.is_ok(),
                swarm_ports = ports.is_ok(),
                "binding request missing attributes"
            );
            return;
        },
    };

    let session = Session {
        external: src,
        internal,
        swarm_external: SocketAddr::new(src.ip(), swarm_ports.0),
        swarm_internal: SocketAddr::new(internal.ip(), swarm_ports.1),
    };
    let changed = {
        let mut sessions = state.sessions.write().expect("sessions lock poisoned");
        sessions.insert(peer, session)
    };
    if changed {
        info!(%peer, external = %src, %internal, "registered peer");
    }

    // The reply carries the caller's observed address and an empty table
    // attribute for schema consistency; membership arrives as separate
    // per-entry indications.
    let reply = MessageBuilder::with_transaction_id(BINDING_SUCCESS, message.transaction_id())
        .username(&state.id)
        .xor_mapped_address(src)
        .session_table(&SessionTable::new())
        .expect("empty table always encodes")
        .build(&state.config.password);
    if let Err(e) = state.socket.send_to(&reply, src).await {
        warn!(%src, error = %e, "failed sending binding reply");
        return;
    }

    if changed {
        advertise_new_peer(state, peer, session).await;
    }
}

/// Pushes a changed session to the rest of the fleet, and the rest of
/// the fleet to the changed peer - one entry per datagram.
async fn advertise_new_peer(state: &Arc<ServerState>, peer: PeerId, session: Session) {
    let sessions = state.sessions_snapshot();

    let delta = match indication(state, peer, session) {
        Some(delta) => delta,
        None => return,
    };
    for (other, other_session) in sessions.iter() {
        if *other == peer {
            continue;
        }
        if let Err(e) = state.socket.send_to(&delta, other_session.external).await {
            warn!(to = %other, error = %e, "failed advertising new peer");
        } else {
            trace!(subject = %peer, to = %other, "advertised new peer");
        }
    }

    for (other, other_session) in sessions.iter() {
        if *other == peer {
            continue;
        }
        let Some(entry) = indication(state, *other, *other_session) else {
            continue;
        };
        if let Err(e) = state.socket.send_to(&entry, session.external).await {
            warn!(to = %peer, error = %e, "failed back-filling peer table");
        }
    }
}

/// Re-advertises the full table to every peer, one entry per datagram.
async fn advertise_session_table(state: &Arc<ServerState>) {
    let sessions = state.sessions_snapshot();
    if sessions.is_empty() {
        return;
    }
    let mut failures = 0usize;
    for (recipient, recipient_session) in sessions.iter() {
        for (entry, entry_session) in sessions.iter() {
            let Some(datagram) = indication(state, *entry, *entry_session) else {
                continue;
            };
            if state
                .socket
                .send_to(&datagram, recipient_session.external)
                .await
                .is_err()
            {
                failures += 1;
            }
        }
        trace!(to = %recipient, "advertised session table");
    }
    debug!(
        peers = sessions.len(),
        failures, "session table advertisement round complete"
    );
}

fn indication(state: &ServerState, peer: PeerId, session: Session) -> Option<Bytes> {
    MessageBuilder::new(BINDING_INDICATION)
        .username(&state.id)
        .session_table(&SessionTable::singleton(peer, session))
        .ok()
        .map(|b| b.build(&state.config.password))
}

async fn get_catalog(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.catalog_snapshot())
}

async fn post_catalog(State(state): State<Arc<ServerState>>, body: Bytes) -> StatusCode {
    let notification: Notification = match serde_json::from_slice(&body) {
        Ok(notification) => notification,
        Err(e) => {
            debug!(error = %e, "malformed catalog submission");
            return StatusCode::BAD_REQUEST;
        },
    };
    if let Err(e) = notification.verify(&state.public_key) {
        debug!(uuid = %notification.uuid, error = %e, "catalog submission failed verification");
        return StatusCode::FORBIDDEN;
    }

    let mut notifications = state
        .notifications
        .write()
        .expect("notifications lock poisoned");
    let accept = match notifications.get(&notification.uuid) {
        Some(existing) => existing.version < notification.version,
        None => true,
    };
    if accept {
        info!(uuid = %notification.uuid, version = notification.version, "catalog updated");
        notifications.insert(notification.uuid.clone(), notification);
        state.modified.fetch_add(1, Ordering::Release);
    }
    StatusCode::OK
}

fn load_snapshot(path: &std::path::Path) -> Result<HashMap<String, Notification>, ServerError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ServerError::Snapshot {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(ServerError::Snapshot {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Rewrites the snapshot atomically when the catalog changed since the
/// last snapshot: tempfile in the same directory, fsync, rename.
async fn snapshot_if_modified(state: &Arc<ServerState>) {
    let modified = state.modified.load(Ordering::Acquire);
    if modified == state.snapshotted.load(Ordering::Acquire) {
        return;
    }
    let catalog = state.catalog_snapshot();
    let path = state.config.snapshot_file.clone();
    let result = tokio::task::spawn_blocking(move || write_snapshot(&path, &catalog))
        .await
        .expect("snapshot task panicked");
    match result {
        Ok(()) => {
            state.snapshotted.store(modified, Ordering::Release);
            debug!(path = %state.config.snapshot_file.display(), "snapshot written");
        },
        Err(e) => {
            // In-memory state stays authoritative; retried next tick.
            warn!(path = %state.config.snapshot_file.display(), error = %e, "snapshot failed");
        },
    }
}

fn write_snapshot(
    path: &std::path::Path,
    catalog: &HashMap<String, Notification>,
) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut temp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    serde_json::to_writer(&mut temp, catalog)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use updraft_core::config::ServerConfig;
    use updraft_core::keys::generate_signing_key;
    use updraft_core::notification::DEFAULT_PIECE_LENGTH;
    use updraft_core::wire::TransactionId;

    fn test_config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig {
            address: "127.0.0.1:0".to_string(),
            snapshot_file: dir.path().join("server.json"),
            snapshot_interval: Duration::from_millis(50),
            ..ServerConfig::default()
        }
    }

    async fn bind_and_wait_reply(
        client: &UdpSocket,
        server: SocketAddr,
        password: &str,
        id: PeerId,
    ) -> wire::Message {
        let txid = TransactionId::random();
        let request = MessageBuilder::with_transaction_id(BINDING_REQUEST, txid)
            .username(&id)
            .xor_mapped_address(client.local_addr().unwrap())
            .swarm_ports(6881, 6881)
            .build(password);
        client.send_to(&request, server).await.unwrap();

        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .expect("no reply from server")
                .unwrap();
            let message = wire::validate(&buf[..n], password, None).unwrap();
            if message.message_type() == BINDING_SUCCESS && message.transaction_id() == txid {
                return message;
            }
        }
    }

    async fn recv_indication(client: &UdpSocket, password: &str) -> SessionTable {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .expect("no indication from server")
                .unwrap();
            let message = wire::validate(&buf[..n], password, None).unwrap();
            if message.message_type() == BINDING_INDICATION {
                return message.session_table().unwrap();
            }
        }
    }

    #[tokio::test]
    async fn binding_registers_and_reflects_the_external_address() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let config = test_config(&dir);
        let password = config.password.clone();
        let server = RendezvousServer::bind_with_key(config, key.verifying_key())
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerId::new([1; 6]);
        let reply =
            bind_and_wait_reply(&client, server.local_addr(), &password, peer).await;

        assert_eq!(
            reply.xor_mapped_address().unwrap(),
            client.local_addr().unwrap()
        );
        // Schema consistency: the reply carries an (empty) table.
        assert!(reply.session_table().unwrap().is_empty());

        let sessions = server.sessions();
        assert_eq!(sessions.len(), 1);
        let session = sessions.get(&peer).unwrap();
        assert_eq!(session.external, client.local_addr().unwrap());
        assert_eq!(session.swarm_external.port(), 6881);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn new_peers_are_advertised_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let config = test_config(&dir);
        let password = config.password.clone();
        let server = RendezvousServer::bind_with_key(config, key.verifying_key())
            .await
            .unwrap();

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let first_id = PeerId::new([1; 6]);
        bind_and_wait_reply(&first, server.local_addr(), &password, first_id).await;

        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second_id = PeerId::new([2; 6]);
        bind_and_wait_reply(&second, server.local_addr(), &password, second_id).await;

        // The existing peer hears about the newcomer...
        let delta = recv_indication(&first, &password).await;
        assert!(delta.get(&second_id).is_some());
        // ...and the newcomer is back-filled with the existing fleet.
        let backfill = recv_indication(&second, &password).await;
        assert!(backfill.get(&first_id).is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn rebinding_with_the_same_tuple_is_not_re_advertised() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let config = test_config(&dir);
        let password = config.password.clone();
        let server = RendezvousServer::bind_with_key(config, key.verifying_key())
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerId::new([1; 6]);
        bind_and_wait_reply(&client, server.local_addr(), &password, peer).await;
        // Keep-alive style rebinding: same tuple, table unchanged.
        bind_and_wait_reply(&client, server.local_addr(), &password, peer).await;
        assert_eq!(server.sessions().len(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn catalog_accepts_verifies_and_supersedes() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let config = test_config(&dir);
        let server = RendezvousServer::bind_with_key(config, key.verifying_key())
            .await
            .unwrap();
        let url = format!("http://{}/", server.local_addr());
        let client = reqwest::Client::new();

        let payload = dir.path().join("fw.img");
        std::fs::write(&payload, [1u8; 10_000]).unwrap();
        let v1 = Notification::for_file(
            &payload, "shell", 1, "https://t.example/a", DEFAULT_PIECE_LENGTH, &key,
        )
        .unwrap();
        let v2 = Notification::for_file(
            &payload, "shell", 2, "https://t.example/a", DEFAULT_PIECE_LENGTH, &key,
        )
        .unwrap();

        // Unsigned submissions bounce with 403, junk with 400.
        let mut unsigned = v1.clone();
        unsigned.signatures.clear();
        let status = client.post(&url).json(&unsigned).send().await.unwrap().status();
        assert_eq!(status, 403);
        let status = client
            .post(&url)
            .body("{not json")
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, 400);

        assert_eq!(client.post(&url).json(&v2).send().await.unwrap().status(), 200);
        // Older versions are accepted but do not replace.
        assert_eq!(client.post(&url).json(&v1).send().await.unwrap().status(), 200);

        let catalog: HashMap<String, Notification> =
            client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("shell").unwrap().version, 2);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let config = test_config(&dir);

        let payload = dir.path().join("fw.img");
        std::fs::write(&payload, [1u8; 10_000]).unwrap();
        let n = Notification::for_file(
            &payload, "shell", 7, "https://t.example/a", DEFAULT_PIECE_LENGTH, &key,
        )
        .unwrap();

        {
            let server = RendezvousServer::bind_with_key(config.clone(), key.verifying_key())
                .await
                .unwrap();
            let url = format!("http://{}/", server.local_addr());
            let client = reqwest::Client::new();
            assert_eq!(client.post(&url).json(&n).send().await.unwrap().status(), 200);

            // Outlive at least one snapshot tick.
            tokio::time::sleep(Duration::from_millis(300)).await;
            server.shutdown().await;
        }
        assert!(config.snapshot_file.exists());

        let server = RendezvousServer::bind_with_key(config, key.verifying_key())
            .await
            .unwrap();
        let url = format!("http://{}/", server.local_addr());
        let catalog: HashMap<String, Notification> = reqwest::Client::new()
            .get(&url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(catalog.get("shell").unwrap().version, 7);

        server.shutdown().await;
    }
}
