//! The agent: one node of the update fleet.
//!
//! The agent is the sole owner of the overlay connection, the update
//! manager, and the administration API; everything else holds interface
//! handles. It wires the three notification entry paths together:
//!
//! 1. gossip datagrams read from the overlay,
//! 2. local submissions through the Unix-socket API,
//! 3. the catalog pull fallback, used at startup and whenever the
//!    overlay has been out of its serving state for too long.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use updraft_core::config::AgentConfig;
use updraft_core::keys::{load_verifying_key, KeyError};
use updraft_core::notification::Notification;
use updraft_core::peer::{local_peer_id, PeerId};

use crate::api::{self, ApiContext};
use crate::overlay::{OverlayConn, OverlayError};
use crate::swarm::DiskSwarm;
use crate::updates::{IngestError, UpdateManager};

/// Cadence of the overlay-stall check feeding the pull fallback.
const PULL_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors from agent startup.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The verifying key could not be loaded.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The overlay connection could not be opened.
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// Data directories or the API socket could not be set up.
    #[error("agent setup: {0}")]
    Io(#[from] std::io::Error),
}

/// A running agent.
pub struct Agent {
    config: AgentConfig,
    overlay: Arc<OverlayConn>,
    manager: Arc<UpdateManager>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Agent {
    /// Starts an agent: opens the overlay, re-ingests persisted
    /// notifications, and spawns the gossip reader, the pull-fallback
    /// loop, and the API server.
    ///
    /// # Errors
    ///
    /// Fails when the verifying key is unusable, the data directories
    /// cannot be created, or the API socket cannot be bound.
    pub async fn start(config: AgentConfig) -> Result<Self, AgentError> {
        let public_key = load_verifying_key(&config.public_key_file)?;
        std::fs::create_dir_all(config.update_dir())?;
        std::fs::create_dir_all(config.notification_dir())?;

        let id = match &config.overlay.peer_id {
            Some(fixed) => fixed
                .parse::<PeerId>()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?,
            None => local_peer_id().unwrap_or_else(|e| {
                warn!(error = %e, "no stable identity, using a random peer id");
                PeerId::random()
            }),
        };
        info!(peer = %id, server = %config.overlay.server, "starting agent");

        let overlay = OverlayConn::open(id, config.overlay.clone()).await?;
        let manager = UpdateManager::new(
            Arc::new(DiskSwarm::new(config.update_dir())),
            overlay.clone(),
            public_key,
            config.update_dir(),
            config.notification_dir(),
        );
        manager.load_persisted().await;

        // A stale socket from an unclean exit would fail the bind.
        match std::fs::remove_file(&config.api.socket) {
            Ok(()) => debug!(socket = %config.api.socket.display(), "removed stale api socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        let listener = tokio::net::UnixListener::bind(&config.api.socket)?;
        info!(socket = %config.api.socket.display(), "api listening");

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::new();

        let ctx = Arc::new(ApiContext {
            manager: manager.clone(),
            overlay: overlay.clone(),
            config: config.clone(),
        });
        tasks.push(tokio::spawn(api::serve(ctx, listener, shutdown.subscribe())));
        tasks.push(tokio::spawn(gossip_reader(
            overlay.clone(),
            manager.clone(),
            shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(pull_loop(
            config.clone(),
            overlay.clone(),
            manager.clone(),
            shutdown.subscribe(),
        )));

        Ok(Self {
            config,
            overlay,
            manager,
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    /// The agent's update manager.
    pub fn manager(&self) -> &Arc<UpdateManager> {
        &self.manager
    }

    /// The agent's overlay connection.
    pub fn overlay(&self) -> &Arc<OverlayConn> {
        &self.overlay
    }

    /// Drains the agent: stop accepting submissions, stop transfers,
    /// close the overlay, and remove the API socket file.
    pub async fn shutdown(&self) {
        info!("agent shutting down");
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.manager.shutdown().await;
        self.overlay.close().await;
        if let Err(e) = std::fs::remove_file(&self.config.api.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed removing api socket");
            }
        }
        info!("agent stopped");
    }
}

/// Blocks on the overlay and funnels every readable payload into the
/// ingest path. Not every gossip datagram is an update; decode failures
/// are logged and dropped.
async fn gossip_reader(
    overlay: Arc<OverlayConn>,
    manager: Arc<UpdateManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !overlay.is_ready() {
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                _ = shutdown.changed() => break,
            }
        }
        let payload = tokio::select! {
            p = overlay.read_msg() => p,
            _ = shutdown.changed() => break,
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(OverlayError::NotReady) => continue,
            Err(OverlayError::Closed) => break,
            Err(e) => {
                warn!(error = %e, "gossip read failed");
                continue;
            },
        };
        let notification = match Notification::from_bytes(&payload) {
            Ok(notification) => notification,
            Err(e) => {
                debug!(error = %e, len = payload.len(), "gossip payload is not an update");
                continue;
            },
        };
        let uuid = notification.uuid.clone();
        let version = notification.version;
        match manager.ingest(notification, None).await {
            Ok(()) => info!(%uuid, version, "update received over gossip"),
            Err(IngestError::AlreadyExists { .. } | IngestError::Older { .. }) => {
                debug!(%uuid, version, "ignoring stale gossip");
            },
            Err(e) => warn!(%uuid, version, error = %e, "gossip update rejected"),
        }
    }
}

/// Catalog pull fallback: once at startup, then whenever the overlay has
/// been out of its serving state for longer than the configured stall
/// window. Restores liveness when UDP is blocked.
async fn pull_loop(
    config: AgentConfig,
    overlay: Arc<OverlayConn>,
    manager: Arc<UpdateManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = format!("http://{}/", config.overlay.server);

    match manager.pull_catalog(&url).await {
        Ok(installed) => info!(installed, "startup catalog pull complete"),
        Err(e) => debug!(error = %e, "startup catalog pull failed"),
    }

    loop {
        tokio::select! {
            () = tokio::time::sleep(PULL_CHECK_INTERVAL) => {},
            _ = shutdown.changed() => break,
        }
        if overlay.idle_for() < config.pull_after {
            continue;
        }
        info!(idle = ?overlay.idle_for(), "overlay stalled, pulling catalog");
        match manager.pull_catalog(&url).await {
            Ok(installed) => info!(installed, "catalog pull complete"),
            Err(e) => warn!(error = %e, "catalog pull failed"),
        }
    }
}
