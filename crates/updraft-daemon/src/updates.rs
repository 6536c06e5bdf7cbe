//! Update lifecycle management.
//!
//! The update manager owns the notification set: it verifies candidates,
//! supersedes older versions so each logical stream has at most one
//! active update, drives the swarm transfer, and re-multicasts accepted
//! notifications to keep the epidemic spreading.
//!
//! Candidates arrive from three paths that all funnel into
//! [`UpdateManager::ingest`]: local administrative submission (with a
//! source file), gossip datagrams read from the overlay, and the catalog
//! pull fallback. Per-uuid ordering holds because every lifecycle
//! transition happens under the manager's write lock, and the lock is
//! never held across network or disk I/O.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use updraft_core::automata::{Automata, Transition};
use updraft_core::notification::{Notification, NotificationError};

use crate::overlay::{OverlayConn, OverlayError};
use crate::swarm::{SwarmClient, SwarmError, SwarmTransfer};

/// Progress reporter cadence.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Transfer errors tolerated before a download falls back to `created`.
const DOWNLOAD_RETRY_BUDGET: u32 = 5;

/// Re-broadcast schedule after a local submission: once per minute, five
/// times, while the entry is still current.
const REBROADCAST_COUNT: u32 = 5;
const REBROADCAST_INTERVAL: Duration = Duration::from_secs(60);

/// Update lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum UpdateState {
    Deleted,
    Created,
    Downloading,
    DownloadError,
    Downloaded,
    Deploying,
    DeployError,
    Deployed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deleted => "deleted",
            Self::Created => "created",
            Self::Downloading => "downloading",
            Self::DownloadError => "downloadError",
            Self::Downloaded => "downloaded",
            Self::Deploying => "deploying",
            Self::DeployError => "deployError",
            Self::Deployed => "deployed",
        };
        f.write_str(name)
    }
}

/// Update lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum UpdateEvent {
    Create,
    Download,
    Stop,
    Error,
    Success,
    UnderLimit,
    OverLimit,
    Deploy,
    Delete,
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Download => "download",
            Self::Stop => "stop",
            Self::Error => "error",
            Self::Success => "success",
            Self::UnderLimit => "underLimit",
            Self::OverLimit => "overLimit",
            Self::Deploy => "deploy",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

fn lifecycle() -> Automata<UpdateState, UpdateEvent> {
    use UpdateEvent as E;
    use UpdateState as S;
    Automata::new(
        "update",
        S::Deleted,
        &[
            Transition { src: S::Deleted, event: E::Create, dest: S::Created },
            Transition { src: S::Created, event: E::Download, dest: S::Downloading },
            Transition { src: S::Created, event: E::Delete, dest: S::Deleted },
            Transition { src: S::Downloading, event: E::Stop, dest: S::Created },
            Transition { src: S::Downloading, event: E::Error, dest: S::DownloadError },
            Transition { src: S::Downloading, event: E::Success, dest: S::Downloaded },
            Transition { src: S::DownloadError, event: E::UnderLimit, dest: S::Downloading },
            Transition { src: S::DownloadError, event: E::OverLimit, dest: S::Created },
            Transition { src: S::Downloaded, event: E::Deploy, dest: S::Deploying },
            Transition { src: S::Downloaded, event: E::Delete, dest: S::Deleted },
            Transition { src: S::Deploying, event: E::Stop, dest: S::Downloaded },
            Transition { src: S::Deploying, event: E::Success, dest: S::Deployed },
            Transition { src: S::Deploying, event: E::Error, dest: S::DeployError },
            Transition { src: S::DeployError, event: E::UnderLimit, dest: S::Deploying },
            Transition { src: S::DeployError, event: E::OverLimit, dest: S::Downloaded },
            Transition { src: S::Deployed, event: E::Delete, dest: S::Deleted },
        ],
    )
}

/// Errors from the ingest path. The agent API maps these onto HTTP
/// statuses.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Signature verification failed (or the notification is unsigned).
    #[error("notification rejected: {0}")]
    Verification(#[source] NotificationError),

    /// The same (uuid, version) is already installed.
    #[error("update {uuid} version {version} already exists")]
    AlreadyExists {
        /// Stream id.
        uuid: String,
        /// Version already present.
        version: u64,
    },

    /// The candidate is older than the installed version.
    #[error("update {uuid} candidate {candidate} is older than installed {current}")]
    Older {
        /// Stream id.
        uuid: String,
        /// Candidate version.
        candidate: u64,
        /// Installed version.
        current: u64,
    },

    /// The uuid cannot name a metadata file.
    #[error("uuid {0:?} is not usable as an update id")]
    InvalidUuid(String),

    /// The payload name cannot name a file in the payload directory.
    #[error("payload name {0:?} is not usable as a file name")]
    InvalidName(String),

    /// Local submission named a source file that does not exist.
    #[error("source file {0} does not exist")]
    SourceMissing(String),

    /// Copying the local source into the payload directory failed.
    #[error("copying source into {dest}: {source}")]
    SourceCopyFailed {
        /// Destination path.
        dest: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The swarm adapter refused the payload descriptor.
    #[error(transparent)]
    Swarm(#[from] SwarmError),
}

/// Outbound gossip seam. The agent implements this with its overlay
/// connection; tests substitute a recorder.
#[async_trait]
pub trait Multicast: Send + Sync {
    /// Best-effort multicast of one payload to all known peers.
    async fn multicast(&self, payload: &[u8]) -> Result<usize, OverlayError>;
}

#[async_trait]
impl Multicast for OverlayConn {
    async fn multicast(&self, payload: &[u8]) -> Result<usize, OverlayError> {
        self.write(payload).await
    }
}

struct Update {
    notification: Notification,
    lifecycle: Automata<UpdateState, UpdateEvent>,
    transfer: Option<Arc<dyn SwarmTransfer>>,
    last_error: Option<String>,
}

/// Serializable snapshot of one update, as returned by the agent API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateView {
    /// The installed notification.
    pub notification: Notification,
    /// Current lifecycle state.
    pub state: String,
    /// Most recent transfer error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Owner of the notification set and the update lifecycle.
pub struct UpdateManager {
    updates: tokio::sync::RwLock<HashMap<String, Update>>,
    swarm: Arc<dyn SwarmClient>,
    multicast: Arc<dyn Multicast>,
    public_key: VerifyingKey,
    update_dir: PathBuf,
    notification_dir: PathBuf,
    closed: watch::Sender<bool>,
    reporters: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl UpdateManager {
    /// Creates a manager. `update_dir` receives payload files,
    /// `notification_dir` the bencoded metadata persisted per uuid.
    pub fn new(
        swarm: Arc<dyn SwarmClient>,
        multicast: Arc<dyn Multicast>,
        public_key: VerifyingKey,
        update_dir: PathBuf,
        notification_dir: PathBuf,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            updates: tokio::sync::RwLock::new(HashMap::new()),
            swarm,
            multicast,
            public_key,
            update_dir,
            notification_dir,
            closed,
            reporters: Mutex::new(Vec::new()),
        })
    }

    /// Ingests a candidate notification.
    ///
    /// Verification comes first, then the version gate under the write
    /// lock, then - for local submissions - the source copy, the swarm
    /// registration, metadata persistence, and one multicast. A
    /// superseded predecessor is stopped and deleted only once the
    /// candidate's source copy and swarm registration have succeeded.
    ///
    /// # Errors
    ///
    /// See [`IngestError`]; on any error the candidate is not installed
    /// and the previously installed version, if any, stays in place.
    pub async fn ingest(
        self: &Arc<Self>,
        notification: Notification,
        source: Option<&Path>,
    ) -> Result<(), IngestError> {
        notification
            .verify(&self.public_key)
            .map_err(IngestError::Verification)?;
        if !valid_path_component(&notification.uuid) {
            return Err(IngestError::InvalidUuid(notification.uuid));
        }
        if !valid_path_component(&notification.info.name) {
            return Err(IngestError::InvalidName(notification.info.name));
        }

        let uuid = notification.uuid.clone();
        let version = notification.version;

        let superseded = {
            let mut updates = self.updates.write().await;
            if let Some(existing) = updates.get(&uuid) {
                let current = existing.notification.version;
                if current > version {
                    return Err(IngestError::Older {
                        uuid,
                        candidate: version,
                        current,
                    });
                }
                if current == version {
                    return Err(IngestError::AlreadyExists { uuid, version });
                }
            }
            let staged = updates.remove(&uuid);
            let lifecycle = lifecycle();
            let _ = lifecycle.event(UpdateEvent::Create);
            updates.insert(
                uuid.clone(),
                Update {
                    notification: notification.clone(),
                    lifecycle,
                    transfer: None,
                    last_error: None,
                },
            );
            staged
        };

        if let Some(source) = source {
            if let Err(e) = self.copy_source(source, &notification).await {
                self.restore(&uuid, version, superseded).await;
                return Err(e);
            }
        }

        let transfer = match self
            .swarm
            .add(&notification.info, &notification.announce)
            .await
        {
            Ok(transfer) => transfer,
            Err(e) => {
                self.restore(&uuid, version, superseded).await;
                return Err(e.into());
            },
        };

        // The candidate is in place; only now is the predecessor safe to
        // stop and delete.
        if let Some(old) = superseded {
            info!(
                %uuid,
                old_version = old.notification.version,
                new_version = version,
                "superseding update"
            );
            self.retire(old).await;
        }
        {
            let mut updates = self.updates.write().await;
            if let Some(update) = updates.get_mut(&uuid) {
                if update.notification.version == version {
                    update.transfer = Some(transfer.clone());
                    let _ = update.lifecycle.event(UpdateEvent::Download);
                }
            }
        }
        self.spawn_reporter(uuid.clone(), version, transfer);

        self.persist(&notification).await;

        match notification.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.multicast.multicast(&bytes).await {
                    // Epidemic spread tolerates per-hop loss.
                    debug!(%uuid, version, error = %e, "multicast failed");
                }
            },
            Err(e) => warn!(%uuid, version, error = %e, "could not encode notification for gossip"),
        }

        info!(%uuid, version, "update ingested");
        Ok(())
    }

    async fn copy_source(
        &self,
        source: &Path,
        notification: &Notification,
    ) -> Result<(), IngestError> {
        if !source.exists() {
            return Err(IngestError::SourceMissing(source.display().to_string()));
        }
        let dest = self.update_dir.join(&notification.info.name);
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| IngestError::SourceCopyFailed {
                dest: dest.display().to_string(),
                source: e,
            })?;
        debug!(source = %source.display(), dest = %dest.display(), "source copied");
        Ok(())
    }

    /// Unwinds a failed ingest: drops the candidate entry and puts the
    /// staged predecessor back. A downloading predecessor whose reporter
    /// exited while the candidate briefly held the slot gets a fresh
    /// one. If a concurrent ingest replaced the candidate in the
    /// meantime, that ingest owns the slot and the held predecessor is
    /// retired instead.
    async fn restore(
        self: &Arc<Self>,
        uuid: &str,
        version: u64,
        predecessor: Option<Update>,
    ) {
        let mut respawn = None;
        let mut orphaned = None;
        {
            let mut updates = self.updates.write().await;
            let candidate_in_place = updates
                .get(uuid)
                .is_some_and(|u| u.notification.version == version);
            if !candidate_in_place {
                orphaned = predecessor;
            } else {
                updates.remove(uuid);
                if let Some(old) = predecessor {
                    if let (Some(transfer), UpdateState::Downloading) =
                        (&old.transfer, old.lifecycle.current())
                    {
                        respawn = Some((old.notification.version, transfer.clone()));
                    }
                    updates.insert(uuid.to_string(), old);
                }
            }
        }
        if let Some(old) = orphaned {
            self.retire(old).await;
        }
        if let Some((old_version, transfer)) = respawn {
            debug!(%uuid, version = old_version, "restored superseded update");
            self.spawn_reporter(uuid.to_string(), old_version, transfer);
        }
    }

    /// Stops a superseded or deleted update and removes its payload.
    async fn retire(&self, update: Update) {
        if let Some(transfer) = &update.transfer {
            transfer.stop().await;
        }
        let _ = update.lifecycle.event(UpdateEvent::Stop);
        let _ = update.lifecycle.event(UpdateEvent::Delete);
        let payload = self.update_dir.join(&update.notification.info.name);
        match tokio::fs::remove_file(&payload).await {
            Ok(()) => debug!(path = %payload.display(), "payload removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %payload.display(), error = %e, "failed removing payload"),
        }
    }

    /// Removes an update: stops its transfer, deletes payload and
    /// metadata. Returns whether an entry existed; deleting an unknown
    /// uuid is not an error.
    pub async fn delete(&self, uuid: &str) -> bool {
        let removed = self.updates.write().await.remove(uuid);
        let Some(update) = removed else {
            return false;
        };
        info!(%uuid, version = update.notification.version, "deleting update");
        self.retire(update).await;
        let metadata = self.notification_dir.join(uuid);
        match tokio::fs::remove_file(&metadata).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %metadata.display(), error = %e, "failed removing metadata"),
        }
        true
    }

    /// Known uuids, sorted.
    pub async fn list(&self) -> Vec<String> {
        let updates = self.updates.read().await;
        let mut uuids: Vec<String> = updates.keys().cloned().collect();
        uuids.sort();
        uuids
    }

    /// Snapshot of one update.
    pub async fn view(&self, uuid: &str) -> Option<UpdateView> {
        let updates = self.updates.read().await;
        updates.get(uuid).map(|update| UpdateView {
            notification: update.notification.clone(),
            state: update.lifecycle.current().to_string(),
            last_error: update.last_error.clone(),
        })
    }

    /// Forces a one-off re-multicast of an installed notification.
    /// Returns `None` for an unknown uuid.
    pub async fn rebroadcast(&self, uuid: &str) -> Option<()> {
        let bytes = {
            let updates = self.updates.read().await;
            updates.get(uuid)?.notification.to_bytes().ok()?
        };
        match self.multicast.multicast(&bytes).await {
            Ok(_) => debug!(%uuid, "re-broadcast sent"),
            Err(e) => debug!(%uuid, error = %e, "re-broadcast failed"),
        }
        Some(())
    }

    /// Schedules the post-submission re-broadcast: once per minute for
    /// five minutes, while the entry is still current.
    pub fn schedule_rebroadcast(self: &Arc<Self>, uuid: String, version: u64) {
        let manager = self.clone();
        let mut closed = self.closed.subscribe();
        tokio::spawn(async move {
            for _ in 0..REBROADCAST_COUNT {
                tokio::select! {
                    () = tokio::time::sleep(REBROADCAST_INTERVAL) => {},
                    _ = closed.changed() => break,
                }
                let bytes = {
                    let updates = manager.updates.read().await;
                    match updates.get(&uuid) {
                        Some(update) if update.notification.version == version => {
                            update.notification.to_bytes().ok()
                        },
                        _ => None,
                    }
                };
                let Some(bytes) = bytes else { break };
                if let Err(e) = manager.multicast.multicast(&bytes).await {
                    debug!(%uuid, version, error = %e, "scheduled re-broadcast failed");
                }
            }
        });
    }

    /// Fetches the rendezvous catalog and ingests every notification
    /// through the normal path. Returns how many were newly installed.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the catalog is unreachable or
    /// malformed; per-notification rejections are not errors.
    pub async fn pull_catalog(self: &Arc<Self>, url: &str) -> Result<usize, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let catalog: HashMap<String, Notification> = client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let total = catalog.len();
        let mut installed = 0usize;
        for (_, notification) in catalog {
            match self.ingest(notification, None).await {
                Ok(()) => installed += 1,
                Err(IngestError::AlreadyExists { .. } | IngestError::Older { .. }) => {},
                Err(e) => warn!(error = %e, "catalog entry rejected"),
            }
        }
        info!(total, installed, "catalog pull complete");
        Ok(installed)
    }

    /// Re-ingests every notification persisted in the metadata directory.
    /// Called once at agent startup.
    pub async fn load_persisted(self: &Arc<Self>) {
        let entries = match std::fs::read_dir(&self.notification_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.notification_dir.display(), error = %e, "cannot read metadata dir");
                return;
            },
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(bytes) = std::fs::read(&path) else {
                warn!(path = %path.display(), "unreadable metadata entry");
                continue;
            };
            match Notification::from_bytes(&bytes) {
                Ok(notification) => {
                    let uuid = notification.uuid.clone();
                    match self.ingest(notification, None).await {
                        Ok(()) => debug!(%uuid, "re-ingested persisted update"),
                        Err(e) => warn!(%uuid, error = %e, "persisted update rejected"),
                    }
                },
                Err(e) => warn!(path = %path.display(), error = %e, "bad metadata entry"),
            }
        }
    }

    async fn persist(&self, notification: &Notification) {
        let path = self.notification_dir.join(&notification.uuid);
        match notification.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    // In-memory state stays authoritative; the entry will
                    // be re-persisted the next time this uuid changes.
                    warn!(path = %path.display(), error = %e, "failed persisting notification");
                }
            },
            Err(e) => warn!(uuid = %notification.uuid, error = %e, "failed encoding notification"),
        }
    }

    fn spawn_reporter(
        self: &Arc<Self>,
        uuid: String,
        version: u64,
        transfer: Arc<dyn SwarmTransfer>,
    ) {
        let manager = self.clone();
        let mut closed = self.closed.subscribe();
        let handle = tokio::spawn(async move {
            let mut err_count = 0u32;
            loop {
                if *closed.borrow() {
                    break;
                }
                let state = {
                    let updates = manager.updates.read().await;
                    match updates.get(&uuid) {
                        Some(update) if update.notification.version == version => {
                            update.lifecycle.current()
                        },
                        _ => break,
                    }
                };
                if state != UpdateState::Downloading {
                    break;
                }

                if transfer.metadata_ready().await {
                    transfer.download_all().await;
                }
                match transfer.progress().await {
                    Ok(progress) => {
                        err_count = 0;
                        info!(
                            %uuid,
                            version,
                            completed = progress.completed,
                            missing = progress.missing,
                            "transfer progress"
                        );
                        if progress.missing == 0 {
                            let updates = manager.updates.write().await;
                            if let Some(update) = updates.get(&uuid) {
                                if update.notification.version == version {
                                    let _ = update.lifecycle.event(UpdateEvent::Success);
                                    info!(%uuid, version, "payload downloaded and verified");
                                }
                            }
                            break;
                        }
                    },
                    Err(e) => {
                        err_count += 1;
                        warn!(%uuid, version, error = %e, errors = err_count, "transfer error");
                        let mut updates = manager.updates.write().await;
                        if let Some(update) = updates.get_mut(&uuid) {
                            if update.notification.version == version {
                                update.last_error = Some(e.to_string());
                                let _ = update.lifecycle.event(UpdateEvent::Error);
                                if err_count >= DOWNLOAD_RETRY_BUDGET {
                                    let _ = update.lifecycle.event(UpdateEvent::OverLimit);
                                    break;
                                }
                                let _ = update.lifecycle.event(UpdateEvent::UnderLimit);
                            }
                        }
                    },
                }
                tokio::select! {
                    () = tokio::time::sleep(REPORT_INTERVAL) => {},
                    _ = closed.changed() => break,
                }
            }
        });
        self.reporters
            .lock()
            .expect("reporters lock poisoned")
            .push(handle);
    }

    /// Stops every transfer, signals the progress reporters, and waits
    /// for them to observe the terminal state and exit.
    pub async fn shutdown(&self) {
        let _ = self.closed.send(true);
        let transfers: Vec<Arc<dyn SwarmTransfer>> = {
            let updates = self.updates.read().await;
            updates.values().filter_map(|u| u.transfer.clone()).collect()
        };
        for transfer in transfers {
            transfer.stop().await;
        }
        let reporters: Vec<_> = {
            let mut reporters = self.reporters.lock().expect("reporters lock poisoned");
            reporters.drain(..).collect()
        };
        for reporter in reporters {
            let _ = reporter.await;
        }
    }
}

/// Uuids and payload names become file names; both must stay a single
/// path component.
fn valid_path_component(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 255
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::swarm::DiskSwarm;
    use updraft_core::keys::generate_signing_key;
    use updraft_core::notification::DEFAULT_PIECE_LENGTH;

    struct RecordingMulticast {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Multicast for RecordingMulticast {
        async fn multicast(&self, payload: &[u8]) -> Result<usize, OverlayError> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(payload.len())
        }
    }

    struct Fixture {
        _data: tempfile::TempDir,
        source_dir: tempfile::TempDir,
        manager: Arc<UpdateManager>,
        gossip: Arc<RecordingMulticast>,
        key: ed25519_dalek::SigningKey,
        update_dir: PathBuf,
        notification_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let update_dir = data.path().join("update");
        let notification_dir = data.path().join("notification");
        std::fs::create_dir_all(&update_dir).unwrap();
        std::fs::create_dir_all(&notification_dir).unwrap();

        let key = generate_signing_key();
        let gossip = Arc::new(RecordingMulticast {
            sent: Mutex::new(Vec::new()),
        });
        let manager = UpdateManager::new(
            Arc::new(DiskSwarm::new(&update_dir)),
            gossip.clone(),
            key.verifying_key(),
            update_dir.clone(),
            notification_dir.clone(),
        );
        Fixture {
            _data: data,
            source_dir: tempfile::tempdir().unwrap(),
            manager,
            gossip,
            key,
            update_dir,
            notification_dir,
        }
    }

    impl Fixture {
        fn notification(&self, uuid: &str, version: u64) -> (std::path::PathBuf, Notification) {
            let source = self.source_dir.path().join(format!("{uuid}-{version}.img"));
            std::fs::write(&source, vec![version as u8; 50_000]).unwrap();
            let n = Notification::for_file(
                &source,
                uuid,
                version,
                "https://tracker.example/announce",
                DEFAULT_PIECE_LENGTH,
                &self.key,
            )
            .unwrap();
            (source, n)
        }

        async fn wait_for_state(&self, uuid: &str, state: &str) {
            for _ in 0..100 {
                if let Some(view) = self.manager.view(uuid).await {
                    if view.state == state {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let seen = self.manager.view(uuid).await.map(|v| v.state);
            panic!("update {uuid} never reached {state}, last state {seen:?}");
        }
    }

    #[tokio::test]
    async fn local_submission_installs_downloads_and_multicasts() {
        let fx = fixture();
        let (source, n) = fx.notification("shell", 1);

        fx.manager.ingest(n.clone(), Some(&source)).await.unwrap();

        assert_eq!(fx.manager.list().await, vec!["shell".to_string()]);
        assert!(fx.update_dir.join(&n.info.name).exists());
        assert!(fx.notification_dir.join("shell").exists());

        // The copied payload verifies immediately, so the reporter moves
        // the update to downloaded.
        fx.wait_for_state("shell", "downloaded").await;

        let sent = fx.gossip.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let gossiped = Notification::from_bytes(&sent[0]).unwrap();
        assert_eq!(gossiped, n);
    }

    #[tokio::test]
    async fn versions_are_monotonic_with_at_most_one_active() {
        let fx = fixture();
        let (s2, n2) = fx.notification("shell", 2);
        fx.manager.ingest(n2.clone(), Some(&s2)).await.unwrap();

        let (_s1, n1) = fx.notification("shell", 1);
        assert!(matches!(
            fx.manager.ingest(n1, None).await,
            Err(IngestError::Older { current: 2, candidate: 1, .. })
        ));

        assert!(matches!(
            fx.manager.ingest(n2.clone(), None).await,
            Err(IngestError::AlreadyExists { version: 2, .. })
        ));

        let (s3, n3) = fx.notification("shell", 3);
        fx.manager.ingest(n3.clone(), Some(&s3)).await.unwrap();

        // Supersession: one entry, the newest version, old payload gone.
        assert_eq!(fx.manager.list().await.len(), 1);
        let view = fx.manager.view("shell").await.unwrap();
        assert_eq!(view.notification.version, 3);
        assert!(fx.update_dir.join(&n3.info.name).exists());
        assert!(!fx.update_dir.join(&n2.info.name).exists());
    }

    #[tokio::test]
    async fn tampered_notification_is_rejected() {
        let fx = fixture();
        let (_source, mut n) = fx.notification("shell", 1);
        n.version = 9;

        assert!(matches!(
            fx.manager.ingest(n, None).await,
            Err(IngestError::Verification(_))
        ));
        assert!(fx.manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn missing_source_rolls_the_entry_back() {
        let fx = fixture();
        let (source, n) = fx.notification("shell", 1);
        std::fs::remove_file(&source).unwrap();

        assert!(matches!(
            fx.manager.ingest(n, Some(&source)).await,
            Err(IngestError::SourceMissing(_))
        ));
        assert!(fx.manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn failed_newer_submission_leaves_the_installed_version_intact() {
        let fx = fixture();
        let (s1, n1) = fx.notification("shell", 1);
        fx.manager.ingest(n1.clone(), Some(&s1)).await.unwrap();
        fx.wait_for_state("shell", "downloaded").await;

        // A newer candidate whose source vanished must not disturb the
        // installed version.
        let (s2, n2) = fx.notification("shell", 2);
        std::fs::remove_file(&s2).unwrap();
        assert!(matches!(
            fx.manager.ingest(n2.clone(), Some(&s2)).await,
            Err(IngestError::SourceMissing(_))
        ));

        let view = fx.manager.view("shell").await.unwrap();
        assert_eq!(view.notification.version, 1);
        assert_eq!(view.state, "downloaded");
        assert!(fx.update_dir.join(&n1.info.name).exists());
        assert!(!fx.update_dir.join(&n2.info.name).exists());

        // The stream is still healthy: the same v2 with a readable
        // source supersedes normally afterwards.
        let (s2b, n2b) = fx.notification("shell", 2);
        fx.manager.ingest(n2b, Some(&s2b)).await.unwrap();
        assert_eq!(
            fx.manager.view("shell").await.unwrap().notification.version,
            2
        );
        assert!(!fx.update_dir.join(&n1.info.name).exists());
    }

    #[tokio::test]
    async fn hostile_uuid_is_rejected() {
        let fx = fixture();
        let source = fx.source_dir.path().join("payload.img");
        std::fs::write(&source, [1u8; 1024]).unwrap();
        let n = Notification::for_file(
            &source,
            "../escape",
            1,
            "https://tracker.example/announce",
            DEFAULT_PIECE_LENGTH,
            &fx.key,
        )
        .unwrap();

        assert!(matches!(
            fx.manager.ingest(n, None).await,
            Err(IngestError::InvalidUuid(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_files() {
        let fx = fixture();
        let (source, n) = fx.notification("shell", 1);
        fx.manager.ingest(n.clone(), Some(&source)).await.unwrap();
        assert!(fx.update_dir.join(&n.info.name).exists());

        assert!(fx.manager.delete("shell").await);
        assert!(!fx.update_dir.join(&n.info.name).exists());
        assert!(!fx.notification_dir.join("shell").exists());
        assert!(fx.manager.list().await.is_empty());

        // Second delete: nothing left, still not an error.
        assert!(!fx.manager.delete("shell").await);
    }

    #[tokio::test]
    async fn rebroadcast_repeats_the_notification() {
        let fx = fixture();
        let (source, n) = fx.notification("shell", 1);
        fx.manager.ingest(n, Some(&source)).await.unwrap();
        assert_eq!(fx.gossip.sent.lock().unwrap().len(), 1);

        assert!(fx.manager.rebroadcast("shell").await.is_some());
        assert_eq!(fx.gossip.sent.lock().unwrap().len(), 2);

        assert!(fx.manager.rebroadcast("unknown").await.is_none());
    }

    #[tokio::test]
    async fn persisted_updates_reload_through_the_normal_path() {
        let fx = fixture();
        let (source, n) = fx.notification("shell", 5);
        fx.manager.ingest(n, Some(&source)).await.unwrap();

        // A fresh manager over the same directories re-ingests on load.
        let gossip = Arc::new(RecordingMulticast {
            sent: Mutex::new(Vec::new()),
        });
        let reloaded = UpdateManager::new(
            Arc::new(DiskSwarm::new(&fx.update_dir)),
            gossip,
            fx.key.verifying_key(),
            fx.update_dir.clone(),
            fx.notification_dir.clone(),
        );
        reloaded.load_persisted().await;

        assert_eq!(reloaded.list().await, vec!["shell".to_string()]);
        assert_eq!(reloaded.view("shell").await.unwrap().notification.version, 5);
    }
}
