//! Swarm adapter.
//!
//! The content-addressed transfer engine is an external collaborator; the
//! update manager only consumes the small surface defined here: register a
//! payload descriptor, observe progress, request all pieces, stop.
//!
//! [`DiskSwarm`] is the built-in implementation backing that surface with
//! the agent's payload directory: it verifies the payload piece by piece
//! against the descriptor's SHA-1 hashes. Locally submitted payloads are
//! complete as soon as the source copy lands; payloads provisioned by an
//! out-of-band transfer become complete once every piece verifies.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha1::Digest as _;
use thiserror::Error;
use updraft_core::notification::PayloadInfo;

/// Errors from the swarm adapter.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Payload file I/O failed in a way that is not "not there yet".
    #[error("payload {path}: {source}")]
    Io {
        /// Payload path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Progress snapshot of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmProgress {
    /// Bytes present and piece-verified.
    pub completed: u64,
    /// Bytes still missing or failing verification.
    pub missing: u64,
}

/// Handle to one in-flight payload transfer.
#[async_trait]
pub trait SwarmTransfer: Send + Sync {
    /// Current verified/missing byte counts.
    async fn progress(&self) -> Result<SwarmProgress, SwarmError>;

    /// True once the payload metadata is fully known and pieces can be
    /// requested.
    async fn metadata_ready(&self) -> bool;

    /// Requests every missing piece.
    async fn download_all(&self);

    /// Stops the transfer. Idempotent.
    async fn stop(&self);
}

/// The client surface the update manager drives.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Registers a payload descriptor and returns its transfer handle.
    async fn add(
        &self,
        info: &PayloadInfo,
        announce: &str,
    ) -> Result<Arc<dyn SwarmTransfer>, SwarmError>;
}

/// Disk-backed swarm implementation rooted at the payload directory.
#[derive(Debug, Clone)]
pub struct DiskSwarm {
    root: PathBuf,
}

impl DiskSwarm {
    /// Creates a swarm client storing payloads under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SwarmClient for DiskSwarm {
    async fn add(
        &self,
        info: &PayloadInfo,
        announce: &str,
    ) -> Result<Arc<dyn SwarmTransfer>, SwarmError> {
        tracing::debug!(name = %info.name, announce, "registering payload with disk swarm");
        Ok(Arc::new(DiskTransfer {
            path: self.root.join(&info.name),
            info: info.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct DiskTransfer {
    path: PathBuf,
    info: PayloadInfo,
    stopped: AtomicBool,
}

#[async_trait]
impl SwarmTransfer for DiskTransfer {
    async fn progress(&self) -> Result<SwarmProgress, SwarmError> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(SwarmProgress {
                completed: 0,
                missing: self.info.length,
            });
        }
        let path = self.path.clone();
        let info = self.info.clone();
        tokio::task::spawn_blocking(move || verified_bytes(&path, &info))
            .await
            .expect("piece verification task panicked")
    }

    async fn metadata_ready(&self) -> bool {
        // The descriptor itself carries the full metadata; a disk-backed
        // transfer is always ready to be asked for pieces.
        !self.stopped.load(Ordering::Acquire)
    }

    async fn download_all(&self) {
        // Pieces arrive out of band (local copy or external transfer);
        // there is nothing to request from the local disk.
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Walks the payload once, counting the bytes of every piece whose SHA-1
/// hash matches the descriptor.
fn verified_bytes(path: &Path, info: &PayloadInfo) -> Result<SwarmProgress, SwarmError> {
    use std::io::Read;

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SwarmProgress {
                completed: 0,
                missing: info.length,
            });
        },
        Err(source) => {
            return Err(SwarmError::Io {
                path: path.display().to_string(),
                source,
            });
        },
    };

    let piece_length = info.piece_length as usize;
    let mut chunk = vec![0u8; piece_length];
    let mut completed = 0u64;
    for index in 0..info.piece_count() {
        let mut filled = 0;
        loop {
            let n = file.read(&mut chunk[filled..]).map_err(|source| SwarmError::Io {
                path: path.display().to_string(),
                source,
            })?;
            if n == 0 {
                break;
            }
            filled += n;
            if filled == chunk.len() {
                break;
            }
        }
        if filled == 0 {
            break;
        }
        let expected_len = expected_piece_len(info, index);
        if filled as u64 == expected_len {
            let digest: [u8; 20] = sha1::Sha1::digest(&chunk[..filled]).into();
            if info.piece_hash(index) == Some(digest) {
                completed += expected_len;
            }
        }
        if filled < chunk.len() {
            break;
        }
    }

    Ok(SwarmProgress {
        completed,
        missing: info.length.saturating_sub(completed),
    })
}

fn expected_piece_len(info: &PayloadInfo, index: usize) -> u64 {
    let start = index as u64 * info.piece_length;
    info.piece_length.min(info.length.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use updraft_core::notification::DEFAULT_PIECE_LENGTH;

    async fn fixture(contents: &[u8]) -> (tempfile::TempDir, PayloadInfo, Arc<dyn SwarmTransfer>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.img");
        std::fs::write(&path, contents).unwrap();
        let info = PayloadInfo::from_file(&path, DEFAULT_PIECE_LENGTH).unwrap();

        let swarm = DiskSwarm::new(dir.path());
        let transfer = swarm.add(&info, "https://tracker.example/announce").await.unwrap();
        (dir, info, transfer)
    }

    #[tokio::test]
    async fn complete_payload_reports_no_missing_bytes() {
        let (_dir, info, transfer) = fixture(&[3u8; 100_000]).await;
        assert!(transfer.metadata_ready().await);
        let progress = transfer.progress().await.unwrap();
        assert_eq!(progress.completed, info.length);
        assert_eq!(progress.missing, 0);
    }

    #[tokio::test]
    async fn absent_payload_is_fully_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.img");
        std::fs::write(&path, [9u8; 50_000]).unwrap();
        let info = PayloadInfo::from_file(&path, DEFAULT_PIECE_LENGTH).unwrap();
        std::fs::remove_file(&path).unwrap();

        let transfer = DiskSwarm::new(dir.path())
            .add(&info, "")
            .await
            .unwrap();
        let progress = transfer.progress().await.unwrap();
        assert_eq!(progress.completed, 0);
        assert_eq!(progress.missing, info.length);
    }

    #[tokio::test]
    async fn corrupted_piece_does_not_count() {
        let (dir, info, transfer) = fixture(&[5u8; 100_000]).await;

        // Corrupt one byte inside the second piece.
        let path = dir.path().join("fw.img");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[DEFAULT_PIECE_LENGTH as usize + 10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let progress = transfer.progress().await.unwrap();
        assert_eq!(progress.completed, info.length - DEFAULT_PIECE_LENGTH);
        assert_eq!(progress.missing, DEFAULT_PIECE_LENGTH);
    }

    #[tokio::test]
    async fn stopped_transfer_reports_nothing() {
        let (_dir, info, transfer) = fixture(&[1u8; 10_000]).await;
        transfer.stop().await;
        assert!(!transfer.metadata_ready().await);
        let progress = transfer.progress().await.unwrap();
        assert_eq!(progress.missing, info.length);
    }
}
