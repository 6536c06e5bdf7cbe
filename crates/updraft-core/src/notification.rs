//! Signed update notifications.
//!
//! A [`Notification`] describes one version of one logical update stream:
//! a content-addressed payload descriptor plus provenance, identified by
//! `(uuid, version)` and authenticated by a detached signature.
//!
//! Two equivalent representations exist. The canonical form - used for
//! gossip datagrams, on-disk metadata, and signing - is the bencoded
//! dictionary; the administrative form is its JSON transliteration. Field
//! names are fixed, lowercase, and hyphenated in both.
//!
//! Signing covers the SHA-256 digest of the canonical encoding with the
//! `signatures` field stripped, so any mutation outside `signatures`
//! invalidates the stored signature. Notifications are immutable once
//! signed.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name under which updraft records its signature.
pub const SIGNER_NAME: &str = "io.updraft";

/// `created-by` value stamped on locally built notifications.
pub const CREATED_BY: &str = "updraft";

/// Default payload piece length in bytes.
pub const DEFAULT_PIECE_LENGTH: u64 = 32 * 1024;

/// Length of one SHA-1 piece hash.
pub const PIECE_HASH_LEN: usize = 20;

/// Errors from building, encoding, and verifying notifications.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Bencode encoding or decoding failed.
    #[error("bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// Reading a payload file failed.
    #[error("payload file {path}: {source}")]
    PayloadIo {
        /// Path of the payload file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The notification carries no signature under [`SIGNER_NAME`].
    #[error("no signature by {SIGNER_NAME}")]
    MissingSignature,

    /// The stored signature bytes are not hex or not a valid signature.
    #[error("malformed signature record")]
    MalformedSignature,

    /// The signature did not verify under the configured public key.
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Content-addressed payload descriptor: enough for a swarm to fetch and
/// verify the payload piece by piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    /// Total payload length in bytes.
    pub length: u64,

    /// Payload file name within the data directory.
    pub name: String,

    /// Piece granularity in bytes.
    #[serde(rename = "piece-length")]
    pub piece_length: u64,

    /// Concatenated 20-byte SHA-1 piece hashes, hex-encoded.
    pub pieces: String,
}

impl PayloadInfo {
    /// Builds a descriptor by hashing `path` at `piece_length`
    /// granularity.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::PayloadIo`] when the file cannot be
    /// read.
    pub fn from_file(path: &Path, piece_length: u64) -> Result<Self, NotificationError> {
        let io = |source| NotificationError::PayloadIo {
            path: path.display().to_string(),
            source,
        };

        let mut file = std::fs::File::open(path).map_err(io)?;
        let mut pieces = String::new();
        let mut length = 0u64;
        let mut chunk = vec![0u8; piece_length as usize];
        loop {
            let mut filled = 0;
            while filled < chunk.len() {
                let n = file.read(&mut chunk[filled..]).map_err(io)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            length += filled as u64;
            pieces.push_str(&hex::encode(sha1::Sha1::digest(&chunk[..filled])));
            if filled < chunk.len() {
                break;
            }
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            length,
            name,
            piece_length,
            pieces,
        })
    }

    /// Number of pieces described.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / (PIECE_HASH_LEN * 2)
    }

    /// The SHA-1 hash of piece `index`, if in range and well-formed.
    pub fn piece_hash(&self, index: usize) -> Option<[u8; PIECE_HASH_LEN]> {
        let start = index * PIECE_HASH_LEN * 2;
        let end = start + PIECE_HASH_LEN * 2;
        let hex_hash = self.pieces.get(start..end)?;
        let bytes = hex::decode(hex_hash).ok()?;
        bytes.try_into().ok()
    }
}

/// One detached signature over the canonical notification form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Optional certificate chain, hex-encoded. Unused by updraft itself.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate: String,

    /// Optional human-readable signer info.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info: String,

    /// Hex-encoded Ed25519 signature over the SHA-256 digest of the
    /// canonical form.
    pub signature: String,
}

/// A signed, versioned update descriptor.
///
/// Fields are declared in sorted key order so the bencoded form is
/// canonical without a re-sort pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Tracker endpoint for the payload swarm.
    pub announce: String,

    /// Software that produced this notification.
    #[serde(rename = "created-by", default)]
    pub created_by: String,

    /// Creation time, Unix seconds.
    #[serde(rename = "creation-date", default)]
    pub creation_date: u64,

    /// Text encoding of string fields.
    #[serde(default)]
    pub encoding: String,

    /// Payload descriptor.
    pub info: PayloadInfo,

    /// Signer name to signature record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, SignatureRecord>,

    /// Logical update stream this notification belongs to.
    pub uuid: String,

    /// Monotonic version counter, Unix seconds by convention.
    pub version: u64,
}

impl Notification {
    /// Builds and signs a notification for the file at `path`.
    ///
    /// The payload name is prefixed with `{uuid}-v{version}-` so that
    /// versions of the same stream never collide in the data directory.
    ///
    /// # Errors
    ///
    /// Returns a [`NotificationError`] when the payload cannot be hashed
    /// or the canonical form cannot be encoded.
    pub fn for_file(
        path: &Path,
        uuid: &str,
        version: u64,
        tracker: &str,
        piece_length: u64,
        key: &SigningKey,
    ) -> Result<Self, NotificationError> {
        let mut info = PayloadInfo::from_file(path, piece_length)?;
        info.name = format!("{uuid}-v{version}-{}", info.name);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut notification = Self {
            announce: tracker.to_string(),
            created_by: CREATED_BY.to_string(),
            creation_date: now,
            encoding: "UTF-8".to_string(),
            info,
            signatures: BTreeMap::new(),
            uuid: uuid.to_string(),
            version,
        };
        notification.sign(key)?;
        Ok(notification)
    }

    /// Encodes the canonical (bencoded) form with `signatures` stripped.
    /// This is the exact byte sequence that signatures cover.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Bencode`] when encoding fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, NotificationError> {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        Ok(serde_bencode::to_bytes(&unsigned)?)
    }

    /// SHA-256 digest of the canonical form.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Bencode`] when encoding fails.
    pub fn digest(&self) -> Result<[u8; 32], NotificationError> {
        Ok(Sha256::digest(self.canonical_bytes()?).into())
    }

    /// Signs the notification, recording the signature under
    /// [`SIGNER_NAME`]. Any previous signatures are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Bencode`] when the canonical form
    /// cannot be encoded.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), NotificationError> {
        self.signatures.clear();
        let digest = self.digest()?;
        let signature = key.sign(&digest);
        self.signatures.insert(
            SIGNER_NAME.to_string(),
            SignatureRecord {
                certificate: String::new(),
                info: String::new(),
                signature: hex::encode(signature.to_bytes()),
            },
        );
        Ok(())
    }

    /// Verifies the signature recorded under [`SIGNER_NAME`].
    ///
    /// # Errors
    ///
    /// [`NotificationError::MissingSignature`] when no record exists,
    /// [`NotificationError::MalformedSignature`] when the record does not
    /// decode, and [`NotificationError::VerificationFailed`] when the
    /// signature does not verify.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), NotificationError> {
        let record = self
            .signatures
            .get(SIGNER_NAME)
            .ok_or(NotificationError::MissingSignature)?;
        let bytes =
            hex::decode(&record.signature).map_err(|_| NotificationError::MalformedSignature)?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|_| NotificationError::MalformedSignature)?;
        let digest = self.digest()?;
        key.verify_strict(&digest, &signature)
            .map_err(|_| NotificationError::VerificationFailed)
    }

    /// Encodes the full notification (signatures included) in the
    /// canonical bencoded form used on the gossip path and on disk.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Bencode`] when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NotificationError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    /// Decodes a notification from its bencoded form.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Bencode`] on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NotificationError> {
        Ok(serde_bencode::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::keys::generate_signing_key;

    fn payload_file(dir: &tempfile::TempDir, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("firmware.img");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn sample(key: &SigningKey) -> (tempfile::TempDir, Notification) {
        let dir = tempfile::tempdir().unwrap();
        let path = payload_file(&dir, &[0xabu8; 100_000]);
        let n = Notification::for_file(&path, "shell", 1_700_000_000, "https://tracker.example:443/announce", DEFAULT_PIECE_LENGTH, key)
            .unwrap();
        (dir, n)
    }

    #[test]
    fn payload_info_hashes_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = payload_file(&dir, &[7u8; 70_000]);
        let info = PayloadInfo::from_file(&path, DEFAULT_PIECE_LENGTH).unwrap();

        assert_eq!(info.length, 70_000);
        // 70000 bytes at 32 KiB pieces: two full pieces plus a tail.
        assert_eq!(info.piece_count(), 3);
        assert!(info.piece_hash(2).is_some());
        assert!(info.piece_hash(3).is_none());

        // The tail piece hashes only the remaining bytes.
        let tail_len = 70_000 - 2 * DEFAULT_PIECE_LENGTH as usize;
        let expected: [u8; PIECE_HASH_LEN] = sha1::Sha1::digest(vec![7u8; tail_len]).into();
        assert_eq!(info.piece_hash(2).unwrap(), expected);
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);
        n.verify(&key.verifying_key()).unwrap();
    }

    #[test]
    fn mutating_any_field_outside_signatures_breaks_verification() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);
        let public = key.verifying_key();

        let mut bumped = n.clone();
        bumped.version += 1;
        assert!(matches!(
            bumped.verify(&public),
            Err(NotificationError::VerificationFailed)
        ));

        let mut renamed = n.clone();
        renamed.info.name.push('x');
        assert!(matches!(
            renamed.verify(&public),
            Err(NotificationError::VerificationFailed)
        ));

        let mut retracked = n;
        retracked.announce = "https://other.example/announce".to_string();
        assert!(matches!(
            retracked.verify(&public),
            Err(NotificationError::VerificationFailed)
        ));
    }

    #[test]
    fn verification_under_wrong_key_fails() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);
        let other = generate_signing_key();
        assert!(matches!(
            n.verify(&other.verifying_key()),
            Err(NotificationError::VerificationFailed)
        ));
    }

    #[test]
    fn unsigned_notification_is_rejected() {
        let key = generate_signing_key();
        let (_dir, mut n) = sample(&key);
        n.signatures.clear();
        assert!(matches!(
            n.verify(&key.verifying_key()),
            Err(NotificationError::MissingSignature)
        ));
    }

    #[test]
    fn bencode_round_trip_preserves_signature_validity() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);

        let bytes = n.to_bytes().unwrap();
        let decoded = Notification::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, n);
        decoded.verify(&key.verifying_key()).unwrap();
    }

    #[test]
    fn json_form_carries_the_same_schema() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);

        let json = serde_json::to_value(&n).unwrap();
        assert!(json.get("creation-date").is_some());
        assert!(json.get("info").unwrap().get("piece-length").is_some());

        let back: Notification = serde_json::from_value(json).unwrap();
        back.verify(&key.verifying_key()).unwrap();
    }

    #[test]
    fn canonical_bytes_strip_signatures() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);
        let canonical = n.canonical_bytes().unwrap();
        assert!(!String::from_utf8_lossy(&canonical).contains("signatures"));

        let mut unsigned = n.clone();
        unsigned.signatures.clear();
        assert_eq!(unsigned.canonical_bytes().unwrap(), canonical);
        // The canonical form is stable across clones of the same payload.
        assert_eq!(n.canonical_bytes().unwrap(), canonical);
    }

    #[test]
    fn payload_name_is_versioned() {
        let key = generate_signing_key();
        let (_dir, n) = sample(&key);
        assert!(n.info.name.starts_with("shell-v1700000000-"));
    }
}
