//! Signing-key storage.
//!
//! Update notifications are authenticated with a single Ed25519 keypair
//! held by the operator: agents and the rendezvous server are configured
//! with the verifying key, the submit tooling with the signing key. Keys
//! are stored as hex-encoded raw key files; signing keys are written with
//! 0600 permissions.

use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use thiserror::Error;

/// Errors from key file handling.
#[derive(Debug, Error)]
pub enum KeyError {
    /// I/O error reading or writing a key file.
    #[error("key file {path}: {source}")]
    Io {
        /// Path of the key file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Key file contents were not valid hex.
    #[error("key file {0} is not valid hex")]
    BadHex(String),

    /// Key material had the wrong length or was not a valid curve point.
    #[error("key file {0} does not hold a valid key")]
    BadKey(String),
}

fn io_err(path: &Path, source: std::io::Error) -> KeyError {
    KeyError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Generates a fresh Ed25519 signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Loads a signing key from a hex-encoded key file.
///
/// # Errors
///
/// Returns a [`KeyError`] when the file is unreadable or does not hold a
/// 32-byte hex-encoded secret key.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let bytes = hex::decode(text.trim()).map_err(|_| KeyError::BadHex(path.display().to_string()))?;
    let secret: [u8; SECRET_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| KeyError::BadKey(path.display().to_string()))?;
    Ok(SigningKey::from_bytes(&secret))
}

/// Loads a verifying key from a hex-encoded key file.
///
/// # Errors
///
/// Returns a [`KeyError`] when the file is unreadable or does not hold a
/// valid 32-byte public key.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, KeyError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let bytes = hex::decode(text.trim()).map_err(|_| KeyError::BadHex(path.display().to_string()))?;
    let public: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| KeyError::BadKey(path.display().to_string()))?;
    VerifyingKey::from_bytes(&public).map_err(|_| KeyError::BadKey(path.display().to_string()))
}

/// Writes a signing key (0600) and its verifying key (`<path>.pub`) as
/// hex-encoded key files.
///
/// # Errors
///
/// Returns a [`KeyError`] when either file cannot be written.
pub fn save_keypair(path: &Path, key: &SigningKey) -> Result<(), KeyError> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| io_err(path, e))?;
    file.write_all(hex::encode(key.to_bytes()).as_bytes())
        .map_err(|e| io_err(path, e))?;

    let pub_path = path.with_extension("pub");
    std::fs::write(&pub_path, hex::encode(key.verifying_key().to_bytes()))
        .map_err(|e| io_err(&pub_path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updraft.key");

        let key = generate_signing_key();
        save_keypair(&path, &key).unwrap();

        let loaded = load_signing_key(&path).unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());

        let public = load_verifying_key(&path.with_extension("pub")).unwrap();
        assert_eq!(public, key.verifying_key());
    }

    #[test]
    fn malformed_key_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");

        std::fs::write(&path, "not hex at all").unwrap();
        assert!(matches!(load_signing_key(&path), Err(KeyError::BadHex(_))));

        std::fs::write(&path, "aabb").unwrap();
        assert!(matches!(load_signing_key(&path), Err(KeyError::BadKey(_))));

        assert!(matches!(
            load_signing_key(&dir.path().join("missing.key")),
            Err(KeyError::Io { .. })
        ));
    }
}
