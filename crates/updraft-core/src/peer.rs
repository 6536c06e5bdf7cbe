//! Peer identity and reachability model.
//!
//! A [`PeerId`] is a 6-byte opaque identifier derived from a stable
//! hardware attribute of the node (the first active interface's MAC
//! address, falling back to a digest of the machine id). Peers are
//! pseudonymous: identifiers are unique but not authenticated.
//!
//! A [`Session`] is one peer's reachability snapshot as observed by the
//! rendezvous server - external and internal address pairs for both the
//! overlay port and the swarm port. The [`SessionTable`] maps peer ids to
//! sessions and is the membership view exchanged between the rendezvous
//! server and overlay peers.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of bytes in a peer identifier.
pub const PEER_ID_LEN: usize = 6;

/// Errors from peer id and session handling.
#[derive(Debug, Error)]
pub enum PeerError {
    /// A peer id was not exactly [`PEER_ID_LEN`] bytes.
    #[error("peer id is {0} bytes, expected {PEER_ID_LEN}")]
    BadIdLength(usize),

    /// A peer id string was not valid lowercase hex.
    #[error("peer id is not valid hex: {0}")]
    BadIdHex(#[from] hex::FromHexError),

    /// No stable hardware attribute was found to derive an id from.
    #[error("no active network interface or machine id available")]
    NoStableIdentity,

    /// A session address string did not parse.
    #[error("bad session address {addr:?}: {source}")]
    BadAddress {
        /// The offending string.
        addr: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// Session-table encoding failed.
    #[error("session table encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Session-table decoding failed.
    #[error("session table decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// A 6-byte opaque peer identifier, printable as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wraps raw bytes as a peer id.
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Parses an id from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::BadIdLength`] unless the slice is exactly
    /// [`PEER_ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerError> {
        let arr: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| PeerError::BadIdLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Generates a random id. Used only when no stable hardware identity
    /// is available.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Derives the local peer id from a stable hardware attribute.
///
/// Tries, in order: the MAC address of the first non-loopback interface
/// that is up (read from `/sys/class/net`), then the SHA-256 digest of
/// `/etc/machine-id`.
///
/// # Errors
///
/// Returns [`PeerError::NoStableIdentity`] when neither source is
/// available.
pub fn local_peer_id() -> Result<PeerId, PeerError> {
    if let Some(id) = peer_id_from_sysfs(Path::new("/sys/class/net")) {
        return Ok(id);
    }
    if let Ok(machine_id) = std::fs::read(Path::new("/etc/machine-id")) {
        let digest = Sha256::digest(&machine_id);
        return PeerId::from_slice(&digest[..PEER_ID_LEN]);
    }
    Err(PeerError::NoStableIdentity)
}

fn peer_id_from_sysfs(net_dir: &Path) -> Option<PeerId> {
    let mut names: Vec<_> = std::fs::read_dir(net_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| n != "lo")
        .collect();
    names.sort();

    for name in names {
        let iface = net_dir.join(&name);
        // operstate is "up" for active interfaces; "unknown" is common for
        // virtual interfaces that are nonetheless carrying traffic.
        let state = std::fs::read_to_string(iface.join("operstate")).unwrap_or_default();
        if !matches!(state.trim(), "up" | "unknown") {
            continue;
        }
        let addr = std::fs::read_to_string(iface.join("address")).unwrap_or_default();
        let bytes = hex::decode(addr.trim().replace(':', "")).unwrap_or_default();
        if bytes.len() == PEER_ID_LEN && bytes.iter().any(|b| *b != 0) {
            return PeerId::from_slice(&bytes).ok();
        }
    }
    None
}

/// One peer's reachability snapshot: external and internal address pairs
/// for the overlay socket and the swarm socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Externally observed overlay address (server side of the NAT).
    pub external: SocketAddr,
    /// Internally bound overlay address (peer side of the NAT).
    pub internal: SocketAddr,
    /// Externally observed swarm address.
    pub swarm_external: SocketAddr,
    /// Internally bound swarm address.
    pub swarm_internal: SocketAddr,
}

impl Session {
    /// Returns the addresses in wire order:
    /// (external, internal, swarm-external, swarm-internal).
    pub const fn as_array(&self) -> [SocketAddr; 4] {
        [
            self.external,
            self.internal,
            self.swarm_external,
            self.swarm_internal,
        ]
    }
}

// On the wire (and in JSON views) a session is an array of exactly four
// "ip:port" strings in the order documented on the struct.
impl Serialize for Session {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let arr = self.as_array().map(|a| a.to_string());
        arr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Session {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let arr = <[String; 4]>::deserialize(deserializer)?;
        let mut addrs = [None; 4];
        for (slot, s) in addrs.iter_mut().zip(arr.iter()) {
            *slot = Some(s.parse::<SocketAddr>().map_err(D::Error::custom)?);
        }
        Ok(Self {
            external: addrs[0].expect("populated above"),
            internal: addrs[1].expect("populated above"),
            swarm_external: addrs[2].expect("populated above"),
            swarm_internal: addrs[3].expect("populated above"),
        })
    }
}

/// The membership view: peer id to session, at most one entry per peer.
///
/// Backed by a `BTreeMap` so that the MessagePack encoding is canonical -
/// applying the same delta twice yields byte-identical encodings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionTable(BTreeMap<PeerId, Session>);

impl SessionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table holding a single entry. Used for new-peer
    /// advertisements and per-entry table pushes.
    pub fn singleton(id: PeerId, session: Session) -> Self {
        let mut table = Self::new();
        table.insert(id, session);
        table
    }

    /// Upserts an entry. Returns `true` when the table changed (new peer
    /// or different session tuple).
    pub fn insert(&mut self, id: PeerId, session: Session) -> bool {
        match self.0.get(&id) {
            Some(existing) if *existing == session => false,
            _ => {
                self.0.insert(id, session);
                true
            },
        }
    }

    /// Merges `delta` into this table, overwriting entries by peer id.
    /// Entries are never deleted through this path.
    pub fn merge(&mut self, delta: &SessionTable) {
        for (id, session) in &delta.0 {
            self.0.insert(*id, *session);
        }
    }

    /// Removes an entry, returning it if present.
    pub fn remove(&mut self, id: &PeerId) -> Option<Session> {
        self.0.remove(id)
    }

    /// Looks up a peer's session.
    pub fn get(&self, id: &PeerId) -> Option<&Session> {
        self.0.get(id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in peer-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Session)> {
        self.0.iter()
    }

    /// Encodes the table as canonical MessagePack: a map of lowercase-hex
    /// peer ids to arrays of four `"ip:port"` strings.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Encode`] when serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, PeerError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decodes a table from its MessagePack form.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, PeerError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl<'a> IntoIterator for &'a SessionTable {
    type Item = (&'a PeerId, &'a Session);
    type IntoIter = std::collections::btree_map::Iter<'a, PeerId, Session>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
