//! Page identifiers and their on-disk key encoding.
//!
//! Layout of an encoded key:
//!
//! ```text
//! +----------------+------------------------+-------------+
//! | version (8, BE)| owner hash (32)        | path (var)  |
//! +----------------+------------------------+-------------+
//! ```
//!
//! The version goes first and big-endian so that byte-wise comparison of two
//! keys sharing owner and path orders them by version. Range-oriented engines
//! then place neighbouring versions next to each other.

use bytes::Bytes;
use std::fmt;

/// Length of an owner hash in bytes
pub const OWNER_HASH_LEN: usize = 32;

/// Length of the encoded version prefix
pub const VERSION_LEN: usize = 8;

/// Marker written at the start of the owner hash for keys that must never exist
const MISS_MARKER: [u8; 4] = *b"MISS";

/// Fixed-length identifier of the logical owner of a page path
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OwnerHash([u8; OWNER_HASH_LEN]);

impl OwnerHash {
    /// All-zero hash used by every page the write generator produces
    pub const ZERO: OwnerHash = OwnerHash([0u8; OWNER_HASH_LEN]);

    /// Sentinel hash for miss-mode reads.
    ///
    /// Starts with `MISS`; the write path only ever stores [`OwnerHash::ZERO`],
    /// so any key carrying this hash is absent from the store.
    pub const MISS: OwnerHash = {
        let mut raw = [0u8; OWNER_HASH_LEN];
        raw[0] = MISS_MARKER[0];
        raw[1] = MISS_MARKER[1];
        raw[2] = MISS_MARKER[2];
        raw[3] = MISS_MARKER[3];
        OwnerHash(raw)
    };

    pub const fn new(raw: [u8; OWNER_HASH_LEN]) -> Self {
        Self(raw)
    }

    /// Build a hash from a shorter prefix, zero-padding the rest.
    ///
    /// Returns `None` if `prefix` is longer than [`OWNER_HASH_LEN`].
    pub fn from_prefix(prefix: &[u8]) -> Option<Self> {
        if prefix.len() > OWNER_HASH_LEN {
            return None;
        }
        let mut raw = [0u8; OWNER_HASH_LEN];
        raw[..prefix.len()].copy_from_slice(prefix);
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; OWNER_HASH_LEN] {
        &self.0
    }

    pub fn is_miss_sentinel(&self) -> bool {
        self.0[..MISS_MARKER.len()] == MISS_MARKER
    }
}

impl fmt::Debug for OwnerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerHash(")?;
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// Logical identifier of one page version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId {
    pub version: u64,
    pub owner: OwnerHash,
    pub path: Vec<u8>,
}

impl PageId {
    pub fn new(version: u64, owner: OwnerHash, path: Vec<u8>) -> Self {
        Self {
            version,
            owner,
            path,
        }
    }

    /// Identifier with zero owner and empty path, as produced by the write generator
    pub fn root(version: u64) -> Self {
        Self::new(version, OwnerHash::ZERO, Vec::new())
    }

    /// Encode into the store key layout
    pub fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.encoded_len());
        key.extend_from_slice(&self.version.to_be_bytes());
        key.extend_from_slice(self.owner.as_bytes());
        key.extend_from_slice(&self.path);
        key
    }

    pub fn encoded_len(&self) -> usize {
        VERSION_LEN + OWNER_HASH_LEN + self.path.len()
    }

    /// Inverse of [`PageId::encode`]; `None` if `key` is shorter than the fixed prefix.
    pub fn decode(key: &[u8]) -> Option<Self> {
        if key.len() < VERSION_LEN + OWNER_HASH_LEN {
            return None;
        }
        let (version, rest) = key.split_at(VERSION_LEN);
        let (owner, path) = rest.split_at(OWNER_HASH_LEN);

        let mut version_bytes = [0u8; VERSION_LEN];
        version_bytes.copy_from_slice(version);
        let mut owner_bytes = [0u8; OWNER_HASH_LEN];
        owner_bytes.copy_from_slice(owner);

        Some(Self {
            version: u64::from_be_bytes(version_bytes),
            owner: OwnerHash(owner_bytes),
            path: path.to_vec(),
        })
    }
}

/// Encode an optional identifier; an absent identifier has no key.
pub fn encode_key(id: Option<&PageId>) -> Option<Vec<u8>> {
    id.map(PageId::encode)
}

/// Opaque page payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData {
    pub raw: Bytes,
}

impl PageData {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
