use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte content identifier computed as BLAKE2b-256 over a chunk's bytes.
///
/// Identical bytes always produce the identical id; distinct bytes collide
/// only with cryptographic improbability. Serialized as lowercase hex so
/// manifests stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    /// Digest `data` with the default algorithm (BLAKE2b-256).
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        ContentId(out)
    }

    /// Hex-encode the full id for use as a storage key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Parse a 64-char lowercase hex string back into an id.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid content id '{s}': {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("invalid content id '{s}': expected 32 bytes"))?;
        Ok(ContentId(bytes))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Digest function used to derive [`ContentId`]s.
///
/// Implementations must be pure: the same bytes always map to the same id.
/// The chunker and the blob stores only ever see ids, so the algorithm can
/// be upgraded behind this trait without touching their contracts.
pub trait ContentAddressor: Send + Sync {
    fn digest(&self, data: &[u8]) -> ContentId;
}

/// Default addressor: unkeyed BLAKE2b-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake2Addressor;

impl ContentAddressor for Blake2Addressor {
    fn digest(&self, data: &[u8]) -> ContentId {
        ContentId::compute(data)
    }
}
