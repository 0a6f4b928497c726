//! Signature wrapper type

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Detached Ed25519 signature (64 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Signature(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != 64 {
            return Err(anyhow::anyhow!(
                "Invalid signature length: {} (expected 64)",
                bytes.len()
            ));
        }
        let mut sig = [0u8; 64];
        sig.copy_from_slice(bytes);
        Ok(Signature(sig))
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// All-zero placeholder used while computing the signing domain
    pub fn zeroed() -> Self {
        Signature([0u8; 64])
    }
}

// serde does not derive for [u8; 64]; persisted records carry signatures as
// raw byte strings.
impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <&[u8]>::deserialize(deserializer)?;
        Signature::try_from_slice(bytes).map_err(D::Error::custom)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
