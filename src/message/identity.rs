//! Signer identities and fixed-width byte newtypes
//!
//! An identity is the Ed25519 public key of the signer, written as lowercase
//! hex on every text boundary (JSON, config, registry snapshots).

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error parsing one of the hex-encoded newtypes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    Encoding(String),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], HexError> {
    let trimmed = s.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(trimmed).map_err(|e| HexError::Encoding(e.to_string()))?;
    bytes.as_slice().try_into().map_err(|_| HexError::Length {
        expected: N,
        actual: bytes.len(),
    })
}

macro_rules! hex_newtype {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = HexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Signer identity (Ed25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 32]);

hex_newtype!(Identity, 32);

impl Identity {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    pub fn from_signing_key(key: &SigningKey) -> Self {
        Self::from_verifying_key(&key.verifying_key())
    }

    /// Decode the identity as an Ed25519 verifying key.
    ///
    /// Fails for byte strings that are not a valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }
}

/// Detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 64]);

hex_newtype!(Signature, 64);

impl Signature {
    pub fn to_dalek(&self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

impl From<ed25519_dalek::Signature> for Signature {
    fn from(sig: ed25519_dalek::Signature) -> Self {
        Self(sig.to_bytes())
    }
}

/// SHA-256 content hash of a stored message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

hex_newtype!(ContentHash, 32);

impl ContentHash {
    /// Number of 4-bit digits in the hash.
    pub const NIBBLES: usize = 64;

    /// The `index`-th hex digit, most significant first.
    pub fn nibble(&self, index: usize) -> u8 {
        let byte = self.0[index / 2];
        if index % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0f
        }
    }
}

/// Digest of a trie node; the root one summarizes the whole leaf set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrieDigest([u8; 32]);

hex_newtype!(TrieDigest, 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse_accepts_prefix_and_case() {
        let lower = "ab".repeat(32);
        let upper = format!("0x{}", "AB".repeat(32));
        let a: Identity = lower.parse().unwrap();
        let b: Identity = upper.parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(b.to_string(), lower);
    }

    #[test]
    fn test_identity_wrong_length_rejected() {
        let err = "abcd".parse::<Identity>().unwrap_err();
        assert_eq!(err, HexError::Length { expected: 32, actual: 2 });
    }

    #[test]
    fn test_nibbles_most_significant_first() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xa7;
        let hash = ContentHash::from_bytes(bytes);
        assert_eq!(hash.nibble(0), 0xa);
        assert_eq!(hash.nibble(1), 0x7);
        assert_eq!(hash.nibble(2), 0x0);
    }

    #[test]
    fn test_identity_json_is_hex_string() {
        let id = Identity::from_bytes([1u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
