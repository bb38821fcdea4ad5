//! 32-byte identifiers used on the reconciliation boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid bytes32 `{input}`: {reason}")]
pub struct IdParseError {
    pub input: String,
    pub reason: String,
}

fn parse_bytes32(input: &str) -> Result<[u8; 32], IdParseError> {
    let cleaned = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(cleaned).map_err(|e| IdParseError {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| IdParseError {
        input: input.to_string(),
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}

macro_rules! bytes32_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
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

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_bytes32(s).map($name)
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

bytes32_id!(
    /// Identifier of one consensus request.
    RequestId
);

bytes32_id!(
    /// Key of a tradable pair, `keccak256(symbol)` of the upper-cased symbol.
    PairKey
);

impl PairKey {
    pub fn from_symbol(symbol: &str) -> Self {
        let digest = Keccak256::digest(symbol.trim().to_uppercase().as_bytes());
        PairKey(digest.into())
    }
}
