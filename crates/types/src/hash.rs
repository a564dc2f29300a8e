//! Double-SHA-256 hash types.
//!
//! Bitcoin-family chains identify blocks and transactions by the double
//! SHA-256 of their serialized form. bitcoind hex-encodes these digests in
//! byte-reversed ("display") order; [`BlockHash`] and [`Txid`] store exactly
//! the bytes that decode from that hex form, so a hash parsed from an RPC
//! response compares directly against [`BlockHash::hash_rev`] of raw data.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Size of a block or transaction hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Compute the double-SHA-256 of `data`.
///
/// The result is in internal byte order, the order hashes appear in wire
/// serializations such as a header's previous-block field.
pub fn sha256d(data: &[u8]) -> [u8; HASH_SIZE] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&second);
    out
}

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name([u8; HASH_SIZE]);

        impl $name {
            /// Creates a hash from a 32-byte array in display order.
            #[inline]
            pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
                Self(bytes)
            }

            /// Creates a hash from a slice, validating the width.
            pub fn from_slice(slice: &[u8]) -> Result<Self> {
                if slice.len() != HASH_SIZE {
                    return Err(Error::InvalidLength {
                        expected: HASH_SIZE,
                        actual: slice.len(),
                    });
                }
                let mut bytes = [0u8; HASH_SIZE];
                bytes.copy_from_slice(slice);
                Ok(Self(bytes))
            }

            /// Parses a hash from its hex form as bitcoind emits it.
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| Error::BadArgs(format!("invalid hex: {e}")))?;
                Self::from_slice(&bytes)
            }

            /// Double-SHA-256 of `data`, byte-reversed into display order.
            pub fn hash_rev(data: &[u8]) -> Self {
                let mut bytes = sha256d(data);
                bytes.reverse();
                Self(bytes)
            }

            /// The hash bytes in display order.
            #[inline]
            pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
                &self.0
            }

            /// The hash bytes in internal (wire) order.
            pub fn to_internal(&self) -> [u8; HASH_SIZE] {
                let mut bytes = self.0;
                bytes.reverse();
                bytes
            }

            /// Whether this is the all-zero hash.
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; HASH_SIZE]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

hash_newtype! {
    /// A block hash in display order.
    BlockHash
}

hash_newtype! {
    /// A transaction id in display order.
    Txid
}
