//! Header chain verifier.
//!
//! [`HeaderVerifier`] checks that each incoming header extends the chain it
//! has seen so far: heights are consecutive and the header's previous-block
//! field matches the hash of the last accepted header. The verifier is a
//! cheap-to-clone value type; callers snapshot it before a verify and assign
//! the snapshot back to undo a failed attempt, all under the storage lock
//! that hands it out.

use ember_types::{header_hash, prev_block_hash, RawHeader, HASH_SIZE};
use thiserror::Error;

/// A header that failed to extend the verified chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// The header arrived for a height other than the next expected one.
    #[error("expected header for height {expected}, got height {got}")]
    WrongHeight {
        /// Next height the verifier expects.
        expected: u32,
        /// Height the header was submitted for.
        got: u32,
    },

    /// The header's previous-block field does not match the last accepted
    /// header's hash.
    #[error("header at height {height} does not connect: expected prev {expected}, got {got}")]
    DoesNotConnect {
        /// Height of the offending header.
        height: u32,
        /// Hex of the expected previous-block hash (internal order).
        expected: String,
        /// Hex of the previous-block field found in the header.
        got: String,
    },
}

/// Incremental verifier over a header chain.
#[derive(Debug, Clone, Default)]
pub struct HeaderVerifier {
    next_height: u32,
    prev_hash: Option<[u8; HASH_SIZE]>,
    last: Option<(u32, RawHeader)>,
}

impl HeaderVerifier {
    /// A verifier for an empty chain, expecting height 0 first.
    pub fn new() -> Self {
        Self::default()
    }

    /// A verifier seeded from an existing tip.
    pub fn from_tip(height: u32, header: RawHeader) -> Self {
        Self {
            next_height: height + 1,
            prev_hash: Some(header_hash(&header)),
            last: Some((height, header)),
        }
    }

    /// The next height this verifier will accept.
    pub fn next_height(&self) -> u32 {
        self.next_height
    }

    /// Checks that `header` extends the chain at `height` and, on success,
    /// advances the verifier state.
    ///
    /// On failure the verifier is left untouched.
    pub fn verify(&mut self, height: u32, header: &RawHeader) -> Result<(), VerifyError> {
        if height != self.next_height {
            return Err(VerifyError::WrongHeight {
                expected: self.next_height,
                got: height,
            });
        }
        if let Some(prev) = self.prev_hash {
            let claimed = prev_block_hash(header);
            if claimed != prev {
                return Err(VerifyError::DoesNotConnect {
                    height,
                    expected: hex::encode(prev),
                    got: hex::encode(claimed),
                });
            }
        }
        self.prev_hash = Some(header_hash(header));
        self.last = Some((height, *header));
        self.next_height = height + 1;
        Ok(())
    }

    /// The last header this verifier accepted, with its height.
    pub fn last_header_processed(&self) -> Option<(u32, RawHeader)> {
        self.last
    }
}
