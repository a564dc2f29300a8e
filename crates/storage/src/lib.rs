//! # Ember Header Storage
//!
//! Local persistence for the header chain the indexer builds:
//!
//! - **[`Storage`]**: the header vector behind a read-write lock, the chain
//!   name, and an asynchronous save queue flushing to flat files.
//!
//! - **[`HeaderVerifier`]**: the shared chain verifier handed out under the
//!   storage lock. It is a value type: clone it to snapshot, assign the
//!   clone back to undo a failed verification.
//!
//! The two locks ([`Storage::header_verifier`] and
//! [`Storage::mutable_headers`]) are always taken sequentially by consumers,
//! never nested.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod headers;
mod verifier;

pub use headers::{SaveItem, Storage, StorageConfig, StorageError};
pub use verifier::{HeaderVerifier, VerifyError};
