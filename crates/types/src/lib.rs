//! # Ember Core Types
//!
//! Shared primitives for the Ember header indexer:
//!
//! - **[`BlockHash`] / [`Txid`]**: 32-byte double-SHA-256 identifiers in the
//!   byte-reversed "display" order that bitcoind hex-encodes them in.
//!
//! - **[`RpcMsgId`]**: the constrained JSON-RPC message id (null, integer or
//!   string) with a total order and hashing across variants.
//!
//! - **[`PreProcessedBlock`]**: the light projection of a raw block that the
//!   sync pipeline consumes: the 80-byte header plus per-transaction input
//!   and output enumerations.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod block;
mod error;
mod hash;
mod rpc_id;

pub use block::{
    header_hash, prev_block_hash, InputRef, OutputRef, PreProcessedBlock, RawHeader, TxInfo,
    HEADER_SIZE,
};
pub use error::{Error, Result};
pub use hash::{sha256d, BlockHash, Txid, HASH_SIZE};
pub use rpc_id::RpcMsgId;
