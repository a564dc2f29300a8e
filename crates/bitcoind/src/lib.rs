//! # Ember Bitcoind Manager
//!
//! The upstream side of the indexer: a bounded pool of JSON-RPC clients
//! against a single bitcoind, with connection-lifecycle events the sync
//! controller gates on.
//!
//! ## Key pieces
//!
//! - **[`RpcTransport`]**: the request/reply contract. [`HttpTransport`] is
//!   the production implementation; tests plug in mocks.
//!
//! - **[`BitcoindMgr`]**: multiplexes requests over the transport, bounds
//!   concurrency to [`N_CLIENTS`], and broadcasts [`BitcoindEvent`]s
//!   (`FirstGoodConnection`, `AllConnectionsLost`, `InWarmUp`).
//!
//! - **[`ChainInfo`]**: the typed `getblockchaininfo` record with
//!   required/advisory field partitioning.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod chain_info;
mod error;
mod manager;
mod transport;

pub use chain_info::ChainInfo;
pub use error::{RpcError, RPC_IN_WARMUP};
pub use manager::{BitcoindConfig, BitcoindEvent, BitcoindMgr, N_CLIENTS};
pub use transport::{HttpTransport, RpcTransport};
