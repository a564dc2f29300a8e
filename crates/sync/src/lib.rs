//! # Ember Sync Controller
//!
//! The synchronization core of the Ember indexer. The [`Controller`] drives
//! a state machine that:
//!
//! 1. waits for the upstream bitcoind to become reachable,
//! 2. probes `getblockchaininfo` to discover the remote tip,
//! 3. fans out stride-partitioned download tasks across the bounded RPC
//!    client pool,
//! 4. reassembles out-of-order deliveries into strictly ascending height
//!    order,
//! 5. verifies each header against the shared chain verifier and appends it
//!    to storage, and
//! 6. loops back to the probe (or arms the poll timer) to follow the tip.
//!
//! All controller state is confined to a single message loop; tasks and
//! timers communicate with it only by posting messages. Failures collapse a
//! run into a retried poll; the conditions in [`FatalError`] terminate the
//! process.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod controller;
mod error;
mod server;
mod state;
mod stats;
mod task;

pub use controller::{Controller, ControllerHandle, SyncConfig, SyncEvent};
pub use error::FatalError;
pub use server::ServerManager;
pub use state::{default_dl_concurrency, StateMachine, SyncState};
