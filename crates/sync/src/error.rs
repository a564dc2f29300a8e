//! Unrecoverable controller failures.

use thiserror::Error;

/// Conditions the controller cannot recover from.
///
/// These bypass the state machine: [`crate::Controller::run`] returns the
/// error and [`crate::Controller::startup`] terminates the process after
/// logging it. Nothing is written to storage on any of these paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// The daemon serves a different chain than the one recorded in storage.
    #[error(
        "bitcoind reports chain \"{daemon}\", which differs from our database: \"{db}\". \
         You may have connected to the wrong bitcoind. To fix this issue either connect \
         to a different bitcoind or delete the datadir to resynch."
    )]
    ChainMismatch {
        /// Chain recorded in storage.
        db: String,
        /// Chain the daemon reports.
        daemon: String,
    },

    /// Our stored tip is ahead of the daemon's.
    #[error(
        "we have height {local}, but bitcoind reports height {remote}. Possible reasons: \
         a massive reorg, your node is acting funny, or you are on the wrong chain. \
         Cowardly giving up and exiting"
    )]
    Regression {
        /// Locally stored tip height.
        local: i64,
        /// Tip height the daemon reports.
        remote: i64,
    },

    /// An internal invariant was violated; continuing would corrupt the index.
    #[error("internal error: {0}")]
    InternalInvariant(String),

    /// The client-facing server manager failed to bind/listen.
    #[error("server manager startup failed: {0}")]
    ServerStartup(String),
}
