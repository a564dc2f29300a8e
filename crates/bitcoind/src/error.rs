//! Errors surfaced by the bitcoind RPC layer.

use thiserror::Error;

/// JSON-RPC error code bitcoind returns while it is still warming up.
pub const RPC_IN_WARMUP: i64 = -28;

/// Errors from talking to bitcoind.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The transport could not deliver the request or receive a reply
    /// (connection refused, timeout, broken pipe).
    #[error("transport failure: {0}")]
    Transport(String),

    /// bitcoind answered with an error object.
    #[error("rpc error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// bitcoind is up but still warming up (error code −28).
    #[error("bitcoind is warming up: {0}")]
    WarmingUp(String),

    /// The reply arrived but does not have the shape we expect.
    #[error("malformed response: {0}")]
    BadResponse(String),
}

impl RpcError {
    /// Classifies a JSON-RPC error object.
    pub fn from_error_object(code: i64, message: String) -> Self {
        if code == RPC_IN_WARMUP {
            Self::WarmingUp(message)
        } else {
            Self::Server { code, message }
        }
    }
}
