//! Client-facing server lifecycle hook.
//!
//! The indexer defers listening for client connections until the chain is
//! known-good: the controller starts the attached server manager the first
//! time it reaches the up-to-date state. Everything else about the servers
//! is out of scope here.

use async_trait::async_trait;
use serde_json::Value;

/// Lifecycle hook for the client-facing servers.
#[async_trait]
pub trait ServerManager: Send + Sync {
    /// Binds and starts listening. Runs once, on the runtime the controller
    /// was created on. An error here is fatal to the process.
    async fn startup(&self) -> Result<(), String>;

    /// Point-in-time stats for the stats snapshot.
    fn stats(&self) -> Value {
        Value::Null
    }
}
