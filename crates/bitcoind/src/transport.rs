//! RPC transport contract and the HTTP implementation.
//!
//! The sync core only ever sees [`RpcTransport`]: one request in, one reply
//! (or one error) out, correlated by the message id. [`HttpTransport`] is
//! the production implementation speaking bitcoind's HTTP JSON-RPC with
//! basic auth; tests substitute their own transports.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::trace;

use ember_types::RpcMsgId;

use crate::error::RpcError;

/// One-shot JSON-RPC request/reply transport.
///
/// Every submission resolves to exactly one of three outcomes: a reply
/// value, a server error object ([`RpcError::Server`] /
/// [`RpcError::WarmingUp`]), or a transport failure
/// ([`RpcError::Transport`]).
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Sends `method(params)` tagged with `id` and waits for the correlated
    /// reply.
    async fn send_request(
        &self,
        id: RpcMsgId,
        method: &str,
        params: &[Value],
    ) -> Result<Value, RpcError>;
}

/// HTTP JSON-RPC transport for bitcoind.
pub struct HttpTransport {
    url: String,
    auth: Option<(String, String)>,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport for the given `http://host:port` endpoint.
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            auth: None,
            client,
        })
    }

    /// Attaches basic-auth credentials (bitcoind's rpcuser/rpcpassword).
    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send_request(
        &self,
        id: RpcMsgId,
        method: &str,
        params: &[Value],
    ) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_value(),
            "method": method,
            "params": params,
        });
        trace!(%id, method, "rpc request");

        let mut req = self.client.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let reply: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // correlate: the reply must echo our id
        let reply_id = RpcMsgId::from_value(reply.get("id").unwrap_or(&Value::Null))
            .map_err(|e| RpcError::BadResponse(e.to_string()))?;
        if reply_id != id {
            return Err(RpcError::BadResponse(format!(
                "reply id {reply_id} does not match request id {id}"
            )));
        }

        match reply.get("error") {
            Some(err) if !err.is_null() => {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_owned();
                Err(RpcError::from_error_object(code, message))
            }
            _ => match reply.get("result") {
                Some(result) => Ok(result.clone()),
                None => Err(RpcError::BadResponse("reply carries no result".into())),
            },
        }
    }
}
