//! The bitcoind manager: a bounded pool of RPC "clients" over one transport,
//! plus connection-lifecycle events.
//!
//! Requests are multiplexed and unordered; callers must correlate by id
//! (the transport does) and must not assume reply order matches request
//! order. At most [`N_CLIENTS`] requests are in flight at once; additional
//! submissions wait for a permit, which is what bounds the download tasks'
//! natural pipelining.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info, warn};

use ember_types::RpcMsgId;

use crate::error::RpcError;
use crate::transport::RpcTransport;

/// Number of concurrent RPC connections the manager maintains.
pub const N_CLIENTS: usize = 3;

/// Connection-lifecycle events.
#[derive(Debug, Clone)]
pub enum BitcoindEvent {
    /// The first request since startup (or since all connections were lost)
    /// completed against a live bitcoind. Carries the request id that won.
    FirstGoodConnection(u64),
    /// The transport stopped reaching bitcoind.
    AllConnectionsLost,
    /// bitcoind replied that it is still warming up.
    InWarmUp(String),
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    /// Maximum concurrent in-flight requests.
    pub max_clients: usize,
    /// Cadence of the connection-keeper probe.
    pub ping_interval: Duration,
}

impl Default for BitcoindConfig {
    fn default() -> Self {
        Self {
            max_clients: N_CLIENTS,
            ping_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct ConnState {
    connected: bool,
}

/// The bitcoind RPC manager.
pub struct BitcoindMgr {
    transport: Arc<dyn RpcTransport>,
    clients: Semaphore,
    max_clients: usize,
    ping_interval: Duration,
    keeper_started: AtomicBool,
    event_tx: broadcast::Sender<BitcoindEvent>,
    next_id: AtomicU64,
    n_requests: AtomicU64,
    n_errors: AtomicU64,
    state: Mutex<ConnState>,
}

impl BitcoindMgr {
    /// Creates a manager over `transport`.
    pub fn new(transport: Arc<dyn RpcTransport>, config: BitcoindConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            transport,
            clients: Semaphore::new(config.max_clients),
            max_clients: config.max_clients,
            ping_interval: config.ping_interval,
            keeper_started: AtomicBool::new(false),
            event_tx,
            next_id: AtomicU64::new(1),
            n_requests: AtomicU64::new(0),
            n_errors: AtomicU64::new(0),
            state: Mutex::new(ConnState::default()),
        })
    }

    /// Subscribes to connection-lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BitcoindEvent> {
        self.event_tx.subscribe()
    }

    /// Width of the client pool.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Spawns the connection keeper: a periodic lightweight probe (`uptime`)
    /// that establishes reachability and keeps the lifecycle events flowing
    /// even while nothing else is submitting requests.
    ///
    /// Idempotent; must be called from within a Tokio runtime.
    pub fn startup(self: &Arc<Self>) {
        if self.keeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.ping_interval;
        tokio::spawn(async move {
            loop {
                let Some(mgr) = weak.upgrade() else { break };
                let _ = mgr.submit_request("uptime", &[]).await;
                drop(mgr);
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Submits one request and waits for its correlated reply.
    ///
    /// Bounded by the client pool: at most `max_clients` submissions run
    /// concurrently, the rest queue on the pool.
    pub async fn submit_request(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        let id_num = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = RpcMsgId::from(id_num);

        let _permit = self
            .clients
            .acquire()
            .await
            .map_err(|_| RpcError::Transport("client pool closed".into()))?;

        self.n_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.transport.send_request(id, method, params).await;

        match &result {
            Ok(_) | Err(RpcError::Server { .. }) | Err(RpcError::BadResponse(_)) => {
                // any decoded reply proves the daemon is reachable
                self.note_reachable(id_num).await;
                if result.is_err() {
                    self.n_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(RpcError::WarmingUp(msg)) => {
                self.n_errors.fetch_add(1, Ordering::Relaxed);
                let _ = self.event_tx.send(BitcoindEvent::InWarmUp(msg.clone()));
                self.note_unreachable().await;
            }
            Err(RpcError::Transport(msg)) => {
                self.n_errors.fetch_add(1, Ordering::Relaxed);
                debug!(method, error = %msg, "transport failure");
                self.note_unreachable().await;
            }
        }
        result
    }

    async fn note_reachable(&self, id: u64) {
        let mut state = self.state.lock().await;
        if !state.connected {
            state.connected = true;
            info!(id, "Connected to bitcoind");
            let _ = self.event_tx.send(BitcoindEvent::FirstGoodConnection(id));
        }
    }

    async fn note_unreachable(&self) {
        let mut state = self.state.lock().await;
        if state.connected {
            state.connected = false;
            warn!("Lost connection to bitcoind");
            let _ = self.event_tx.send(BitcoindEvent::AllConnectionsLost);
        }
    }

    /// Whether the last observed exchange reached bitcoind.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Point-in-time stats for the stats snapshot.
    pub fn stats(&self) -> Value {
        json!({
            "clients": self.max_clients,
            "requests sent": self.n_requests.load(Ordering::Relaxed),
            "errors": self.n_errors.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Transport that fails with a transport error for the first `fail_n`
    /// requests, then succeeds.
    struct FlakyTransport {
        fail_n: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcTransport for FlakyTransport {
        async fn send_request(
            &self,
            _id: RpcMsgId,
            _method: &str,
            _params: &[Value],
        ) -> Result<Value, RpcError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_n {
                Err(RpcError::Transport("refused".into()))
            } else {
                Ok(json!("ok"))
            }
        }
    }

    #[tokio::test]
    async fn emits_first_good_connection_once_per_outage() {
        let transport = Arc::new(FlakyTransport {
            fail_n: 1,
            calls: AtomicUsize::new(0),
        });
        let mgr = BitcoindMgr::new(transport, BitcoindConfig::default());
        let mut events = mgr.subscribe();

        // first request fails at the transport; no events yet (we were
        // never connected, so nothing was "lost")
        assert!(mgr.submit_request("getblockcount", &[]).await.is_err());
        assert!(events.try_recv().is_err());

        // second succeeds -> first good connection
        mgr.submit_request("getblockcount", &[]).await.unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            BitcoindEvent::FirstGoodConnection(_)
        ));

        // further successes stay quiet
        mgr.submit_request("getblockcount", &[]).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn emits_all_connections_lost_on_transition() {
        use std::sync::atomic::AtomicBool;

        /// Transport whose availability can be flipped from the test.
        struct SwitchTransport {
            up: AtomicBool,
        }

        #[async_trait]
        impl RpcTransport for SwitchTransport {
            async fn send_request(
                &self,
                _id: RpcMsgId,
                _method: &str,
                _params: &[Value],
            ) -> Result<Value, RpcError> {
                if self.up.load(Ordering::SeqCst) {
                    Ok(json!("ok"))
                } else {
                    Err(RpcError::Transport("gone".into()))
                }
            }
        }

        let transport = Arc::new(SwitchTransport {
            up: AtomicBool::new(true),
        });
        let mgr = BitcoindMgr::new(
            Arc::clone(&transport) as Arc<dyn RpcTransport>,
            BitcoindConfig::default(),
        );
        let mut events = mgr.subscribe();

        mgr.submit_request("getblockcount", &[]).await.unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            BitcoindEvent::FirstGoodConnection(_)
        ));

        transport.up.store(false, Ordering::SeqCst);
        assert!(mgr.submit_request("getblockcount", &[]).await.is_err());
        assert!(matches!(
            events.try_recv().unwrap(),
            BitcoindEvent::AllConnectionsLost
        ));
        assert!(!mgr.is_connected().await);

        // a second failure while already down stays quiet
        assert!(mgr.submit_request("getblockcount", &[]).await.is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn warm_up_is_broadcast() {
        struct WarmTransport;

        #[async_trait]
        impl RpcTransport for WarmTransport {
            async fn send_request(
                &self,
                _id: RpcMsgId,
                _method: &str,
                _params: &[Value],
            ) -> Result<Value, RpcError> {
                Err(RpcError::from_error_object(-28, "Loading block index...".into()))
            }
        }

        let mgr = BitcoindMgr::new(Arc::new(WarmTransport), BitcoindConfig::default());
        let mut events = mgr.subscribe();

        let err = mgr.submit_request("getblockchaininfo", &[]).await;
        assert!(matches!(err, Err(RpcError::WarmingUp(_))));
        assert!(matches!(
            events.try_recv().unwrap(),
            BitcoindEvent::InWarmUp(msg) if msg.contains("Loading")
        ));
    }
}
