//! Request/response correlation over a push-only transport.
//!
//! `invoke` pushes a request to the agent and polls a shared result table for the matching
//! transaction id. Only transactions registered as pending accept a reply, and a reply is taken out
//! of the table by exactly one caller. Each pending entry carries its caller's own deadline; the
//! sweep only evicts entries whose deadline passed more than a grace period ago, and unclaimed
//! results older than that grace period.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use strata_core::ids::{AgentKey, TransactionId};
use strata_core::rpc::{RpcMethod, RpcRequest, RpcResult, ServerMessage};
use strata_core::OrchestrationError;

use crate::registry::ConnectionRegistry;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct StoredResult {
    result: RpcResult,
    received_at: Instant,
}

pub struct RpcDispatcher {
    registry: Arc<ConnectionRegistry>,
    /// Transaction id to the caller's deadline.
    pending: DashMap<TransactionId, Instant>,
    results: DashMap<TransactionId, StoredResult>,
    default_timeout: Duration,
    poll_interval: Duration,
}

impl RpcDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            results: DashMap::new(),
            default_timeout,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Call `method` on the agent and decode its result as `T`.
    #[instrument(skip_all, fields(agent_key = %agent_key, method = %method))]
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        agent_key: &AgentKey,
        method: RpcMethod,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<T, OrchestrationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let connection = self.registry.resolve(agent_key)?;

        let request = RpcRequest::new(method, args)
            .map_err(|e| OrchestrationError::RemoteFault(format!("cannot encode request: {e}")))?;
        let tid = request.transaction_id;
        let frame = serde_json::to_string(&ServerMessage::Request(request))
            .map_err(|e| OrchestrationError::RemoteFault(format!("cannot encode request: {e}")))?;

        let deadline = Instant::now() + timeout;
        let _ = self.pending.insert(tid, deadline);
        match tokio::time::timeout_at(deadline, connection.send(frame)).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = self.pending.remove(&tid);
                return Err(OrchestrationError::AgentUnreachable(agent_key.clone()));
            }
            Err(_) => {
                let _ = self.pending.remove(&tid);
                warn!(transaction_id = %tid, timeout = ?timeout, "send queue stayed full");
                return Err(OrchestrationError::RpcTimeout(timeout));
            }
        }
        debug!(transaction_id = %tid, "request sent");

        loop {
            if let Some((_, stored)) = self.results.remove(&tid) {
                let _ = self.pending.remove(&tid);
                return decode(stored.result);
            }
            let now = Instant::now();
            if now >= deadline {
                let _ = self.pending.remove(&tid);
                let _ = self.results.remove(&tid);
                warn!(transaction_id = %tid, timeout = ?timeout, "rpc timed out");
                return Err(OrchestrationError::RpcTimeout(timeout));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Store a reply for its waiting caller. Replies nobody waits for are dropped.
    pub fn on_response(&self, result: RpcResult) -> bool {
        let tid = result.transaction_id;
        if !self.pending.contains_key(&tid) {
            debug!(transaction_id = %tid, "dropping response for unknown transaction");
            return false;
        }
        let mut accepted = false;
        let _ = self.results.entry(tid).or_insert_with(|| {
            accepted = true;
            StoredResult {
                result,
                received_at: Instant::now(),
            }
        });
        if !accepted {
            debug!(transaction_id = %tid, "duplicate response ignored");
        }
        accepted
    }

    /// Evict pending entries whose deadline passed more than `grace` ago, and unclaimed results
    /// older than `grace`.
    pub fn sweep(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let before = self.pending.len() + self.results.len();
        self.pending.retain(|_, deadline| now < *deadline + grace);
        self.results
            .retain(|_, stored| now.duration_since(stored.received_at) < grace);
        before.saturating_sub(self.pending.len() + self.results.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stored_count(&self) -> usize {
        self.results.len()
    }
}

fn decode<T: DeserializeOwned>(result: RpcResult) -> Result<T, OrchestrationError> {
    if let Some(error) = result.error {
        return Err(OrchestrationError::RemoteFault(error));
    }
    let json = result.result.unwrap_or_else(|| "null".to_string());
    serde_json::from_str(&json)
        .map_err(|e| OrchestrationError::RemoteFault(format!("cannot decode result: {e}")))
}

/// Sweep every `default_timeout` with a grace period of twice that.
pub fn start_sweep_task(dispatcher: Arc<RpcDispatcher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = dispatcher.default_timeout();
        let mut ticker = tokio::time::interval(period);
        loop {
            let _ = ticker.tick().await;
            let evicted = dispatcher.sweep(period * 2);
            if evicted > 0 {
                info!(evicted, "evicted stale rpc transactions");
            }
        }
    })
}
