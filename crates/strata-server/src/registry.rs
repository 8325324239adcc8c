//! Live agent connections.
//!
//! Two maps: every open socket by [`ConnectionId`], and the current socket of each agent key.
//! A later `Connect` for a key replaces the mapping. Disconnect clears the mapping only when it
//! still points at the disconnecting socket, checked and removed in one atomic `remove_if`, so a
//! stale disconnect can never evict a fresher reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::ids::AgentKey;
use strata_core::OrchestrationError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One open socket. Dropping the last sender closes the socket's writer.
pub struct Connection {
    pub id: ConnectionId,
    agent_key: Mutex<Option<AgentKey>>,
    tx: mpsc::Sender<String>,
    last_seen: AtomicU64,
}

impl Connection {
    pub fn agent_key(&self) -> Option<AgentKey> {
        self.agent_key.lock().clone()
    }

    /// Queue a frame for the socket writer.
    pub async fn send(&self, text: String) -> bool {
        self.tx.send(text).await.is_ok()
    }

    fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_seen.load(Ordering::Relaxed)))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    agents: DashMap<AgentKey, ConnectionId>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            agents: DashMap::new(),
            max_send_queue,
        }
    }

    /// Track a freshly opened socket. It serves no agent until [`Self::on_connect`].
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection {
            id: id.clone(),
            agent_key: Mutex::new(None),
            tx,
            last_seen: AtomicU64::new(now_millis()),
        });
        let _ = self.connections.insert(id.clone(), connection);
        (id, rx)
    }

    /// Bind `key` to the socket `id`. Latest connection wins.
    pub fn on_connect(&self, key: AgentKey, id: &ConnectionId) -> bool {
        let Some(connection) = self.connections.get(id).map(|c| Arc::clone(c.value())) else {
            warn!(connection_id = %id, agent_key = %key, "connect on unknown connection");
            return false;
        };

        let previous_key = connection.agent_key.lock().replace(key.clone());
        if let Some(previous_key) = previous_key.filter(|k| k != &key) {
            let _ = self.agents.remove_if(&previous_key, |_, current| current == id);
        }

        match self.agents.insert(key.clone(), id.clone()) {
            Some(old) if &old != id => {
                info!(agent_key = %key, old = %old, new = %id, "agent reconnected, replacing connection")
            }
            _ => info!(agent_key = %key, connection_id = %id, "agent connected"),
        }

        // The socket may have closed while we were binding it.
        if !self.connections.contains_key(id) {
            let _ = self.agents.remove_if(&key, |_, current| current == id);
            return false;
        }
        true
    }

    /// Forget socket `id`. Returns the agent key whose mapping was removed, if any.
    pub fn on_disconnect(&self, id: &ConnectionId) -> Option<AgentKey> {
        let (_, connection) = self.connections.remove(id)?;
        let key = connection.agent_key()?;
        match self.agents.remove_if(&key, |_, current| current == id) {
            Some(_) => {
                info!(agent_key = %key, connection_id = %id, "agent disconnected");
                Some(key)
            }
            None => {
                debug!(agent_key = %key, connection_id = %id, "stale disconnect ignored");
                None
            }
        }
    }

    pub fn resolve(&self, key: &AgentKey) -> Result<Arc<Connection>, OrchestrationError> {
        self.agents
            .get(key)
            .and_then(|id| self.connections.get(id.value()).map(|c| Arc::clone(c.value())))
            .ok_or_else(|| OrchestrationError::AgentUnreachable(key.clone()))
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Agent key bound to socket `id`, if it has sent `Connect`.
    pub fn agent_of(&self, id: &ConnectionId) -> Option<AgentKey> {
        self.connections.get(id).and_then(|c| c.agent_key())
    }

    pub fn record_seen(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get(id) {
            connection.touch();
        }
    }

    pub fn connected_agents(&self) -> Vec<AgentKey> {
        let mut keys: Vec<AgentKey> = self.agents.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop sockets silent for longer than `timeout`.
    pub fn cleanup_stale(&self, timeout: Duration) -> usize {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            let key = self.on_disconnect(id);
            info!(connection_id = %id, agent_key = ?key, "dropped silent connection");
        }
        stale.len()
    }
}

/// Periodically drop connections that stopped answering pings.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let _ = ticker.tick().await;
            let removed = registry.cleanup_stale(timeout);
            if removed > 0 {
                info!(removed, "stale connection cleanup");
            }
        }
    })
}
