//! Single consumer of every frame agents push to the control plane.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use strata_core::ids::AgentKey;
use strata_core::rpc::{AgentMessage, ServerMessage};
use strata_store::Repository;

use crate::dispatcher::RpcDispatcher;
use crate::orchestrator::JobRunner;
use crate::registry::{ConnectionId, ConnectionRegistry};

pub struct AgentHub {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<RpcDispatcher>,
    pub runner: Arc<JobRunner>,
    pub store: Arc<dyn Repository>,
}

/// Route agent frames until every socket reader has gone away.
///
/// Nothing here waits on an agent: completions spawn their follow-up dispatches, so a slow
/// RPC can never stall the reply it is waiting for.
pub async fn process_agent_messages(mut rx: mpsc::Receiver<(ConnectionId, String)>, hub: AgentHub) {
    while let Some((connection_id, raw)) = rx.recv().await {
        let message: AgentMessage = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "malformed agent frame");
                continue;
            }
        };

        if let AgentMessage::Connect { agent_key } = message {
            hub.on_connect(agent_key, &connection_id).await;
            continue;
        }
        if hub.registry.agent_of(&connection_id).is_none() {
            debug!(connection_id = %connection_id, kind = message.message_type(), "frame before connect dropped");
            continue;
        }

        match message {
            AgentMessage::Response(result) => {
                let _ = hub.dispatcher.on_response(result);
            }
            AgentMessage::TaskProgress(progress) => hub.runner.on_progress(progress),
            AgentMessage::TaskComplete(complete) => {
                let runner = Arc::clone(&hub.runner);
                tokio::spawn(async move {
                    let task_id = complete.job_run_task_id.clone();
                    if let Err(e) = runner.on_task_complete(complete).await {
                        error!(job_run_task_id = %task_id, error = %e, "failed to record completion");
                    }
                });
            }
            AgentMessage::Connect { .. } => {}
        }
    }
    info!("agent message loop stopped");
}

impl AgentHub {
    async fn on_connect(&self, agent_key: AgentKey, connection_id: &ConnectionId) {
        match self.store.get_agent(&agent_key) {
            Ok(_) => {
                let _ = self.registry.on_connect(agent_key, connection_id);
            }
            Err(e) => {
                warn!(agent_key = %agent_key, connection_id = %connection_id, error = %e, "rejecting unknown agent");
                if let Some(connection) = self.registry.connection(connection_id) {
                    let reason = format!("unknown agent key {agent_key}");
                    if let Ok(frame) = serde_json::to_string(&ServerMessage::Rejected { reason }) {
                        let _ = connection.send(frame).await;
                    }
                }
                let _ = self.registry.on_disconnect(connection_id);
            }
        }
    }
}
