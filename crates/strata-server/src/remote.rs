use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use strata_core::ids::AgentKey;
use strata_core::models::{Database, DatabaseConnection, JobRunTask};
use strata_core::rpc::RpcMethod;
use strata_core::OrchestrationError;

use crate::dispatcher::RpcDispatcher;

/// Typed calls the control plane makes on agents.
#[async_trait]
pub trait AgentRemote: Send + Sync {
    async fn test_sql_server(
        &self,
        agent: &AgentKey,
        connection: &DatabaseConnection,
    ) -> Result<String, OrchestrationError>;

    async fn get_database_list(
        &self,
        agent: &AgentKey,
        connection: &DatabaseConnection,
    ) -> Result<Vec<Database>, OrchestrationError>;

    async fn run(
        &self,
        task: &JobRunTask,
        previous: Option<&JobRunTask>,
    ) -> Result<String, OrchestrationError>;

    async fn stop(&self, task: &JobRunTask) -> Result<String, OrchestrationError>;

    async fn encrypt(&self, agent: &AgentKey, plaintext: &str) -> Result<String, OrchestrationError>;
}

/// [`AgentRemote`] over the RPC dispatcher.
pub struct RemoteService {
    dispatcher: Arc<RpcDispatcher>,
    timeout: Option<Duration>,
}

impl RemoteService {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self {
            dispatcher,
            timeout: None,
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, OrchestrationError> {
    serde_json::to_value(value)
        .map_err(|e| OrchestrationError::RemoteFault(format!("cannot encode argument: {e}")))
}

#[async_trait]
impl AgentRemote for RemoteService {
    async fn test_sql_server(
        &self,
        agent: &AgentKey,
        connection: &DatabaseConnection,
    ) -> Result<String, OrchestrationError> {
        self.dispatcher
            .invoke(agent, RpcMethod::TestSqlServer, vec![to_value(connection)?], self.timeout)
            .await
    }

    async fn get_database_list(
        &self,
        agent: &AgentKey,
        connection: &DatabaseConnection,
    ) -> Result<Vec<Database>, OrchestrationError> {
        self.dispatcher
            .invoke(agent, RpcMethod::GetDatabaseList, vec![to_value(connection)?], self.timeout)
            .await
    }

    async fn run(
        &self,
        task: &JobRunTask,
        previous: Option<&JobRunTask>,
    ) -> Result<String, OrchestrationError> {
        let args = vec![to_value(task)?, to_value(previous)?];
        self.dispatcher
            .invoke(&task.agent_key, RpcMethod::Run, args, self.timeout)
            .await
    }

    async fn stop(&self, task: &JobRunTask) -> Result<String, OrchestrationError> {
        self.dispatcher
            .invoke(&task.agent_key, RpcMethod::Stop, vec![to_value(&task.id)?], self.timeout)
            .await
    }

    async fn encrypt(&self, agent: &AgentKey, plaintext: &str) -> Result<String, OrchestrationError> {
        self.dispatcher
            .invoke(agent, RpcMethod::Encrypt, vec![Value::String(plaintext.to_string())], self.timeout)
            .await
    }
}
