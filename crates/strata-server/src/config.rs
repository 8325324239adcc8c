use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strata_core::filter::DatabaseFilter;
use strata_core::ids::JobTaskId;
use strata_core::models::{Agent, Job, JobTask, TaskSettings};
use strata_core::settings::{self, load_layered, read_env_string, read_env_u64, SettingsError};
use strata_store::{Repository, StoreError};
use strata_telemetry::TelemetryConfig;

/// Agents, jobs and job steps known to the control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Catalogue {
    pub agents: Vec<Agent>,
    pub jobs: Vec<Job>,
    pub job_tasks: Vec<JobTask>,
}

impl Catalogue {
    /// Reject step definitions that could never run.
    pub fn validate(&self) -> settings::Result<()> {
        let invalid = |msg: String| Err(SettingsError::InvalidValue(msg));
        let steps: HashMap<&JobTaskId, &JobTask> =
            self.job_tasks.iter().map(|t| (&t.id, t)).collect();
        if steps.len() != self.job_tasks.len() {
            return invalid("job task ids must be unique".into());
        }

        for task in &self.job_tasks {
            if !self.jobs.iter().any(|j| j.id == task.job_id) {
                return invalid(format!("job task {} references unknown job {}", task.id, task.job_id));
            }
            if !self.agents.iter().any(|a| a.key == task.agent_key) {
                return invalid(format!(
                    "job task {} references unknown agent {}",
                    task.id, task.agent_key
                ));
            }
            if task.settings.kind() != task.kind {
                return invalid(format!(
                    "job task {} is {} but carries {} settings",
                    task.id,
                    task.kind,
                    task.settings.kind()
                ));
            }
            if let TaskSettings::CreateBackup(backup) = &task.settings {
                if let Err(e) = DatabaseFilter::from_settings(backup) {
                    return invalid(format!("job task {} has an invalid pattern: {e}", task.id));
                }
            }

            match &task.use_previous_task_artifacts_from {
                Some(previous) => match steps.get(previous) {
                    Some(p) if p.job_id == task.job_id && p.order < task.order => {}
                    Some(_) => {
                        return invalid(format!(
                            "job task {} must chain from an earlier task of the same job",
                            task.id
                        ))
                    }
                    None => {
                        return invalid(format!(
                            "job task {} chains from unknown task {previous}",
                            task.id
                        ))
                    }
                },
                None if task.kind.requires_previous_artifact() => {
                    return invalid(format!(
                        "job task {} ({}) needs a previous task to take artifacts from",
                        task.id, task.kind
                    ))
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Write every entry into the store.
    pub fn seed(&self, store: &dyn Repository) -> Result<(), StoreError> {
        for agent in &self.agents {
            store.upsert_agent(agent.clone())?;
        }
        for job in &self.jobs {
            store.upsert_job(job.clone())?;
        }
        for task in &self.job_tasks {
            store.upsert_job_task(task.clone())?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub rpc_timeout_secs: u64,
    /// Frames buffered per socket before senders wait.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// Sockets silent for longer than this are dropped.
    pub stale_timeout_secs: u64,
    pub catalogue: Catalogue,
    pub logging: TelemetryConfig,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 7070,
            rpc_timeout_secs: 30,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            stale_timeout_secs: 90,
            catalogue: Catalogue::default(),
            logging: TelemetryConfig::default(),
        }
    }
}

impl ServerSettings {
    pub fn load(path: &Path) -> settings::Result<Self> {
        let mut loaded: Self = load_layered(path)?;
        loaded.apply_env_overrides();
        loaded.catalogue.validate()?;
        Ok(loaded)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(host) = read_env_string("STRATA_HOST") {
            self.host = host;
        }
        if let Some(port) = read_env_u64("STRATA_PORT", 0, u64::from(u16::MAX)) {
            self.port = port as u16;
        }
        if let Some(secs) = read_env_u64("STRATA_RPC_TIMEOUT_SECS", 1, 3_600) {
            self.rpc_timeout_secs = secs;
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs.max(1))
    }
}
