pub mod config;
pub mod connection;
pub mod database;
pub mod executor;
pub mod handlers;
pub mod runner;
pub mod service;
pub mod tasks;

pub use config::AgentSettings;
pub use executor::{TaskContext, TaskError, TaskExecutor, TaskOutcome};
pub use runner::TaskRunner;
pub use service::AgentService;
