pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod server;

pub use config::{Catalogue, ServerSettings};
pub use dispatcher::RpcDispatcher;
pub use error::RunError;
pub use orchestrator::JobRunner;
pub use registry::{ConnectionId, ConnectionRegistry};
pub use remote::{AgentRemote, RemoteService};
pub use server::{start, ServerHandle};
