pub mod errors;
pub mod filter;
pub mod ids;
pub mod models;
pub mod rpc;
pub mod secrets;
pub mod settings;

pub use errors::OrchestrationError;
