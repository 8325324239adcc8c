pub mod error;
pub mod memory;
pub mod repository;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use repository::{Repository, RunCompletion};
