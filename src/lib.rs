pub mod config;
pub mod coordinator;
pub mod error;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
