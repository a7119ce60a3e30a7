pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod shutdown;
pub mod task;
pub mod worker;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
