pub mod agent_server;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod modules;
pub mod state;
pub mod types;
pub mod workflow;

pub use config::{ConfigLoader, ConfigValidator, FleetflowConfig};
pub use engine::{Engine, Plan, RunFailure, RunOptions};
pub use error::AppError;
pub use types::*;
