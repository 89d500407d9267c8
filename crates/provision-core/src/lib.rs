pub mod adapter;
pub mod audit;
pub mod config;
pub mod credential;
pub mod error;
pub mod policy;
pub mod request;
pub mod response;
pub mod retry;
pub mod run;
pub mod sequencer;
pub mod store;
pub mod types;

pub use error::{ErrorKind, ProvisionError, Result};
pub use sequencer::{Orchestrator, OrchestratorSettings, Reconciler};
