pub mod claim;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod publish;
pub mod queue;
pub mod site;
pub mod step;
pub mod store;
pub mod vcs;
