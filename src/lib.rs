pub mod agents;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod doctor;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod profiles;
pub mod registry;
pub mod runner;
pub mod server;
pub mod service;
pub mod taxonomy;
pub mod telemetry;
pub mod workflow;
