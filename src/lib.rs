pub mod config;
pub mod engine;
pub mod errors;
pub mod gatekeeper;
pub mod models;
pub mod policy;
pub mod processor;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod transport;
