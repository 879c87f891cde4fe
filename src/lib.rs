pub mod config;
pub mod logging;

// Core modules
pub mod batch;
pub mod chunk;
pub mod error;
pub mod hashing;
pub mod health;
pub mod item;
pub mod network;
pub mod orchestrator;
pub mod plugin;
pub mod resume;
pub mod store;
pub mod throttle;
pub mod timer;
pub mod transport;
pub mod validate;
