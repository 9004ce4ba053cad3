pub mod advisor;
pub mod config;
pub mod credentials;
pub mod error;
pub mod exchange;
pub mod market;
pub mod models;
pub mod orchestrator;
pub mod reconciler;
pub mod session;
pub mod signer;
pub mod time_sync;

pub use models::*;
