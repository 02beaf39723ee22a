pub mod backup;
pub mod borg;
pub mod config;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod profile;
pub mod repository;
pub mod restore;
pub mod runner;
pub mod sanitize;
pub mod snapshot;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod unpack;

pub use error::{Error, Result};
