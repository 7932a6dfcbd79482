//! Shipyard build engine: turns a project's source into a deployable
//! artifact inside an isolated container, with a durable job queue, retries,
//! per-project dependency caches and a persisted build record.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod schema;
pub mod services;
pub mod store;

pub use error::{BuildError, Result};
