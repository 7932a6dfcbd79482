//! Build engine services: script synthesis, sandboxed execution, caching,
//! packaging, state tracking and the scheduler that drives them.

pub mod artifact_service;
pub mod cache_service;
pub mod deployment_service;
pub mod executor;
pub mod pipeline;
pub mod progress;
pub mod retention;
pub mod sandbox;
pub mod scheduler;
pub mod script_generator;
pub mod tracker;
