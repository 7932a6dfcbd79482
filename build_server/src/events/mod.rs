//! Build lifecycle events.
//!
//! `BuildEvent`s are the only way the tracker mutates a build document;
//! `QueueEvent`s fan out from the scheduler to subscribers.

pub mod build;
pub mod queue;

pub use build::BuildEvent;
pub use queue::QueueEvent;
