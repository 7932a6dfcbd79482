//! Queue events fanned out to subscribers of the scheduler.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { build_id: String, position: usize },
    Progress { build_id: String, progress: u8 },
    Completed { build_id: String },
    Failed {
        build_id: String,
        reason: String,
        attempt: u32,
        will_retry: bool,
    },
    Cancelled { build_id: String },
}

impl QueueEvent {
    pub fn build_id(&self) -> &str {
        match self {
            Self::Enqueued { build_id, .. }
            | Self::Progress { build_id, .. }
            | Self::Completed { build_id }
            | Self::Failed { build_id, .. }
            | Self::Cancelled { build_id } => build_id,
        }
    }
}
