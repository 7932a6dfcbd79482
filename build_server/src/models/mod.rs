//! Build engine data models.

pub mod build;
pub mod deployment;
pub mod job;
pub mod project;
pub mod request;

pub use build::{
    Artifact, ArtifactKind, Build, BuildLogs, BuildStatus, BuildStatusView, CacheSummary,
    FailureSummary, Stage, StageStatus,
};
pub use deployment::{Deployment, DeploymentStatus};
pub use job::{Enqueued, Job, JobState};
pub use project::{BuildConfig, EnvVar, ProjectType};
pub use request::BuildRequest;
