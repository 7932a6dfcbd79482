//! Deployment: the release attempt that owns a build.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::schema::deployments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deploying,
    Success,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "building" => Some(Self::Building),
            "deploying" => Some(Self::Deploying),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub project_id: String,
    pub status: DeploymentStatus,
    pub build_id: Option<String>,
    pub error_message: Option<String>,
    pub artifact_path: Option<String>,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn queued(deployment_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            project_id: project_id.into(),
            status: DeploymentStatus::Queued,
            build_id: None,
            error_message: None,
            artifact_path: None,
            build_started_at: None,
            build_finished_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = deployments)]
#[diesel(treat_none_as_null = true)]
pub struct DeploymentRow {
    pub deployment_id: String,
    pub project_id: String,
    pub status: String,
    pub build_id: Option<String>,
    pub error_message: Option<String>,
    pub artifact_path: Option<String>,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Deployment> for DeploymentRow {
    fn from(deployment: &Deployment) -> Self {
        Self {
            deployment_id: deployment.deployment_id.clone(),
            project_id: deployment.project_id.clone(),
            status: deployment.status.as_str().to_string(),
            build_id: deployment.build_id.clone(),
            error_message: deployment.error_message.clone(),
            artifact_path: deployment.artifact_path.clone(),
            build_started_at: deployment.build_started_at,
            build_finished_at: deployment.build_finished_at,
            updated_at: deployment.updated_at,
        }
    }
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = BuildError;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        let status = DeploymentStatus::parse(&row.status).ok_or_else(|| {
            BuildError::Store(format!("unknown deployment status {}", row.status))
        })?;
        Ok(Self {
            deployment_id: row.deployment_id,
            project_id: row.project_id,
            status,
            build_id: row.build_id,
            error_message: row.error_message,
            artifact_path: row.artifact_path,
            build_started_at: row.build_started_at,
            build_finished_at: row.build_finished_at,
            updated_at: row.updated_at,
        })
    }
}
