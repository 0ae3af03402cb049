use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::LogEvent;

/// A build log line as carried by the Log Channel.
///
/// Field names match the payload the build workers have always produced
/// (`PROJECT_ID`, `DEPLOYMENT_ID`, `log`). `event_id` and `timestamp` are
/// optional on the wire so older producers still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "PROJECT_ID")]
    pub project_id: String,
    #[serde(rename = "DEPLOYMENT_ID")]
    pub deployment_id: String,
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogMessage {
    /// Build a message stamped with a fresh event id and the current time.
    pub fn new(
        project_id: impl Into<String>,
        deployment_id: impl Into<String>,
        log: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            deployment_id: deployment_id.into(),
            log: log.into(),
            event_id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    /// Convert into a persistable event. `fallback_id` is only evaluated when
    /// the producer did not stamp an event id.
    pub fn into_event(
        self,
        fallback_id: impl FnOnce() -> String,
        received_at: DateTime<Utc>,
    ) -> LogEvent {
        LogEvent {
            event_id: self.event_id.unwrap_or_else(fallback_id),
            deployment_id: self.deployment_id,
            project_id: self.project_id,
            log: self.log,
            timestamp: self.timestamp.unwrap_or(received_at),
        }
    }
}

/// Identity injected into every build execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    pub project_id: String,
    pub deployment_id: String,
    pub source_locator: String,
}

impl BuildContext {
    pub const PROJECT_ID_VAR: &'static str = "PROJECT_ID";
    pub const DEPLOYMENT_ID_VAR: &'static str = "DEPLOYMENT_ID";
    pub const SOURCE_LOCATOR_VAR: &'static str = "SOURCE_LOCATOR";
    /// Older build images read the repository from this name.
    pub const LEGACY_SOURCE_VAR: &'static str = "GIT_REPOSITORY_URL";

    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (Self::PROJECT_ID_VAR, self.project_id.clone()),
            (Self::DEPLOYMENT_ID_VAR, self.deployment_id.clone()),
            (Self::SOURCE_LOCATOR_VAR, self.source_locator.clone()),
            (Self::LEGACY_SOURCE_VAR, self.source_locator.clone()),
        ]
    }
}
