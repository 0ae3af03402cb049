use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A deployable source repository, addressed publicly by its tenant slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub source_locator: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of one build-and-publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid deployment status: {0}")]
pub struct ParseStatusError(pub String);

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Building => "BUILDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> to` is a legal status transition.
    ///
    /// QUEUED may fail directly when the build never launched.
    pub fn can_transition_to(&self, to: DeploymentStatus) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Building)
                | (Self::Queued, Self::Failed)
                | (Self::Building, Self::Succeeded)
                | (Self::Building, Self::Failed)
        )
    }

    /// Statuses from which `to` can be reached.
    pub fn predecessors(to: DeploymentStatus) -> &'static [DeploymentStatus] {
        match to {
            Self::Queued => &[],
            Self::Building => &[Self::Queued],
            Self::Succeeded => &[Self::Building],
            Self::Failed => &[Self::Queued, Self::Building],
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "BUILDING" => Ok(Self::Building),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One persisted build log line. `event_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub event_id: String,
    pub deployment_id: String,
    pub project_id: String,
    pub log: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DeploymentStatus; 4] = [
        DeploymentStatus::Queued,
        DeploymentStatus::Building,
        DeploymentStatus::Succeeded,
        DeploymentStatus::Failed,
    ];

    #[test]
    fn test_status_string_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!("queued".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&DeploymentStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }

    #[test]
    fn test_valid_transitions() {
        use DeploymentStatus::*;
        assert!(Queued.can_transition_to(Building));
        assert!(Queued.can_transition_to(Failed));
        assert!(Building.can_transition_to(Succeeded));
        assert!(Building.can_transition_to(Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        use DeploymentStatus::*;
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Building));
        assert!(!Building.can_transition_to(Queued));
        for status in ALL {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_predecessors_agree_with_transitions() {
        for to in ALL {
            for from in ALL {
                let listed = DeploymentStatus::predecessors(to).contains(&from);
                assert_eq!(listed, from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DeploymentStatus::Succeeded.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(!DeploymentStatus::Queued.is_terminal());
        assert!(!DeploymentStatus::Building.is_terminal());
    }

    #[test]
    fn test_project_serializes_camel_case() {
        let project = Project {
            id: "p1".into(),
            name: "site".into(),
            source_locator: "https://github.com/acme/site".into(),
            slug: "brave-otter".into(),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&project).unwrap();
        assert_eq!(value["sourceLocator"], "https://github.com/acme/site");
        assert_eq!(value["slug"], "brave-otter");
    }
}
