//! Build log transport: producers publish to the [`channel::LogChannel`],
//! the [`pipeline::LogPipeline`] persists and fans out.

pub mod channel;
pub mod pipeline;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use launchpad_common::LogMessage;
use serde::Serialize;
use tokio::sync::broadcast;

use channel::LogChannel;

/// A log line on its way to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    pub deployment_id: String,
    pub log: String,
}

pub type LiveSender = broadcast::Sender<LiveEvent>;

pub fn live_channel(capacity: usize) -> LiveSender {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    tx
}

/// Publishes lines for one deployment, keyed by deployment id so they stay
/// in order on a single partition.
#[derive(Clone)]
pub struct LogPublisher {
    channel: Arc<dyn LogChannel>,
    project_id: String,
    deployment_id: String,
}

impl LogPublisher {
    pub fn new(
        channel: Arc<dyn LogChannel>,
        project_id: impl Into<String>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            project_id: project_id.into(),
            deployment_id: deployment_id.into(),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub async fn publish(&self, line: impl Into<String>) -> Result<()> {
        let message = LogMessage::new(&self.project_id, &self.deployment_id, line);
        let payload = message.encode().context("Failed to encode log message")?;
        self.channel.publish(&self.deployment_id, payload).await
    }
}
