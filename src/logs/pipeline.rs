//! Log consumption loop.
//!
//! Each batch pulled from the channel is broadcast live, persisted, and only
//! then committed. A failed insert is retried until it succeeds or the
//! pipeline shuts down; while retrying, no further batches are polled, which
//! leaves the backlog in the channel and makes producers wait once a
//! partition fills up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use launchpad_common::{LogEvent, LogMessage};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelRecord, LogChannel};
use super::store::LogStore;
use super::{LiveEvent, LiveSender};
use crate::config::PipelineSection;
use crate::errors::PipelineError;

/// Counts for one processed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub inserted: usize,
    pub malformed: usize,
    pub broadcast: usize,
}

/// Event id for records whose producer did not stamp one. Stable across
/// redeliveries of the same record.
fn derived_event_id(partition: u32, offset: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", partition, offset).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct LogPipeline {
    channel: Arc<dyn LogChannel>,
    store: Arc<dyn LogStore>,
    live: LiveSender,
    config: PipelineSection,
    /// Highest offset per partition already sent to live subscribers.
    broadcast_marks: HashMap<u32, u64>,
}

impl LogPipeline {
    pub fn new(
        channel: Arc<dyn LogChannel>,
        store: Arc<dyn LogStore>,
        live: LiveSender,
        config: PipelineSection,
    ) -> Self {
        Self {
            channel,
            store,
            live,
            config,
            broadcast_marks: HashMap::new(),
        }
    }

    /// Consume until `shutdown` fires. Uncommitted records are re-read from
    /// the last commit on start.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        self.channel.rewind().await.map_err(PipelineError::Channel)?;
        let wait = Duration::from_millis(self.config.poll_interval_ms);
        info!(batch_size = self.config.batch_size, "Log pipeline started");

        loop {
            let records = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.channel.poll_batch(self.config.batch_size, wait) => {
                    polled.map_err(PipelineError::Channel)?
                }
            };
            if records.is_empty() {
                continue;
            }
            match self.process_batch(records, &shutdown).await {
                Ok(report) => debug!(
                    received = report.received,
                    inserted = report.inserted,
                    malformed = report.malformed,
                    "Processed log batch"
                ),
                Err(PipelineError::Shutdown) => break,
                Err(e) => return Err(e),
            }
        }

        info!("Log pipeline stopped");
        Ok(())
    }

    pub async fn process_batch(
        &mut self,
        records: Vec<ChannelRecord>,
        shutdown: &CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport {
            received: records.len(),
            ..Default::default()
        };
        let received_at = Utc::now();
        let mut last_offsets: BTreeMap<u32, u64> = BTreeMap::new();
        let mut events = Vec::with_capacity(records.len());

        for record in records {
            last_offsets
                .entry(record.partition)
                .and_modify(|o| *o = (*o).max(record.offset))
                .or_insert(record.offset);

            let message = match LogMessage::decode(&record.payload) {
                Ok(message) => message,
                Err(e) => {
                    // Never decodable, so it is committed along with the batch.
                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Skipping malformed log record"
                    );
                    report.malformed += 1;
                    continue;
                }
            };
            let (partition, offset) = (record.partition, record.offset);
            let event =
                message.into_event(|| derived_event_id(partition, offset), received_at);

            if self.broadcast(partition, offset, &event) {
                report.broadcast += 1;
            }
            events.push(event);
        }

        report.inserted = self.persist(events, shutdown).await?;

        for (partition, offset) in last_offsets {
            self.channel
                .commit(partition, offset)
                .await
                .map_err(PipelineError::Channel)?;
        }
        Ok(report)
    }

    /// Best-effort live fan-out. Records at or below the partition's mark were
    /// already sent before a redelivery and are skipped.
    fn broadcast(&mut self, partition: u32, offset: u64, event: &LogEvent) -> bool {
        if let Some(mark) = self.broadcast_marks.get(&partition)
            && offset <= *mark
        {
            return false;
        }
        self.broadcast_marks.insert(partition, offset);
        // No receivers is not an error.
        let _ = self.live.send(LiveEvent {
            deployment_id: event.deployment_id.clone(),
            log: event.log.clone(),
        });
        true
    }

    async fn persist(
        &self,
        events: Vec<LogEvent>,
        shutdown: &CancellationToken,
    ) -> Result<usize, PipelineError> {
        if events.is_empty() {
            return Ok(0);
        }
        let max_backoff = Duration::from_millis(self.config.retry_max_ms);
        let mut backoff = Duration::from_millis(self.config.retry_initial_ms);
        let mut attempt: u32 = 1;

        loop {
            match self.store.insert_batch(events.clone()).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) => {
                    error!(
                        attempt,
                        events = events.len(),
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Failed to persist log batch"
                    );
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(PipelineError::Shutdown),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(max_backoff);
            attempt += 1;
        }
    }
}
