//! Partitioned log channel with commit-based redelivery.
//!
//! Producers publish keyed payloads; records with the same key land on the
//! same partition and keep their publish order. A consumer polls batches,
//! and a record stays in the channel until its offset is committed.
//! [`LogChannel::rewind`] moves the read position back to the last commit,
//! which is what a restarted consumer sees: everything not yet committed is
//! delivered again.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait LogChannel: Send + Sync {
    /// Append a payload. Waits while the target partition is full.
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Up to `max` records past the read position, waiting at most `wait`
    /// for something to arrive. Per partition, records come back in offset order.
    async fn poll_batch(&self, max: usize, wait: Duration) -> Result<Vec<ChannelRecord>>;

    /// Mark every record of `partition` up to and including `offset` as done.
    async fn commit(&self, partition: u32, offset: u64) -> Result<()>;

    /// Reset the read position of every partition to its last commit.
    async fn rewind(&self) -> Result<()>;
}

#[derive(Default)]
struct PartitionState {
    /// Uncommitted records; the front has offset `committed`.
    records: VecDeque<ChannelRecord>,
    next_offset: u64,
    /// First offset not yet committed.
    committed: u64,
    /// Next offset handed to the consumer.
    position: u64,
}

struct Partition {
    state: Mutex<PartitionState>,
    capacity: Semaphore,
}

/// In-process [`LogChannel`] with bounded partitions.
pub struct MemoryLogChannel {
    partitions: Vec<Partition>,
    data_ready: Notify,
    cursor: AtomicUsize,
}

fn lock(partition: &Partition) -> Result<std::sync::MutexGuard<'_, PartitionState>> {
    partition
        .state
        .lock()
        .map_err(|e| anyhow::anyhow!("Log channel lock poisoned: {}", e))
}

impl MemoryLogChannel {
    pub fn new(partitions: u32, capacity: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Partition {
                state: Mutex::new(PartitionState::default()),
                capacity: Semaphore::new(capacity.max(1)),
            })
            .collect();
        Self {
            partitions,
            data_ready: Notify::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }

    /// Last committed offset of a partition, if anything was committed.
    pub fn committed_offset(&self, partition: u32) -> Result<Option<u64>> {
        let part = self
            .partitions
            .get(partition as usize)
            .with_context(|| format!("Unknown partition {}", partition))?;
        let state = lock(part)?;
        Ok(state.committed.checked_sub(1))
    }

    /// Records published but not yet committed, across all partitions.
    pub fn pending(&self) -> Result<usize> {
        let mut total = 0;
        for part in &self.partitions {
            total += lock(part)?.records.len();
        }
        Ok(total)
    }

    fn drain_ready(&self, max: usize) -> Result<Vec<ChannelRecord>> {
        let count = self.partitions.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut batch = Vec::new();

        for i in 0..count {
            if batch.len() >= max {
                break;
            }
            let mut state = lock(&self.partitions[(start + i) % count])?;
            let skip = (state.position - state.committed) as usize;
            let take = (max - batch.len()).min(state.records.len().saturating_sub(skip));
            batch.extend(state.records.iter().skip(skip).take(take).cloned());
            state.position += take as u64;
        }
        Ok(batch)
    }
}

#[async_trait]
impl LogChannel for MemoryLogChannel {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let partition = self.partition_for(key);
        let part = &self.partitions[partition as usize];
        part.capacity
            .acquire()
            .await
            .context("Log channel closed")?
            .forget();
        {
            let mut state = lock(part)?;
            let offset = state.next_offset;
            state.next_offset += 1;
            state.records.push_back(ChannelRecord {
                partition,
                offset,
                key: key.to_string(),
                payload,
            });
        }
        self.data_ready.notify_one();
        Ok(())
    }

    async fn poll_batch(&self, max: usize, wait: Duration) -> Result<Vec<ChannelRecord>> {
        let batch = self.drain_ready(max)?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(wait, self.data_ready.notified()).await;
        self.drain_ready(max)
    }

    async fn commit(&self, partition: u32, offset: u64) -> Result<()> {
        let part = self
            .partitions
            .get(partition as usize)
            .with_context(|| format!("Unknown partition {}", partition))?;
        let released = {
            let mut state = lock(part)?;
            if offset < state.committed {
                return Ok(());
            }
            let through = (offset + 1).min(state.next_offset);
            let released = (through - state.committed) as usize;
            state.records.drain(..released);
            state.committed = through;
            state.position = state.position.max(through);
            released
        };
        part.capacity.add_permits(released);
        Ok(())
    }

    async fn rewind(&self) -> Result<()> {
        for part in &self.partitions {
            let mut state = lock(part)?;
            state.position = state.committed;
        }
        Ok(())
    }
}
