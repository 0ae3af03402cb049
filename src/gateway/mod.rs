//! Live log subscription gateway.
//!
//! Connections join deployment-scoped broadcast groups and receive every
//! live log line for that deployment from the moment they joined. Each
//! member has its own bounded line queue; a member whose queue is full
//! misses the line instead of holding up the rest of the group. Join
//! confirmations are never dropped.

pub mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logs::LiveEvent;

pub type ConnectionId = u64;

pub fn join_confirmation(deployment_id: &str) -> String {
    format!("Joined logs:{}", deployment_id)
}

/// Everything addressed to one connection. Join confirmations travel on
/// their own lane and are read before log lines, so a full line queue
/// never swallows a confirmation and a confirmation always precedes the
/// lines of the group it confirms.
pub struct Outbound {
    control: mpsc::UnboundedReceiver<String>,
    lines: mpsc::Receiver<String>,
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            Some(text) = self.control.recv() => Some(text),
            line = self.lines.recv() => line,
        }
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.control
            .try_recv()
            .ok()
            .or_else(|| self.lines.try_recv().ok())
    }
}

struct Member {
    control: mpsc::UnboundedSender<String>,
    lines: mpsc::Sender<String>,
}

pub struct BroadcastGroups {
    groups: DashMap<String, HashMap<ConnectionId, mpsc::Sender<String>>>,
    connections: DashMap<ConnectionId, Member>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
    next_id: AtomicU64,
    member_buffer: usize,
}

impl BroadcastGroups {
    pub fn new(member_buffer: usize) -> Self {
        Self {
            groups: DashMap::new(),
            connections: DashMap::new(),
            memberships: DashMap::new(),
            next_id: AtomicU64::new(1),
            member_buffer: member_buffer.max(1),
        }
    }

    /// Register a connection. The receiver yields everything addressed to it.
    pub fn connect(&self) -> (ConnectionId, Outbound) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (lines_tx, lines_rx) = mpsc::channel(self.member_buffer);
        self.connections.insert(
            id,
            Member {
                control: control_tx,
                lines: lines_tx,
            },
        );
        self.memberships.insert(id, HashSet::new());
        (
            id,
            Outbound {
                control: control_rx,
                lines: lines_rx,
            },
        )
    }

    /// Add `conn` to the group for `deployment_id` and confirm to that
    /// connection only. Returns false for an unknown connection.
    pub fn join(&self, conn: ConnectionId, deployment_id: &str) -> bool {
        let Some((control, lines)) = self
            .connections
            .get(&conn)
            .map(|member| (member.control.clone(), member.lines.clone()))
        else {
            return false;
        };
        {
            // Confirm while holding the group entry so no line for this
            // group can be queued ahead of the confirmation.
            let mut group = self.groups.entry(deployment_id.to_string()).or_default();
            if control.send(join_confirmation(deployment_id)).is_err() {
                debug!(conn, deployment_id = %deployment_id, "Connection closed before join");
                return false;
            }
            group.insert(conn, lines);
        }
        if let Some(mut joined) = self.memberships.get_mut(&conn) {
            joined.insert(deployment_id.to_string());
        }
        debug!(conn, deployment_id = %deployment_id, "Connection joined group");
        true
    }

    /// Relay `text` to every member of the group. Returns how many members
    /// accepted it.
    pub fn deliver(&self, deployment_id: &str, text: &str) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        if let Some(group) = self.groups.get(deployment_id) {
            for (conn, tx) in group.iter() {
                match tx.try_send(text.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(conn = *conn, deployment_id = %deployment_id, "Slow member, dropping line");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*conn),
                }
            }
        }
        for conn in closed {
            self.disconnect(conn);
        }
        delivered
    }

    /// Remove a connection from every group it joined. Empty groups go away.
    pub fn disconnect(&self, conn: ConnectionId) {
        self.connections.remove(&conn);
        let Some((_, joined)) = self.memberships.remove(&conn) else {
            return;
        };
        for deployment_id in joined {
            if let Some(mut group) = self.groups.get_mut(&deployment_id) {
                group.remove(&conn);
            }
            self.groups
                .remove_if(&deployment_id, |_, members| members.is_empty());
        }
        debug!(conn, "Connection left all groups");
    }

    pub fn group_size(&self, deployment_id: &str) -> usize {
        self.groups.get(deployment_id).map_or(0, |g| g.len())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Forward live pipeline events to their broadcast groups until shutdown.
pub fn spawn_relay(
    groups: Arc<BroadcastGroups>,
    mut live: broadcast::Receiver<LiveEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Live log relay started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = live.recv() => match event {
                    Ok(event) => {
                        groups.deliver(&event.deployment_id, &event.log);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Live log relay lagged; lines dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        info!("Live log relay stopped");
    })
}
