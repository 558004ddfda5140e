//! Connection registry: the single owner of every live socket handle.
//!
//! A socket handle is the sending half of a bounded channel drained by that
//! socket's writer task. Fan-out never waits on a socket: a full buffer
//! (slow consumer) or a closed channel counts as a write failure, and the
//! connection is evicted on the spot.
//!
//! Every register/unregister signals [`ChannelDemand`] while the write guard
//! is held, so the relay sees subscription transitions in the same order as
//! registry transitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::broker::ChannelName;
use crate::event::Envelope;
use crate::model::{ClientId, NodeId, ProjectId};
use crate::telemetry::metrics;

/// One serialized envelope, shared by every socket it is delivered to.
pub type Frame = Arc<str>;

/// Sending half of a socket's outbound queue.
pub type ConnectionHandle = mpsc::Sender<Frame>;

/// Receives reference-count changes for project channels.
pub trait ChannelDemand: Send + Sync {
    fn acquire(&self, channel: &ChannelName);
    fn release(&self, channel: &ChannelName);
}

/// Demand sink that ignores every change. For registries without a relay.
#[derive(Debug, Default)]
pub struct NoDemand;

impl ChannelDemand for NoDemand {
    fn acquire(&self, _channel: &ChannelName) {}
    fn release(&self, _channel: &ChannelName) {}
}

/// A registered connection, without its socket handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub client_id: ClientId,
    pub project_id: ProjectId,
    pub connected_at: DateTime<Utc>,
}

/// Outcome of one fan-out call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Clients whose write failed. Already unregistered.
    pub failed: Vec<ClientId>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Entry {
    connection: Connection,
    handle: ConnectionHandle,
    /// Node topic filter. Empty means every event.
    topics: HashSet<NodeId>,
}

impl Entry {
    fn accepts(&self, node_id: Option<&NodeId>) -> bool {
        match node_id {
            Some(node) if !self.topics.is_empty() => self.topics.contains(node),
            _ => true,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ClientId, Entry>,
    projects: HashMap<ProjectId, HashSet<ClientId>>,
}

impl RegistryState {
    fn remove(&mut self, client_id: &ClientId) -> Option<Entry> {
        let entry = self.connections.remove(client_id)?;
        let project = &entry.connection.project_id;
        if let Some(clients) = self.projects.get_mut(project) {
            clients.remove(client_id);
            if clients.is_empty() {
                self.projects.remove(project);
            }
        }
        Some(entry)
    }
}

pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    demand: Arc<dyn ChannelDemand>,
}

impl ConnectionRegistry {
    pub fn new(demand: Arc<dyn ChannelDemand>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            demand,
        }
    }

    /// Registry with no relay behind it.
    pub fn standalone() -> Self {
        Self::new(Arc::new(NoDemand))
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a live connection. A stale entry under the same client id is
    /// evicted first; dropping its handle closes the old socket.
    pub fn register(
        &self,
        project_id: ProjectId,
        client_id: ClientId,
        handle: ConnectionHandle,
    ) -> Connection {
        let connection = Connection {
            client_id,
            project_id: project_id.clone(),
            connected_at: Utc::now(),
        };

        let mut state = self.write();
        let stale = state.remove(&client_id);
        state.connections.insert(
            client_id,
            Entry {
                connection: connection.clone(),
                handle,
                topics: HashSet::new(),
            },
        );
        state
            .projects
            .entry(project_id.clone())
            .or_default()
            .insert(client_id);

        // Acquire before releasing the stale entry so a same-project
        // re-register never drops the channel to zero.
        self.demand.acquire(&ChannelName::project(&project_id));
        match stale {
            Some(stale) => {
                warn!(
                    client_id = %client_id,
                    stale_project = %stale.connection.project_id,
                    "client id already registered, evicted stale connection"
                );
                self.demand
                    .release(&ChannelName::project(&stale.connection.project_id));
            }
            None => metrics::connections().add(1, &[]),
        }
        drop(state);

        info!(client_id = %client_id, project_id = %project_id, "connection registered");
        connection
    }

    /// Remove a connection. Returns false if it was not registered.
    pub fn unregister(&self, client_id: &ClientId) -> bool {
        let mut state = self.write();
        let Some(entry) = state.remove(client_id) else {
            return false;
        };
        self.demand
            .release(&ChannelName::project(&entry.connection.project_id));
        drop(state);

        metrics::connections().add(-1, &[]);
        info!(
            client_id = %client_id,
            project_id = %entry.connection.project_id,
            "connection unregistered"
        );
        true
    }

    /// Unregister only if the entry still owns `handle`. A client that has
    /// already re-registered under the same id keeps its new socket.
    pub fn unregister_handle(&self, client_id: &ClientId, handle: &ConnectionHandle) -> bool {
        let mut state = self.write();
        let owned = state
            .connections
            .get(client_id)
            .is_some_and(|entry| entry.handle.same_channel(handle));
        if !owned {
            return false;
        }
        if let Some(entry) = state.remove(client_id) {
            self.demand
                .release(&ChannelName::project(&entry.connection.project_id));
        }
        drop(state);
        metrics::connections().add(-1, &[]);
        true
    }

    /// Deliver to every connection of `project_id` whose topic filter
    /// accepts the envelope.
    pub fn fan_out(&self, project_id: &ProjectId, envelope: &Envelope) -> DeliveryReport {
        let Some(frame) = encode(envelope) else {
            return DeliveryReport::default();
        };
        self.fan_out_frame(project_id, envelope.kind.node_id(), frame)
    }

    /// Deliver an already-encoded frame. `node_id` is matched against topic
    /// filters; `None` reaches every connection of the project.
    pub fn fan_out_frame(
        &self,
        project_id: &ProjectId,
        node_id: Option<&NodeId>,
        frame: Frame,
    ) -> DeliveryReport {
        let targets: Vec<(ClientId, ConnectionHandle)> = {
            let state = self.read();
            let Some(clients) = state.projects.get(project_id) else {
                debug!(project_id = %project_id, "no connections for project");
                return DeliveryReport::default();
            };
            clients
                .iter()
                .filter_map(|id| state.connections.get(id).map(|entry| (id, entry)))
                .filter(|(_, entry)| entry.accepts(node_id))
                .map(|(id, entry)| (*id, entry.handle.clone()))
                .collect()
        };

        self.deliver(targets, frame, "project")
    }

    /// Deliver to every connection, ignoring topic filters.
    pub fn broadcast_all(&self, envelope: &Envelope) -> DeliveryReport {
        match encode(envelope) {
            Some(frame) => self.broadcast_frame(frame),
            None => DeliveryReport::default(),
        }
    }

    pub fn broadcast_frame(&self, frame: Frame) -> DeliveryReport {
        let targets: Vec<(ClientId, ConnectionHandle)> = self
            .read()
            .connections
            .iter()
            .map(|(id, entry)| (*id, entry.handle.clone()))
            .collect();
        self.deliver(targets, frame, "all")
    }

    /// Deliver to one client. Returns false if it is unknown or was evicted.
    pub fn send_to(&self, client_id: &ClientId, envelope: &Envelope) -> bool {
        let Some(frame) = encode(envelope) else {
            return false;
        };
        let Some(handle) = self
            .read()
            .connections
            .get(client_id)
            .map(|entry| entry.handle.clone())
        else {
            return false;
        };
        self.deliver(vec![(*client_id, handle)], frame, "direct")
            .is_clean()
    }

    fn deliver(
        &self,
        targets: Vec<(ClientId, ConnectionHandle)>,
        frame: Frame,
        scope: &'static str,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut dead = Vec::new();

        for (client_id, handle) in targets {
            match handle.try_send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client_id = %client_id, "outbound buffer full, evicting slow consumer");
                    dead.push((client_id, handle));
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client_id = %client_id, "socket closed during fan-out");
                    dead.push((client_id, handle));
                }
            }
        }

        for (client_id, handle) in dead {
            if self.unregister_handle(&client_id, &handle) {
                report.failed.push(client_id);
            }
        }

        if report.delivered > 0 {
            metrics::fanout_deliveries().add(
                report.delivered as u64,
                &[KeyValue::new("scope", scope), KeyValue::new("result", "ok")],
            );
        }
        if !report.failed.is_empty() {
            metrics::fanout_deliveries().add(
                report.failed.len() as u64,
                &[KeyValue::new("scope", scope), KeyValue::new("result", "evicted")],
            );
        }
        report
    }

    /// Add node ids to a connection's topic filter. Returns false for an
    /// unknown client.
    pub fn add_topics(&self, client_id: &ClientId, node_ids: &[NodeId]) -> bool {
        let mut state = self.write();
        let Some(entry) = state.connections.get_mut(client_id) else {
            return false;
        };
        entry.topics.extend(node_ids.iter().cloned());
        true
    }

    /// Remove node ids from a connection's topic filter. Removing the last
    /// one returns the connection to receiving every event.
    pub fn remove_topics(&self, client_id: &ClientId, node_ids: &[NodeId]) -> bool {
        let mut state = self.write();
        let Some(entry) = state.connections.get_mut(client_id) else {
            return false;
        };
        for node in node_ids {
            entry.topics.remove(node);
        }
        true
    }

    pub fn topics(&self, client_id: &ClientId) -> Option<Vec<NodeId>> {
        self.read().connections.get(client_id).map(|entry| {
            let mut topics: Vec<NodeId> = entry.topics.iter().cloned().collect();
            topics.sort();
            topics
        })
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Connection> {
        self.read()
            .connections
            .get(client_id)
            .map(|entry| entry.connection.clone())
    }

    pub fn connections(&self, project_id: &ProjectId) -> Vec<Connection> {
        let state = self.read();
        state
            .projects
            .get(project_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.connections.get(id))
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn project_connection_count(&self, project_id: &ProjectId) -> usize {
        self.read().projects.get(project_id).map_or(0, HashSet::len)
    }

    /// Projects with at least one live connection.
    pub fn active_projects(&self) -> Vec<ProjectId> {
        let mut projects: Vec<ProjectId> = self.read().projects.keys().cloned().collect();
        projects.sort();
        projects
    }

    /// Unregister everything. Dropping the handles ends every writer task.
    pub fn close_all(&self) -> usize {
        let mut state = self.write();
        let ids: Vec<ClientId> = state.connections.keys().copied().collect();
        for id in &ids {
            if let Some(entry) = state.remove(id) {
                self.demand
                    .release(&ChannelName::project(&entry.connection.project_id));
            }
        }
        drop(state);
        metrics::connections().add(-(ids.len() as i64), &[]);
        ids.len()
    }
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!(kind = envelope.type_tag(), "failed to serialize envelope: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Heartbeat};

    #[test]
    fn topic_filter_passes_events_without_node() {
        let (tx, _rx) = mpsc::channel(1);
        let mut entry = Entry {
            connection: Connection {
                client_id: ClientId::new(),
                project_id: ProjectId::new("P1").unwrap(),
                connected_at: Utc::now(),
            },
            handle: tx,
            topics: HashSet::new(),
        };
        let n1 = NodeId::new("n1");
        let n2 = NodeId::new("n2");

        assert!(entry.accepts(Some(&n1)));
        entry.topics.insert(n1.clone());
        assert!(entry.accepts(Some(&n1)));
        assert!(!entry.accepts(Some(&n2)));
        assert!(entry.accepts(None));
    }

    #[test]
    fn send_to_unknown_client_is_false() {
        let registry = ConnectionRegistry::standalone();
        let envelope = Envelope::new(EventKind::SystemHeartbeat(Heartbeat { connections: 0 }));
        assert!(!registry.send_to(&ClientId::new(), &envelope));
    }
}
