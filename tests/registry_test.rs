//! Integration tests for the connection registry.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use studio_relay::broker::ChannelName;
use studio_relay::event::{Envelope, EventKind, Heartbeat, NodeStateUpdated, TaskLifecycle};
use studio_relay::model::{ClientId, NodeId, ProjectId, TaskId};
use studio_relay::registry::{ChannelDemand, ConnectionRegistry, Frame};
use tokio::sync::mpsc;

/// Records every demand change in order.
#[derive(Default)]
struct RecordingDemand {
    events: Mutex<Vec<String>>,
}

impl RecordingDemand {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ChannelDemand for RecordingDemand {
    fn acquire(&self, channel: &ChannelName) {
        self.events.lock().unwrap().push(format!("+{channel}"));
    }

    fn release(&self, channel: &ChannelName) {
        self.events.lock().unwrap().push(format!("-{channel}"));
    }
}

fn registry() -> (ConnectionRegistry, Arc<RecordingDemand>) {
    let demand = Arc::new(RecordingDemand::default());
    (ConnectionRegistry::new(demand.clone()), demand)
}

fn project(id: &str) -> ProjectId {
    ProjectId::new(id).unwrap()
}

fn socket(buffer: usize) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(buffer)
}

fn started(project_id: &ProjectId, node: &str) -> Envelope {
    Envelope::new(EventKind::TaskStarted(TaskLifecycle {
        task_id: TaskId::new(),
        node_id: Some(NodeId::new(node)),
    }))
    .for_project(project_id.clone())
}

fn received(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

// ---------------------------------------------------------------------------
// Channel demand
// ---------------------------------------------------------------------------

#[test]
fn demand_follows_project_membership() {
    let (registry, demand) = registry();
    let p1 = project("P1");
    let (a, b) = (ClientId::new(), ClientId::new());
    let (tx_a, _rx_a) = socket(8);
    let (tx_b, _rx_b) = socket(8);

    registry.register(p1.clone(), a, tx_a);
    registry.register(p1.clone(), b, tx_b);
    assert_eq!(registry.project_connection_count(&p1), 2);

    assert!(registry.unregister(&a));
    assert!(registry.unregister(&b));
    assert_eq!(registry.project_connection_count(&p1), 0);
    assert!(registry.active_projects().is_empty());

    assert_eq!(
        demand.take(),
        vec![
            "+project:P1:events",
            "+project:P1:events",
            "-project:P1:events",
            "-project:P1:events",
        ]
    );
}

#[test]
fn unregister_is_idempotent() {
    let (registry, demand) = registry();
    let client = ClientId::new();
    let (tx, _rx) = socket(8);
    registry.register(project("P1"), client, tx);

    assert!(registry.unregister(&client));
    assert!(!registry.unregister(&client));
    assert!(!registry.unregister(&ClientId::new()));
    assert_eq!(demand.take(), vec!["+project:P1:events", "-project:P1:events"]);
    assert_eq!(registry.connection_count(), 0);
}

#[test]
fn reregister_same_client_replaces_stale_socket() {
    let (registry, demand) = registry();
    let client = ClientId::new();
    let (old_tx, mut old_rx) = socket(8);
    let (new_tx, _new_rx) = socket(8);

    registry.register(project("P1"), client, old_tx.clone());
    registry.register(project("P2"), client, new_tx);

    assert_eq!(registry.connection_count(), 1);
    assert_eq!(registry.get(&client).unwrap().project_id, project("P2"));
    assert_eq!(
        demand.take(),
        vec!["+project:P1:events", "+project:P2:events", "-project:P1:events"]
    );

    // The old socket's cleanup must not evict the new registration.
    assert!(!registry.unregister_handle(&client, &old_tx));
    assert_eq!(registry.connection_count(), 1);

    // The registry no longer holds the old sender.
    drop(old_tx);
    assert!(old_rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[test]
fn fan_out_reaches_only_the_project() {
    let (registry, _demand) = registry();
    let (p1, p2) = (project("P1"), project("P2"));
    let (tx_a, mut rx_a) = socket(8);
    let (tx_b, mut rx_b) = socket(8);
    let (tx_c, mut rx_c) = socket(8);
    registry.register(p1.clone(), ClientId::new(), tx_a);
    registry.register(p1.clone(), ClientId::new(), tx_b);
    registry.register(p2.clone(), ClientId::new(), tx_c);

    let report = registry.fan_out(&p1, &started(&p1, "n1"));
    assert_eq!(report.delivered, 2);
    assert!(report.is_clean());

    let a = received(&mut rx_a);
    let b = received(&mut rx_b);
    assert_eq!(a.len(), 1);
    assert_eq!(a, b);
    assert_eq!(a[0]["type"], "task.started");
    assert_eq!(a[0]["projectId"], "P1");
    assert!(received(&mut rx_c).is_empty());
}

#[test]
fn closed_socket_is_evicted_without_affecting_others() {
    let (registry, demand) = registry();
    let p1 = project("P1");
    let (alive, dead) = (ClientId::new(), ClientId::new());
    let (tx_alive, mut rx_alive) = socket(8);
    let (tx_dead, rx_dead) = socket(8);
    registry.register(p1.clone(), alive, tx_alive);
    registry.register(p1.clone(), dead, tx_dead);
    demand.take();

    drop(rx_dead);
    let report = registry.fan_out(&p1, &started(&p1, "n1"));

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, vec![dead]);
    assert!(registry.get(&dead).is_none());
    assert_eq!(received(&mut rx_alive).len(), 1);
    assert_eq!(demand.take(), vec!["-project:P1:events"]);
}

#[test]
fn slow_consumer_is_evicted_when_buffer_fills() {
    let (registry, _demand) = registry();
    let p1 = project("P1");
    let (fast, slow) = (ClientId::new(), ClientId::new());
    let (tx_fast, mut rx_fast) = socket(16);
    let (tx_slow, _rx_slow) = socket(2);
    registry.register(p1.clone(), fast, tx_fast);
    registry.register(p1.clone(), slow, tx_slow);

    let mut evicted = Vec::new();
    for _ in 0..3 {
        evicted.extend(registry.fan_out(&p1, &started(&p1, "n1")).failed);
    }

    assert_eq!(evicted, vec![slow]);
    assert_eq!(registry.connection_count(), 1);
    assert_eq!(received(&mut rx_fast).len(), 3);
}

#[test]
fn topic_filter_limits_node_events() {
    let (registry, _demand) = registry();
    let p1 = project("P1");
    let (filtered, open) = (ClientId::new(), ClientId::new());
    let (tx_f, mut rx_f) = socket(8);
    let (tx_o, mut rx_o) = socket(8);
    registry.register(p1.clone(), filtered, tx_f);
    registry.register(p1.clone(), open, tx_o);

    assert!(registry.add_topics(&filtered, &[NodeId::new("n1")]));
    assert_eq!(registry.topics(&filtered).unwrap(), vec![NodeId::new("n1")]);

    registry.fan_out(&p1, &started(&p1, "n1"));
    registry.fan_out(&p1, &started(&p1, "n2"));
    registry.fan_out(
        &p1,
        &Envelope::new(EventKind::NodeStateUpdated(NodeStateUpdated {
            node_id: NodeId::new("n2"),
            state: serde_json::json!({"status": "dirty"}),
        }))
        .for_project(p1.clone()),
    );

    assert_eq!(received(&mut rx_f).len(), 1);
    assert_eq!(received(&mut rx_o).len(), 3);

    assert!(registry.remove_topics(&filtered, &[NodeId::new("n1")]));
    registry.fan_out(&p1, &started(&p1, "n2"));
    assert_eq!(received(&mut rx_f).len(), 1);
}

#[test]
fn broadcast_reaches_every_project() {
    let (registry, _demand) = registry();
    let (tx_a, mut rx_a) = socket(8);
    let (tx_b, mut rx_b) = socket(8);
    registry.register(project("P1"), ClientId::new(), tx_a);
    registry.register(project("P2"), ClientId::new(), tx_b);

    let heartbeat = Envelope::new(EventKind::SystemHeartbeat(Heartbeat { connections: 2 }));
    assert_eq!(registry.broadcast_all(&heartbeat).delivered, 2);
    assert_eq!(received(&mut rx_a)[0]["type"], "system.heartbeat");
    assert_eq!(received(&mut rx_b)[0]["payload"]["connections"], 2);
}

#[test]
fn close_all_releases_every_channel() {
    let (registry, demand) = registry();
    let (tx_a, mut rx_a) = socket(8);
    let (tx_b, _rx_b) = socket(8);
    registry.register(project("P1"), ClientId::new(), tx_a);
    registry.register(project("P2"), ClientId::new(), tx_b);
    demand.take();

    assert_eq!(registry.close_all(), 2);
    assert_eq!(registry.connection_count(), 0);

    let mut released = demand.take();
    released.sort();
    assert_eq!(released, vec!["-project:P1:events", "-project:P2:events"]);
    // Writer side sees the channel closed.
    assert!(matches!(
        rx_a.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));
}
