//! Message envelopes carried on sockets and broker channels.
//!
//! Every real-time event is wrapped in an [`Envelope`]. The `type` tag is
//! mapped onto the closed [`EventKind`] enum; tags outside the vocabulary are
//! kept verbatim in [`EventKind::Unknown`] so the relay can forward them to
//! clients that understand them. The same JSON is used between workers and the
//! broker and between the relay and sockets.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ClientId, NodeId, ProjectId, TaskId};

/// Wire names of every known envelope type.
pub mod tags {
    pub const PING: &str = "ping";
    pub const START_GENERATION: &str = "start_generation";
    pub const TASK_CANCEL: &str = "task.cancel";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";

    pub const CONNECTION_ESTABLISHED: &str = "connection.established";
    pub const SYSTEM_HEARTBEAT: &str = "system.heartbeat";
    pub const SYSTEM_DEGRADED: &str = "system.degraded";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_PROGRESS: &str = "task.progress";
    pub const TASK_SUCCESS: &str = "task.success";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const NODE_STATE_UPDATED: &str = "node.state.updated";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single event. Built once at the point of emission and shared read-only
/// by every fan-out target.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    /// Links a response or lifecycle event to the request that caused it.
    pub correlation_id: Option<String>,
    /// Owning project. Always set for project-scoped events.
    pub project_id: Option<ProjectId>,
    pub kind: EventKind,
}

impl Envelope {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: None,
            project_id: None,
            kind,
        }
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Shorthand for an `error` envelope addressed to one client.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error(ErrorPayload {
            code,
            message: message.into(),
            task_id: None,
        }))
    }

    pub fn type_tag(&self) -> &str {
        self.kind.type_tag()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Envelope", 5)?;
        state.serialize_field("type", self.kind.type_tag())?;
        state.serialize_field("timestamp", &self.timestamp)?;
        match &self.correlation_id {
            Some(id) => state.serialize_field("correlationId", id)?,
            None => state.skip_field("correlationId")?,
        }
        match &self.project_id {
            Some(id) => state.serialize_field("projectId", id)?,
            None => state.skip_field("projectId")?,
        }
        state.serialize_field("payload", &Payload(&self.kind))?;
        state.end()
    }
}

/// Envelope as it appears on the wire, before the tag is interpreted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    type_tag: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    project_id: Option<ProjectId>,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = Error;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        Ok(Self {
            timestamp: raw.timestamp,
            correlation_id: raw.correlation_id,
            project_id: raw.project_id,
            kind: EventKind::from_wire(raw.type_tag, raw.payload)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// The few fields of a broker message the relay routes and checks on. The
/// message itself is forwarded byte for byte, so fields the relay does not
/// know about reach clients untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub type_tag: String,
    pub task_id: Option<TaskId>,
    pub node_id: Option<NodeId>,
    /// Progress as sent, any JSON number.
    pub progress: Option<f64>,
}

impl Routing {
    /// Read the routing fields. Fails only when `text` is not a JSON object
    /// with a non-empty string `type`.
    pub fn peek(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let type_tag = value
            .get("type")
            .and_then(Value::as_str)
            .filter(|tag| !tag.is_empty())
            .ok_or_else(|| Error::Protocol("message has no type".into()))?
            .to_string();
        let payload = value.get("payload");

        Ok(Self {
            task_id: payload_field(payload, "taskId")
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok()),
            node_id: payload_field(payload, "nodeId")
                .and_then(Value::as_str)
                .map(NodeId::new),
            progress: payload_field(payload, "progress").and_then(Value::as_f64),
            type_tag,
        })
    }

    /// A `task.*` event naming a task.
    pub fn is_task_event(&self) -> bool {
        self.task_id.is_some() && self.type_tag.starts_with("task.")
    }

    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self.type_tag.as_str(),
            tags::TASK_SUCCESS | tags::TASK_FAILED | tags::TASK_CANCELLED
        )
    }
}

fn payload_field<'a>(payload: Option<&'a Value>, name: &str) -> Option<&'a Value> {
    payload.and_then(|p| p.get(name))
}

/// Clamp any numeric progress to a whole percentage.
pub fn clamp_percent(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, 100.0).round() as u8
}

fn deserialize_percent<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u8, D::Error> {
    f64::deserialize(deserializer).map(clamp_percent)
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Every event the relay knows about, inbound and outbound.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    // Client -> server
    Ping,
    StartGeneration(StartGeneration),
    TaskCancel(CancelTask),
    Subscribe(NodeTopics),
    Unsubscribe(NodeTopics),

    // Server -> client
    ConnectionEstablished(ConnectionEstablished),
    SystemHeartbeat(Heartbeat),
    SystemDegraded(Degraded),
    Pong,
    Error(ErrorPayload),

    // Task lifecycle, published on project channels
    TaskQueued(TaskQueued),
    TaskStarted(TaskLifecycle),
    TaskProgress(TaskProgress),
    TaskSuccess(TaskSuccess),
    TaskFailed(TaskFailed),
    TaskCancelled(TaskLifecycle),
    NodeStateUpdated(NodeStateUpdated),

    /// A tag outside the vocabulary. Forwarded as-is.
    Unknown { type_tag: String, payload: Value },
}

impl EventKind {
    pub fn type_tag(&self) -> &str {
        match self {
            EventKind::Ping => tags::PING,
            EventKind::StartGeneration(_) => tags::START_GENERATION,
            EventKind::TaskCancel(_) => tags::TASK_CANCEL,
            EventKind::Subscribe(_) => tags::SUBSCRIBE,
            EventKind::Unsubscribe(_) => tags::UNSUBSCRIBE,
            EventKind::ConnectionEstablished(_) => tags::CONNECTION_ESTABLISHED,
            EventKind::SystemHeartbeat(_) => tags::SYSTEM_HEARTBEAT,
            EventKind::SystemDegraded(_) => tags::SYSTEM_DEGRADED,
            EventKind::Pong => tags::PONG,
            EventKind::Error(_) => tags::ERROR,
            EventKind::TaskQueued(_) => tags::TASK_QUEUED,
            EventKind::TaskStarted(_) => tags::TASK_STARTED,
            EventKind::TaskProgress(_) => tags::TASK_PROGRESS,
            EventKind::TaskSuccess(_) => tags::TASK_SUCCESS,
            EventKind::TaskFailed(_) => tags::TASK_FAILED,
            EventKind::TaskCancelled(_) => tags::TASK_CANCELLED,
            EventKind::NodeStateUpdated(_) => tags::NODE_STATE_UPDATED,
            EventKind::Unknown { type_tag, .. } => type_tag,
        }
    }

    fn from_wire(type_tag: String, payload: Value) -> Result<Self> {
        if type_tag.is_empty() {
            return Err(Error::Protocol("envelope type must not be empty".into()));
        }
        let kind = match type_tag.as_str() {
            tags::PING => EventKind::Ping,
            tags::START_GENERATION => EventKind::StartGeneration(decode(payload)?),
            tags::TASK_CANCEL => EventKind::TaskCancel(decode(payload)?),
            tags::SUBSCRIBE => EventKind::Subscribe(decode(payload)?),
            tags::UNSUBSCRIBE => EventKind::Unsubscribe(decode(payload)?),
            tags::CONNECTION_ESTABLISHED => EventKind::ConnectionEstablished(decode(payload)?),
            tags::SYSTEM_HEARTBEAT => EventKind::SystemHeartbeat(decode(payload)?),
            tags::SYSTEM_DEGRADED => EventKind::SystemDegraded(decode(payload)?),
            tags::PONG => EventKind::Pong,
            tags::ERROR => EventKind::Error(decode(payload)?),
            tags::TASK_QUEUED => EventKind::TaskQueued(decode(payload)?),
            tags::TASK_STARTED => EventKind::TaskStarted(decode(payload)?),
            tags::TASK_PROGRESS => EventKind::TaskProgress(decode(payload)?),
            tags::TASK_SUCCESS => EventKind::TaskSuccess(decode(payload)?),
            tags::TASK_FAILED => EventKind::TaskFailed(decode(payload)?),
            tags::TASK_CANCELLED => EventKind::TaskCancelled(decode(payload)?),
            tags::NODE_STATE_UPDATED => EventKind::NodeStateUpdated(decode(payload)?),
            _ => EventKind::Unknown { type_tag, payload },
        };
        Ok(kind)
    }

    /// Node the event concerns, used for per-connection topic filtering.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            EventKind::TaskQueued(p) => p.node_id.as_ref(),
            EventKind::TaskStarted(p) | EventKind::TaskCancelled(p) => p.node_id.as_ref(),
            EventKind::TaskProgress(p) => p.node_id.as_ref(),
            EventKind::TaskSuccess(p) => p.node_id.as_ref(),
            EventKind::TaskFailed(p) => p.node_id.as_ref(),
            EventKind::NodeStateUpdated(p) => Some(&p.node_id),
            _ => None,
        }
    }

    /// Task the event concerns, if it is a task lifecycle event.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            EventKind::TaskQueued(p) => Some(p.task_id),
            EventKind::TaskStarted(p) | EventKind::TaskCancelled(p) => Some(p.task_id),
            EventKind::TaskProgress(p) => Some(p.task_id),
            EventKind::TaskSuccess(p) => Some(p.task_id),
            EventKind::TaskFailed(p) => Some(p.task_id),
            _ => None,
        }
    }

    /// Does this event end a task's lifecycle?
    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::TaskSuccess(_) | EventKind::TaskFailed(_) | EventKind::TaskCancelled(_)
        )
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T> {
    let payload = match payload {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    Ok(serde_json::from_value(payload)?)
}

/// Serializes the payload half of an [`EventKind`].
struct Payload<'a>(&'a EventKind);

impl Serialize for Payload<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            EventKind::Ping | EventKind::Pong => {
                serializer.serialize_struct("Empty", 0)?.end()
            }
            EventKind::StartGeneration(p) => p.serialize(serializer),
            EventKind::TaskCancel(p) => p.serialize(serializer),
            EventKind::Subscribe(p) | EventKind::Unsubscribe(p) => p.serialize(serializer),
            EventKind::ConnectionEstablished(p) => p.serialize(serializer),
            EventKind::SystemHeartbeat(p) => p.serialize(serializer),
            EventKind::SystemDegraded(p) => p.serialize(serializer),
            EventKind::Error(p) => p.serialize(serializer),
            EventKind::TaskQueued(p) => p.serialize(serializer),
            EventKind::TaskStarted(p) | EventKind::TaskCancelled(p) => p.serialize(serializer),
            EventKind::TaskProgress(p) => p.serialize(serializer),
            EventKind::TaskSuccess(p) => p.serialize(serializer),
            EventKind::TaskFailed(p) => p.serialize(serializer),
            EventKind::NodeStateUpdated(p) => p.serialize(serializer),
            EventKind::Unknown { payload, .. } => payload.serialize(serializer),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// `start_generation`: dispatch a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGeneration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_tier: Option<String>,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

/// `task.cancel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTask {
    pub task_id: TaskId,
}

/// `subscribe` / `unsubscribe`: node topic filter for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTopics {
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub client_id: ClientId,
    pub project_id: ProjectId,
    /// True when the client carried forward a previous client id.
    pub resumed: bool,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub connections: usize,
}

/// `system.degraded`: broker reachability changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Degraded {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedMessage,
    UnsupportedType,
    InvalidParameters,
    TaskNotFound,
    TaskNotCancellable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueued {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Tier the task will run with.
    pub quality_tier: String,
    /// Tier the request asked for, when it differs from the resolved one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_tier: Option<String>,
}

/// `task.started` and `task.cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLifecycle {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// 0-100. Any JSON number is accepted on the way in.
    #[serde(deserialize_with = "deserialize_percent")]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSuccess {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub result_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailed {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateUpdated {
    pub node_id: NodeId,
    pub state: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_envelope_uses_camel_case_wire_format() {
        let task_id = TaskId::new();
        let envelope = Envelope::new(EventKind::TaskProgress(TaskProgress {
            task_id,
            node_id: Some(NodeId::new("n1")),
            progress: 50,
            step_description: Some("sampling".into()),
        }))
        .for_project(ProjectId::new("P1").unwrap())
        .with_correlation(Some("req-1".into()));

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "task.progress");
        assert_eq!(value["projectId"], "P1");
        assert_eq!(value["correlationId"], "req-1");
        assert_eq!(value["payload"]["taskId"], task_id.to_string());
        assert_eq!(value["payload"]["stepDescription"], "sampling");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn unknown_types_are_preserved() {
        let text = json!({
            "type": "render.preview",
            "timestamp": "2026-01-01T00:00:00Z",
            "projectId": "P1",
            "payload": {"frame": 12, "uri": "s3://bucket/frame.png"}
        })
        .to_string();

        let envelope = Envelope::from_json(&text).unwrap();
        match &envelope.kind {
            EventKind::Unknown { type_tag, payload } => {
                assert_eq!(type_tag, "render.preview");
                assert_eq!(payload["frame"], 12);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }

        let forwarded: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        let original: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(forwarded, original);
    }

    #[test]
    fn inbound_messages_may_omit_timestamp_and_payload() {
        let envelope = Envelope::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(envelope.kind, EventKind::Ping);

        let envelope =
            Envelope::from_json(r#"{"type":"start_generation","correlationId":"c1"}"#).unwrap();
        match envelope.kind {
            EventKind::StartGeneration(req) => {
                assert!(req.quality_tier.is_none());
                assert_eq!(req.parameters, json!({}));
            }
            other => panic!("expected StartGeneration, got {other:?}"),
        }
    }

    #[test]
    fn empty_or_missing_type_is_rejected() {
        assert!(Envelope::from_json(r#"{"type":""}"#).is_err());
        assert!(Envelope::from_json(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn known_type_with_bad_payload_is_rejected() {
        let text = r#"{"type":"task.progress","payload":{"progress":"half"}}"#;
        assert!(Envelope::from_json(text).is_err());
    }

    #[test]
    fn node_and_task_accessors() {
        let task_id = TaskId::new();
        let kind = EventKind::TaskCancelled(TaskLifecycle {
            task_id,
            node_id: Some(NodeId::new("n7")),
        });
        assert_eq!(kind.task_id(), Some(task_id));
        assert_eq!(kind.node_id().map(NodeId::as_str), Some("n7"));
        assert!(kind.is_task_terminal());
        assert!(EventKind::Ping.task_id().is_none());
    }

    #[test]
    fn fractional_progress_is_rounded_and_clamped() {
        let task_id = TaskId::new();
        let text = json!({"type": "task.progress", "payload": {"taskId": task_id, "progress": 49.6}})
            .to_string();
        match Envelope::from_json(&text).unwrap().kind {
            EventKind::TaskProgress(p) => assert_eq!(p.progress, 50),
            other => panic!("expected TaskProgress, got {other:?}"),
        }
        assert_eq!(clamp_percent(-3.0), 0);
        assert_eq!(clamp_percent(250.0), 100);
    }

    #[test]
    fn routing_reads_only_what_it_needs() {
        let task_id = TaskId::new();
        let text = json!({
            "type": "task.progress",
            "payload": {"taskId": task_id, "nodeId": "n3", "progress": 12.5, "etaSecs": 9}
        })
        .to_string();
        let routing = Routing::peek(&text).unwrap();
        assert_eq!(routing.task_id, Some(task_id));
        assert_eq!(routing.node_id, Some(NodeId::new("n3")));
        assert_eq!(routing.progress, Some(12.5));
        assert!(routing.is_task_event());
        assert!(!routing.is_task_terminal());

        // Payload shape is not validated here.
        let odd = Routing::peek(r#"{"type":"task.progress","payload":"half"}"#).unwrap();
        assert!(odd.task_id.is_none());
        assert!(Routing::peek(r#"{"payload":{}}"#).is_err());
        assert!(Routing::peek("[1,2]").is_err());
    }
}
