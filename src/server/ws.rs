//! Per-socket connection handling.
//!
//! Each socket gets a writer task that drains the outbound queue owned by
//! the registry, and a reader loop that handles client envelopes. Protocol
//! errors are answered with an `error` envelope and never close the socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use super::AppState;
use super::http::{ApiError, known_project};
use crate::broker::ChannelName;
use crate::dispatcher::DispatchRequest;
use crate::error::Error;
use crate::event::{
    CancelTask, ConnectionEstablished, Envelope, ErrorCode, ErrorPayload, EventKind,
};
use crate::model::{ClientId, ProjectId};
use crate::registry::Frame;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Client id from a previous session, to resume under the same id.
    pub client_id: Option<String>,
}

pub async fn upgrade(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let project_id = known_project(&state, project_id).await?;

    let resumed_id = query
        .client_id
        .as_deref()
        .and_then(|raw| match raw.parse::<ClientId>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(client_id = raw, "ignoring malformed client id");
                None
            }
        });
    let resumed = resumed_id.is_some();
    let client_id = resumed_id.unwrap_or_default();

    let span = info_span!("ws.connection", project_id = %project_id, client_id = %client_id);
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(state, socket, project_id, client_id, resumed).instrument(span)
    }))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    project_id: ProjectId,
    client_id: ClientId,
    resumed: bool,
) {
    let settings = state.settings().clone();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(settings.outbound_buffer);
    let own_handle = tx.downgrade();

    state
        .registry()
        .register(project_id.clone(), client_id, tx);

    // Events published after connection.established must reach this socket.
    let channel = ChannelName::project(&project_id);
    if !state
        .relay()
        .wait_ready(&channel, settings.subscribe_timeout)
        .await
    {
        warn!("project channel not live yet, continuing");
    }

    let mut writer = tokio::spawn(
        async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    );

    state.registry().send_to(
        &client_id,
        &Envelope::new(EventKind::ConnectionEstablished(ConnectionEstablished {
            client_id,
            project_id: project_id.clone(),
            resumed,
            heartbeat_interval_ms: settings.heartbeat_interval.as_millis() as u64,
        }))
        .for_project(project_id.clone()),
    );
    info!(resumed, "socket open");

    let mut writer_done = false;
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            // The registry dropped our queue: evicted or shutting down.
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                handle_text(&state, &project_id, &client_id, &text).await;
            }
            Some(Ok(Message::Binary(_))) => reply_error(
                &state,
                &client_id,
                None,
                ErrorCode::MalformedMessage,
                "binary frames are not supported",
            ),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("socket read error: {e}");
                break;
            }
        }
    }

    if let Some(handle) = own_handle.upgrade() {
        state.registry().unregister_handle(&client_id, &handle);
    }
    // Let the writer flush and close, but do not wait on a stalled peer.
    if !writer_done && tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    info!("socket closed");
}

async fn handle_text(state: &AppState, project_id: &ProjectId, client_id: &ClientId, text: &str) {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("malformed client message: {e}");
            reply_error(
                state,
                client_id,
                None,
                ErrorCode::MalformedMessage,
                format!("could not parse message: {e}"),
            );
            return;
        }
    };
    let correlation_id = envelope.correlation_id.clone();

    match envelope.kind {
        EventKind::Ping => {
            state.registry().send_to(
                client_id,
                &Envelope::new(EventKind::Pong).with_correlation(correlation_id),
            );
        }
        EventKind::StartGeneration(request) => {
            let result = state
                .dispatcher()
                .dispatch(DispatchRequest {
                    project_id: project_id.clone(),
                    node_id: request.node_id,
                    quality_tier: request.quality_tier,
                    parameters: request.parameters,
                    correlation_id: correlation_id.clone(),
                })
                .await;
            match result {
                Ok(task_id) => debug!(task_id = %task_id, "generation started"),
                Err(Error::InvalidParameters(msg)) => reply_error(
                    state,
                    client_id,
                    correlation_id,
                    ErrorCode::InvalidParameters,
                    msg,
                ),
                Err(e) => {
                    warn!("dispatch failed: {e}");
                    reply_error(
                        state,
                        client_id,
                        correlation_id,
                        ErrorCode::Internal,
                        "dispatch failed",
                    );
                }
            }
        }
        EventKind::TaskCancel(CancelTask { task_id }) => {
            let dispatcher = state.dispatcher();
            let owned = dispatcher
                .get_status(&task_id)
                .is_ok_and(|task| &task.project_id == project_id);
            let (code, message) = if !owned {
                (ErrorCode::TaskNotFound, "no such task in this project")
            } else {
                match dispatcher.cancel(&task_id).await {
                    // task.cancelled reaches the client through the channel.
                    Ok(true) => return,
                    Ok(false) => (ErrorCode::TaskNotCancellable, "task already finished"),
                    Err(_) => (ErrorCode::TaskNotFound, "no such task in this project"),
                }
            };
            let error = Envelope::new(EventKind::Error(ErrorPayload {
                code,
                message: message.to_string(),
                task_id: Some(task_id),
            }))
            .with_correlation(correlation_id);
            state.registry().send_to(client_id, &error);
        }
        EventKind::Subscribe(topics) => {
            state.registry().add_topics(client_id, &topics.node_ids);
        }
        EventKind::Unsubscribe(topics) => {
            state.registry().remove_topics(client_id, &topics.node_ids);
        }
        other @ (EventKind::ConnectionEstablished(_)
        | EventKind::SystemHeartbeat(_)
        | EventKind::SystemDegraded(_)
        | EventKind::Pong
        | EventKind::Error(_)
        | EventKind::TaskQueued(_)
        | EventKind::TaskStarted(_)
        | EventKind::TaskProgress(_)
        | EventKind::TaskSuccess(_)
        | EventKind::TaskFailed(_)
        | EventKind::TaskCancelled(_)
        | EventKind::NodeStateUpdated(_)
        | EventKind::Unknown { .. }) => reply_error(
            state,
            client_id,
            correlation_id,
            ErrorCode::UnsupportedType,
            format!("{} is not accepted from clients", other.type_tag()),
        ),
    }
}

fn reply_error(
    state: &AppState,
    client_id: &ClientId,
    correlation_id: Option<String>,
    code: ErrorCode,
    message: impl Into<String>,
) {
    let envelope = Envelope::error(code, message).with_correlation(correlation_id);
    state.registry().send_to(client_id, &envelope);
}
