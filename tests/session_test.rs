//! Session manager tests against a scripted WebSocket server, plus one run
//! against the real relay server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use studio_relay::broker::{Broker, MemoryBroker, Publisher};
use studio_relay::config::TierTable;
use studio_relay::dispatcher::{DispatchRequest, TaskDispatcher};
use studio_relay::event::{ConnectionEstablished, Envelope, EventKind};
use studio_relay::model::{ClientId, NodeId, ProjectId};
use studio_relay::relay::{PubSubRelay, RelaySettings};
use studio_relay::server::{self, AnyProject, AppState, ServerSettings};
use studio_relay::session::{self, SessionConfig, SessionHandle, SessionState};
use studio_relay::worker::SimulatedWorker;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;

const WAIT: Duration = Duration::from_secs(5);

/// Accepts TCP connections and hands them to the test, which decides when
/// (and whether) to complete the WebSocket handshake.
struct ScriptedServer {
    url: String,
    pending: mpsc::UnboundedReceiver<TcpStream>,
}

struct ServerConn {
    uri: String,
    ws: WebSocketStream<TcpStream>,
}

impl ScriptedServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/projects/P1", listener.local_addr().unwrap());
        let (tx, pending) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    return;
                }
            }
        });
        Self { url, pending }
    }

    async fn next_stream(&mut self) -> TcpStream {
        tokio::time::timeout(WAIT, self.pending.recv())
            .await
            .expect("no connection attempt")
            .unwrap()
    }

    /// Complete the handshake on the next connection attempt.
    async fn accept(&mut self) -> ServerConn {
        let stream = self.next_stream().await;
        let (uri_tx, uri_rx) = std::sync::mpsc::channel();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let _ = uri_tx.send(request.uri().to_string());
                Ok(response)
            },
        )
        .await
        .unwrap();
        ServerConn {
            uri: uri_rx.recv().unwrap(),
            ws,
        }
    }

    /// Answer the next attempt with a plain HTTP error.
    async fn reject(&mut self, status: u16) {
        let stream = self.next_stream().await;
        let _ = tokio_tungstenite::accept_hdr_async(
            stream,
            move |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder().status(status).body(None).unwrap())
            },
        )
        .await;
    }
}

impl ServerConn {
    async fn establish(&mut self, client_id: ClientId, resumed: bool) {
        let project_id = ProjectId::new("P1").unwrap();
        let envelope = Envelope::new(EventKind::ConnectionEstablished(ConnectionEstablished {
            client_id,
            project_id: project_id.clone(),
            resumed,
            heartbeat_interval_ms: 30_000,
        }))
        .for_project(project_id);
        self.ws
            .send(Message::Text(envelope.to_json().unwrap()))
            .await
            .unwrap();
    }

    async fn next_json(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for client frame")
                .expect("client went away")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }
}

fn fast_config(url: &str) -> SessionConfig {
    SessionConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        suspended_delay: Duration::from_millis(20),
        ..SessionConfig::new(url)
    }
}

async fn wait_state(session: &SessionHandle, pred: impl Fn(&SessionState) -> bool) -> SessionState {
    let mut changes = session.state_changes();
    let state = tokio::time::timeout(WAIT, changes.wait_for(|s| pred(s)))
        .await
        .expect("state never reached")
        .unwrap();
    state.clone()
}

fn ping(correlation: &str) -> Envelope {
    Envelope::new(EventKind::Ping).with_correlation(Some(correlation.to_string()))
}

#[tokio::test]
async fn first_connect_delivers_established() {
    let mut server = ScriptedServer::start().await;
    let mut session = session::connect(fast_config(&server.url));

    let mut conn = server.accept().await;
    assert!(!conn.uri.contains("client_id"));
    let client_id = ClientId::new();
    conn.establish(client_id, false).await;

    let event = tokio::time::timeout(WAIT, session.next_event()).await.unwrap().unwrap();
    assert_eq!(event.type_tag(), "connection.established");
    assert_eq!(session.client_id(), Some(client_id));
    assert_eq!(session.state(), SessionState::Connected);

    session.send(ping("p1")).unwrap();
    let frame = conn.next_json().await;
    assert_eq!(frame["type"], "ping");
    assert_eq!(frame["correlationId"], "p1");

    session.close().await;
}

#[tokio::test]
async fn reconnect_resumes_id_then_resubscribes_then_flushes() {
    let mut server = ScriptedServer::start().await;
    let session = session::connect(fast_config(&server.url));

    let mut first = server.accept().await;
    let client_id = ClientId::new();
    first.establish(client_id, false).await;
    tokio::time::timeout(WAIT, async {
        while session.client_id().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    session.subscribe(vec![NodeId::new("n1"), NodeId::new("n2")]).unwrap();
    let subscribe = first.next_json().await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["payload"]["nodeIds"], serde_json::json!(["n1", "n2"]));

    // Server goes away.
    first.ws.close(None).await.unwrap();
    drop(first);
    wait_state(&session, |s| !s.is_live()).await;

    // Offline: these are queued until the next connection is up.
    session.unsubscribe(vec![NodeId::new("n2")]).unwrap();
    session.send(ping("q1")).unwrap();
    session.send(ping("q2")).unwrap();

    let mut second = server.accept().await;
    assert!(
        second.uri.contains(&format!("client_id={client_id}")),
        "reconnect did not carry the client id: {}",
        second.uri
    );

    let resubscribe = second.next_json().await;
    assert_eq!(resubscribe["type"], "subscribe");
    assert_eq!(resubscribe["payload"]["nodeIds"], serde_json::json!(["n1"]));
    assert_eq!(second.next_json().await["correlationId"], "q1");
    assert_eq!(second.next_json().await["correlationId"], "q2");

    wait_state(&session, |s| *s == SessionState::Connected).await;
    session.close().await;
}

#[tokio::test]
async fn offline_queue_drops_oldest_when_full() {
    let mut server = ScriptedServer::start().await;
    let config = SessionConfig {
        queue_capacity: 2,
        ..fast_config(&server.url)
    };
    let session = session::connect(config);

    // The handshake is held open, so everything below is queued.
    let stream = server.next_stream().await;
    for id in ["a", "b", "c"] {
        session.send(ping(id)).unwrap();
    }
    drop(stream);

    let mut conn = server.accept().await;
    assert_eq!(conn.next_json().await["correlationId"], "b");
    assert_eq!(conn.next_json().await["correlationId"], "c");

    session.close().await;
}

#[tokio::test]
async fn silent_server_suspends_then_reconnects() {
    let mut server = ScriptedServer::start().await;
    let config = SessionConfig {
        heartbeat_timeout: Duration::from_millis(100),
        ..fast_config(&server.url)
    };
    let session = session::connect(config);

    let mut first = server.accept().await;
    let client_id = ClientId::new();
    first.establish(client_id, false).await;

    // No heartbeat follows.
    wait_state(&session, |s| *s == SessionState::Suspended).await;

    let second = server.accept().await;
    assert!(second.uri.contains(&format!("client_id={client_id}")));
    wait_state(&session, |s| *s == SessionState::Connected).await;

    drop(first);
    session.close().await;
}

#[tokio::test]
async fn rejected_upgrade_is_terminal() {
    let mut server = ScriptedServer::start().await;
    let session = session::connect(fast_config(&server.url));

    server.reject(404).await;
    match wait_state(&session, SessionState::is_terminal).await {
        SessionState::Error(reason) => assert!(reason.contains("404"), "{reason}"),
        other => panic!("expected error state, got {other}"),
    }
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    // Bind and release a port so nothing is listening on it.
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let config = SessionConfig {
        max_attempts: Some(3),
        ..fast_config(&format!("ws://{addr}/ws/projects/P1"))
    };
    let session = session::connect(config);

    match wait_state(&session, SessionState::is_terminal).await {
        SessionState::Error(reason) => {
            assert!(reason.starts_with("gave up after 3 failed attempts"), "{reason}")
        }
        other => panic!("expected error state, got {other}"),
    }
}

#[tokio::test]
async fn flapping_server_keeps_backing_off() {
    let mut server = ScriptedServer::start().await;
    let config = SessionConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        ..fast_config(&server.url)
    };
    let session = session::connect(config);

    // Accept and drop straight away, well inside `stable_after`.
    for _ in 0..3 {
        let mut conn = server.accept().await;
        conn.establish(ClientId::new(), false).await;
        drop(conn);
    }

    let state = wait_state(&session, |s| {
        matches!(s, SessionState::Reconnecting { attempt } if *attempt >= 3)
    })
    .await;
    assert_eq!(state, SessionState::Reconnecting { attempt: 3 });
    session.close().await;
}

#[tokio::test]
async fn unread_events_do_not_block_close() {
    let mut server = ScriptedServer::start().await;
    let session = session::connect(fast_config(&server.url));
    let mut conn = server.accept().await;
    conn.establish(ClientId::new(), false).await;
    wait_state(&session, |s| *s == SessionState::Connected).await;

    // More frames than the session buffers; the owner never reads them.
    for i in 0..1100 {
        let text = serde_json::json!({
            "type": "render.preview",
            "projectId": "P1",
            "payload": {"frame": i}
        })
        .to_string();
        conn.ws.send(Message::Text(text)).await.unwrap();
    }
    conn.ws.flush().await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), session.close())
        .await
        .expect("close stalled behind unread events");
}

#[tokio::test]
async fn close_while_offline_returns_promptly() {
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let config = SessionConfig {
        base_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(60),
        ..SessionConfig::new(format!("ws://{addr}/ws/projects/P1"))
    };
    let session = session::connect(config);
    wait_state(&session, |s| matches!(s, SessionState::Reconnecting { .. })).await;

    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .expect("close waited out the backoff");
}

#[tokio::test]
async fn close_sends_close_frame() {
    let mut server = ScriptedServer::start().await;
    let session = session::connect(fast_config(&server.url));
    let mut conn = server.accept().await;
    conn.establish(ClientId::new(), false).await;
    wait_state(&session, |s| *s == SessionState::Connected).await;

    session.close().await;

    let end = tokio::time::timeout(WAIT, async {
        loop {
            match conn.ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test]
async fn session_follows_tasks_on_relay_server() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (relay, registry) = PubSubRelay::start(Arc::clone(&broker), RelaySettings::default());
    let worker = SimulatedWorker::new(Duration::from_millis(5)).with_steps(2);
    let dispatcher = TaskDispatcher::new(TierTable::builtin(), Arc::new(worker), Publisher::new(broker));
    let state = AppState::new(
        registry,
        relay,
        dispatcher,
        Arc::new(AnyProject),
        ServerSettings::default(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let served = tokio::spawn(server::serve(listener, state.clone(), async {
        stop_rx.await.ok();
    }));

    let mut session = session::connect(fast_config(&format!("ws://{addr}/ws/projects/P1")));
    let established = tokio::time::timeout(WAIT, session.next_event()).await.unwrap().unwrap();
    assert_eq!(established.type_tag(), "connection.established");

    let task_id = state
        .dispatcher()
        .dispatch(DispatchRequest::new(ProjectId::new("P1").unwrap()).node("n1"))
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, session.next_event()).await.unwrap().unwrap();
        if event.kind.task_id() != Some(task_id) {
            continue;
        }
        seen.push(event.type_tag().to_string());
        if event.kind.is_task_terminal() {
            break;
        }
    }
    assert_eq!(
        seen,
        vec!["task.queued", "task.started", "task.progress", "task.progress", "task.success"]
    );

    session.close().await;
    let _ = stop_tx.send(());
    served.await.unwrap().unwrap();
}
