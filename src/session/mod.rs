//! Client-side session manager.
//!
//! Keeps one logical session alive over a sequence of WebSocket connections.
//! Lost connections are retried with capped exponential backoff. The attempt
//! count only resets once a connection has stayed up for `stable_after`, so a
//! server that accepts and immediately drops keeps backing off. A silent
//! server (no frames for `heartbeat_timeout`) is treated as a restart and
//! retried after a short fixed delay instead. Outbound messages sent while
//! offline are queued and flushed after the node topics are re-requested.
//!
//! Server events are buffered for the owner up to a fixed depth; beyond that
//! they are dropped with a warning rather than stalling the connection.
//!
//! ```no_run
//! # async fn demo() -> studio_relay::error::Result<()> {
//! use studio_relay::session::{self, SessionConfig};
//!
//! let mut session = session::connect(SessionConfig::new("ws://127.0.0.1:8080/ws/projects/P1"));
//! while let Some(event) = session.next_event().await {
//!     println!("{}", event.type_tag());
//! }
//! # Ok(())
//! # }
//! ```

pub mod queue;

pub use queue::OutboundQueue;

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backoff::backoff_delay;
use crate::error::{Error, Result};
use crate::event::{Envelope, EventKind, NodeTopics};
use crate::model::{ClientId, NodeId};

const EVENT_BUFFER: usize = 1024;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `ws://host/ws/projects/{project_id}`, without `client_id`.
    pub url: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Silence after which the server is presumed restarted.
    pub heartbeat_timeout: Duration,
    /// Fixed retry delay after a presumed restart.
    pub suspended_delay: Duration,
    pub connect_timeout: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Uptime after which a lost connection counts as healthy and the
    /// backoff starts over.
    pub stable_after: Duration,
    /// Outbound messages held while offline.
    pub queue_capacity: usize,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(75),
            suspended_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            max_attempts: None,
            stable_after: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// Connection state as the user should see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// Waiting before retry number `attempt` (1-based).
    Reconnecting { attempt: u32 },
    /// Server presumed restarted; retrying after a fixed delay.
    Suspended,
    /// Closed by the user.
    Disconnected,
    /// Terminal failure; no further attempts.
    Error(String),
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Error(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            SessionState::Suspended => f.write_str("suspended"),
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

enum Command {
    Send(Envelope),
    Subscribe(Vec<NodeId>),
    Unsubscribe(Vec<NodeId>),
    Close,
}

/// Owner's end of a session. Dropping it closes the session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    client_id: watch::Receiver<Option<ClientId>>,
    events: mpsc::Receiver<Envelope>,
    task: JoinHandle<()>,
}

/// Start a session. Must be called inside a tokio runtime.
pub fn connect(config: SessionConfig) -> SessionHandle {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(SessionState::Connecting);
    let (client_tx, client_id) = watch::channel(None);
    let (events_tx, events) = mpsc::channel(EVENT_BUFFER);

    let span = info_span!("session", url = %config.url);
    let session = Session {
        queue: OutboundQueue::new(config.queue_capacity),
        config,
        commands,
        state: state_tx,
        client_id: client_tx,
        events: events_tx,
        topics: BTreeSet::new(),
    };
    let task = tokio::spawn(session.run().instrument(span));

    SessionHandle {
        commands: commands_tx,
        state,
        client_id,
        events,
        task,
    }
}

impl SessionHandle {
    /// Send now if connected, otherwise queue until the next connection.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.command(Command::Send(envelope))
    }

    /// Follow these nodes. Re-requested after every reconnect.
    pub fn subscribe(&self, node_ids: Vec<NodeId>) -> Result<()> {
        self.command(Command::Subscribe(node_ids))
    }

    pub fn unsubscribe(&self, node_ids: Vec<NodeId>) -> Result<()> {
        self.command(Command::Unsubscribe(node_ids))
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Id assigned by the server, carried across reconnects.
    pub fn client_id(&self) -> Option<ClientId> {
        *self.client_id.borrow()
    }

    /// Next server envelope. `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    /// Close the socket and wait for the session to finish.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Other("session has ended".into()))
    }
}

/// How a live connection ended.
enum Exit {
    Closed,
    Lost,
    Silent,
}

/// Outcome of one connection attempt.
enum Attempt {
    /// Connected, then ended after the given uptime.
    Ended(Exit, Duration),
    Failed(String),
    Rejected(String),
    Closed,
}

enum Step {
    Frame(Option<std::result::Result<Message, tungstenite::Error>>),
    Command(Option<Command>),
    Silent,
}

struct Session {
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SessionState>,
    client_id: watch::Sender<Option<ClientId>>,
    events: mpsc::Sender<Envelope>,
    topics: BTreeSet<NodeId>,
    queue: OutboundQueue,
}

impl Session {
    async fn run(mut self) {
        // Attempts since the last connection that stayed up.
        let mut failures: u32 = 0;
        loop {
            self.set_state(SessionState::Connecting);
            let delay = match self.attempt().await {
                Attempt::Closed | Attempt::Ended(Exit::Closed, _) => {
                    self.set_state(SessionState::Disconnected);
                    return;
                }
                Attempt::Rejected(reason) => {
                    warn!(%reason, "connection rejected, giving up");
                    self.set_state(SessionState::Error(reason));
                    return;
                }
                Attempt::Ended(Exit::Silent, _) => {
                    warn!("no traffic from server, assuming restart");
                    failures = 0;
                    self.set_state(SessionState::Suspended);
                    self.config.suspended_delay
                }
                Attempt::Ended(Exit::Lost, uptime) => {
                    if uptime >= self.config.stable_after {
                        failures = 0;
                    }
                    failures += 1;
                    info!(?uptime, attempt = failures, "connection lost");
                    self.set_state(SessionState::Reconnecting { attempt: failures });
                    backoff_delay(failures - 1, self.config.base_delay, self.config.max_delay)
                }
                Attempt::Failed(reason) => {
                    failures += 1;
                    if self.config.max_attempts.is_some_and(|max| failures >= max) {
                        let reason = format!("gave up after {failures} failed attempts: {reason}");
                        warn!(%reason, "session failed");
                        self.set_state(SessionState::Error(reason));
                        return;
                    }
                    debug!(failures, %reason, "connect failed");
                    self.set_state(SessionState::Reconnecting { attempt: failures });
                    backoff_delay(failures - 1, self.config.base_delay, self.config.max_delay)
                }
            };
            if self.pause(delay).await {
                self.set_state(SessionState::Disconnected);
                return;
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        let url = self.connect_url();
        let connecting = tokio::time::timeout(self.config.connect_timeout, connect_async(url));
        tokio::pin!(connecting);

        let result = loop {
            let command = tokio::select! {
                result = &mut connecting => break result,
                command = self.commands.recv() => command,
            };
            if self.absorb(command) {
                return Attempt::Closed;
            }
        };
        let socket = match result {
            Err(_) => return Attempt::Failed("connect timed out".into()),
            Ok(Err(tungstenite::Error::Http(response))) if response.status().is_client_error() => {
                return Attempt::Rejected(format!("server refused upgrade: {}", response.status()));
            }
            Ok(Err(e)) => return Attempt::Failed(e.to_string()),
            Ok(Ok((socket, _))) => socket,
        };

        self.set_state(SessionState::Connected);
        info!("connected");
        let connected_at = Instant::now();
        let exit = self.serve(socket).await;
        Attempt::Ended(exit, connected_at.elapsed())
    }

    async fn serve(&mut self, socket: Socket) -> Exit {
        let (mut sink, mut stream) = socket.split();

        if !self.restore(&mut sink).await {
            return Exit::Lost;
        }

        let silence = tokio::time::sleep(self.config.heartbeat_timeout);
        tokio::pin!(silence);

        loop {
            let step = tokio::select! {
                frame = stream.next() => Step::Frame(frame),
                command = self.commands.recv() => Step::Command(command),
                _ = &mut silence => Step::Silent,
            };
            match step {
                Step::Frame(Some(Ok(message))) => {
                    silence
                        .as_mut()
                        .reset(Instant::now() + self.config.heartbeat_timeout);
                    match message {
                        Message::Text(text) => self.inbound(&text),
                        Message::Close(_) => return Exit::Lost,
                        _ => {}
                    }
                }
                Step::Frame(Some(Err(e))) => {
                    debug!("read failed: {e}");
                    return Exit::Lost;
                }
                Step::Frame(None) => return Exit::Lost,
                Step::Command(None) | Step::Command(Some(Command::Close)) => {
                    let _ = sink.close().await;
                    return Exit::Closed;
                }
                Step::Command(Some(Command::Send(envelope))) => {
                    if !send(&mut sink, &envelope).await {
                        self.queue.requeue(envelope);
                        return Exit::Lost;
                    }
                }
                Step::Command(Some(Command::Subscribe(node_ids))) => {
                    self.topics.extend(node_ids.iter().cloned());
                    let envelope = Envelope::new(EventKind::Subscribe(NodeTopics { node_ids }));
                    if !send(&mut sink, &envelope).await {
                        return Exit::Lost;
                    }
                }
                Step::Command(Some(Command::Unsubscribe(node_ids))) => {
                    for node in &node_ids {
                        self.topics.remove(node);
                    }
                    let envelope = Envelope::new(EventKind::Unsubscribe(NodeTopics { node_ids }));
                    if !send(&mut sink, &envelope).await {
                        return Exit::Lost;
                    }
                }
                Step::Silent => return Exit::Silent,
            }
        }
    }

    /// Re-request topics, then flush queued messages in order.
    async fn restore(&mut self, sink: &mut SplitSink<Socket, Message>) -> bool {
        if !self.topics.is_empty() {
            let node_ids = self.topics.iter().cloned().collect();
            let envelope = Envelope::new(EventKind::Subscribe(NodeTopics { node_ids }));
            if !send(sink, &envelope).await {
                return false;
            }
        }
        let pending = self.queue.len();
        while let Some(envelope) = self.queue.pop() {
            if !send(sink, &envelope).await {
                self.queue.requeue(envelope);
                return false;
            }
        }
        if pending > 0 {
            info!(flushed = pending, "sent queued messages");
        }
        true
    }

    fn inbound(&mut self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping unreadable server message: {e}");
                return;
            }
        };
        if let EventKind::ConnectionEstablished(established) = &envelope.kind {
            info!(client_id = %established.client_id, resumed = established.resumed, "session established");
            self.client_id.send_replace(Some(established.client_id));
        }
        match self.events.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                warn!(kind = envelope.type_tag(), "event buffer full, dropping server event");
            }
            // Owner dropped the receiver; keep serving until close.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Wait out a retry delay while still accepting commands. Returns true
    /// when the owner asked to close.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let command = tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => command,
            };
            if self.absorb(command) {
                return true;
            }
        }
    }

    /// Record a command received while offline. Returns true on close.
    fn absorb(&mut self, command: Option<Command>) -> bool {
        match command {
            None | Some(Command::Close) => return true,
            Some(Command::Send(envelope)) => {
                self.queue.push(envelope);
            }
            Some(Command::Subscribe(node_ids)) => self.topics.extend(node_ids),
            Some(Command::Unsubscribe(node_ids)) => {
                for node in &node_ids {
                    self.topics.remove(node);
                }
            }
        }
        false
    }

    fn connect_url(&self) -> String {
        match *self.client_id.borrow() {
            Some(id) => with_client_id(&self.config.url, id),
            None => self.config.url.clone(),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "session state");
            *current = state;
            true
        });
    }
}

async fn send(sink: &mut SplitSink<Socket, Message>, envelope: &Envelope) -> bool {
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(e) => {
            warn!("dropping unserializable message: {e}");
            return true;
        }
    };
    match sink.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("write failed: {e}");
            false
        }
    }
}

fn with_client_id(url: &str, client_id: ClientId) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}client_id={client_id}")
}
