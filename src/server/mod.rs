//! HTTP and WebSocket front end.
//!
//! One socket per project at `/ws/projects/:project_id`, a small task API
//! under `/api`, and `/health`. The server owns the background heartbeat
//! loop, which also prunes finished task records.

pub mod http;
pub mod projects;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatcher::TaskDispatcher;
use crate::error::Result;
use crate::event::{Envelope, EventKind, Heartbeat};
use crate::registry::ConnectionRegistry;
use crate::relay::PubSubRelay;

pub use projects::{AnyProject, DirectoryProjects, ProjectStore};

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub heartbeat_interval: Duration,
    /// Outbound frames buffered per socket before eviction.
    pub outbound_buffer: usize,
    /// How long finished task records stay queryable.
    pub task_retention: Duration,
    /// How long a new socket waits for its project channel to go live
    /// before `connection.established` is sent anyway.
    pub subscribe_timeout: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            outbound_buffer: config.outbound_buffer,
            task_retention: config.task_retention,
            ..Self::default()
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            outbound_buffer: 256,
            task_retention: Duration::from_secs(3600),
            subscribe_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<ConnectionRegistry>,
    relay: Arc<PubSubRelay>,
    dispatcher: TaskDispatcher,
    projects: Arc<dyn ProjectStore>,
    settings: ServerSettings,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        relay: Arc<PubSubRelay>,
        dispatcher: TaskDispatcher,
        projects: Arc<dyn ProjectStore>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                relay,
                dispatcher,
                projects,
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn relay(&self) -> &Arc<PubSubRelay> {
        &self.inner.relay
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.inner.dispatcher
    }

    pub fn projects(&self) -> &dyn ProjectStore {
        self.inner.projects.as_ref()
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/ws/projects/:project_id", get(ws::upgrade))
        .route(
            "/api/projects/:project_id/tasks",
            post(http::create_task).get(http::list_tasks),
        )
        .route("/api/tasks/:task_id", get(http::get_task))
        .route("/api/tasks/:task_id/cancel", post(http::cancel_task))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every socket and stop the
/// relay's listeners.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let stop = Arc::new(Notify::new());
    let heartbeat = tokio::spawn(heartbeat_loop(state.clone(), Arc::clone(&stop)));

    let registry = Arc::clone(state.registry());
    let closing = async move {
        shutdown.await;
        // Upgraded sockets outlive their HTTP connection; close them here so
        // their tasks end.
        let closed = registry.close_all();
        info!(closed, "shutdown requested, sockets closed");
    };

    info!(%addr, "relay listening");
    axum::serve(listener, router(state.clone()).into_make_service())
        .with_graceful_shutdown(closing)
        .await?;

    stop.notify_one();
    let _ = heartbeat.await;
    state.relay().shutdown().await;
    Ok(())
}

/// Periodic `system.heartbeat` to every socket, plus task retention.
async fn heartbeat_loop(state: AppState, stop: Arc<Notify>) {
    let settings = state.settings().clone();
    let mut ticker = tokio::time::interval(settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.notified() => return,
            _ = ticker.tick() => {}
        }

        let registry = state.registry();
        let heartbeat = Envelope::new(EventKind::SystemHeartbeat(Heartbeat {
            connections: registry.connection_count(),
        }));
        let report = registry.broadcast_all(&heartbeat);
        let pruned = state
            .dispatcher()
            .prune_finished(settings.task_retention);
        debug!(
            delivered = report.delivered,
            evicted = report.failed.len(),
            pruned,
            "heartbeat"
        );
    }
}
