//! Pub/sub relay: bridges broker channels to the connection registry.
//!
//! The relay is the only component that subscribes or unsubscribes broker
//! channels. Each subscribed channel owns exactly one listener task, which
//! consumes messages in publish order and hands them to the registry for
//! fan-out. Project channels are reference counted through
//! [`ChannelDemand`]; the global channel is pinned for the relay's lifetime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backoff::backoff_delay;
use crate::broker::{Broker, BrokerSubscription, ChannelName};
use crate::event::{Degraded, Envelope, EventKind, Routing};
use crate::model::TaskId;
use crate::registry::{ChannelDemand, ConnectionRegistry, Frame};
use crate::telemetry::metrics;

/// Tasks tracked per listener, both for progress regression warnings and
/// for dropping events that arrive after a task finished.
const MAX_TRACKED_TASKS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// First delay after a failed broker subscribe.
    pub retry_base: Duration,
    /// Ceiling for the subscribe retry delay.
    pub retry_max: Duration,
    /// Consecutive subscribe failures before clients are told the relay is
    /// degraded.
    pub degraded_after: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(10),
            degraded_after: 3,
        }
    }
}

struct ChannelSubscription {
    ref_count: usize,
    stop: Option<oneshot::Sender<()>>,
    ready: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

pub struct PubSubRelay {
    broker: Arc<dyn Broker>,
    settings: RelaySettings,
    registry: OnceLock<Weak<ConnectionRegistry>>,
    subscriptions: Mutex<HashMap<ChannelName, ChannelSubscription>>,
    health: Arc<BrokerHealth>,
}

impl PubSubRelay {
    /// Create a relay and the registry it serves, and pin the global channel.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        broker: Arc<dyn Broker>,
        settings: RelaySettings,
    ) -> (Arc<PubSubRelay>, Arc<ConnectionRegistry>) {
        let relay = Arc::new(PubSubRelay {
            broker,
            settings,
            registry: OnceLock::new(),
            subscriptions: Mutex::new(HashMap::new()),
            health: Arc::new(BrokerHealth::default()),
        });
        let demand: Arc<dyn ChannelDemand> = relay.clone();
        let registry = Arc::new(ConnectionRegistry::new(demand));
        let _ = relay.registry.set(Arc::downgrade(&registry));
        relay.ensure_subscribed(&ChannelName::Global);
        info!(backend = relay.broker.backend(), "relay started");
        (relay, registry)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<ChannelName, ChannelSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `channel` if it is not already. The map insert is the claim,
    /// so concurrent callers never start a second listener.
    pub fn ensure_subscribed(&self, channel: &ChannelName) {
        let mut subs = self.subscriptions();
        self.claim(&mut subs, channel);
    }

    /// Stop the channel's listener, which then unsubscribes from the broker.
    /// No-op when not subscribed.
    pub fn ensure_unsubscribed(&self, channel: &ChannelName) {
        let removed = self.subscriptions().remove(channel);
        if let Some(mut sub) = removed {
            stop(channel, &mut sub);
        }
    }

    fn claim<'a>(
        &self,
        subs: &'a mut HashMap<ChannelName, ChannelSubscription>,
        channel: &ChannelName,
    ) -> &'a mut ChannelSubscription {
        subs.entry(channel.clone()).or_insert_with(|| {
            let (stop_tx, stop_rx) = oneshot::channel();
            let (ready_tx, ready_rx) = watch::channel(false);
            let listener = Listener {
                channel: channel.clone(),
                broker: Arc::clone(&self.broker),
                registry: self.registry.get().cloned().unwrap_or_default(),
                settings: self.settings.clone(),
                health: Arc::clone(&self.health),
                ready: ready_tx,
                stop: stop_rx,
                last_progress: HashMap::new(),
                finished: FinishedTasks::default(),
            };
            let span = info_span!("relay.listener", channel = %channel);
            let task = tokio::spawn(listener.run().instrument(span));

            metrics::subscriptions().add(1, &[KeyValue::new("channel_kind", channel.kind())]);
            debug!(channel = %channel, "listener spawned");
            ChannelSubscription {
                ref_count: 0,
                stop: Some(stop_tx),
                ready: ready_rx,
                task,
            }
        })
    }

    /// Wait until the channel's listener holds a live broker subscription.
    /// Returns false on timeout or when the channel is not subscribed.
    pub async fn wait_ready(&self, channel: &ChannelName, timeout: Duration) -> bool {
        let Some(mut ready) = self.subscriptions().get(channel).map(|s| s.ready.clone()) else {
            return false;
        };
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|live| *live)).await,
            Ok(Ok(_))
        )
    }

    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.subscriptions().contains_key(channel)
    }

    pub fn ref_count(&self, channel: &ChannelName) -> usize {
        self.subscriptions().get(channel).map_or(0, |s| s.ref_count)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// True while at least one channel cannot be subscribed.
    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    /// Stop every listener, global channel included, and wait for them to
    /// unsubscribe.
    pub async fn shutdown(&self) {
        let drained: Vec<(ChannelName, ChannelSubscription)> =
            self.subscriptions().drain().collect();
        let mut tasks = Vec::with_capacity(drained.len());
        for (channel, mut sub) in drained {
            if let Some(stop_tx) = sub.stop.take() {
                let _ = stop_tx.send(());
            }
            metrics::subscriptions().add(-1, &[KeyValue::new("channel_kind", channel.kind())]);
            tasks.push(sub.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("listener task panicked: {e}");
            }
        }
        info!("relay stopped");
    }
}

impl ChannelDemand for PubSubRelay {
    fn acquire(&self, channel: &ChannelName) {
        let mut subs = self.subscriptions();
        let sub = self.claim(&mut subs, channel);
        sub.ref_count += 1;
        debug!(channel = %channel, ref_count = sub.ref_count, "channel acquired");
    }

    fn release(&self, channel: &ChannelName) {
        let mut subs = self.subscriptions();
        let Some(sub) = subs.get_mut(channel) else {
            warn!(channel = %channel, "release for a channel that is not subscribed");
            return;
        };
        sub.ref_count = sub.ref_count.saturating_sub(1);
        debug!(channel = %channel, ref_count = sub.ref_count, "channel released");
        if sub.ref_count == 0 && *channel != ChannelName::Global {
            if let Some(mut sub) = subs.remove(channel) {
                stop(channel, &mut sub);
            }
        }
    }
}

fn stop(channel: &ChannelName, sub: &mut ChannelSubscription) {
    if let Some(stop_tx) = sub.stop.take() {
        let _ = stop_tx.send(());
    }
    metrics::subscriptions().add(-1, &[KeyValue::new("channel_kind", channel.kind())]);
    info!(channel = %channel, "channel unsubscribed");
}

// ---------------------------------------------------------------------------
// Broker health
// ---------------------------------------------------------------------------

/// Channels whose broker subscription is currently failing. The relay is
/// degraded while the set is non-empty.
#[derive(Default)]
struct BrokerHealth {
    failing: Mutex<HashSet<ChannelName>>,
}

impl BrokerHealth {
    fn failing(&self) -> MutexGuard<'_, HashSet<ChannelName>> {
        self.failing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_degraded(&self) -> bool {
        !self.failing().is_empty()
    }

    /// Returns true when this is the first failing channel.
    fn mark_failing(&self, channel: &ChannelName) -> bool {
        let mut failing = self.failing();
        failing.insert(channel.clone()) && failing.len() == 1
    }

    /// Returns true when this was the last failing channel.
    fn mark_healthy(&self, channel: &ChannelName) -> bool {
        let mut failing = self.failing();
        failing.remove(channel) && failing.is_empty()
    }
}

/// Bounded record of tasks that reached a terminal state, oldest evicted
/// first.
#[derive(Default)]
struct FinishedTasks {
    ids: HashSet<TaskId>,
    order: VecDeque<TaskId>,
}

impl FinishedTasks {
    fn contains(&self, task_id: &TaskId) -> bool {
        self.ids.contains(task_id)
    }

    fn insert(&mut self, task_id: TaskId) {
        if !self.ids.insert(task_id) {
            return;
        }
        self.order.push_back(task_id);
        if self.order.len() > MAX_TRACKED_TASKS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct Listener {
    channel: ChannelName,
    broker: Arc<dyn Broker>,
    registry: Weak<ConnectionRegistry>,
    settings: RelaySettings,
    health: Arc<BrokerHealth>,
    ready: watch::Sender<bool>,
    stop: oneshot::Receiver<()>,
    last_progress: HashMap<TaskId, f64>,
    finished: FinishedTasks,
}

enum Step {
    Stop,
    Message(Option<String>),
}

impl Listener {
    async fn run(mut self) {
        self.listen().await;
        // A stopped channel no longer counts against broker health.
        self.set_healthy();
    }

    async fn listen(&mut self) {
        let name = self.channel.to_string();
        let mut failures: u32 = 0;

        loop {
            let attempt = tokio::select! {
                _ = &mut self.stop => return,
                result = self.broker.subscribe(&name) => result,
            };

            let mut subscription = match attempt {
                Ok(subscription) => subscription,
                Err(e) => {
                    failures += 1;
                    let delay = backoff_delay(
                        failures - 1,
                        self.settings.retry_base,
                        self.settings.retry_max,
                    );
                    warn!(failures, ?delay, "broker subscribe failed: {e}");
                    if failures >= self.settings.degraded_after {
                        self.set_failing(e.to_string());
                    }
                    tokio::select! {
                        _ = &mut self.stop => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if failures > 0 {
                info!(failures, "broker subscription recovered");
                failures = 0;
            }
            self.set_healthy();
            let _ = self.ready.send(true);
            debug!("listening");

            loop {
                let step = tokio::select! {
                    _ = &mut self.stop => Step::Stop,
                    message = subscription.next_message() => Step::Message(message),
                };
                match step {
                    Step::Stop => {
                        self.teardown(subscription).await;
                        return;
                    }
                    Step::Message(Some(text)) => self.deliver(&text),
                    Step::Message(None) => {
                        warn!("broker connection lost, resubscribing");
                        let _ = self.ready.send(false);
                        break;
                    }
                }
            }
        }
    }

    async fn teardown(&self, mut subscription: Box<dyn BrokerSubscription>) {
        let _ = self.ready.send(false);
        if let Err(e) = subscription.unsubscribe().await {
            warn!("broker unsubscribe failed: {e}");
        }
    }

    fn deliver(&mut self, text: &str) {
        metrics::broker_messages().add(
            1,
            &[
                KeyValue::new("direction", "receive"),
                KeyValue::new("channel_kind", self.channel.kind()),
            ],
        );

        let routing = match Routing::peek(text) {
            Ok(routing) => routing,
            Err(e) => {
                warn!("dropping undecodable broker message: {e}");
                return;
            }
        };
        if !self.admit(&routing) {
            return;
        }

        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let frame: Frame = Arc::from(text);
        let report = match &self.channel {
            ChannelName::Project(project_id) => {
                registry.fan_out_frame(project_id, routing.node_id.as_ref(), frame)
            }
            ChannelName::Global => registry.broadcast_frame(frame),
        };
        debug!(
            kind = %routing.type_tag,
            delivered = report.delivered,
            evicted = report.failed.len(),
            "fanned out"
        );
    }

    /// Task bookkeeping. Events for a task that already finished are
    /// dropped; progress regressions are passed through and only logged.
    fn admit(&mut self, routing: &Routing) -> bool {
        let Some(task_id) = routing.task_id.filter(|_| routing.is_task_event()) else {
            return true;
        };
        if self.finished.contains(&task_id) {
            warn!(
                task_id = %task_id,
                kind = %routing.type_tag,
                "event for a finished task, ignoring"
            );
            return false;
        }

        if routing.is_task_terminal() {
            self.last_progress.remove(&task_id);
            self.finished.insert(task_id);
        } else if let Some(reported) = routing.progress {
            let last = self.last_progress.get(&task_id).copied().unwrap_or(0.0);
            if reported < last {
                warn!(
                    task_id = %task_id,
                    previous = last,
                    reported,
                    "task progress went backwards"
                );
            } else {
                if self.last_progress.len() >= MAX_TRACKED_TASKS {
                    self.last_progress.clear();
                }
                self.last_progress.insert(task_id, reported);
            }
        }
        true
    }

    fn set_failing(&self, reason: String) {
        if !self.health.mark_failing(&self.channel) {
            return;
        }
        error!(%reason, "broker unavailable, relay degraded");
        self.announce(true, Some(reason));
    }

    fn set_healthy(&self) {
        if !self.health.mark_healthy(&self.channel) {
            return;
        }
        info!("broker reachable again, relay recovered");
        self.announce(false, None);
    }

    fn announce(&self, active: bool, reason: Option<String>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.broadcast_all(&Envelope::new(EventKind::SystemDegraded(Degraded {
                active,
                reason,
            })));
        }
    }
}
