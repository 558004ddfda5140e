//! Metric instrument factories for studio-relay.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"studio-relay"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for studio-relay instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("studio-relay")
}

/// Up/down counter: live WebSocket connections.
pub fn connections() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("relay.connections")
        .with_description("Number of live client connections")
        .build()
}

/// Up/down counter: active broker channel subscriptions.
/// Labels: `channel_kind` ("project" | "global").
pub fn subscriptions() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("relay.subscriptions")
        .with_description("Number of active broker channel subscriptions")
        .build()
}

/// Counter: per-socket deliveries made by fan-out.
/// Labels: `scope` ("project" | "all" | "direct"), `result` ("ok" | "evicted").
pub fn fanout_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("relay.fanout.deliveries")
        .with_description("Number of frames handed to client sockets")
        .build()
}

/// Counter: broker messages.
/// Labels: `direction` ("publish" | "receive"), `channel_kind`, `result`.
pub fn broker_messages() -> Counter<u64> {
    meter()
        .u64_counter("relay.broker.messages")
        .with_description("Number of broker messages published or received")
        .build()
}

/// Counter: tasks accepted by the dispatcher.
/// Labels: `tier`, `fell_back` ("true" | "false").
pub fn tasks_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("relay.tasks.dispatched")
        .with_description("Number of tasks dispatched")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("relay.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Histogram: wall time from dispatch to terminal state, in milliseconds.
/// Labels: `tier`, `status`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.tasks.duration_ms")
        .with_description("Task duration from dispatch to terminal state")
        .with_unit("ms")
        .build()
}
