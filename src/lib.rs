//! # studio-relay
//!
//! Real-time task and event relay for the generative media studio.
//!
//! Browsers hold one WebSocket per project. Workers publish task lifecycle
//! events to a pub/sub broker (in-memory, Redis or Postgres LISTEN/NOTIFY),
//! and the relay fans each message out to every socket of the owning
//! project. Tasks are dispatched with quality tier resolution and
//! cancellation, and a client-side session manager keeps subscriptions alive
//! across reconnects.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod model;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod worker;
