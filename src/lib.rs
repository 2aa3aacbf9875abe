//! courier — a multi-protocol real-time messaging server.
//!
//! Clients interact through three front-ends — an HTTP+GraphQL API, a
//! long-lived WebSocket session, and a custom framed TCP session — and
//! publish/subscribe to topics routed through an internal broker. Domain
//! events emitted by business services are bridged into the broker so that
//! subscribed sessions receive live updates.

#![allow(clippy::type_complexity)]

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod pubsub;
pub mod test_util;
pub mod topic;
pub mod ws;

pub use error::{Result, ServerError};
