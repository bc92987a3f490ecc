//! mpgate gateway core
//!
//! Exposes a stateful chat-messenger protocol ("MP") as building blocks
//! for a stateless HTTP API: per-tenant session clients over a framed
//! JSON WebSocket transport, supervised session lifecycle with bounded
//! reconnect, and an event classification + webhook delivery pipeline.
#![allow(dead_code)]

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod protocol;
pub mod tenant;
