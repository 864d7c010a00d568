//! # relay-core
//!
//! Shared vocabulary for the relay gateway crates.
//!
//! - **Branded IDs**: `SessionId`, `RunId`, `ConnectionId`, `IntentId`, `RequestId`
//! - **Protocol**: hello/helloOk handshake, request/response/event frames,
//!   close codes, protocol version negotiation
//! - **Backoff**: reconnect delay math with jitter
//! - **Clock**: monotonic time source that tests can drive by hand
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod backoff;
pub mod clock;
pub mod ids;
pub mod logging;
pub mod protocol;
