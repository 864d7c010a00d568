//! # relay-client
//!
//! Transport client for the relay gateway.
//!
//! [`GatewayClient`] performs the `hello`/`helloOk` handshake, correlates
//! responses to requests by ID, sequences broadcast events (reporting gaps),
//! and reconnects with jittered exponential backoff until a non-retryable
//! close or an exhausted attempt budget ends it.

#![deny(unsafe_code)]

pub mod client;
pub mod errors;
pub mod observer;
pub mod options;
mod pending;
pub mod sequencer;

pub use client::{ClientState, GatewayClient};
pub use errors::{ClientError, Result};
pub use observer::{ChannelObserver, ClientNotification, ClientObserver, NoopObserver};
pub use options::ClientOptions;
pub use sequencer::{EventSequencer, Gap, SeqDecision};
