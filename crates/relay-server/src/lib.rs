//! # relay-server
//!
//! Axum HTTP + `WebSocket` gateway server.
//!
//! - HTTP endpoints: `/health`, `/metrics`, `/ws`
//! - `WebSocket` gateway: `hello`/`helloOk` handshake with authentication and
//!   protocol negotiation, heartbeat, concurrent request dispatch
//! - RPC method registry and handlers over [`relay_runtime::GatewayRuntime`]
//! - Per-connection event sequencing with bounded outbound queues
//! - Graceful shutdown via `CancellationToken` with a drain timeout

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod health;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthError, Authenticator, SharedSecretAuth};
pub use config::ServerConfig;
pub use server::{GatewayServer, RunningServer};
