//! WebSocket connection management, handshake, heartbeat, message dispatch,
//! and event fan-out.

pub mod broadcast;
pub mod connection;
pub mod event_bridge;
pub mod handler;
pub mod heartbeat;
pub mod session;
