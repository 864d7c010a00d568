//! Prometheus exporter and the metric names the server records.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// RPC requests (counter; label `method`).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// Failed RPC requests (counter; labels `method`, `code`).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// Handler time (histogram; label `method`).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Handshakes completed (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Open connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connections refused before `helloOk` (counter; label `reason`).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Inbound frames (counter).
pub const WS_MESSAGES_RECEIVED_TOTAL: &str = "ws_messages_received_total";
/// Frames written to sockets (counter).
pub const WS_MESSAGES_SENT_TOTAL: &str = "ws_messages_sent_total";
/// Events not delivered because a queue was full or the bridge lagged (counter).
pub const WS_EVENTS_DROPPED_TOTAL: &str = "ws_events_dropped_total";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";

/// Install the process-wide recorder and describe the server's metrics.
///
/// Fails if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    info!("prometheus recorder installed");
    Ok(handle)
}

/// Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe() {
    describe_counter!(RPC_REQUESTS_TOTAL, "RPC requests dispatched");
    describe_counter!(RPC_ERRORS_TOTAL, "RPC requests answered with an error");
    describe_histogram!(RPC_REQUEST_DURATION_SECONDS, Unit::Seconds, "RPC handler time");
    describe_counter!(WS_CONNECTIONS_TOTAL, "WebSocket handshakes completed");
    describe_gauge!(WS_CONNECTIONS_ACTIVE, "Open WebSocket connections");
    describe_counter!(WS_CONNECTIONS_REJECTED_TOTAL, "Connections refused before helloOk");
    describe_counter!(WS_MESSAGES_RECEIVED_TOTAL, "Inbound WebSocket frames");
    describe_counter!(WS_MESSAGES_SENT_TOTAL, "Outbound WebSocket frames");
    describe_counter!(WS_EVENTS_DROPPED_TOTAL, "Events that never reached a client");
    describe_histogram!(WS_CONNECTION_DURATION_SECONDS, Unit::Seconds, "Connection lifetime");
}
