//! Dependency-injection context for RPC handlers.

use std::sync::Arc;
use std::time::Instant;

use relay_runtime::GatewayRuntime;

use crate::websocket::connection::ClientConnection;

/// Shared context passed to every RPC handler.
#[derive(Clone)]
pub struct RpcContext {
    /// Registries and run coordination.
    pub runtime: GatewayRuntime,
    /// When the server started.
    pub server_start_time: Instant,
    /// Registered method names, sorted.
    pub methods: Arc<[String]>,
    /// Connection the request arrived on. `None` outside a socket.
    pub connection: Option<Arc<ClientConnection>>,
}

impl RpcContext {
    /// Context without a connection.
    pub fn new(runtime: GatewayRuntime, methods: Vec<String>) -> Self {
        Self {
            runtime,
            server_start_time: Instant::now(),
            methods: methods.into(),
            connection: None,
        }
    }

    /// Same context, bound to one connection.
    pub fn for_connection(&self, connection: Arc<ClientConnection>) -> Self {
        Self {
            connection: Some(connection),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::test_helpers::make_test_context;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_context_has_no_connection() {
        let ctx = make_test_context();
        assert!(ctx.connection.is_none());
        assert!(ctx.methods.iter().any(|m| m == "system.ping"));
    }

    #[test]
    fn for_connection_shares_runtime() {
        let ctx = make_test_context();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new("c1".into(), tx, CancellationToken::new()));
        let bound = ctx.for_connection(conn);
        assert_eq!(bound.connection.as_ref().unwrap().id.as_str(), "c1");
        assert!(Arc::ptr_eq(&bound.runtime.registry, &ctx.runtime.registry));
    }
}
