//! System handlers: ping, methods.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodHandler;

/// Returns a pong with the server time and uptime.
pub struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    #[instrument(skip(self, ctx), fields(method = "system.ping"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "uptimeSecs": ctx.server_start_time.elapsed().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }
}

/// Lists every registered method.
pub struct MethodsHandler;

#[async_trait]
impl MethodHandler for MethodsHandler {
    #[instrument(skip(self, ctx), fields(method = "system.methods"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({ "methods": &*ctx.methods }))
    }
}
