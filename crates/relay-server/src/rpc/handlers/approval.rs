//! Approval handlers: two-phase request/wait plus resolve.

use async_trait::async_trait;
use relay_runtime::intents::IntentRequest;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{parse_params, require_string_param};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::validate_key;

/// Phase one: register an approval and return its ID immediately.
pub struct RequestHandler;

#[async_trait]
impl MethodHandler for RequestHandler {
    #[instrument(skip(self, params, ctx), fields(method = "approval.request"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let req: IntentRequest = parse_params(params)?;
        validate_key(&req.kind, "kind")?;
        if req.timeout_ms == Some(0) {
            return Err(RpcError::invalid_params("timeoutMs must be positive"));
        }
        let registration = ctx.runtime.intents.register(req);
        serde_json::to_value(registration).map_err(|e| RpcError::Internal {
            message: e.to_string(),
        })
    }
}

/// Phase two: block until decided or expired. Expiry reads as a null
/// decision.
pub struct WaitHandler;

#[async_trait]
impl MethodHandler for WaitHandler {
    #[instrument(skip(self, ctx), fields(method = "approval.wait"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let id = require_string_param(params.as_ref(), "id")?;
        let decision = ctx.runtime.intents.wait_for_decision(&id).await?;
        Ok(json!({ "id": id, "decision": decision }))
    }
}

#[derive(Deserialize)]
struct ResolveParams {
    id: String,
    #[serde(default)]
    decision: Option<String>,
}

/// Record a decision. `resolved: false` for unknown, expired, or already
/// decided approvals.
pub struct ResolveHandler;

#[async_trait]
impl MethodHandler for ResolveHandler {
    #[instrument(skip(self, ctx), fields(method = "approval.resolve"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: ResolveParams = parse_params(params)?;
        let resolved = ctx.runtime.intents.resolve(&p.id, p.decision);
        Ok(json!({ "id": p.id, "resolved": resolved }))
    }
}
