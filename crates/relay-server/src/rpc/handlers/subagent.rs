//! Subagent hierarchy handlers: register, list, stop.

use async_trait::async_trait;
use relay_runtime::GatewayEvent;
use relay_runtime::events::names;
use relay_runtime::subagents::RegisterSubagent;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{parse_params, require_string_param};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::validate_key;

/// Record a child run spawned by a requester session.
pub struct RegisterHandler;

#[async_trait]
impl MethodHandler for RegisterHandler {
    #[instrument(skip(self, params, ctx), fields(method = "subagent.register"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let req: RegisterSubagent = parse_params(params)?;
        validate_key(&req.run_id, "runId")?;
        validate_key(&req.child_session_key, "childSessionKey")?;
        validate_key(&req.requester_session_key, "requesterSessionKey")?;
        if req.child_session_key == req.requester_session_key {
            return Err(RpcError::invalid_params(
                "childSessionKey must differ from requesterSessionKey",
            ));
        }
        let entry = ctx.runtime.subagents.register(req);
        Ok(json!({ "entry": entry }))
    }
}

/// Direct children of a requester.
pub struct ListHandler;

#[async_trait]
impl MethodHandler for ListHandler {
    #[instrument(skip(self, ctx), fields(method = "subagent.list"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let key = require_string_param(params.as_ref(), "requesterSessionKey")?;
        let entries = ctx.runtime.subagents.list_for_requester(&key);
        Ok(json!({ "count": entries.len(), "entries": entries }))
    }
}

/// Stop every live descendant of a requester, recursively.
pub struct StopHandler;

#[async_trait]
impl MethodHandler for StopHandler {
    #[instrument(skip(self, ctx), fields(method = "subagent.stop"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let key = require_string_param(params.as_ref(), "requesterSessionKey")?;
        let control = ctx.runtime.control();
        let stopped = ctx
            .runtime
            .subagents
            .stop_subagents_for_requester(&key, &control);
        if stopped > 0 {
            let payload = json!({ "requesterSessionKey": key, "stopped": stopped });
            let event = match ctx.runtime.registry.find_by_key(&key) {
                Some(record) => GatewayEvent::for_session(record.id(), names::SUBAGENT_STOPPED, payload),
                None => GatewayEvent::global(names::SUBAGENT_STOPPED, payload),
            };
            let _ = ctx.runtime.events.emit(event);
        }
        Ok(json!({ "stopped": stopped }))
    }
}
