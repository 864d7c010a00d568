//! Session handlers: create, get, list, reset, subscribe.

use async_trait::async_trait;
use relay_core::ids::SessionId;
use relay_runtime::GatewayEvent;
use relay_runtime::events::names;
use relay_runtime::registry::CreateSession;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::rpc::context::RpcContext;
use crate::rpc::errors::{self, RpcError};
use crate::rpc::handlers::{parse_params, require_string_param};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{MAX_PARAM_LENGTH, validate_key, validate_string_param};

fn session_not_found(session_id: &str) -> RpcError {
    RpcError::NotFound {
        code: errors::SESSION_NOT_FOUND.into(),
        message: format!("Session not found: {session_id}"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateParams {
    session_key: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    session_id: Option<SessionId>,
}

/// Create a session, or refresh one by explicit ID. The calling connection
/// is subscribed to the session's events.
pub struct CreateSessionHandler;

#[async_trait]
impl MethodHandler for CreateSessionHandler {
    #[instrument(skip(self, ctx), fields(method = "session.create"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: CreateParams = parse_params(params)?;
        validate_key(&p.session_key, "sessionKey")?;
        validate_string_param(&p.cwd, "cwd", MAX_PARAM_LENGTH)?;
        if let Some(id) = &p.session_id {
            validate_key(id, "sessionId")?;
        }

        let registry = &ctx.runtime.registry;
        let created = registry.create_session(CreateSession {
            session_key: p.session_key,
            cwd: p.cwd,
            session_id: p.session_id,
        })?;
        let snapshot = created.record.snapshot(registry.now());

        if let Some(conn) = &ctx.connection {
            if conn.subscribe(snapshot.session_id.clone()) {
                debug!(conn_id = %conn.id, session_id = %snapshot.session_id, "connection subscribed");
            }
        }
        if !created.refreshed {
            let _ = ctx.runtime.events.emit(GatewayEvent::global(
                names::SESSION_CREATED,
                json!({
                    "sessionId": snapshot.session_id,
                    "sessionKey": snapshot.session_key,
                }),
            ));
        }

        Ok(json!({
            "session": snapshot,
            "refreshed": created.refreshed,
            "evicted": created.evicted,
        }))
    }
}

/// Fetch one session. Counts as activity for idle reaping.
pub struct GetSessionHandler;

#[async_trait]
impl MethodHandler for GetSessionHandler {
    #[instrument(skip(self, ctx), fields(method = "session.get"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let session_id = require_string_param(params.as_ref(), "sessionId")?;
        let registry = &ctx.runtime.registry;
        let record = registry
            .get_session(&session_id)
            .ok_or_else(|| session_not_found(&session_id))?;
        Ok(json!({ "session": record.snapshot(registry.now()) }))
    }
}

/// List all sessions, oldest first.
pub struct ListSessionsHandler;

#[async_trait]
impl MethodHandler for ListSessionsHandler {
    #[instrument(skip(self, ctx), fields(method = "session.list"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let sessions = ctx.runtime.registry.list();
        Ok(json!({
            "count": sessions.len(),
            "sessions": sessions,
        }))
    }
}

/// Remove a session, aborting its run and dropping queued follow-ups.
pub struct ResetSessionHandler;

#[async_trait]
impl MethodHandler for ResetSessionHandler {
    #[instrument(skip(self, ctx), fields(method = "session.reset"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let session_id = require_string_param(params.as_ref(), "sessionId")?;
        let record = ctx
            .runtime
            .registry
            .remove_session(&session_id)
            .ok_or_else(|| session_not_found(&session_id))?;
        let cleared = ctx.runtime.followups.clear(&record.session_key());
        Ok(json!({
            "sessionId": record.id(),
            "removed": true,
            "clearedFollowups": cleared,
        }))
    }
}

/// Subscribe the calling connection to an existing session's events.
pub struct SubscribeHandler;

#[async_trait]
impl MethodHandler for SubscribeHandler {
    #[instrument(skip(self, ctx), fields(method = "session.subscribe"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let session_id = require_string_param(params.as_ref(), "sessionId")?;
        let Some(conn) = &ctx.connection else {
            return Err(RpcError::Custom {
                code: errors::NOT_AVAILABLE.into(),
                message: "session.subscribe requires a WebSocket connection".into(),
                details: None,
            });
        };
        if !ctx.runtime.registry.has_session(&session_id) {
            return Err(session_not_found(&session_id));
        }
        let added = conn.subscribe(SessionId::from(session_id.as_str()));
        Ok(json!({
            "sessionId": session_id,
            "subscribed": true,
            "alreadySubscribed": !added,
        }))
    }
}
