//! Agent run handlers: run, abort, wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::ids::SessionId;
use relay_runtime::runs::{RunRequest, Submission};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::{self, RpcError};
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{MAX_KEY_LENGTH, validate_key, validate_string_param};

/// `agent.wait` default when the caller gives no `timeoutMs`.
const DEFAULT_WAIT_MS: u64 = 30_000;

/// Submission result as sent on the wire.
pub(crate) fn submission_to_json(submission: Submission) -> Value {
    match submission {
        Submission::Started { run_id, .. } => json!({ "status": "started", "runId": run_id }),
        Submission::Duplicate(record) => json!({
            "status": "duplicate",
            "runId": record.run_id,
            "run": record,
        }),
        Submission::Queued { position } => json!({ "status": "queued", "position": position }),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunParams {
    session_id: SessionId,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    queue_if_busy: bool,
}

/// Start a run on a session.
///
/// A repeated `idempotencyKey` returns the earlier run instead of starting
/// a new one. A busy session fails with `SESSION_BUSY` unless
/// `queueIfBusy` is set.
pub struct RunHandler;

#[async_trait]
impl MethodHandler for RunHandler {
    #[instrument(skip(self, params, ctx), fields(method = "agent.run"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: RunParams = parse_params(params)?;
        validate_key(&p.session_id, "sessionId")?;
        if let Some(key) = &p.idempotency_key {
            validate_string_param(key, "idempotencyKey", MAX_KEY_LENGTH)?;
        }
        let submission = ctx.runtime.runs.start(
            Arc::clone(&ctx.runtime.executor),
            RunRequest {
                session_id: p.session_id,
                input: p.input,
                idempotency_key: p.idempotency_key,
                queue_if_busy: p.queue_if_busy,
            },
        )?;
        Ok(submission_to_json(submission))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbortParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
}

/// Abort a run, by run ID or by the session's active run.
pub struct AbortHandler;

#[async_trait]
impl MethodHandler for AbortHandler {
    #[instrument(skip(self, ctx), fields(method = "agent.abort"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: AbortParams = parse_params(params)?;
        let runs = &ctx.runtime.runs;
        match (p.run_id, p.session_id) {
            (Some(run_id), _) => {
                if runs.get(&run_id).is_none() {
                    return Err(RpcError::NotFound {
                        code: errors::RUN_NOT_FOUND.into(),
                        message: format!("Run not found: {run_id}"),
                    });
                }
                let aborted = runs.abort_run(&run_id);
                Ok(json!({ "aborted": aborted, "runId": run_id }))
            }
            (None, Some(session_id)) => {
                if !ctx.runtime.registry.has_session(&session_id) {
                    return Err(RpcError::NotFound {
                        code: errors::SESSION_NOT_FOUND.into(),
                        message: format!("Session not found: {session_id}"),
                    });
                }
                let aborted = runs.abort(&session_id);
                Ok(json!({ "aborted": aborted.is_some(), "runId": aborted }))
            }
            (None, None) => Err(RpcError::invalid_params(
                "Missing required parameter 'sessionId' or 'runId'",
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    run_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Wait for a run to end. Returns the record as of the deadline, so a
/// `running` status means the wait timed out.
pub struct WaitHandler;

#[async_trait]
impl MethodHandler for WaitHandler {
    #[instrument(skip(self, ctx), fields(method = "agent.wait"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: WaitParams = parse_params(params)?;
        let timeout = Duration::from_millis(p.timeout_ms.unwrap_or(DEFAULT_WAIT_MS));
        let record = ctx.runtime.runs.wait(&p.run_id, timeout).await?;
        let done = record.status.is_terminal();
        Ok(json!({ "run": record, "done": done }))
    }
}
