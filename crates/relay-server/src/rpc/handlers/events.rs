//! Inbound event ingestion with at-least-once dedupe.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::ids::SessionId;
use relay_runtime::runs::RunRequest;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::agent::submission_to_json;
use crate::rpc::handlers::parse_params;
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{MAX_KEY_LENGTH, validate_key, validate_string_param};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestParams {
    session_id: SessionId,
    event_id: String,
    #[serde(default)]
    dedupe_key: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

/// Accept an event for a session, dropping repeats by dedupe key.
///
/// A fresh event carrying `input` becomes a run, queued behind any active
/// run. The dedupe key doubles as the run's idempotency key within the
/// session. If the run cannot be submitted the dedupe mark is released, so a
/// redelivery is not mistaken for a duplicate.
pub struct IngestHandler;

#[async_trait]
impl MethodHandler for IngestHandler {
    #[instrument(skip(self, params, ctx), fields(method = "events.ingest"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p: IngestParams = parse_params(params)?;
        validate_key(&p.session_id, "sessionId")?;
        validate_key(&p.event_id, "eventId")?;
        if let Some(key) = &p.dedupe_key {
            validate_string_param(key, "dedupeKey", MAX_KEY_LENGTH)?;
        }

        let accepted = ctx
            .runtime
            .runs
            .accept_event(&p.session_id, &p.event_id, p.dedupe_key.as_deref())?;
        if !accepted {
            return Ok(json!({ "accepted": false, "duplicate": true }));
        }

        let Some(input) = p.input else {
            return Ok(json!({ "accepted": true, "duplicate": false }));
        };
        let idempotency_key = p.dedupe_key.clone().unwrap_or_else(|| p.event_id.clone());
        debug!(session_id = %p.session_id, idempotency_key, "event starts run");
        let submission = ctx
            .runtime
            .runs
            .start(
                Arc::clone(&ctx.runtime.executor),
                RunRequest {
                    session_id: p.session_id.clone(),
                    input,
                    idempotency_key: Some(idempotency_key),
                    queue_if_busy: true,
                },
            )
            .inspect_err(|_| {
                let _ = ctx.runtime.runs.release_event(
                    &p.session_id,
                    &p.event_id,
                    p.dedupe_key.as_deref(),
                );
            })?;
        Ok(json!({
            "accepted": true,
            "duplicate": false,
            "run": submission_to_json(submission),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::errors;
    use crate::rpc::handlers::session::CreateSessionHandler;
    use crate::rpc::handlers::test_helpers::make_test_context;

    async fn session(ctx: &RpcContext) -> String {
        session_with_key(ctx, "inbox").await
    }

    async fn session_with_key(ctx: &RpcContext, key: &str) -> String {
        let created = CreateSessionHandler
            .handle(Some(json!({ "sessionKey": key })), ctx)
            .await
            .unwrap();
        created["session"]["sessionId"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn duplicate_event_dropped() {
        let ctx = make_test_context();
        let sid = session(&ctx).await;
        let params = json!({ "sessionId": sid, "eventId": "e1" });
        let first = IngestHandler.handle(Some(params.clone()), &ctx).await.unwrap();
        let second = IngestHandler.handle(Some(params), &ctx).await.unwrap();
        assert_eq!(first["accepted"], true);
        assert_eq!(second["accepted"], false);
        assert_eq!(second["duplicate"], true);
    }

    #[tokio::test]
    async fn dedupe_key_overrides_event_id() {
        let ctx = make_test_context();
        let sid = session(&ctx).await;
        let a = IngestHandler
            .handle(Some(json!({ "sessionId": sid, "eventId": "e1", "dedupeKey": "msg-7" })), &ctx)
            .await
            .unwrap();
        let b = IngestHandler
            .handle(Some(json!({ "sessionId": sid, "eventId": "e2", "dedupeKey": "msg-7" })), &ctx)
            .await
            .unwrap();
        assert_eq!(a["accepted"], true);
        assert_eq!(b["accepted"], false);
    }

    #[tokio::test]
    async fn event_with_input_starts_then_queues() {
        let ctx = make_test_context();
        let sid = session(&ctx).await;
        let first = IngestHandler
            .handle(
                Some(json!({ "sessionId": sid, "eventId": "e1", "input": {"delayMs": 60_000} })),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(first["run"]["status"], "started");

        let second = IngestHandler
            .handle(
                Some(json!({ "sessionId": sid, "eventId": "e2", "input": {"text": "next"} })),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(second["run"]["status"], "queued");
        assert_eq!(ctx.runtime.followups.depth("inbox"), 1);
    }

    #[tokio::test]
    async fn same_event_id_runs_in_each_session() {
        let ctx = make_test_context();
        let a = session_with_key(&ctx, "chan:a").await;
        let b = session_with_key(&ctx, "chan:b").await;
        let input = json!({ "delayMs": 60_000 });

        let ra = IngestHandler
            .handle(Some(json!({ "sessionId": a, "eventId": "msg-1", "input": input })), &ctx)
            .await
            .unwrap();
        let rb = IngestHandler
            .handle(Some(json!({ "sessionId": b, "eventId": "msg-1", "input": input })), &ctx)
            .await
            .unwrap();
        assert_eq!(ra["run"]["status"], "started");
        assert_eq!(rb["run"]["status"], "started");
        assert_ne!(ra["run"]["runId"], rb["run"]["runId"]);
        assert_eq!(ctx.runtime.registry.active_run_count(), 2);
    }

    #[tokio::test]
    async fn unknown_session() {
        let ctx = make_test_context();
        let err = IngestHandler
            .handle(Some(json!({ "sessionId": "ghost", "eventId": "e1" })), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::SESSION_NOT_FOUND);
    }
}
